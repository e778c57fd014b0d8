//! Out-of-band files exchanged with processes inside a sandbox.
//!
//! The producer writes a small file into the sandbox's signal directory; the consumer polls
//! for it, reads it and deletes it. Delivery is best effort: a file that has disappeared by
//! the time it is read back was most likely consumed already.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{SandboxError, SandboxResult};
use crate::executor::{argv, CommandExecutor};
use crate::models::{PermissionDecision, PermissionPrompt, SandboxKey};
use crate::settings::ManagerConfig;

/// Exit status of the poll script when the file is not there yet.
const NOT_YET: i64 = 3;

/// Writes stdin to `$2`, then renames it onto `$3` so the consumer never sees a partial file.
const WRITE_SCRIPT: &str = r#"mkdir -p "$1" && { chmod 777 "$1" 2>/dev/null || true; } && cat > "$2" && chmod 666 "$2" && mv -f "$2" "$3" || { rm -f "$2"; exit 1; }"#;
const TAKE_SCRIPT: &str = r#"if [ -f "$1" ]; then cat "$1"; rm -f "$1"; else exit 3; fi"#;
const LIST_PROMPTS_SCRIPT: &str = r#"for f in "$1"/permission_*.json; do [ -f "$f" ] || continue; cat "$f"; printf '\000'; done"#;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// The file was read back with the expected content.
    Verified,
    /// Written, but the read-back was missing or different.
    Unconfirmed(String),
}

/// File names inside the signal directory are restricted to `[A-Za-z0-9_.-]`.
pub fn validate_request_id(id: &str) -> SandboxResult<()> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(SandboxError::InvalidRequest(format!(
            "invalid request id {id:?}"
        )))
    }
}

pub struct SignalFileChannel {
    executor: Arc<CommandExecutor>,
    config: Arc<ManagerConfig>,
}

impl SignalFileChannel {
    pub fn new(executor: Arc<CommandExecutor>, config: Arc<ManagerConfig>) -> Self {
        Self { executor, config }
    }

    pub fn path_for(&self, request_id: &str) -> String {
        format!("{}/{request_id}", self.config.signal_dir.trim_end_matches('/'))
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.signal_poll()
    }

    pub async fn deliver(
        &self,
        key: &SandboxKey,
        request_id: &str,
        payload: &str,
    ) -> SandboxResult<Delivery> {
        validate_request_id(request_id)?;
        let path = self.path_for(request_id);
        // Hidden, so consumers globbing the directory skip it.
        let staging = self.path_for(&format!(".{request_id}.{}", Uuid::new_v4().simple()));

        self.executor
            .run(
                key,
                &argv([
                    "sh",
                    "-c",
                    WRITE_SCRIPT,
                    "sh",
                    self.config.signal_dir.as_str(),
                    staging.as_str(),
                    path.as_str(),
                ]),
                Some(payload.as_bytes()),
                &[],
            )
            .await?;

        let delivery = match self
            .executor
            .run(key, &argv(["cat", path.as_str()]), None, &[])
            .await
        {
            Ok(read_back) if read_back.stdout == payload.trim() => Delivery::Verified,
            Ok(_) => Delivery::Unconfirmed("read-back differs from what was written".into()),
            Err(SandboxError::CommandFailed { .. }) => {
                Delivery::Unconfirmed("file was gone on read-back, probably consumed".into())
            }
            Err(error) => Delivery::Unconfirmed(format!("read-back failed: {error}")),
        };

        if let Delivery::Unconfirmed(reason) = &delivery {
            warn!("delivered {path} to {key} without confirmation: {reason}");
        } else {
            debug!("delivered {path} to {key}");
        }
        Ok(delivery)
    }

    /// Polls until `request_id` appears, then reads and deletes it. Returns `None` on timeout.
    pub async fn await_file(
        &self,
        key: &SandboxKey,
        request_id: &str,
        timeout: Duration,
    ) -> SandboxResult<Option<String>> {
        validate_request_id(request_id)?;
        let path = self.path_for(request_id);
        let deadline = Instant::now() + timeout;
        let take = argv(["sh", "-c", TAKE_SCRIPT, "sh", path.as_str()]);

        loop {
            match self.executor.run(key, &take, None, &[]).await {
                Ok(output) => return Ok(Some(output.stdout)),
                Err(SandboxError::CommandFailed { exit_code, .. }) if exit_code == NOT_YET => {}
                Err(error) => return Err(error),
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("gave up waiting for {path} in {key}");
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval().min(deadline - now)).await;
        }
    }

    /// Reads every pending permission prompt in one exec.
    pub async fn list_prompts(&self, key: &SandboxKey) -> SandboxResult<Vec<PermissionPrompt>> {
        let output = self
            .executor
            .run(
                key,
                &argv(["sh", "-c", LIST_PROMPTS_SCRIPT, "sh", self.config.signal_dir.as_str()]),
                None,
                &[],
            )
            .await?;

        let prompts = output
            .stdout
            .split('\0')
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .filter_map(|raw| match serde_json::from_str::<PermissionPrompt>(raw) {
                Ok(prompt) => Some(prompt),
                Err(error) => {
                    warn!("skipping unreadable permission prompt in {key}: {error}");
                    None
                }
            })
            .collect();
        Ok(prompts)
    }

    pub async fn respond(
        &self,
        key: &SandboxKey,
        decision: &PermissionDecision,
    ) -> SandboxResult<Delivery> {
        validate_request_id(&decision.prompt_id)?;
        let payload = json!({
            "promptId": decision.prompt_id,
            "approved": decision.approved,
            "reason": decision.reason,
            "timestamp": Utc::now().to_rfc3339(),
        })
        .to_string();

        let delivery = self
            .deliver(key, &format!("response_{}.json", decision.prompt_id), &payload)
            .await?;

        let prompt_file = self.path_for(&format!("permission_{}.json", decision.prompt_id));
        if let Err(error) = self
            .executor
            .run(key, &argv(["rm", "-f", prompt_file.as_str()]), None, &[])
            .await
        {
            debug!("could not remove {prompt_file}: {error}");
        }
        Ok(delivery)
    }
}

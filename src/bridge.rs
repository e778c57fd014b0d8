//! Long-lived interactive processes inside a sandbox: assistant turns and the login wizard.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, RwLock};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::demux::{self, Channel};
use crate::errors::{SandboxError, SandboxResult};
use crate::events::{LineAccumulator, TurnRenderer};
use crate::executor::{argv, CommandExecutor};
use crate::models::{EnvVar, LoginResponse, SandboxKey, VerifyCodeResponse};
use crate::runtime::ExecStream;
use crate::sessions::SessionStore;
use crate::settings::ManagerConfig;
use crate::signal::SignalFileChannel;
use crate::wizard::{self, MarkerWindow, SetupSignal, VerifySignal};

/// Text chunks of one assistant turn, in order.
pub type ChunkStream = BoxStream<'static, String>;

const CHUNK_BUFFER: usize = 64;
const LOGIN_OUTPUT_BUFFER: usize = 256;
const READ_BUFFER: usize = 4096;

/// Records the shell's pid, then becomes the assistant process so the pid stays valid.
const PID_WRAPPER: &str =
    r#"pidfile="$1"; shift; mkdir -p "$(dirname "$pidfile")"; echo $$ > "$pidfile"; exec "$@""#;
const KILL_SCRIPT: &str =
    r#"if [ -f "$1" ]; then kill "$(cat "$1")" 2>/dev/null; rm -f "$1"; fi"#;
const INSTALL_EXPECT: &str =
    "command -v expect >/dev/null 2>&1 || (apt-get update -qq && apt-get install -y -qq expect)";
const PREPARE_SIGNAL_DIR: &str =
    r#"mkdir -p "$1" && chmod 777 "$1" && rm -f "$1/verification_code.txt" "$1/auth_result.txt""#;
const INSTALL_SCRIPT: &str = r#"cat > "$1" && chmod 755 "$1""#;
const WRITE_FILE: &str = r#"mkdir -p "$(dirname "$1")" && cat > "$1""#;

const ALLOWED_TOOLS: &[&str] = &[
    "Bash",
    "Edit",
    "MultiEdit",
    "NotebookEdit",
    "WebFetch",
    "WebSearch",
    "Write",
];

/// A login driver that outlives the request that started it.
#[derive(Clone)]
struct LoginHandle {
    session_id: String,
    output: broadcast::Sender<String>,
    ended: CancellationToken,
    pump: AbortHandle,
}

type LoginTable = Arc<RwLock<HashMap<SandboxKey, LoginHandle>>>;

pub struct InteractiveSessionBridge {
    executor: Arc<CommandExecutor>,
    signals: Arc<SignalFileChannel>,
    config: Arc<ManagerConfig>,
    sessions: SessionStore,
    logins: LoginTable,
}

impl InteractiveSessionBridge {
    pub fn new(
        executor: Arc<CommandExecutor>,
        signals: Arc<SignalFileChannel>,
        config: Arc<ManagerConfig>,
    ) -> Self {
        Self {
            executor,
            signals,
            config,
            sessions: SessionStore::new(),
            logins: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    fn assistant_env(&self) -> Vec<EnvVar> {
        self.config
            .api_key
            .iter()
            .map(|key| EnvVar::new("ANTHROPIC_API_KEY", key))
            .collect()
    }

    /// Command line of one non-interactive assistant turn.
    pub fn turn_argv(&self, message: &str, with_settings: bool, resume: Option<&str>) -> Vec<String> {
        let mut command = argv([
            self.config.assistant_binary.as_str(),
            "--print",
            "--verbose",
            "--output-format",
            "stream-json",
        ]);
        if with_settings {
            command.extend(argv([
                "--mcp-config",
                self.config.assistant_settings_path.as_str(),
                "--permission-prompt-tool",
            ]));
            command.push(self.config.permission_tool());
        }
        if let Some(token) = resume {
            command.extend(argv(["--resume", token]));
        }
        command.push(message.to_string());
        command
    }

    /// Starts an assistant turn and returns its chunks as they arrive.
    ///
    /// Dropping the returned stream stops the assistant process inside the sandbox.
    pub async fn start_turn(&self, key: &SandboxKey, message: &str) -> SandboxResult<ChunkStream> {
        let message = message.trim();
        if message.is_empty() {
            return Err(SandboxError::InvalidRequest("message must not be empty".into()));
        }

        let with_settings = self
            .executor
            .probe(
                key,
                &argv(["test", "-f", self.config.assistant_settings_path.as_str()]),
            )
            .await?;
        let resume = self.sessions.get(key).await;

        let pid_file = format!(
            "{}/assistant-{}.pid",
            self.config.signal_dir.trim_end_matches('/'),
            Uuid::new_v4().simple()
        );
        let mut command = argv(["sh", "-c", PID_WRAPPER, "sh", pid_file.as_str()]);
        command.extend(self.turn_argv(message, with_settings, resume.as_deref()));

        let (sandbox, _exec_id, exec) = self
            .executor
            .open(key, &command, &self.assistant_env(), false, false)
            .await?;
        info!(
            "assistant turn started in {} (resuming: {})",
            sandbox.name,
            resume.is_some()
        );

        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
        let turn = TurnPump {
            key: key.clone(),
            executor: Arc::clone(&self.executor),
            sessions: self.sessions.clone(),
            pid_file,
        };
        tokio::spawn(turn.run(exec, tx));

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        })
        .boxed())
    }

    pub async fn check_authenticated(&self, key: &SandboxKey) -> SandboxResult<bool> {
        let whoami = argv([self.config.assistant_binary.as_str(), "auth", "whoami"]);
        match self
            .executor
            .run(key, &whoami, None, &self.assistant_env())
            .await
        {
            Ok(output) => {
                let text = format!("{}\n{}", output.stdout, output.stderr).to_lowercase();
                Ok(!text.trim().is_empty()
                    && !text.contains("not authenticated")
                    && !text.contains("no valid"))
            }
            Err(SandboxError::CommandFailed { .. }) => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Writes the project's assistant settings unless they already exist.
    /// Returns whether a file was written.
    pub async fn ensure_assistant_settings(&self, key: &SandboxKey) -> SandboxResult<bool> {
        let path = self.config.assistant_settings_path.as_str();
        if self.executor.probe(key, &argv(["test", "-f", path])).await? {
            return Ok(false);
        }

        let (command, args) = self
            .config
            .permission_server_command
            .split_first()
            .map(|(command, args)| (command.clone(), args.to_vec()))
            .unwrap_or_default();
        let mut servers = serde_json::Map::new();
        servers.insert(
            self.config.permission_server.clone(),
            json!({ "command": command, "args": args }),
        );
        let settings = json!({
            "includeCoAuthoredBy": false,
            "permissions": { "allow": ALLOWED_TOOLS },
            "mcpServers": servers,
        });
        let body = serde_json::to_string_pretty(&settings)
            .map_err(|e| SandboxError::Internal(format!("encode assistant settings: {e}")))?;

        self.executor
            .run(
                key,
                &argv(["sh", "-c", WRITE_FILE, "sh", path]),
                Some(body.as_bytes()),
                &[],
            )
            .await?;
        info!("wrote assistant settings for {key}");
        Ok(true)
    }

    pub async fn clear_session(&self, key: &SandboxKey) -> bool {
        self.sessions.clear(key).await
    }

    pub async fn has_live_login(&self, key: &SandboxKey) -> bool {
        self.logins
            .read()
            .await
            .get(key)
            .is_some_and(|handle| !handle.ended.is_cancelled())
    }

    /// Starts the login driver and waits for its first milestone.
    ///
    /// When a sign-in URL shows up the driver keeps running in the background and stays
    /// addressable by `key` until [`Self::verify_code`] or its own exit.
    pub async fn start_login(&self, key: &SandboxKey) -> SandboxResult<LoginResponse> {
        if let Some(previous) = self.logins.write().await.remove(key) {
            debug!("replacing login session {} for {key}", previous.session_id);
            previous.pump.abort();
        }

        let signal_dir = self.config.signal_dir.as_str();
        self.executor
            .run(key, &argv(["sh", "-c", INSTALL_EXPECT]), None, &[])
            .await?;
        self.executor
            .run(key, &argv(["sh", "-c", PREPARE_SIGNAL_DIR, "sh", signal_dir]), None, &[])
            .await?;
        let script = wizard::render_script(&self.config.assistant_binary, signal_dir);
        self.executor
            .run(
                key,
                &argv(["sh", "-c", INSTALL_SCRIPT, "sh", wizard::SCRIPT_PATH]),
                Some(script.as_bytes()),
                &[],
            )
            .await?;

        let (sandbox, _exec_id, exec) = self
            .executor
            .open(
                key,
                &argv(["expect", wizard::SCRIPT_PATH]),
                &self.assistant_env(),
                true,
                true,
            )
            .await?;

        let session_id = Uuid::new_v4().to_string();
        let (output, mut rx) = broadcast::channel(LOGIN_OUTPUT_BUFFER);
        let ended = CancellationToken::new();
        let pump = tokio::spawn(pump_login(
            exec,
            output.clone(),
            ended.clone(),
            Arc::clone(&self.logins),
            key.clone(),
            session_id.clone(),
        ));
        let handle = LoginHandle {
            session_id: session_id.clone(),
            output,
            ended,
            pump: pump.abort_handle(),
        };
        info!("login driver started in {} (session {session_id})", sandbox.name);

        let timeout = self.config.setup_timeout();
        let signal = match tokio::time::timeout(timeout, first_setup_signal(&mut rx, &handle.ended)).await
        {
            Ok(signal) => signal,
            Err(_) => {
                handle.pump.abort();
                return Err(SandboxError::AuthTimeout(format!(
                    "no sign-in URL within {}s",
                    timeout.as_secs()
                )));
            }
        };

        match signal {
            Some(SetupSignal::Url(auth_url)) => {
                let mut logins = self.logins.write().await;
                if handle.ended.is_cancelled() {
                    warn!("login driver for {key} exited right after printing its URL");
                } else {
                    logins.insert(key.clone(), handle);
                }
                Ok(LoginResponse::WaitingForCode {
                    auth_url,
                    session_id,
                })
            }
            Some(SetupSignal::AlreadyAuthenticated) => Ok(LoginResponse::AlreadyConfigured),
            Some(SetupSignal::Completed) => Ok(LoginResponse::Completed),
            Some(SetupSignal::Failed(detail)) => {
                handle.pump.abort();
                Err(SandboxError::AuthError(detail))
            }
            None => Err(SandboxError::AuthError(
                "login driver exited before printing a sign-in URL".into(),
            )),
        }
    }

    /// Hands the verification code to the login driver and waits for its verdict.
    pub async fn verify_code(&self, key: &SandboxKey, code: &str) -> SandboxResult<VerifyCodeResponse> {
        let code = code.trim();
        if code.is_empty() {
            return Err(SandboxError::InvalidRequest("verification code must not be empty".into()));
        }
        let timeout = self.config.verify_timeout();
        let deadline = Instant::now() + timeout;

        // Subscribe before delivering so no marker printed after pickup is missed.
        let live = self
            .logins
            .read()
            .await
            .get(key)
            .filter(|handle| !handle.ended.is_cancelled())
            .map(|handle| (handle.output.subscribe(), handle.ended.clone()));

        self.signals.deliver(key, wizard::CODE_FILE, code).await?;

        let mut window = MarkerWindow::default();
        if let Some((mut rx, ended)) = live {
            let watched = tokio::time::timeout_at(deadline, async {
                while let Some(chunk) = next_output(&mut rx, &ended).await {
                    window.push(&chunk);
                    if let Some(signal) = window.verify_signal() {
                        return Some(signal);
                    }
                }
                None
            })
            .await;

            match watched {
                Ok(Some(signal)) => return self.conclude_login(key, signal, window.acknowledged()).await,
                Ok(None) => info!("login output for {key} ended without a verdict; polling for the result file"),
                Err(_) => {
                    self.abandon_login(key).await;
                    return Err(SandboxError::AuthTimeout(format!(
                        "no verdict within {}s",
                        timeout.as_secs()
                    )));
                }
            }
        } else {
            info!("no live login session for {key}; polling for the result file");
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.signals.await_file(key, wizard::RESULT_FILE, remaining).await? {
            Some(result) => {
                let signal = if result.contains(wizard::ALREADY_AUTHENTICATED) {
                    VerifySignal::Success
                } else {
                    wizard::classify_verdict(&result)
                        .unwrap_or_else(|| VerifySignal::Failure(result.trim().to_string()))
                };
                self.conclude_login(key, signal, window.acknowledged()).await
            }
            None => {
                self.abandon_login(key).await;
                Err(SandboxError::AuthTimeout(format!(
                    "no verdict within {}s",
                    timeout.as_secs()
                )))
            }
        }
    }

    async fn conclude_login(
        &self,
        key: &SandboxKey,
        signal: VerifySignal,
        acknowledged: bool,
    ) -> SandboxResult<VerifyCodeResponse> {
        self.logins.write().await.remove(key);
        match signal {
            VerifySignal::Success => {
                info!("assistant login completed for {key}");
                Ok(VerifyCodeResponse {
                    configured: true,
                    acknowledged,
                })
            }
            VerifySignal::Failure(detail) => {
                warn!("assistant login failed for {key}: {detail}");
                Err(SandboxError::AuthError(detail))
            }
        }
    }

    async fn abandon_login(&self, key: &SandboxKey) {
        if let Some(handle) = self.logins.write().await.remove(key) {
            handle.pump.abort();
        }
    }
}

async fn first_setup_signal(
    rx: &mut broadcast::Receiver<String>,
    ended: &CancellationToken,
) -> Option<SetupSignal> {
    let mut window = MarkerWindow::default();
    while let Some(chunk) = next_output(rx, ended).await {
        window.push(&chunk);
        if let Some(signal) = window.setup_signal() {
            return Some(signal);
        }
    }
    None
}

/// Next chunk of driver output; `None` once the driver is gone and everything was read.
async fn next_output(
    rx: &mut broadcast::Receiver<String>,
    ended: &CancellationToken,
) -> Option<String> {
    loop {
        tokio::select! {
            biased;
            received = rx.recv() => match received {
                Ok(chunk) => return Some(chunk),
                Err(RecvError::Lagged(skipped)) => warn!("login output watcher skipped {skipped} chunk(s)"),
                Err(RecvError::Closed) => return None,
            },
            _ = ended.cancelled() => return None,
        }
    }
}

async fn pump_login(
    mut exec: ExecStream,
    output: broadcast::Sender<String>,
    ended: CancellationToken,
    logins: LoginTable,
    key: SandboxKey,
    session_id: String,
) {
    let mut buf = vec![0u8; READ_BUFFER];
    let mut pending = Vec::new();
    loop {
        match exec.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let text = take_utf8(&mut pending);
                if !text.is_empty() {
                    // No subscribers between requests is normal.
                    let _ = output.send(text);
                }
            }
            Err(error) => {
                debug!("login output for {key} failed: {error}");
                break;
            }
        }
    }
    if !pending.is_empty() {
        let _ = output.send(String::from_utf8_lossy(&pending).into_owned());
    }

    ended.cancel();
    let mut logins = logins.write().await;
    if logins
        .get(&key)
        .is_some_and(|handle| handle.session_id == session_id)
    {
        logins.remove(&key);
    }
    info!("login driver for {key} exited");
}

/// Decodes the complete UTF-8 prefix of `pending`, keeping a trailing partial character.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let valid = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(error) if error.error_len().is_none() => error.valid_up_to(),
        Err(_) => pending.len(),
    };
    let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
    pending.drain(..valid);
    text
}

enum TurnEnd {
    Finished,
    Exhausted,
    Broken(String),
    Disconnected,
}

/// Drives one assistant exec and forwards its rendered chunks.
struct TurnPump {
    key: SandboxKey,
    executor: Arc<CommandExecutor>,
    sessions: SessionStore,
    pid_file: String,
}

impl TurnPump {
    async fn run(self, exec: ExecStream, tx: mpsc::Sender<String>) {
        let mut frames = demux::frames(exec);
        let mut renderer = TurnRenderer::new();
        let mut stdout = LineAccumulator::default();
        let mut stderr = LineAccumulator::default();
        let mut remembered = false;

        let end = 'turn: loop {
            let next = tokio::select! {
                _ = tx.closed() => None,
                frame = frames.next() => Some(frame),
            };
            let frame = match next {
                None => break TurnEnd::Disconnected,
                Some(None) => break TurnEnd::Exhausted,
                Some(Some(Err(error))) => break TurnEnd::Broken(error.to_string()),
                Some(Some(Ok(frame))) => frame,
            };

            let lines = match frame.channel {
                Channel::Stdout => stdout.push(&frame.payload),
                Channel::Stderr => stderr.push(&frame.payload),
            };
            for line in lines {
                let step = renderer.feed_line(&line);
                self.remember_session(&renderer, &mut remembered).await;
                for chunk in step.chunks {
                    if tx.send(chunk).await.is_err() {
                        break 'turn TurnEnd::Disconnected;
                    }
                }
                if step.done {
                    break 'turn TurnEnd::Finished;
                }
            }
        };

        match &end {
            TurnEnd::Finished => {}
            TurnEnd::Exhausted => {
                let mut chunks = Vec::new();
                for trailing in [stdout.finish(), stderr.finish()].into_iter().flatten() {
                    chunks.extend(renderer.feed_line(&trailing).chunks);
                }
                self.remember_session(&renderer, &mut remembered).await;
                chunks.extend(renderer.finish(None));
                for chunk in chunks {
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
            }
            TurnEnd::Broken(reason) => {
                warn!("assistant stream for {} broke: {reason}", self.key);
                if !renderer.started() {
                    let _ = tx.send(format!("Stream error: {reason}")).await;
                }
            }
            TurnEnd::Disconnected => {
                info!("client left the assistant turn for {}; stopping it", self.key);
            }
        }
        drop(tx);
        drop(frames);

        // A turn can end on a terminal event while the CLI is still shutting down.
        let cleanup = match end {
            TurnEnd::Disconnected | TurnEnd::Broken(_) | TurnEnd::Finished => KILL_SCRIPT,
            TurnEnd::Exhausted => r#"rm -f "$1""#,
        };
        if let Err(error) = self
            .executor
            .run(
                &self.key,
                &argv(["sh", "-c", cleanup, "sh", self.pid_file.as_str()]),
                None,
                &[],
            )
            .await
        {
            debug!("assistant cleanup for {} failed: {error}", self.key);
        }
    }

    async fn remember_session(&self, renderer: &TurnRenderer, remembered: &mut bool) {
        if *remembered {
            return;
        }
        if let Some(token) = renderer.session_id() {
            self.sessions.set(&self.key, token).await;
            *remembered = true;
        }
    }
}

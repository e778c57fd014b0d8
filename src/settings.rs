//! Daemon settings.
//!
//! Settings are read from a JSON file, by default in the OS-appropriate config directory:
//! - macOS: `~/Library/Application Support/underleaf/settings.json`
//! - Linux: `~/.config/underleaf/settings.json`
//!
//! Every field has a default, so a partial file (or none at all) is fine.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_NAME: &str = "underleaf";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Image every sandbox runs.
    pub image: String,
    /// Docker network sandboxes join. Empty means the engine default.
    pub network: String,
    /// Mount point of the project volume, also the exec working directory.
    pub workdir: String,
    pub container_prefix: String,
    pub volume_prefix: String,
    /// Prefix of every label this daemon applies (`<prefix>.user`, `<prefix>.type`, ...).
    pub label_prefix: String,
    pub reaper_interval_secs: u64,
    pub max_idle_secs: u64,
    pub stop_grace_secs: u64,
    /// Sandbox-internal directory used for signal files.
    pub signal_dir: String,
    pub signal_poll_ms: u64,
    pub setup_timeout_secs: u64,
    pub verify_timeout_secs: u64,
    pub assistant_binary: String,
    /// Name of the MCP server answering permission prompts.
    pub permission_server: String,
    /// Command line of the permission prompt server inside the image.
    pub permission_server_command: Vec<String>,
    /// Project-relative path of the assistant settings file.
    pub assistant_settings_path: String,
    /// Injected into assistant execs only, never written into the sandbox.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            image: "underleaf-latex:latest".to_string(),
            network: "underleaf_web".to_string(),
            workdir: "/workdir".to_string(),
            container_prefix: "underleaf-user".to_string(),
            volume_prefix: "underleaf-repo".to_string(),
            label_prefix: "underleaf".to_string(),
            reaper_interval_secs: 30 * 60,
            max_idle_secs: 60 * 60,
            stop_grace_secs: 10,
            signal_dir: "/tmp/claude-comm".to_string(),
            signal_poll_ms: 500,
            setup_timeout_secs: 300,
            verify_timeout_secs: 90,
            assistant_binary: "claude".to_string(),
            permission_server: "underleaf_permissions".to_string(),
            permission_server_command: vec![
                "node".to_string(),
                "/usr/local/lib/underleaf/permission-prompt-server.js".to_string(),
            ],
            assistant_settings_path: ".claude/settings.json".to_string(),
            api_key: None,
        }
    }
}

impl ManagerConfig {
    /// Default location of the settings file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join(SETTINGS_FILE))
    }

    /// Loads settings from `path`, or from [`Self::default_path`] when none is given.
    /// A missing file yields defaults; a malformed one is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path.map(Path::to_path_buf).or_else(Self::default_path) else {
            return Ok(Self::default());
        };

        match fs::read_to_string(&path) {
            Ok(contents) => {
                let config = serde_json::from_str(&contents).map_err(|e| {
                    anyhow::anyhow!("failed to parse settings file {}: {e}", path.display())
                })?;
                tracing::debug!("loaded settings from {:?}", path);
                Ok(config)
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(error) => Err(anyhow::anyhow!(
                "failed to read settings file {}: {error}",
                path.display()
            )),
        }
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn signal_poll(&self) -> Duration {
        Duration::from_millis(self.signal_poll_ms)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn label(&self, name: &str) -> String {
        format!("{}.{name}", self.label_prefix)
    }

    /// Tool name the assistant calls for permission prompts.
    pub fn permission_tool(&self) -> String {
        format!("mcp__{}__permission_prompt", self.permission_server)
    }
}

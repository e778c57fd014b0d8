use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use utoipa::ToSchema;

/// Identity of a sandbox and of its assistant session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, ToSchema)]
pub struct SandboxKey {
    pub user: String,
    pub project: String,
}

impl SandboxKey {
    pub fn new(user: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            project: project.into(),
        }
    }
}

impl fmt::Display for SandboxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user, self.project)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn to_assignment(&self) -> String {
        format!("{}={}", self.key, self.value)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Running,
    Stopped,
    Error,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct Sandbox {
    pub user: String,
    pub project: String,
    pub container_id: String,
    pub name: String,
    /// Volume mounted at creation; never changes afterwards.
    pub volume: String,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

impl Sandbox {
    pub fn key(&self) -> SandboxKey {
        SandboxKey::new(&self.user, &self.project)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct Volume {
    pub project: String,
    pub name: String,
    /// Container ids currently mounting this volume.
    pub sandboxes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct ProjectOverview {
    pub project: String,
    pub volume: Option<Volume>,
    pub sandboxes: Vec<Sandbox>,
    pub collaborators: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct StatsResponse {
    pub sandboxes: Vec<Sandbox>,
    pub volumes: Vec<Volume>,
    pub total_sandboxes: usize,
    pub total_volumes: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct ForceDeleteRequest {
    /// Must be exactly `DELETE_ALL_DATA`.
    #[schema(example = "DELETE_ALL_DATA")]
    pub confirm: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct ExecRequest {
    /// Shell command run with `bash -c` inside the sandbox
    #[schema(example = "git log --oneline -5")]
    pub command: String,
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct ExecResponse {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct FileListResponse {
    pub paths: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct FileQuery {
    #[schema(example = "chapters/intro.tex")]
    pub path: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct FileContent {
    pub path: String,
    pub content: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct CompileRequest {
    #[serde(default = "default_tex_file")]
    #[schema(example = "main.tex")]
    pub tex_file: String,
}

fn default_tex_file() -> String {
    "main.tex".to_string()
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct CompileResponse {
    pub pdf_file: String,
    pub strategy: String,
    pub log: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct AssistantRequest {
    pub message: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum LoginResponse {
    /// The sign-in URL was captured; the driver is waiting for the verification code.
    WaitingForCode { auth_url: String, session_id: String },
    AlreadyConfigured,
    Completed,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct VerifyCodeRequest {
    pub code: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
pub struct VerifyCodeResponse {
    pub configured: bool,
    /// Whether the driver confirmed it picked up the code.
    pub acknowledged: bool,
}

/// A prompt dropped by the permission tool inside the sandbox.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct PermissionPrompt {
    pub id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub details: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PermissionDecision {
    pub prompt_id: String,
    pub approved: bool,
    #[serde(default)]
    pub reason: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

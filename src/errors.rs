use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::runtime::RuntimeError;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),
    #[error("command failed with exit code {exit_code}: {}", failure_detail(.stdout, .stderr))]
    CommandFailed {
        exit_code: i64,
        stdout: String,
        stderr: String,
    },
    #[error("volume {volume} is still used by {sandboxes} sandbox(es)")]
    VolumeInUse { volume: String, sandboxes: usize },
    #[error("authentication timed out: {0}")]
    AuthTimeout(String),
    #[error("authentication failed: {0}")]
    AuthError(String),
    #[error("exec stream could not be demultiplexed: {0}")]
    ProtocolDesync(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("access denied: {0}")]
    Forbidden(String),
    #[error("compilation failed: {0}")]
    CompileFailed(String),
    #[error(transparent)]
    Runtime(RuntimeError),
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn failure_detail<'a>(stdout: &'a str, stderr: &'a str) -> &'a str {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr;
    }
    let stdout = stdout.trim();
    if !stdout.is_empty() {
        return stdout;
    }
    "no output"
}

impl From<RuntimeError> for SandboxError {
    /// An object that disappeared underneath us means the sandbox is gone, not a server fault.
    fn from(error: RuntimeError) -> Self {
        match error {
            RuntimeError::NotFound(what) => {
                SandboxError::SandboxUnavailable(format!("{what} no longer exists"))
            }
            other => SandboxError::Runtime(other),
        }
    }
}

impl SandboxError {
    pub fn exit_code(&self) -> Option<i64> {
        match self {
            SandboxError::CommandFailed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for SandboxError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            SandboxError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            SandboxError::SandboxUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "sandbox_unavailable")
            }
            SandboxError::CommandFailed { .. } => (StatusCode::BAD_GATEWAY, "command_failed"),
            SandboxError::ProtocolDesync(_) => (StatusCode::BAD_GATEWAY, "protocol_desync"),
            SandboxError::VolumeInUse { .. } => (StatusCode::CONFLICT, "volume_in_use"),
            SandboxError::AuthTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "auth_timeout"),
            SandboxError::AuthError(_) => (StatusCode::UNAUTHORIZED, "auth_error"),
            SandboxError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            SandboxError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            SandboxError::CompileFailed(_) => (StatusCode::UNPROCESSABLE_ENTITY, "compile_failed"),
            SandboxError::Runtime(_) | SandboxError::Internal(_) | SandboxError::Io(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        let body = ErrorBody {
            code: code.to_string(),
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;

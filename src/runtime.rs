//! Container runtime seam.
//!
//! Everything the registries and the executor need from the container engine goes
//! through [`ContainerRuntime`]. The production implementation lives in
//! [`crate::docker`]; tests drive the same code paths with an in-memory fake.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no such object: {0}")]
    NotFound(String),
    #[error("object already exists: {0}")]
    AlreadyExists(String),
    #[error("container runtime error: {0}")]
    Api(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// A hijacked exec connection. Reads yield the exec's output, writes feed its stdin and
/// shutting down the write half closes stdin.
pub trait ExecIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ExecIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type ExecStream = Box<dyn ExecIo>;

#[derive(Clone, Debug)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub volume: String,
    pub mount_target: String,
    pub network: Option<String>,
    pub labels: HashMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerState {
    pub running: bool,
}

/// A labelled container as reported by a list call.
#[derive(Clone, Debug)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct ExecSpec {
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub attach_stdin: bool,
    pub tty: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecStatus {
    pub running: bool,
    pub exit_code: Option<i64>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    async fn volume_exists(&self, name: &str) -> RuntimeResult<bool>;
    /// Fails with [`RuntimeError::AlreadyExists`] when the volume is already there.
    async fn create_volume(&self, name: &str, labels: HashMap<String, String>)
        -> RuntimeResult<()>;
    async fn remove_volume(&self, name: &str) -> RuntimeResult<()>;

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String>;
    async fn start_container(&self, id: &str) -> RuntimeResult<()>;
    async fn stop_container(&self, id: &str, grace: Duration) -> RuntimeResult<()>;
    async fn remove_container(&self, id: &str) -> RuntimeResult<()>;
    /// Returns `None` when the container no longer exists.
    async fn inspect_container(&self, id: &str) -> RuntimeResult<Option<ContainerState>>;
    async fn list_containers(&self, label: &str) -> RuntimeResult<Vec<ContainerRecord>>;

    async fn create_exec(&self, container_id: &str, spec: &ExecSpec) -> RuntimeResult<String>;
    /// With `tty == false` the returned stream carries multiplexed frames (see
    /// [`crate::demux`]); with a TTY it carries raw terminal bytes.
    async fn start_exec(&self, exec_id: &str, tty: bool) -> RuntimeResult<ExecStream>;
    async fn inspect_exec(&self, exec_id: &str) -> RuntimeResult<ExecStatus>;

    /// Returns a tar archive holding the file or directory at `path`.
    async fn download_archive(&self, container_id: &str, path: &str) -> RuntimeResult<Vec<u8>>;
}

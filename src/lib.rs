pub mod api;
pub mod bridge;
pub mod compile;
pub mod demux;
pub mod docker;
pub mod errors;
pub mod events;
pub mod executor;
pub mod files;
pub mod locks;
pub mod manager;
pub mod models;
pub mod registry;
pub mod runtime;
pub mod service;
pub mod sessions;
pub mod settings;
pub mod signal;
pub mod volumes;
pub mod wizard;

pub use api::build_router;
pub use docker::DockerRuntime;
pub use errors::{SandboxError, SandboxResult};
pub use manager::SandboxManager;
pub use service::SandboxService;
pub use settings::ManagerConfig;

pub const DEFAULT_HTTP_PORT: u16 = 46840;

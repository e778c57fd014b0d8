use async_trait::async_trait;
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{sleep, Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use underleaf_sandbox::bridge::ChunkStream;
use underleaf_sandbox::docker::DEFAULT_SOCKET;
use underleaf_sandbox::errors::{SandboxError, SandboxResult};
use underleaf_sandbox::models::{
    AssistantRequest, CompileRequest, CompileResponse, ExecRequest, ExecResponse, FileContent,
    FileListResponse, LoginResponse, PermissionDecision, PermissionPrompt, ProjectOverview,
    Sandbox, SandboxKey, StatsResponse, VerifyCodeRequest, VerifyCodeResponse, Volume,
};
use underleaf_sandbox::{
    build_router, DockerRuntime, ManagerConfig, SandboxManager, SandboxService, DEFAULT_HTTP_PORT,
};

#[derive(Parser, Debug)]
#[command(name = "underleaf-sandboxd", author, version)]
struct Options {
    /// Address the HTTP server binds to
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,
    /// Port for the HTTP server
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT, env = "UNDERLEAF_SANDBOX_PORT")]
    port: u16,
    /// Directory used for logs
    #[arg(long, default_value = "/var/log/underleaf", env = "UNDERLEAF_SANDBOX_LOG_DIR")]
    log_dir: PathBuf,
    /// Settings file; defaults to the per-user config directory
    #[arg(long)]
    config: Option<PathBuf>,
    /// Docker Engine socket
    #[arg(long, default_value = DEFAULT_SOCKET, env = "DOCKER_SOCKET")]
    docker_socket: PathBuf,
    /// API key handed to the assistant inside sandboxes
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    let _guard = init_tracing(&options.log_dir);

    let mut config = match options.config.as_deref() {
        Some(path) => ManagerConfig::load(Some(path))?,
        None => ManagerConfig::load(ManagerConfig::default_path().as_deref())?,
    };
    if options.api_key.is_some() {
        config.api_key = options.api_key.clone();
    }

    run_server(options, config).await;

    Ok(())
}

fn init_tracing(log_dir: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!(
            "Failed to create log directory {:?}: {}. Logging to file disabled.",
            log_dir, e
        );
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, "underleaf-sandboxd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Some(guard)
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {error}");
    }
    tracing::info!("shutdown signal received");
}

async fn run_server(options: Options, config: ManagerConfig) {
    let bind_ip = parse_bind_ip(&options.bind);
    let service = build_service(&options.docker_socket, config).await;
    let app = build_router(service);

    let addr = SocketAddr::new(bind_ip, options.port);
    let retry_delay = Duration::from_secs(5);

    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                tracing::info!("underleaf-sandboxd listening on http://{}", addr);

                match axum::serve(listener, app.clone())
                    .with_graceful_shutdown(shutdown_signal())
                    .await
                {
                    Ok(()) => {
                        tracing::info!("server shut down gracefully");
                        break;
                    }
                    Err(error) => {
                        tracing::error!(?error, "server error; restarting");
                    }
                }
            }
            Err(error) => {
                tracing::error!(?error, %addr, "failed to bind listener");
            }
        }

        tracing::info!(
            "retrying server startup in {} seconds",
            retry_delay.as_secs()
        );
        sleep(retry_delay).await;
    }
}

fn parse_bind_ip(bind: &str) -> IpAddr {
    match bind.parse() {
        Ok(ip) => ip,
        Err(error) => {
            tracing::error!(
                ?error,
                %bind,
                "invalid bind address; defaulting to 0.0.0.0"
            );
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
    }
}

async fn build_service(socket: &Path, config: ManagerConfig) -> Arc<dyn SandboxService> {
    let runtime = match DockerRuntime::connect(socket) {
        Ok(runtime) => runtime,
        Err(error) => return degraded(error.to_string()),
    };
    if let Err(error) = runtime.ping().await {
        return degraded(error.to_string());
    }
    tracing::info!("connected to docker at {}", socket.display());

    let manager = SandboxManager::new(Arc::new(runtime), config);
    match manager.start().await {
        // The reaper runs for the life of the process.
        Ok(_reaper) => Arc::new(manager),
        Err(error) => degraded(error.to_string()),
    }
}

fn degraded(reason: String) -> Arc<dyn SandboxService> {
    tracing::error!(%reason, "failed to initialize docker runtime; running in degraded mode");
    Arc::new(UnavailableSandboxService::new(reason))
}

struct UnavailableSandboxService {
    reason: String,
}

impl UnavailableSandboxService {
    fn new(reason: String) -> Self {
        Self { reason }
    }

    fn error(&self, operation: &str) -> SandboxError {
        SandboxError::SandboxUnavailable(format!(
            "{operation}: container runtime failed to start ({})",
            self.reason
        ))
    }
}

#[async_trait]
impl SandboxService for UnavailableSandboxService {
    async fn provision_project(&self, _project: String) -> SandboxResult<Volume> {
        Err(self.error("provision project"))
    }

    async fn project(&self, _project: String) -> SandboxResult<ProjectOverview> {
        Err(self.error("get project"))
    }

    async fn volume(&self, _project: String) -> SandboxResult<Volume> {
        Err(self.error("get volume"))
    }

    async fn force_delete_volume(&self, _project: String, _confirm: String) -> SandboxResult<Volume> {
        Err(self.error("delete volume"))
    }

    async fn stats(&self) -> SandboxResult<StatsResponse> {
        Err(self.error("list sandboxes"))
    }

    async fn ensure(&self, _key: SandboxKey) -> SandboxResult<Sandbox> {
        Err(self.error("ensure sandbox"))
    }

    async fn get(&self, _key: SandboxKey) -> SandboxResult<Option<Sandbox>> {
        Err(self.error("get sandbox"))
    }

    async fn remove(&self, _key: SandboxKey) -> SandboxResult<Option<Sandbox>> {
        Err(self.error("remove sandbox"))
    }

    async fn exec(&self, _key: SandboxKey, _request: ExecRequest) -> SandboxResult<ExecResponse> {
        Err(self.error("exec sandbox command"))
    }

    async fn list_files(&self, _key: SandboxKey) -> SandboxResult<FileListResponse> {
        Err(self.error("list files"))
    }

    async fn read_file(&self, _key: SandboxKey, _path: String) -> SandboxResult<FileContent> {
        Err(self.error("read file"))
    }

    async fn write_file(&self, _key: SandboxKey, _file: FileContent) -> SandboxResult<()> {
        Err(self.error("write file"))
    }

    async fn compile(
        &self,
        _key: SandboxKey,
        _request: CompileRequest,
    ) -> SandboxResult<CompileResponse> {
        Err(self.error("compile"))
    }

    async fn pdf(&self, _key: SandboxKey, _path: String) -> SandboxResult<Vec<u8>> {
        Err(self.error("fetch pdf"))
    }

    async fn assistant_turn(
        &self,
        _key: SandboxKey,
        _request: AssistantRequest,
    ) -> SandboxResult<ChunkStream> {
        Err(self.error("assistant turn"))
    }

    async fn clear_assistant_session(&self, _key: SandboxKey) -> SandboxResult<bool> {
        Err(self.error("clear assistant session"))
    }

    async fn start_login(&self, _key: SandboxKey) -> SandboxResult<LoginResponse> {
        Err(self.error("start login"))
    }

    async fn verify_login(
        &self,
        _key: SandboxKey,
        _request: VerifyCodeRequest,
    ) -> SandboxResult<VerifyCodeResponse> {
        Err(self.error("verify login"))
    }

    async fn permission_prompts(&self, _key: SandboxKey) -> SandboxResult<Vec<PermissionPrompt>> {
        Err(self.error("list permission prompts"))
    }

    async fn respond_permission(
        &self,
        _key: SandboxKey,
        _decision: PermissionDecision,
    ) -> SandboxResult<()> {
        Err(self.error("respond to permission prompt"))
    }
}

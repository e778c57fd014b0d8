use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bridge::{ChunkStream, InteractiveSessionBridge};
use crate::compile::Compiler;
use crate::errors::{SandboxError, SandboxResult};
use crate::executor::{argv, CommandExecutor};
use crate::files::{validate_path, ProjectFiles};
use crate::models::{
    AssistantRequest, CompileRequest, CompileResponse, ExecRequest, ExecResponse, FileContent,
    FileListResponse, LoginResponse, PermissionDecision, PermissionPrompt, ProjectOverview,
    Sandbox, SandboxKey, StatsResponse, VerifyCodeRequest, VerifyCodeResponse, Volume,
};
use crate::registry::SandboxRegistry;
use crate::runtime::ContainerRuntime;
use crate::service::SandboxService;
use crate::settings::ManagerConfig;
use crate::signal::SignalFileChannel;
use crate::volumes::VolumeRegistry;

/// Wires the registries, executor, bridge and file helpers into one [`SandboxService`].
pub struct SandboxManager {
    volumes: Arc<VolumeRegistry>,
    registry: Arc<SandboxRegistry>,
    executor: Arc<CommandExecutor>,
    signals: Arc<SignalFileChannel>,
    bridge: InteractiveSessionBridge,
    files: Arc<ProjectFiles>,
    compiler: Compiler,
    config: Arc<ManagerConfig>,
}

impl SandboxManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ManagerConfig) -> Self {
        let config = Arc::new(config);
        let volumes = Arc::new(VolumeRegistry::new(
            Arc::clone(&runtime),
            Arc::clone(&config),
        ));
        let registry = Arc::new(SandboxRegistry::new(
            Arc::clone(&runtime),
            Arc::clone(&volumes),
            Arc::clone(&config),
        ));
        let executor = Arc::new(CommandExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&runtime),
            Arc::clone(&config),
        ));
        let signals = Arc::new(SignalFileChannel::new(
            Arc::clone(&executor),
            Arc::clone(&config),
        ));
        let bridge = InteractiveSessionBridge::new(
            Arc::clone(&executor),
            Arc::clone(&signals),
            Arc::clone(&config),
        );
        let files = Arc::new(ProjectFiles::new(Arc::clone(&executor)));
        let compiler = Compiler::new(
            Arc::clone(&executor),
            runtime,
            Arc::clone(&files),
            Arc::clone(&config),
        );

        Self {
            volumes,
            registry,
            executor,
            signals,
            bridge,
            files,
            compiler,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    pub fn volumes(&self) -> &Arc<VolumeRegistry> {
        &self.volumes
    }

    pub fn executor(&self) -> &Arc<CommandExecutor> {
        &self.executor
    }

    pub fn signals(&self) -> &Arc<SignalFileChannel> {
        &self.signals
    }

    pub fn bridge(&self) -> &InteractiveSessionBridge {
        &self.bridge
    }

    /// Restores state left by a previous run, then starts the idle reaper.
    pub async fn start(&self) -> SandboxResult<JoinHandle<()>> {
        self.registry.reconcile().await?;
        Ok(self.registry.spawn_reaper(self.config.reaper_interval()))
    }

    /// Per-sandbox operations refuse projects that were never provisioned.
    async fn require_project(&self, key: &SandboxKey) -> SandboxResult<()> {
        self.volumes.require(&key.project).await.map(|_| ())
    }
}

#[async_trait]
impl SandboxService for SandboxManager {
    async fn provision_project(&self, project: String) -> SandboxResult<Volume> {
        if project.trim().is_empty() {
            return Err(SandboxError::InvalidRequest("project name must not be empty".into()));
        }
        self.volumes.get_or_create(&project).await
    }

    async fn project(&self, project: String) -> SandboxResult<ProjectOverview> {
        let volume = self.volumes.require(&project).await?;
        let sandboxes = self.registry.for_project(&project).await;
        Ok(ProjectOverview {
            collaborators: sandboxes.len(),
            project,
            volume: Some(volume),
            sandboxes,
        })
    }

    async fn volume(&self, project: String) -> SandboxResult<Volume> {
        self.volumes.require(&project).await
    }

    async fn force_delete_volume(&self, project: String, confirm: String) -> SandboxResult<Volume> {
        self.volumes.force_delete(&project, &confirm).await
    }

    async fn stats(&self) -> SandboxResult<StatsResponse> {
        let sandboxes = self.registry.list().await;
        let volumes = self.volumes.list().await;
        Ok(StatsResponse {
            total_sandboxes: sandboxes.len(),
            total_volumes: volumes.len(),
            sandboxes,
            volumes,
        })
    }

    async fn ensure(&self, key: SandboxKey) -> SandboxResult<Sandbox> {
        self.require_project(&key).await?;
        self.registry.get_or_create(&key).await
    }

    async fn get(&self, key: SandboxKey) -> SandboxResult<Option<Sandbox>> {
        self.require_project(&key).await?;
        Ok(self.registry.get(&key).await)
    }

    async fn remove(&self, key: SandboxKey) -> SandboxResult<Option<Sandbox>> {
        self.require_project(&key).await?;
        Ok(self.registry.remove(&key).await)
    }

    async fn exec(&self, key: SandboxKey, request: ExecRequest) -> SandboxResult<ExecResponse> {
        self.require_project(&key).await?;
        if request.command.trim().is_empty() {
            return Err(SandboxError::InvalidRequest("command must not be empty".into()));
        }
        let command = argv(["bash", "-c", request.command.as_str()]);
        let started = Instant::now();
        let result = self.executor.run(&key, &command, None, &request.env).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => Ok(ExecResponse {
                exit_code: 0,
                stdout: output.stdout,
                stderr: output.stderr,
                duration_ms,
            }),
            Err(SandboxError::CommandFailed {
                exit_code,
                stdout,
                stderr,
            }) => Ok(ExecResponse {
                exit_code,
                stdout,
                stderr,
                duration_ms,
            }),
            Err(error) => Err(error),
        }
    }

    async fn list_files(&self, key: SandboxKey) -> SandboxResult<FileListResponse> {
        self.require_project(&key).await?;
        Ok(FileListResponse {
            paths: self.files.list(&key).await?,
        })
    }

    async fn read_file(&self, key: SandboxKey, path: String) -> SandboxResult<FileContent> {
        self.require_project(&key).await?;
        let path = validate_path(&path)?;
        let content = self.files.read(&key, &path).await?;
        Ok(FileContent { path, content })
    }

    async fn write_file(&self, key: SandboxKey, file: FileContent) -> SandboxResult<()> {
        self.require_project(&key).await?;
        self.files.write(&key, &file.path, &file.content).await
    }

    async fn compile(
        &self,
        key: SandboxKey,
        request: CompileRequest,
    ) -> SandboxResult<CompileResponse> {
        self.require_project(&key).await?;
        self.compiler.compile(&key, &request.tex_file).await
    }

    async fn pdf(&self, key: SandboxKey, path: String) -> SandboxResult<Vec<u8>> {
        self.require_project(&key).await?;
        self.compiler.fetch_pdf(&key, &path).await
    }

    async fn assistant_turn(
        &self,
        key: SandboxKey,
        request: AssistantRequest,
    ) -> SandboxResult<ChunkStream> {
        self.require_project(&key).await?;
        if !self.bridge.check_authenticated(&key).await? {
            return Err(SandboxError::AuthError(
                "assistant is not signed in; complete the login first".into(),
            ));
        }
        if let Err(error) = self.bridge.ensure_assistant_settings(&key).await {
            warn!("could not write assistant settings for {key}: {error}");
        }
        self.bridge.start_turn(&key, &request.message).await
    }

    async fn clear_assistant_session(&self, key: SandboxKey) -> SandboxResult<bool> {
        self.require_project(&key).await?;
        let cleared = self.bridge.clear_session(&key).await;
        if cleared {
            info!("cleared assistant session for {key}");
        }
        Ok(cleared)
    }

    async fn start_login(&self, key: SandboxKey) -> SandboxResult<LoginResponse> {
        self.require_project(&key).await?;
        self.bridge.start_login(&key).await
    }

    async fn verify_login(
        &self,
        key: SandboxKey,
        request: VerifyCodeRequest,
    ) -> SandboxResult<VerifyCodeResponse> {
        self.require_project(&key).await?;
        self.bridge.verify_code(&key, &request.code).await
    }

    async fn permission_prompts(&self, key: SandboxKey) -> SandboxResult<Vec<PermissionPrompt>> {
        self.require_project(&key).await?;
        self.signals.list_prompts(&key).await
    }

    async fn respond_permission(
        &self,
        key: SandboxKey,
        decision: PermissionDecision,
    ) -> SandboxResult<()> {
        self.require_project(&key).await?;
        let verdict = if decision.approved { "approved" } else { "denied" };
        self.signals.respond(&key, &decision).await?;
        info!("permission prompt {} {verdict} for {key}", decision.prompt_id);
        Ok(())
    }
}

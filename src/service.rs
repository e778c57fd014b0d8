use crate::bridge::ChunkStream;
use crate::errors::SandboxResult;
use crate::models::{
    AssistantRequest, CompileRequest, CompileResponse, ExecRequest, ExecResponse, FileContent,
    FileListResponse, LoginResponse, PermissionDecision, PermissionPrompt, ProjectOverview,
    Sandbox, SandboxKey, StatsResponse, VerifyCodeRequest, VerifyCodeResponse, Volume,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Everything the HTTP layer can ask of the sandbox daemon.
#[async_trait]
pub trait SandboxService: Send + Sync + 'static {
    async fn provision_project(&self, project: String) -> SandboxResult<Volume>;
    async fn project(&self, project: String) -> SandboxResult<ProjectOverview>;
    async fn volume(&self, project: String) -> SandboxResult<Volume>;
    async fn force_delete_volume(&self, project: String, confirm: String) -> SandboxResult<Volume>;
    async fn stats(&self) -> SandboxResult<StatsResponse>;

    async fn ensure(&self, key: SandboxKey) -> SandboxResult<Sandbox>;
    async fn get(&self, key: SandboxKey) -> SandboxResult<Option<Sandbox>>;
    async fn remove(&self, key: SandboxKey) -> SandboxResult<Option<Sandbox>>;
    /// A non-zero exit is reported in the response, not as an error.
    async fn exec(&self, key: SandboxKey, request: ExecRequest) -> SandboxResult<ExecResponse>;

    async fn list_files(&self, key: SandboxKey) -> SandboxResult<FileListResponse>;
    async fn read_file(&self, key: SandboxKey, path: String) -> SandboxResult<FileContent>;
    async fn write_file(&self, key: SandboxKey, file: FileContent) -> SandboxResult<()>;
    async fn compile(&self, key: SandboxKey, request: CompileRequest)
        -> SandboxResult<CompileResponse>;
    async fn pdf(&self, key: SandboxKey, path: String) -> SandboxResult<Vec<u8>>;

    async fn assistant_turn(
        &self,
        key: SandboxKey,
        request: AssistantRequest,
    ) -> SandboxResult<ChunkStream>;
    /// Returns whether a continuation token was dropped.
    async fn clear_assistant_session(&self, key: SandboxKey) -> SandboxResult<bool>;
    async fn start_login(&self, key: SandboxKey) -> SandboxResult<LoginResponse>;
    async fn verify_login(
        &self,
        key: SandboxKey,
        request: VerifyCodeRequest,
    ) -> SandboxResult<VerifyCodeResponse>;
    async fn permission_prompts(&self, key: SandboxKey) -> SandboxResult<Vec<PermissionPrompt>>;
    async fn respond_permission(
        &self,
        key: SandboxKey,
        decision: PermissionDecision,
    ) -> SandboxResult<()>;
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<dyn SandboxService>,
}

impl AppState {
    pub fn new(service: Arc<dyn SandboxService>) -> Self {
        Self { service }
    }
}

#[allow(dead_code)]
fn assert_app_state_bounds() {
    fn assert_state<T: Clone + Send + Sync + 'static>() {}
    assert_state::<AppState>();
}

use crate::errors::{ErrorBody, SandboxError, SandboxResult};
use crate::models::{
    AssistantRequest, CompileRequest, CompileResponse, EnvVar, ExecRequest, ExecResponse,
    FileContent, FileListResponse, FileQuery, ForceDeleteRequest, HealthResponse, LoginResponse,
    PermissionDecision, PermissionPrompt, ProjectOverview, Sandbox, SandboxKey, SandboxStatus,
    StatsResponse, VerifyCodeRequest, VerifyCodeResponse, Volume,
};
use crate::service::{AppState, SandboxService};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use utoipa::OpenApi as UtoipaOpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(UtoipaOpenApi)]
#[openapi(
    paths(
        health,
        provision_project,
        get_project,
        get_volume,
        force_delete_volume,
        stats,
        ensure_sandbox,
        get_sandbox,
        delete_sandbox,
        exec_sandbox,
        list_files,
        read_file,
        write_file,
        compile_project,
        get_pdf,
        assistant_turn,
        clear_assistant_session,
        start_login,
        verify_login,
        list_permissions,
        respond_permission,
    ),
    components(schemas(
        HealthResponse,
        ErrorBody,
        Volume,
        Sandbox,
        SandboxStatus,
        ProjectOverview,
        StatsResponse,
        ForceDeleteRequest,
        EnvVar,
        ExecRequest,
        ExecResponse,
        FileListResponse,
        FileQuery,
        FileContent,
        CompileRequest,
        CompileResponse,
        AssistantRequest,
        LoginResponse,
        VerifyCodeRequest,
        VerifyCodeResponse,
        PermissionPrompt,
        PermissionDecision
    )),
    tags(
        (name = "projects", description = "Project volumes shared by collaborators"),
        (name = "sandboxes", description = "Per-user sandbox containers"),
        (name = "assistant", description = "Coding assistant sessions inside a sandbox")
    )
)]
pub struct ApiDoc;

pub fn build_router(service: Arc<dyn SandboxService>) -> Router {
    let state = AppState::new(service);
    let openapi = ApiDoc::openapi();
    let swagger_routes: Router<AppState> =
        SwaggerUi::new("/docs").url("/openapi.json", openapi).into();

    Router::new()
        .route("/healthz", get(health))
        .route(
            "/projects/{project}",
            get(get_project).post(provision_project),
        )
        .route("/volumes/{project}", get(get_volume))
        .route("/volumes/{project}/force", delete(force_delete_volume))
        .route("/sandboxes", get(stats))
        .route(
            "/sandboxes/{user}/{project}",
            get(get_sandbox).delete(delete_sandbox),
        )
        .route("/sandboxes/{user}/{project}/ensure", post(ensure_sandbox))
        .route("/sandboxes/{user}/{project}/exec", post(exec_sandbox))
        .route("/sandboxes/{user}/{project}/files", get(list_files))
        .route(
            "/sandboxes/{user}/{project}/files/content",
            get(read_file).put(write_file),
        )
        .route("/sandboxes/{user}/{project}/compile", post(compile_project))
        .route("/sandboxes/{user}/{project}/pdf/{*path}", get(get_pdf))
        .route("/sandboxes/{user}/{project}/assistant", post(assistant_turn))
        .route(
            "/sandboxes/{user}/{project}/assistant/session",
            delete(clear_assistant_session),
        )
        .route(
            "/sandboxes/{user}/{project}/assistant/login",
            post(start_login),
        )
        .route(
            "/sandboxes/{user}/{project}/assistant/login/verify",
            post(verify_login),
        )
        .route(
            "/sandboxes/{user}/{project}/assistant/permissions",
            get(list_permissions),
        )
        .route(
            "/sandboxes/{user}/{project}/assistant/permissions/respond",
            post(respond_permission),
        )
        .merge(swagger_routes)
        .with_state(state)
}

fn sandbox_key((user, project): (String, String)) -> SandboxKey {
    SandboxKey::new(user, project)
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Server is healthy", body = HealthResponse))
)]
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[utoipa::path(
    post,
    path = "/projects/{project}",
    tag = "projects",
    params(("project" = String, Path, description = "Project identifier")),
    responses(
        (status = 201, description = "Project volume ready", body = Volume),
        (status = 400, description = "Bad request", body = ErrorBody)
    )
)]
async fn provision_project(
    State(state): State<AppState>,
    Path(project): Path<String>,
) -> SandboxResult<(StatusCode, Json<Volume>)> {
    let volume = state.service.provision_project(project).await?;
    Ok((StatusCode::CREATED, Json(volume)))
}

#[utoipa::path(
    get,
    path = "/projects/{project}",
    tag = "projects",
    params(("project" = String, Path, description = "Project identifier")),
    responses(
        (status = 200, description = "Volume and active sandboxes", body = ProjectOverview),
        (status = 404, description = "Unknown project", body = ErrorBody)
    )
)]
async fn get_project(
    State(state): State<AppState>,
    Path(project): Path<String>,
) -> SandboxResult<Json<ProjectOverview>> {
    Ok(Json(state.service.project(project).await?))
}

#[utoipa::path(
    get,
    path = "/volumes/{project}",
    tag = "projects",
    params(("project" = String, Path, description = "Project identifier")),
    responses(
        (status = 200, description = "Volume detail", body = Volume),
        (status = 404, description = "Unknown project", body = ErrorBody)
    )
)]
async fn get_volume(
    State(state): State<AppState>,
    Path(project): Path<String>,
) -> SandboxResult<Json<Volume>> {
    Ok(Json(state.service.volume(project).await?))
}

#[utoipa::path(
    delete,
    path = "/volumes/{project}/force",
    tag = "projects",
    params(("project" = String, Path, description = "Project identifier")),
    request_body = ForceDeleteRequest,
    responses(
        (status = 200, description = "Volume and its data removed", body = Volume),
        (status = 400, description = "Missing confirmation", body = ErrorBody),
        (status = 409, description = "Sandboxes still mount the volume", body = ErrorBody)
    )
)]
async fn force_delete_volume(
    State(state): State<AppState>,
    Path(project): Path<String>,
    Json(request): Json<ForceDeleteRequest>,
) -> SandboxResult<Json<Volume>> {
    let volume = state
        .service
        .force_delete_volume(project, request.confirm)
        .await?;
    Ok(Json(volume))
}

#[utoipa::path(
    get,
    path = "/sandboxes",
    tag = "sandboxes",
    responses((status = 200, description = "All sandboxes and volumes", body = StatsResponse))
)]
async fn stats(State(state): State<AppState>) -> SandboxResult<Json<StatsResponse>> {
    Ok(Json(state.service.stats().await?))
}

#[utoipa::path(
    post,
    path = "/sandboxes/{user}/{project}/ensure",
    tag = "sandboxes",
    params(
        ("user" = String, Path, description = "User identifier"),
        ("project" = String, Path, description = "Project identifier")
    ),
    responses(
        (status = 200, description = "Running sandbox", body = Sandbox),
        (status = 404, description = "Unknown project", body = ErrorBody),
        (status = 503, description = "Container runtime unavailable", body = ErrorBody)
    )
)]
async fn ensure_sandbox(
    State(state): State<AppState>,
    Path(ids): Path<(String, String)>,
) -> SandboxResult<Json<Sandbox>> {
    Ok(Json(state.service.ensure(sandbox_key(ids)).await?))
}

#[utoipa::path(
    get,
    path = "/sandboxes/{user}/{project}",
    tag = "sandboxes",
    params(
        ("user" = String, Path, description = "User identifier"),
        ("project" = String, Path, description = "Project identifier")
    ),
    responses(
        (status = 200, description = "Sandbox detail", body = Sandbox),
        (status = 404, description = "Not found", body = ErrorBody)
    )
)]
async fn get_sandbox(
    State(state): State<AppState>,
    Path(ids): Path<(String, String)>,
) -> Response {
    let key = sandbox_key(ids);
    match state.service.get(key.clone()).await {
        Ok(Some(sandbox)) => (StatusCode::OK, Json(sandbox)).into_response(),
        Ok(None) => SandboxError::NotFound(format!("sandbox {key}")).into_response(),
        Err(error) => error.into_response(),
    }
}

#[utoipa::path(
    delete,
    path = "/sandboxes/{user}/{project}",
    tag = "sandboxes",
    params(
        ("user" = String, Path, description = "User identifier"),
        ("project" = String, Path, description = "Project identifier")
    ),
    responses(
        (status = 200, description = "Sandbox removed; the project volume is kept", body = Sandbox),
        (status = 404, description = "Not found", body = ErrorBody)
    )
)]
async fn delete_sandbox(
    State(state): State<AppState>,
    Path(ids): Path<(String, String)>,
) -> Response {
    let key = sandbox_key(ids);
    match state.service.remove(key.clone()).await {
        Ok(Some(sandbox)) => (StatusCode::OK, Json(sandbox)).into_response(),
        Ok(None) => SandboxError::NotFound(format!("sandbox {key}")).into_response(),
        Err(error) => error.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/sandboxes/{user}/{project}/exec",
    tag = "sandboxes",
    params(
        ("user" = String, Path, description = "User identifier"),
        ("project" = String, Path, description = "Project identifier")
    ),
    request_body = ExecRequest,
    responses(
        (status = 200, description = "Command finished; a non-zero exit is reported in the body", body = ExecResponse),
        (status = 404, description = "Unknown project", body = ErrorBody)
    )
)]
async fn exec_sandbox(
    State(state): State<AppState>,
    Path(ids): Path<(String, String)>,
    Json(request): Json<ExecRequest>,
) -> SandboxResult<Json<ExecResponse>> {
    Ok(Json(state.service.exec(sandbox_key(ids), request).await?))
}

#[utoipa::path(
    get,
    path = "/sandboxes/{user}/{project}/files",
    tag = "sandboxes",
    params(
        ("user" = String, Path, description = "User identifier"),
        ("project" = String, Path, description = "Project identifier")
    ),
    responses((status = 200, description = "Project files", body = FileListResponse))
)]
async fn list_files(
    State(state): State<AppState>,
    Path(ids): Path<(String, String)>,
) -> SandboxResult<Json<FileListResponse>> {
    Ok(Json(state.service.list_files(sandbox_key(ids)).await?))
}

#[utoipa::path(
    get,
    path = "/sandboxes/{user}/{project}/files/content",
    tag = "sandboxes",
    params(
        ("user" = String, Path, description = "User identifier"),
        ("project" = String, Path, description = "Project identifier"),
        ("path" = String, Query, description = "Path relative to the project root")
    ),
    responses(
        (status = 200, description = "File contents", body = FileContent),
        (status = 403, description = "Path escapes the project", body = ErrorBody),
        (status = 404, description = "No such file", body = ErrorBody)
    )
)]
async fn read_file(
    State(state): State<AppState>,
    Path(ids): Path<(String, String)>,
    Query(query): Query<FileQuery>,
) -> SandboxResult<Json<FileContent>> {
    Ok(Json(
        state.service.read_file(sandbox_key(ids), query.path).await?,
    ))
}

#[utoipa::path(
    put,
    path = "/sandboxes/{user}/{project}/files/content",
    tag = "sandboxes",
    params(
        ("user" = String, Path, description = "User identifier"),
        ("project" = String, Path, description = "Project identifier")
    ),
    request_body = FileContent,
    responses(
        (status = 204, description = "File written"),
        (status = 403, description = "Path escapes the project", body = ErrorBody)
    )
)]
async fn write_file(
    State(state): State<AppState>,
    Path(ids): Path<(String, String)>,
    Json(file): Json<FileContent>,
) -> SandboxResult<StatusCode> {
    state.service.write_file(sandbox_key(ids), file).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/sandboxes/{user}/{project}/compile",
    tag = "sandboxes",
    params(
        ("user" = String, Path, description = "User identifier"),
        ("project" = String, Path, description = "Project identifier")
    ),
    request_body = CompileRequest,
    responses(
        (status = 200, description = "PDF produced", body = CompileResponse),
        (status = 422, description = "Compilation failed", body = ErrorBody)
    )
)]
async fn compile_project(
    State(state): State<AppState>,
    Path(ids): Path<(String, String)>,
    Json(request): Json<CompileRequest>,
) -> SandboxResult<Json<CompileResponse>> {
    Ok(Json(state.service.compile(sandbox_key(ids), request).await?))
}

#[utoipa::path(
    get,
    path = "/sandboxes/{user}/{project}/pdf/{path}",
    tag = "sandboxes",
    params(
        ("user" = String, Path, description = "User identifier"),
        ("project" = String, Path, description = "Project identifier"),
        ("path" = String, Path, description = "PDF path relative to the project root")
    ),
    responses(
        (status = 200, description = "PDF document", content_type = "application/pdf", body = Vec<u8>),
        (status = 404, description = "No such PDF", body = ErrorBody)
    )
)]
async fn get_pdf(
    State(state): State<AppState>,
    Path((user, project, path)): Path<(String, String, String)>,
) -> SandboxResult<Response> {
    let bytes = state
        .service
        .pdf(SandboxKey::new(user, project), path.clone())
        .await?;
    let file_name = path.rsplit('/').next().unwrap_or("document.pdf").to_string();
    Ok((
        [
            (CONTENT_TYPE, "application/pdf".to_string()),
            (CONTENT_DISPOSITION, format!("inline; filename=\"{file_name}\"")),
            (CACHE_CONTROL, "no-cache".to_string()),
        ],
        bytes,
    )
        .into_response())
}

#[utoipa::path(
    post,
    path = "/sandboxes/{user}/{project}/assistant",
    tag = "assistant",
    params(
        ("user" = String, Path, description = "User identifier"),
        ("project" = String, Path, description = "Project identifier")
    ),
    request_body = AssistantRequest,
    responses(
        (status = 200, description = "Rendered assistant output, streamed as it arrives", content_type = "text/plain", body = String),
        (status = 401, description = "Assistant is not signed in", body = ErrorBody)
    )
)]
async fn assistant_turn(
    State(state): State<AppState>,
    Path(ids): Path<(String, String)>,
    Json(request): Json<AssistantRequest>,
) -> SandboxResult<Response> {
    let chunks = state
        .service
        .assistant_turn(sandbox_key(ids), request)
        .await?;
    let body = Body::from_stream(chunks.map(Ok::<_, Infallible>));
    Ok((
        [
            (CONTENT_TYPE, "text/plain; charset=utf-8"),
            (CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

#[utoipa::path(
    delete,
    path = "/sandboxes/{user}/{project}/assistant/session",
    tag = "assistant",
    params(
        ("user" = String, Path, description = "User identifier"),
        ("project" = String, Path, description = "Project identifier")
    ),
    responses((status = 204, description = "The next turn starts a fresh conversation"))
)]
async fn clear_assistant_session(
    State(state): State<AppState>,
    Path(ids): Path<(String, String)>,
) -> SandboxResult<StatusCode> {
    state.service.clear_assistant_session(sandbox_key(ids)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/sandboxes/{user}/{project}/assistant/login",
    tag = "assistant",
    params(
        ("user" = String, Path, description = "User identifier"),
        ("project" = String, Path, description = "Project identifier")
    ),
    responses(
        (status = 200, description = "Login state", body = LoginResponse),
        (status = 502, description = "The login flow failed", body = ErrorBody),
        (status = 504, description = "No sign-in URL appeared in time", body = ErrorBody)
    )
)]
async fn start_login(
    State(state): State<AppState>,
    Path(ids): Path<(String, String)>,
) -> SandboxResult<Json<LoginResponse>> {
    Ok(Json(state.service.start_login(sandbox_key(ids)).await?))
}

#[utoipa::path(
    post,
    path = "/sandboxes/{user}/{project}/assistant/login/verify",
    tag = "assistant",
    params(
        ("user" = String, Path, description = "User identifier"),
        ("project" = String, Path, description = "Project identifier")
    ),
    request_body = VerifyCodeRequest,
    responses(
        (status = 200, description = "Verification result", body = VerifyCodeResponse),
        (status = 502, description = "Code rejected", body = ErrorBody),
        (status = 504, description = "No verdict in time", body = ErrorBody)
    )
)]
async fn verify_login(
    State(state): State<AppState>,
    Path(ids): Path<(String, String)>,
    Json(request): Json<VerifyCodeRequest>,
) -> SandboxResult<Json<VerifyCodeResponse>> {
    Ok(Json(
        state.service.verify_login(sandbox_key(ids), request).await?,
    ))
}

#[utoipa::path(
    get,
    path = "/sandboxes/{user}/{project}/assistant/permissions",
    tag = "assistant",
    params(
        ("user" = String, Path, description = "User identifier"),
        ("project" = String, Path, description = "Project identifier")
    ),
    responses((status = 200, description = "Pending permission prompts", body = [PermissionPrompt]))
)]
async fn list_permissions(
    State(state): State<AppState>,
    Path(ids): Path<(String, String)>,
) -> SandboxResult<Json<Vec<PermissionPrompt>>> {
    Ok(Json(
        state.service.permission_prompts(sandbox_key(ids)).await?,
    ))
}

#[utoipa::path(
    post,
    path = "/sandboxes/{user}/{project}/assistant/permissions/respond",
    tag = "assistant",
    params(
        ("user" = String, Path, description = "User identifier"),
        ("project" = String, Path, description = "Project identifier")
    ),
    request_body = PermissionDecision,
    responses(
        (status = 204, description = "Decision delivered"),
        (status = 400, description = "Invalid prompt id", body = ErrorBody)
    )
)]
async fn respond_permission(
    State(state): State<AppState>,
    Path(ids): Path<(String, String)>,
    Json(decision): Json<PermissionDecision>,
) -> SandboxResult<StatusCode> {
    state
        .service
        .respond_permission(sandbox_key(ids), decision)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

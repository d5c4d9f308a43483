use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use kgw_client::GatewayError;
use kgw_protocol::{ExecutionState, Kernel, OutputKind};
use serde::{Deserialize, Serialize};
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

use super::AppState;
use super::caller::Caller;
use super::channels;
use crate::model::{CellOutput, Session, SessionStatus};
use crate::sessions::SessionError;
use crate::store::StoreError;

#[derive(OpenApi)]
#[openapi(
    info(title = "kernel session controller"),
    paths(
        health,
        start_kernel,
        list_kernels,
        get_kernel,
        delete_kernel,
        interrupt_kernel,
        restart_kernel,
        create_session,
        list_sessions,
        get_session,
        update_session,
        delete_session,
        list_outputs,
        delete_outputs,
    ),
    components(schemas(
        Kernel,
        ExecutionState,
        Session,
        SessionStatus,
        CellOutput,
        OutputKind,
        StartKernelBody,
        CreateSessionBody,
        UpdateSessionBody,
        ErrorBody,
        HealthBody,
    ))
)]
struct ApiDoc;

pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/kernels", get(list_kernels).post(start_kernel))
        .route("/kernels/{id}", get(get_kernel).delete(delete_kernel))
        .route("/kernels/{id}/interrupt", post(interrupt_kernel))
        .route("/kernels/{id}/restart", post(restart_kernel))
        .route("/kernels/{id}/channels", get(channels::kernel_channels))
        .route("/sessions", get(list_sessions).post(create_session))
        .route(
            "/sessions/{id}",
            get(get_session).put(update_session).delete(delete_session),
        )
        .route(
            "/cells/{cell_id}/outputs",
            get(list_outputs).delete(delete_outputs),
        )
}

#[derive(Debug)]
pub enum ApiError {
    Invalid(String),
    Unauthorized,
    Gateway(GatewayError),
    Session(SessionError),
    Store(StoreError),
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError::Gateway(err)
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Gateway(err) => ApiError::Gateway(err),
            other => ApiError::Session(other),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

fn gateway_status(err: &GatewayError) -> (StatusCode, &'static str) {
    match err {
        GatewayError::UnknownRuntime(_) => (StatusCode::BAD_REQUEST, "unknown_runtime"),
        GatewayError::NotFound(_) => (StatusCode::NOT_FOUND, "kernel_not_found"),
        GatewayError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "gateway_config"),
        GatewayError::Status { .. }
        | GatewayError::Transport(_)
        | GatewayError::Timeout(_)
        | GatewayError::Decode(_) => (StatusCode::BAD_GATEWAY, "gateway_unavailable"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Invalid(msg) => (StatusCode::BAD_REQUEST, "invalid_request", msg),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "missing or invalid caller identity".to_string(),
            ),
            ApiError::Gateway(err) => {
                let (status, code) = gateway_status(&err);
                (status, code, err.to_string())
            }
            ApiError::Session(err) => {
                let (status, code) = match &err {
                    SessionError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
                    SessionError::NotFound(_) => (StatusCode::NOT_FOUND, "session_not_found"),
                    SessionError::Gateway(gateway) => gateway_status(gateway),
                    SessionError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store_error"),
                    SessionError::OrphanedKernel { .. } => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "orphaned_kernel")
                    }
                };
                (status, code, err.to_string())
            }
            ApiError::Store(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_error",
                err.to_string(),
            ),
        };
        let body = ErrorBody {
            code: code.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthBody {
    pub ok: bool,
    pub version: String,
    /// Executions whose reply has not been seen yet.
    pub pending_executions: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StartKernelBody {
    pub language: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateSessionBody {
    pub notebook_id: String,
    pub language: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UpdateSessionBody {
    pub status: String,
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim()).map_err(|e| ApiError::Invalid(format!("invalid {what}: {e}")))
}

#[utoipa::path(get, path = "/health", responses((status = 200, body = HealthBody)))]
pub(crate) async fn health(State(state): State<AppState>) -> Json<HealthBody> {
    Json(HealthBody {
        ok: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        pending_executions: state.correlations.len(),
    })
}

#[utoipa::path(
    post,
    path = "/api/v1/kernels",
    request_body = StartKernelBody,
    responses(
        (status = 201, body = Kernel),
        (status = 400, body = ErrorBody),
        (status = 502, body = ErrorBody),
    )
)]
async fn start_kernel(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(body): Json<StartKernelBody>,
) -> Result<impl IntoResponse, ApiError> {
    let kernel = state.gateway.client().start_kernel(body.language.trim()).await?;
    tracing::debug!(%caller, kernel_id = %kernel.id, "kernel started over http");
    Ok((StatusCode::CREATED, Json(kernel)))
}

#[utoipa::path(get, path = "/api/v1/kernels", responses((status = 200, body = [Kernel])))]
async fn list_kernels(
    State(state): State<AppState>,
    _caller: Caller,
) -> Result<Json<Vec<Kernel>>, ApiError> {
    Ok(Json(state.gateway.client().list_kernels().await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/kernels/{id}",
    params(("id" = String, Path, description = "Kernel id")),
    responses((status = 200, body = Kernel), (status = 404, body = ErrorBody))
)]
async fn get_kernel(
    State(state): State<AppState>,
    _caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<Kernel>, ApiError> {
    Ok(Json(state.gateway.client().get_kernel(&id).await?))
}

#[utoipa::path(
    delete,
    path = "/api/v1/kernels/{id}",
    params(("id" = String, Path, description = "Kernel id")),
    responses((status = 204), (status = 404, body = ErrorBody))
)]
async fn delete_kernel(
    State(state): State<AppState>,
    _caller: Caller,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.relays.teardown(&id);
    state.gateway.client().delete_kernel(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/v1/kernels/{id}/interrupt",
    params(("id" = String, Path, description = "Kernel id")),
    responses((status = 204), (status = 404, body = ErrorBody))
)]
async fn interrupt_kernel(
    State(state): State<AppState>,
    _caller: Caller,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.gateway.client().interrupt_kernel(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/v1/kernels/{id}/restart",
    params(("id" = String, Path, description = "Kernel id")),
    responses((status = 200, body = Kernel), (status = 404, body = ErrorBody))
)]
async fn restart_kernel(
    State(state): State<AppState>,
    _caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<Kernel>, ApiError> {
    Ok(Json(state.gateway.client().restart_kernel(&id).await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/sessions",
    request_body = CreateSessionBody,
    responses(
        (status = 201, body = Session),
        (status = 400, body = ErrorBody),
        (status = 500, body = ErrorBody),
    )
)]
async fn create_session(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(body): Json<CreateSessionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .sessions
        .create_session(caller, &body.notebook_id, &body.language)
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

#[utoipa::path(get, path = "/api/v1/sessions", responses((status = 200, body = [Session])))]
async fn list_sessions(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> Result<Json<Vec<Session>>, ApiError> {
    Ok(Json(state.sessions.list_sessions(caller)?))
}

#[utoipa::path(
    get,
    path = "/api/v1/sessions/{id}",
    params(("id" = Uuid, Path, description = "Session id")),
    responses((status = 200, body = Session), (status = 404, body = ErrorBody))
)]
async fn get_session(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    let id = parse_id(&id, "session id")?;
    Ok(Json(state.sessions.get_session(id, caller)?))
}

#[utoipa::path(
    put,
    path = "/api/v1/sessions/{id}",
    params(("id" = Uuid, Path, description = "Session id")),
    request_body = UpdateSessionBody,
    responses(
        (status = 200, body = Session),
        (status = 400, body = ErrorBody),
        (status = 404, body = ErrorBody),
    )
)]
async fn update_session(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    Json(body): Json<UpdateSessionBody>,
) -> Result<Json<Session>, ApiError> {
    let id = parse_id(&id, "session id")?;
    Ok(Json(state.sessions.update_status(id, caller, &body.status)?))
}

#[utoipa::path(
    delete,
    path = "/api/v1/sessions/{id}",
    params(("id" = Uuid, Path, description = "Session id")),
    responses((status = 204), (status = 404, body = ErrorBody))
)]
async fn delete_session(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id, "session id")?;
    state.sessions.delete_session(id, caller).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/api/v1/cells/{cell_id}/outputs",
    params(("cell_id" = Uuid, Path, description = "Cell id")),
    responses((status = 200, body = [CellOutput]))
)]
async fn list_outputs(
    State(state): State<AppState>,
    _caller: Caller,
    Path(cell_id): Path<String>,
) -> Result<Json<Vec<CellOutput>>, ApiError> {
    let cell_id = parse_id(&cell_id, "cell id")?;
    Ok(Json(state.store.list_outputs(cell_id)?))
}

#[utoipa::path(
    delete,
    path = "/api/v1/cells/{cell_id}/outputs",
    params(("cell_id" = Uuid, Path, description = "Cell id")),
    responses((status = 204))
)]
async fn delete_outputs(
    State(state): State<AppState>,
    _caller: Caller,
    Path(cell_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let cell_id = parse_id(&cell_id, "cell id")?;
    let removed = state.store.delete_outputs(cell_id)?;
    tracing::debug!(%cell_id, removed, "cell outputs deleted");
    Ok(StatusCode::NO_CONTENT)
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_relay_agent_management::{parse_agent, AdapterKind, AgentId, AgentInfo};
use agent_relay_error::{ErrorType, ProblemDetails, RelayError};
use agent_relay_protocol::{
    Message, MessagePart, MessageRole, PartKind, PromptResult, SessionUpdate, StopReason,
    ToolCallStatus,
};
use agent_relay_session_store::{SessionEntry, StoreError};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use crate::proxy::{proxy_session, ProxyRequest};
use crate::session_manager::{
    agent_error, adapter_error, LaunchRequest, SessionInfo, SessionManager, SessionManagerConfig,
    SessionPage, SessionStatus,
};

pub const LOG_HTTP_ENV: &str = "AGENT_RELAY_LOG_HTTP";

pub struct AppState {
    session_manager: Arc<SessionManager>,
}

impl AppState {
    pub fn new(config: SessionManagerConfig) -> Self {
        Self {
            session_manager: Arc::new(SessionManager::new(config)),
        }
    }

    pub fn session_manager(&self) -> Arc<SessionManager> {
        self.session_manager.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .route("/agents", get(list_agents))
        .route(
            "/agents/:agent/settings",
            get(get_agent_settings).post(update_agent_settings),
        )
        .route(
            "/agents/:agent/session/settings",
            get(get_session_settings).put(update_session_settings),
        )
        .route(
            "/agents/:agent/session/trust-response",
            post(respond_to_trust),
        )
        .route(
            "/sessions",
            get(list_sessions).post(create_session).delete(stop_session),
        )
        .route("/sessions/:session_id", get(get_session))
        .route("/sessions/:session_id/proxy/*path", any(proxy))
        .with_state(shared.clone());

    let mut router = Router::new().nest("/v1", v1_router);

    let http_logging = match std::env::var(LOG_HTTP_ENV) {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

pub async fn shutdown_sessions(state: &Arc<AppState>) {
    state.session_manager.stop_all().await;
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        list_agents,
        get_agent_settings,
        update_agent_settings,
        get_session_settings,
        update_session_settings,
        respond_to_trust,
        list_sessions,
        create_session,
        stop_session,
        get_session,
        proxy
    ),
    components(
        schemas(
            HealthResponse,
            AgentInfo,
            AgentId,
            AdapterKind,
            AgentListResponse,
            AgentSettingsResponse,
            AgentSettingsUpdate,
            SessionEntry,
            SessionSettingsUpdate,
            TrustResponseRequest,
            TrustResponseResult,
            CreateSessionRequest,
            SessionInfo,
            SessionStatus,
            SessionPage,
            StopSessionResponse,
            Message,
            MessagePart,
            MessageRole,
            PartKind,
            PromptResult,
            SessionUpdate,
            StopReason,
            ToolCallStatus,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "agents", description = "Agent registry and settings"),
        (name = "sessions", description = "Session lifecycle and proxy")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:2468")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidKey { .. } => {
                ApiError::Relay(RelayError::invalid_argument(err.to_string()))
            }
            _ => ApiError::Relay(RelayError::Storage {
                message: err.to_string(),
            }),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Relay(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentListResponse {
    pub agents: Vec<AgentInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentSettingsResponse {
    pub binary_path: Option<String>,
    pub has_api_key: bool,
    pub preferred_model: Option<String>,
}

/// Absent fields are left alone; an empty string clears the field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentSettingsUpdate {
    #[serde(default)]
    pub binary_path: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub preferred_model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettingsQuery {
    pub session_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettingsUpdate {
    #[serde(default)]
    pub workspace_trusted: Option<bool>,
    #[serde(default)]
    pub yolo: Option<bool>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrustResponseRequest {
    pub session_id: String,
    pub trust: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TrustResponseResult {
    pub retried: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateSessionRequest {
    pub agent_id: String,
    pub project_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListSessionsQuery {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StopSessionQuery {
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StopSessionResponse {
    pub id: String,
    pub stopped: bool,
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/v1/agents",
    responses((status = 200, body = AgentListResponse)),
    tag = "agents"
)]
async fn list_agents(
    State(state): State<Arc<AppState>>,
) -> Result<Json<AgentListResponse>, ApiError> {
    let manager = state.session_manager.clone();
    let agents = tokio::task::spawn_blocking(move || {
        AgentId::all()
            .iter()
            .map(|agent| {
                let override_path = manager
                    .stores(*agent)
                    .ok()
                    .and_then(|stores| stores.settings.load().ok())
                    .and_then(|settings| settings.binary_path);
                AgentInfo::detect(*agent, override_path.as_deref())
            })
            .collect::<Vec<_>>()
    })
    .await
    .map_err(|err| RelayError::UpstreamError {
        message: err.to_string(),
    })?;
    Ok(Json(AgentListResponse { agents }))
}

#[utoipa::path(
    get,
    path = "/v1/agents/{agent}/settings",
    params(("agent" = String, Path, description = "Agent id")),
    responses(
        (status = 200, body = AgentSettingsResponse),
        (status = 400, body = ProblemDetails)
    ),
    tag = "agents"
)]
async fn get_agent_settings(
    State(state): State<Arc<AppState>>,
    Path(agent): Path<String>,
) -> Result<Json<AgentSettingsResponse>, ApiError> {
    let agent = parse_agent(&agent).map_err(agent_error)?;
    let settings = state.session_manager.stores(agent)?.settings.load()?;
    Ok(Json(AgentSettingsResponse::from_settings(settings)))
}

#[utoipa::path(
    post,
    path = "/v1/agents/{agent}/settings",
    request_body = AgentSettingsUpdate,
    params(("agent" = String, Path, description = "Agent id")),
    responses(
        (status = 200, body = AgentSettingsResponse),
        (status = 400, body = ProblemDetails)
    ),
    tag = "agents"
)]
async fn update_agent_settings(
    State(state): State<Arc<AppState>>,
    Path(agent): Path<String>,
    Json(update): Json<AgentSettingsUpdate>,
) -> Result<Json<AgentSettingsResponse>, ApiError> {
    let agent = parse_agent(&agent).map_err(agent_error)?;
    let settings = state
        .session_manager
        .stores(agent)?
        .settings
        .update(|settings| {
            if let Some(path) = update.binary_path {
                settings.binary_path = non_empty(path).map(PathBuf::from);
            }
            if let Some(key) = update.api_key {
                settings.api_key = non_empty(key);
            }
            if let Some(model) = update.preferred_model {
                settings.preferred_model = non_empty(model);
            }
        })?;
    tracing::info!(agent = %agent, "agent settings updated");
    Ok(Json(AgentSettingsResponse::from_settings(settings)))
}

impl AgentSettingsResponse {
    fn from_settings(settings: agent_relay_session_store::AgentSettings) -> Self {
        Self {
            binary_path: settings
                .binary_path
                .map(|path| path.to_string_lossy().into_owned()),
            has_api_key: settings.api_key.is_some_and(|key| !key.is_empty()),
            preferred_model: settings.preferred_model,
        }
    }
}

#[utoipa::path(
    get,
    path = "/v1/agents/{agent}/session/settings",
    params(
        ("agent" = String, Path, description = "Agent id"),
        ("sessionId" = String, Query, description = "Agent-native session id")
    ),
    responses(
        (status = 200, body = SessionEntry),
        (status = 400, body = ProblemDetails)
    ),
    tag = "agents"
)]
async fn get_session_settings(
    State(state): State<Arc<AppState>>,
    Path(agent): Path<String>,
    Query(query): Query<SessionSettingsQuery>,
) -> Result<Json<SessionEntry>, ApiError> {
    let agent = parse_agent(&agent).map_err(agent_error)?;
    let entry = state
        .session_manager
        .stores(agent)?
        .sessions
        .get(&query.session_id)?
        .unwrap_or_else(|| SessionEntry::new(query.session_id));
    Ok(Json(entry))
}

#[utoipa::path(
    put,
    path = "/v1/agents/{agent}/session/settings",
    request_body = SessionSettingsUpdate,
    params(
        ("agent" = String, Path, description = "Agent id"),
        ("sessionId" = String, Query, description = "Agent-native session id")
    ),
    responses(
        (status = 200, body = SessionEntry),
        (status = 400, body = ProblemDetails)
    ),
    tag = "agents"
)]
async fn update_session_settings(
    State(state): State<Arc<AppState>>,
    Path(agent): Path<String>,
    Query(query): Query<SessionSettingsQuery>,
    Json(update): Json<SessionSettingsUpdate>,
) -> Result<Json<SessionEntry>, ApiError> {
    let agent = parse_agent(&agent).map_err(agent_error)?;
    let entry = state
        .session_manager
        .stores(agent)?
        .sessions
        .update(&query.session_id, |entry| {
            if let Some(trusted) = update.workspace_trusted {
                entry.workspace_trusted = Some(trusted);
            }
            if let Some(yolo) = update.yolo {
                entry.yolo = yolo;
            }
            if let Some(model) = update.model {
                entry.model = non_empty(model);
            }
        })?;
    Ok(Json(entry))
}

#[utoipa::path(
    post,
    path = "/v1/agents/{agent}/session/trust-response",
    request_body = TrustResponseRequest,
    params(("agent" = String, Path, description = "Agent id")),
    responses(
        (status = 200, body = TrustResponseResult),
        (status = 400, body = ProblemDetails)
    ),
    tag = "agents"
)]
async fn respond_to_trust(
    State(state): State<Arc<AppState>>,
    Path(agent): Path<String>,
    Json(request): Json<TrustResponseRequest>,
) -> Result<Json<TrustResponseResult>, ApiError> {
    let agent = parse_agent(&agent).map_err(agent_error)?;
    if agent.adapter_kind() != AdapterKind::InProcess {
        return Err(RelayError::invalid_argument(format!(
            "{agent} does not prompt for workspace trust"
        ))
        .into());
    }

    let retried = match state
        .session_manager
        .find_adapter_by_chat(&request.session_id)
        .await
    {
        Some(adapter) => adapter
            .respond_to_trust(&request.session_id, request.trust)
            .map_err(|err| adapter_error(agent, err))?,
        None => {
            state
                .session_manager
                .stores(agent)?
                .sessions
                .update(&request.session_id, |entry| {
                    entry.workspace_trusted = Some(request.trust)
                })?;
            false
        }
    };
    tracing::info!(
        agent = %agent,
        chat_id = %request.session_id,
        trust = request.trust,
        retried,
        "workspace trust recorded"
    );
    Ok(Json(TrustResponseResult { retried }))
}

#[utoipa::path(
    get,
    path = "/v1/sessions",
    params(
        ("page" = Option<usize>, Query, description = "1-based page number"),
        ("page_size" = Option<usize>, Query, description = "Sessions per page")
    ),
    responses((status = 200, body = SessionPage)),
    tag = "sessions"
)]
async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListSessionsQuery>,
) -> Json<SessionPage> {
    Json(
        state
            .session_manager
            .list(query.page, query.page_size)
            .await,
    )
}

#[utoipa::path(
    post,
    path = "/v1/sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, body = SessionInfo),
        (status = 400, body = ProblemDetails),
        (status = 401, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionInfo>), ApiError> {
    if request.agent_id.trim().is_empty() {
        return Err(RelayError::invalid_argument("agent_id is required").into());
    }
    if request.project_dir.trim().is_empty() {
        return Err(RelayError::invalid_argument("project_dir is required").into());
    }
    let info = state
        .session_manager
        .launch(LaunchRequest {
            agent_id: request.agent_id,
            project_dir: PathBuf::from(request.project_dir),
            api_key: request.api_key,
            resume_session_id: request.resume_session_id,
            debug: request.debug,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(info)))
}

#[utoipa::path(
    delete,
    path = "/v1/sessions",
    params(("id" = String, Query, description = "Session id")),
    responses((status = 200, body = StopSessionResponse)),
    tag = "sessions"
)]
async fn stop_session(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StopSessionQuery>,
) -> Json<StopSessionResponse> {
    let id = query.id.unwrap_or_default();
    let stopped = match id.as_str() {
        "" => false,
        id => state.session_manager.stop(id).await.is_some(),
    };
    Json(StopSessionResponse { id, stopped })
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, body = SessionInfo),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    match state.session_manager.get(&session_id).await {
        Some(session) => Ok(Json(session.info)),
        None => Err(RelayError::SessionNotFound { session_id }.into()),
    }
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/proxy/{path}",
    params(
        ("session_id" = String, Path, description = "Session id"),
        ("path" = String, Path, description = "Agent-relative path")
    ),
    responses(
        (status = 200, description = "Forwarded or translated agent response"),
        (status = 503, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn proxy(
    State(state): State<Arc<AppState>>,
    Path((session_id, path)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request = ProxyRequest {
        method,
        path,
        query: uri.query().map(str::to_string),
        headers,
        body,
    };
    Ok(proxy_session(&state.session_manager, &session_id, request).await?)
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

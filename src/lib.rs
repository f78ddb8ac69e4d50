pub mod app;
pub mod config;
pub mod hub;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::signal::ctrl_c;
use tracing::{info, warn};

use crate::app::approvals::{ApprovalEngine, ApprovalView, ResolveOutcome, Verdict};
use crate::app::events::{EventEntry, EventLog};
use crate::app::model::{Decision, DecisionBehavior, DecisionEnvelope, HookInput};
use crate::app::sessions::{Session, SessionRegistry, SessionStatus};
use crate::config::{ConfigStore, SettingsPatch, TimeoutBehavior, Token};
use crate::hub::{Hub, Message};

/// Runtime bind settings resolved from flags and the config document.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
}

#[derive(Clone)]
pub(crate) struct AppState {
    config: Arc<ConfigStore>,
    sessions: Arc<SessionRegistry>,
    events: Arc<EventLog>,
    approvals: Arc<ApprovalEngine>,
    hub: Arc<Hub>,
}

impl AppState {
    fn new(config: Arc<ConfigStore>) -> Self {
        let sessions = Arc::new(SessionRegistry::new());
        let hub = Arc::new(Hub::new());
        let approvals = Arc::new(ApprovalEngine::new(sessions.clone(), hub.clone()));
        Self {
            config,
            sessions,
            events: Arc::new(EventLog::new()),
            approvals,
            hub,
        }
    }

    pub(crate) fn config(&self) -> &ConfigStore {
        &self.config
    }

    fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    fn events(&self) -> &EventLog {
        &self.events
    }

    fn approvals(&self) -> &ApprovalEngine {
        &self.approvals
    }

    pub(crate) fn hub(&self) -> Arc<Hub> {
        self.hub.clone()
    }
}

pub async fn run(config: Arc<ConfigStore>, settings: Settings) -> anyhow::Result<()> {
    let state = AppState::new(config);
    let app = router(state);

    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(listen = %addr, "claudehaus started");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = ctrl_c().await;
    info!("shutdown signal received");
}

fn router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/api/hooks/:event", post(handle_hook))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", get(get_session).patch(update_session))
        .route("/api/sessions/:id/approvals", get(list_session_approvals))
        .route("/api/sessions/:id/events", get(list_session_events))
        .route("/api/approvals/:id", post(resolve_approval))
        .route("/api/settings", get(get_settings).patch(update_settings))
        .route("/api/tokens", post(create_token).get(list_tokens))
        .route("/api/tokens/:id", delete(revoke_token))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(health))
        .route("/", get(index))
        .route("/api/tokens/verify", post(verify_token))
        .route("/ws", get(hub::ws_handler))
        .merge(authed)
        .with_state(state)
}

// Auth -----------------------------------------------------------------

async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let token = extract_token(request.headers(), request.uri().query());
    match token {
        Some(token) if state.config().validate_token(&token) => next.run(request).await,
        _ => ApiError::unauthorized().into_response(),
    }
}

/// Token lookup order: `Authorization: Bearer`, then `?token=`, then the
/// `claudehaus_token` cookie.
pub(crate) fn extract_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some(token) = pair.strip_prefix("token=") {
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }

    if let Some(cookies) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        for cookie in cookies.split(';') {
            if let Some(token) = cookie.trim().strip_prefix("claudehaus_token=") {
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }

    None
}

// Hook ingress ---------------------------------------------------------

async fn handle_hook(
    State(state): State<AppState>,
    Path(event): Path<String>,
    Json(input): Json<HookInput>,
) -> Result<Response, ApiError> {
    if input.session_id.is_empty() {
        return Err(ApiError::invalid("missing_session_id", "session_id is required"));
    }

    info!(
        event = %event,
        session_id = %input.session_id,
        tool_name = input.tool_name.as_deref().unwrap_or(""),
        cwd = %input.cwd,
        "hook event received"
    );

    let nickname = state
        .config()
        .nickname(&input.session_id)
        .unwrap_or_else(|| basename(&input.cwd));
    let session = state
        .sessions()
        .upsert(&input.session_id, &input.cwd, &nickname);

    let tool_name = input.tool_name.clone().unwrap_or_default();
    let tool_input_text = input
        .tool_input
        .as_ref()
        .map(Value::to_string)
        .unwrap_or_default();

    state.hub.broadcast(Message::new(
        "event",
        Some(input.session_id.clone()),
        json!({
            "event_name": event,
            "tool_name": input.tool_name,
            "timestamp": Local::now().format("%H:%M:%S").to_string(),
        }),
    ));

    match event.as_str() {
        "SessionStart" => {
            state
                .events()
                .add(&input.session_id, "SessionStart", "", "", "Session started");
            state.hub.broadcast(Message::new(
                "session_update",
                Some(input.session_id.clone()),
                json!({ "status": "active" }),
            ));
            info!(session_id = %input.session_id, nickname = %session.nickname, "session started");
            Ok(StatusCode::OK.into_response())
        }

        "SessionEnd" => {
            state
                .events()
                .add(&input.session_id, "SessionEnd", "", "", "Session ended");
            state
                .sessions()
                .update_status(&input.session_id, SessionStatus::Ended);
            state.hub.broadcast(Message::new(
                "session_update",
                Some(input.session_id.clone()),
                json!({ "status": "ended" }),
            ));
            info!(session_id = %input.session_id, "session ended");
            Ok(StatusCode::OK.into_response())
        }

        "Stop" | "SubagentStop" => {
            state
                .events()
                .add(&input.session_id, &event, "", "", "Task stopped");
            state
                .sessions()
                .update_status(&input.session_id, SessionStatus::Idle);
            state.hub.broadcast(Message::new(
                "session_update",
                Some(input.session_id.clone()),
                json!({ "status": "idle" }),
            ));
            info!(session_id = %input.session_id, event = %event, "session idle");
            Ok(StatusCode::OK.into_response())
        }

        "PermissionRequest" => {
            let settings = state.config().settings();
            let timeout = Duration::from_secs(settings.approval_timeout_seconds);
            let verdict = state
                .approvals()
                .submit(
                    &input.session_id,
                    &tool_name,
                    input.tool_input.clone().unwrap_or(Value::Null),
                    input.prompt.as_deref().unwrap_or(""),
                    timeout,
                )
                .await;

            match verdict {
                Verdict::Decision(decision) => {
                    state.events().add(
                        &input.session_id,
                        "PermissionRequest",
                        &tool_name,
                        &tool_input_text,
                        &format!("Approved: {}", decision.behavior.as_str()),
                    );
                    match decision.behavior {
                        DecisionBehavior::Allow => {
                            Ok(Json(DecisionEnvelope::allow()).into_response())
                        }
                        DecisionBehavior::Deny => {
                            Ok(Json(DecisionEnvelope::deny(decision.message)).into_response())
                        }
                    }
                }
                Verdict::Timeout => {
                    state.events().add(
                        &input.session_id,
                        "PermissionRequest",
                        &tool_name,
                        &tool_input_text,
                        "Timed out",
                    );
                    // Timeout-behavior policy lives here at the edge; the
                    // engine only ever reports a single timeout verdict.
                    match settings.approval_timeout_behavior {
                        TimeoutBehavior::Allow => Ok(Json(DecisionEnvelope::allow()).into_response()),
                        TimeoutBehavior::Deny => Ok(Json(DecisionEnvelope::deny(Some(
                            "Approval timed out".to_string(),
                        )))
                        .into_response()),
                        TimeoutBehavior::Passthrough => Ok(StatusCode::OK.into_response()),
                    }
                }
            }
        }

        _ => {
            state
                .events()
                .add(&input.session_id, &event, &tool_name, &tool_input_text, "");
            Ok(StatusCode::OK.into_response())
        }
    }
}

fn basename(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

// Sessions -------------------------------------------------------------

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<Session>> {
    Json(state.sessions().all())
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    state
        .sessions()
        .get(&id)
        .map(Json)
        .ok_or_else(session_not_found)
}

#[derive(Debug, Deserialize)]
struct UpdateSessionRequest {
    nickname: String,
}

async fn update_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateSessionRequest>,
) -> Result<Json<Session>, ApiError> {
    let session = state
        .sessions()
        .set_nickname(&id, &request.nickname)
        .ok_or_else(session_not_found)?;
    if let Err(err) = state.config().set_session_nickname(&id, &request.nickname) {
        warn!(%err, session_id = %id, "failed to persist nickname");
    }
    Ok(Json(session))
}

async fn list_session_approvals(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Vec<ApprovalView>> {
    Json(state.approvals().list_by_session(&id))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default = "default_event_limit")]
    limit: usize,
}

fn default_event_limit() -> usize {
    50
}

async fn list_session_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Json<Vec<EventEntry>> {
    Json(state.events().by_session(&id, query.limit))
}

fn session_not_found() -> ApiError {
    ApiError::not_found("session_not_found", "session not found")
}

// Approvals ------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    decision: DecisionBehavior,
    #[serde(default)]
    message: Option<String>,
}

async fn resolve_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<Value>, ApiError> {
    let decision = Decision {
        behavior: request.decision,
        message: request.message,
    };
    match state.approvals().resolve(&id, decision) {
        ResolveOutcome::Resolved => Ok(Json(json!({ "status": "ok" }))),
        ResolveOutcome::NotFound => {
            Err(ApiError::not_found("approval_not_found", "approval not found"))
        }
        ResolveOutcome::AlreadyResolved => {
            Err(ApiError::conflict("already_resolved", "approval already resolved"))
        }
    }
}

// Settings -------------------------------------------------------------

async fn get_settings(State(state): State<AppState>) -> Json<config::Settings> {
    Json(state.config().settings())
}

async fn update_settings(
    State(state): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> Result<Json<config::Settings>, ApiError> {
    state
        .config()
        .update_settings(patch)
        .map(Json)
        .map_err(|err| ApiError::internal("settings_save_failed", err))
}

// Tokens ---------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreateTokenRequest {
    name: String,
}

async fn create_token(
    State(state): State<AppState>,
    Json(request): Json<CreateTokenRequest>,
) -> Result<Json<Value>, ApiError> {
    let name = if request.name.is_empty() {
        "unnamed"
    } else {
        request.name.as_str()
    };
    let secret = state
        .config()
        .create_token(name)
        .map_err(|err| ApiError::internal("token_create_failed", err))?;
    Ok(Json(json!({ "token": secret })))
}

async fn list_tokens(State(state): State<AppState>) -> Json<Vec<Token>> {
    Json(state.config().list_tokens())
}

async fn revoke_token(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.config().revoke_token(&id) {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err(ApiError::not_found("token_not_found", "token not found")),
        Err(err) => Err(ApiError::internal("token_revoke_failed", err)),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VerifyTokenRequest {
    token: String,
}

async fn verify_token(
    State(state): State<AppState>,
    Json(request): Json<VerifyTokenRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.token.is_empty() || !state.config().validate_token(&request.token) {
        return Err(ApiError::unauthorized());
    }
    Ok(Json(json!({ "status": "ok" })))
}

// Misc -----------------------------------------------------------------

async fn health() -> &'static str {
    "OK"
}

const INDEX_HTML: &str = "<!doctype html>\n<html>\n<head><title>claudehaus</title></head>\n<body>\n<h1>claudehaus</h1>\n<p>The control plane is running. Point a dashboard at the JSON API under\n<code>/api</code> and the live stream at <code>/ws</code>.</p>\n</body>\n</html>\n";

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

// Errors ---------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn invalid(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub(crate) fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            body: ErrorBody {
                code: "unauthorized",
                message: "Unauthorized".to_string(),
            },
        }
    }

    fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    fn internal(code: &'static str, err: impl Into<anyhow::Error>) -> Self {
        let err = err.into();
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: ErrorBody {
                code,
                message: err.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

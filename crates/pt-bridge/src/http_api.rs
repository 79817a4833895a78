use axum::{
    extract::{Path, State},
    middleware as axum_middleware,
    routing::{delete, get},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use pt_core::config::Config;
use pt_core::naming::{build_session_name, credential_to_prefix, SessionName};
use pt_session::attach::{Attacher, TmuxAttacher};
use pt_session::tmux::{CommandRunner, SessionInfo, TmuxController};
use pt_telemetry::request_id::request_id_middleware;

use crate::api_error::ApiError;
use crate::auth::{AuthLayer, Credential, CredentialValidator};
use crate::registry::ConnectionRegistry;
use crate::relay_ws;

/// Shared state for all HTTP/WS handlers.
pub struct ApiState {
    pub config: Arc<Config>,
    pub tmux: TmuxController,
    pub attacher: Arc<dyn Attacher>,
    pub registry: Arc<ConnectionRegistry>,
    pub validator: Arc<CredentialValidator>,
    pub start_time: std::time::Instant,
    closing: watch::Sender<bool>,
}

impl ApiState {
    /// State backed by the real tmux binary.
    pub fn new(config: Config, auth_token: &str) -> Self {
        let tmux = TmuxController::from_config(&config.tmux);
        let attacher = Arc::new(TmuxAttacher::from_config(&config.tmux));
        Self::build(config, auth_token, tmux, attacher)
    }

    /// State with caller-supplied host backends, used by tests.
    pub fn with_backends(
        config: Config,
        auth_token: &str,
        runner: Arc<dyn CommandRunner>,
        attacher: Arc<dyn Attacher>,
    ) -> Self {
        let tmux = TmuxController::new(runner).with_history_limit(config.tmux.history_limit);
        Self::build(config, auth_token, tmux, attacher)
    }

    fn build(
        config: Config,
        auth_token: &str,
        tmux: TmuxController,
        attacher: Arc<dyn Attacher>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            tmux,
            attacher,
            registry: Arc::new(ConnectionRegistry::new()),
            validator: Arc::new(CredentialValidator::new(auth_token)),
            start_time: std::time::Instant::now(),
            closing: watch::channel(false).0,
        }
    }

    /// Ask every live relay connection to detach and close with 1001.
    /// Sessions are left running.
    pub fn begin_shutdown(&self) {
        self.closing.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.closing.borrow()
    }

    pub(crate) fn shutdown_watch(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }
}

impl std::fmt::Debug for ApiState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiState")
            .field("tmux", &self.tmux)
            .field("connections", &self.registry.len())
            .finish()
    }
}

/// Build the router: the relay WebSocket, the health probe, and the
/// authenticated session-management endpoints.
pub fn api_router(state: Arc<ApiState>) -> Router {
    let sessions = Router::new()
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{session_id}", delete(kill_session))
        .route("/api/sessions/{session_id}/cwd", get(session_cwd))
        .route("/api/sessions/{session_id}/foreground", get(session_foreground))
        .layer(AuthLayer::new(state.validator.clone()));

    Router::new()
        .route("/api/health", get(health))
        .route("/ws", get(relay_ws::relay_ws))
        .merge(sessions)
        .layer(axum_middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    connections: usize,
}

#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub name: String,
    /// `None` for the bare-prefix session.
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Held by a relay connection or by any tmux client.
    pub attached: bool,
}

impl SessionSummary {
    fn new(info: &SessionInfo, registry: &ConnectionRegistry) -> Self {
        Self {
            name: info.name.to_string(),
            session_id: info.session_id().map(str::to_owned),
            created_at: info.created_at,
            last_activity: info.last_activity,
            attached: registry.is_attached(&info.name) || info.attached_clients > 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /api/health
async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        connections: state.registry.len(),
    })
}

/// GET /api/sessions: sessions in the caller's namespace.
async fn list_sessions(
    State(state): State<Arc<ApiState>>,
    Extension(credential): Extension<Credential>,
) -> Json<Vec<SessionSummary>> {
    let prefix = credential_to_prefix(&credential.0);
    let sessions = state
        .tmux
        .list_sessions(&prefix)
        .await
        .iter()
        .map(|info| SessionSummary::new(info, &state.registry))
        .collect();
    Json(sessions)
}

/// DELETE /api/sessions/{session_id}: administrative kill. Killing an
/// absent session succeeds.
async fn kill_session(
    State(state): State<Arc<ApiState>>,
    Extension(credential): Extension<Credential>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let name = resolve(&credential, &session_id)?;
    state.tmux.kill_session(&name).await?;
    Ok(Json(serde_json::json!({"status": "killed", "session_id": session_id})))
}

/// GET /api/sessions/{session_id}/cwd
async fn session_cwd(
    State(state): State<Arc<ApiState>>,
    Extension(credential): Extension<Credential>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let name = resolve(&credential, &session_id)?;
    let cwd = state.tmux.working_directory(&name).await?;
    Ok(Json(serde_json::json!({"session_id": session_id, "cwd": cwd})))
}

/// GET /api/sessions/{session_id}/foreground
async fn session_foreground(
    State(state): State<Arc<ApiState>>,
    Extension(credential): Extension<Credential>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let name = resolve(&credential, &session_id)?;
    let command = state.tmux.foreground_command(&name).await?;
    Ok(Json(serde_json::json!({"session_id": session_id, "command": command})))
}

fn resolve(credential: &Credential, session_id: &str) -> Result<SessionName, ApiError> {
    Ok(build_session_name(&credential.0, Some(session_id))?)
}

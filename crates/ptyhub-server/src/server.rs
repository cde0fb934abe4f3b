//! HTTP server: session routes plus the WebSocket attach endpoint.

use crate::config::ServerConfig;
use crate::session::{generate_session_id, SessionInfo, SessionManager};
use crate::transport::websocket;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use ptyhub_core::{clamp_idle_threshold, clamp_size, HubError, HubResult};
use serde::Deserialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
}

/// Build the router for all HTTP and WebSocket routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/:id", delete(destroy_session))
        .route("/api/sessions/:id/resize", post(resize_session))
        .route("/api/sessions/:id/input", post(send_input))
        .route("/api/sessions/:id/idle", put(configure_idle))
        .route("/ws/:id", get(websocket::attach))
        .with_state(state)
}

/// The ptyhub server.
pub struct HubServer {
    config: ServerConfig,
    sessions: Arc<SessionManager>,
}

impl HubServer {
    pub fn new(config: ServerConfig) -> Self {
        let sessions = Arc::new(SessionManager::new(config.session.clone()));
        Self { config, sessions }
    }

    /// Serve until `shutdown` resolves, then destroy every session.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> HubResult<()> {
        let listener = tokio::net::TcpListener::bind(self.config.listen).await?;
        info!(
            listen = %self.config.listen,
            max_sessions = self.config.session.max_sessions,
            "ptyhub-server ready"
        );

        let app = router(AppState {
            sessions: self.sessions.clone(),
        });

        // Attached sockets only end once their sessions are gone, so the
        // sessions are torn down before the server waits on connections.
        let sessions = self.sessions.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("received shutdown signal");
                sessions.shutdown().await;
            })
            .await?;

        Ok(())
    }
}

/// Error response: `{ "error": message }` with a status per error kind.
pub struct ApiError(HubError);

impl From<HubError> for ApiError {
    fn from(e: HubError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            HubError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            HubError::SessionExists(_) => StatusCode::CONFLICT,
            HubError::LimitReached(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %self.0, "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn found(id: String, ok: bool) -> ApiResult<StatusCode> {
    if ok {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(HubError::SessionNotFound(id).into())
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.sessions.count().await,
    }))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.list().await)
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    id: Option<String>,
    cwd: PathBuf,
    cols: Option<f64>,
    rows: Option<f64>,
    command: Option<Vec<String>>,
}

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<SessionInfo>)> {
    let id = req.id.unwrap_or_else(generate_session_id);
    let (cols, rows) = clamp_size(req.cols.unwrap_or(80.0), req.rows.unwrap_or(24.0));
    let info = state
        .sessions
        .create(id, &req.cwd, cols, rows, req.command.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn destroy_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let ok = state.sessions.destroy(&id).await;
    found(id, ok)
}

#[derive(Debug, Deserialize)]
struct ResizeRequest {
    cols: f64,
    rows: f64,
}

async fn resize_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> ApiResult<StatusCode> {
    let (cols, rows) = clamp_size(req.cols, req.rows);
    let ok = state.sessions.resize(&id, cols, rows).await;
    found(id, ok)
}

async fn send_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let ok = state.sessions.write(&id, &body).await;
    found(id, ok)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdleRequest {
    idle_threshold_ms: f64,
}

async fn configure_idle(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<IdleRequest>,
) -> ApiResult<StatusCode> {
    let ok = state
        .sessions
        .configure_idle(&id, clamp_idle_threshold(req.idle_threshold_ms))
        .await;
    found(id, ok)
}

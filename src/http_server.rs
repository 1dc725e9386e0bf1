//! HTTP server implementation using Axum.
//!
//! Mirrors the unary gRPC operations as JSON endpoints. Policy rejections come
//! back as `200` bodies with `ok: false`; only admin listings with a bad token
//! and execution faults use error status codes.

use crate::error::{Rejection, ServiceError};
use crate::state::{AppState, SessionSummary};
use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

type ApiError = (StatusCode, Json<serde_json::Value>);

// Request/Response types
#[derive(Debug, Deserialize)]
pub struct SessionBody {
    pub session_id: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    pub session_id: String,
    #[serde(default)]
    pub token: String,
    pub command: String,
}

#[derive(Debug, Deserialize)]
pub struct SetEnvBody {
    pub session_id: String,
    #[serde(default)]
    pub token: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangeDirBody {
    pub session_id: String,
    #[serde(default)]
    pub token: String,
    pub dir: String,
}

#[derive(Debug, Deserialize)]
pub struct AdminBody {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct WhitelistBody {
    #[serde(default)]
    pub token: String,
    pub commands: Vec<String>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct StatusResponse {
    pub ok: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<String>,
}

impl From<Result<String, Rejection>> for StatusResponse {
    fn from(result: Result<String, Rejection>) -> Self {
        match result {
            Ok(message) => Self {
                ok: true,
                message,
                rejection: None,
            },
            Err(r) => Self {
                ok: false,
                message: format!("Error: {r}"),
                rejection: Some(r.reason().to_string()),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub ok: bool,
    pub session_id: String,
    pub output: String,
    pub error: String,
    pub exit_code: i32,
    pub execution_time_ms: u64,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionInfoResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<String>,
}

/// Build the router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Client operations
        .route("/register", post(register))
        .route("/heartbeat", post(heartbeat))
        .route("/execute", post(execute))
        .route("/env", post(set_env))
        .route("/cwd", post(change_dir))
        .route("/session-info", post(session_info))
        // Administration
        .route("/admin/clients", post(list_clients))
        .route("/admin/sessions", post(list_sessions))
        .route("/admin/kill", post(kill_session))
        .route("/admin/whitelist", post(add_to_whitelist))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server on the given port until `shutdown` flips to true.
pub async fn run_server(
    port: u16,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
        info!("HTTP server stopping");
    })
    .await
}

fn unauthorized(rejection: Rejection) -> ApiError {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "ok": false, "rejection": rejection.reason() })),
    )
}

fn internal(err: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "ok": false, "error": err.to_string() })),
    )
}

pub async fn health() -> &'static str {
    "OK"
}

pub async fn register(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<SessionBody>,
) -> Json<StatusResponse> {
    info!("POST /register - session: {}", req.session_id);
    let result = state
        .service
        .register(&req.session_id, &req.token, &addr.to_string())
        .await
        .map(|o| o.message);
    Json(result.into())
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Json(req): Json<SessionBody>,
) -> Json<StatusResponse> {
    let result = state
        .service
        .heartbeat(&req.session_id, &req.token)
        .await
        .map(|()| "OK".to_string());
    Json(result.into())
}

pub async fn execute(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<ExecuteBody>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    info!("POST /execute - session: {}, command: {:?}", req.session_id, req.command);
    let result = state
        .service
        .execute(&req.session_id, &req.token, &req.command, &addr.to_string())
        .await;

    match result {
        Ok(out) => Ok(Json(ExecuteResponse {
            ok: true,
            session_id: out.session_id,
            output: out.output,
            error: out.error.unwrap_or_default(),
            exit_code: out.exit_code,
            execution_time_ms: out.elapsed.as_millis() as u64,
            timed_out: out.timed_out,
            rejection: None,
        })),
        Err(ServiceError::Rejected(r)) => Ok(Json(ExecuteResponse {
            ok: false,
            session_id: req.session_id,
            output: String::new(),
            error: r.to_string(),
            exit_code: -1,
            execution_time_ms: 0,
            timed_out: false,
            rejection: Some(r.reason().to_string()),
        })),
        Err(ServiceError::Exec(e)) => Err(internal(e)),
    }
}

pub async fn set_env(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<SetEnvBody>,
) -> Json<StatusResponse> {
    let result = state
        .service
        .set_env(&req.session_id, &req.token, &req.key, &req.value, &addr.to_string())
        .await;
    Json(result.into())
}

pub async fn change_dir(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<ChangeDirBody>,
) -> Json<StatusResponse> {
    let result = state
        .service
        .change_dir(&req.session_id, &req.token, &req.dir, &addr.to_string())
        .await;
    Json(result.into())
}

pub async fn session_info(
    State(state): State<AppState>,
    Json(req): Json<SessionBody>,
) -> Json<SessionInfoResponse> {
    let resp = match state.service.session_info(&req.session_id, &req.token).await {
        Ok(summary) => SessionInfoResponse {
            ok: true,
            session: Some(summary),
            rejection: None,
        },
        Err(r) => SessionInfoResponse {
            ok: false,
            session: None,
            rejection: Some(r.reason().to_string()),
        },
    };
    Json(resp)
}

pub async fn list_clients(
    State(state): State<AppState>,
    Json(req): Json<AdminBody>,
) -> Result<Json<Vec<String>>, ApiError> {
    let ids = state
        .service
        .list_clients(&req.token)
        .await
        .map_err(unauthorized)?;
    Ok(Json(ids))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Json(req): Json<AdminBody>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    let sessions = state
        .service
        .list_sessions(&req.token)
        .await
        .map_err(unauthorized)?;
    Ok(Json(sessions))
}

pub async fn kill_session(
    State(state): State<AppState>,
    Json(req): Json<SessionBody>,
) -> Json<StatusResponse> {
    info!("POST /admin/kill - session: {}", req.session_id);
    let result = state.service.kill_session(&req.session_id, &req.token).await;
    Json(result.into())
}

pub async fn add_to_whitelist(
    State(state): State<AppState>,
    Json(req): Json<WhitelistBody>,
) -> Result<Json<Vec<String>>, ApiError> {
    let verbs = state
        .service
        .add_to_whitelist(&req.token, &req.commands)
        .await
        .map_err(unauthorized)?;
    Ok(Json(verbs))
}

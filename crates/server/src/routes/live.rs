// crates/server/src/routes/live.rs
//! Live-session endpoints (Subprocess Bridge controls).
//!
//! - `GET  /api/live`                  -- list live sessions
//! - `GET  /api/live/resumable`        -- snapshot entries recovered at startup
//! - `POST /api/live`                  -- start (or resume) a live session
//! - `POST /api/live/{id}/message`     -- queue a user turn
//! - `POST /api/live/{id}/permission`  -- answer a pending permission request
//! - `POST /api/live/{id}/signal`      -- named control signal / `/command`
//! - `POST /api/live/{id}/stop`        -- stop the subprocess
//!
//! Every failed action comes back as a structured error the caller can
//! retry; an unknown id is 404, a rejected action is 409.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/live", get(list_live).post(start_live))
        .route("/live/resumable", get(list_resumable))
        .route("/live/{id}/message", post(send_message))
        .route("/live/{id}/permission", post(send_permission))
        .route("/live/{id}/signal", post(send_signal))
        .route("/live/{id}/stop", post(stop_live))
}

/// GET /api/live -- all live sessions, newest first.
async fn list_live(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let sessions = state.bridges.list().await;
    Json(serde_json::json!({
        "total": sessions.len(),
        "sessions": sessions,
    }))
}

/// GET /api/live/resumable -- entries recovered from the snapshot file.
async fn list_resumable(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "sessions": state.resumable }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    working_dir: String,
    #[serde(default)]
    resume_id: Option<String>,
}

/// POST /api/live -- spawn a subprocess for a new or resumed session.
async fn start_live(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if req.working_dir.is_empty() {
        return Err(ApiError::BadRequest("workingDir is required".into()));
    }
    let info = state
        .bridges
        .start_session(&req.working_dir, req.resume_id)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "session": info })),
    ))
}

#[derive(Debug, Deserialize)]
struct MessageRequest {
    text: String,
}

/// POST /api/live/{id}/message -- queue one user turn.
async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<MessageRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let bridge = state
        .bridges
        .get(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("live session '{id}'")))?;

    if !bridge.send_message(&req.text).await {
        return Err(ApiError::Rejected(format!(
            "session '{id}' is not accepting messages (status {:?})",
            bridge.status()
        )));
    }
    state.bridges.refresh_snapshot(&id).await;
    Ok(Json(serde_json::json!({ "sent": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermissionRequest {
    tool_use_id: String,
    approved: bool,
    #[serde(default)]
    feedback: Option<String>,
}

/// POST /api/live/{id}/permission -- answer the pending permission request.
async fn send_permission(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<PermissionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let bridge = state
        .bridges
        .get(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("live session '{id}'")))?;

    let answered = bridge
        .send_permission_response(&req.tool_use_id, req.approved, req.feedback.as_deref())
        .await;
    if !answered {
        return Err(ApiError::Rejected(format!(
            "no pending permission '{}' on session '{id}'",
            req.tool_use_id
        )));
    }
    Ok(Json(serde_json::json!({ "answered": true })))
}

#[derive(Debug, Deserialize)]
struct SignalRequest {
    signal: String,
}

/// POST /api/live/{id}/signal -- send a named control signal; `/`-prefixed
/// strings pass through as a user turn.
async fn send_signal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<SignalRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let bridge = state
        .bridges
        .get(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("live session '{id}'")))?;

    if !bridge.send_control_signal(&req.signal).await {
        return Err(ApiError::Rejected(format!(
            "signal '{}' rejected by session '{id}'",
            req.signal
        )));
    }
    Ok(Json(serde_json::json!({ "sent": true })))
}

/// POST /api/live/{id}/stop -- stop the subprocess (SIGTERM, then SIGKILL).
async fn stop_live(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.bridges.stop_session(&id).await {
        Ok(Json(serde_json::json!({ "stopped": true })))
    } else {
        Err(ApiError::NotFound(format!("live session '{id}'")))
    }
}

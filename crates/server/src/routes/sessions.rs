// crates/server/src/routes/sessions.rs
//! Disk-session endpoints (Log Tailer views).
//!
//! - `GET    /api/sessions`               -- list all tracked sessions
//! - `GET    /api/sessions/{id}`          -- one session snapshot
//! - `GET    /api/sessions/{id}/messages` -- recent transcript messages
//! - `DELETE /api/sessions/{id}`          -- delete log file + entry

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/sessions/{id}/messages", get(get_session_messages))
}

/// GET /api/sessions -- all tracked sessions, most recently active first.
async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let sessions = state.tailer.sessions().await;
    Json(serde_json::json!({
        "total": sessions.len(),
        "sessions": sessions,
    }))
}

/// GET /api/sessions/{id} -- one session snapshot.
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .tailer
        .session(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("session '{id}'")))?;
    Ok(Json(serde_json::json!({ "session": session })))
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    /// Maximum number of messages to return (default: 50, most recent).
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

/// GET /api/sessions/{id}/messages?limit=50 -- the most recent messages.
async fn get_session_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<MessagesQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .tailer
        .session(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("session '{id}'")))?;

    let total = session.messages.len();
    let limit = params.limit.min(total);
    let messages: Vec<_> = session
        .messages
        .into_iter()
        .skip(total.saturating_sub(limit))
        .collect();

    Ok(Json(serde_json::json!({
        "total": total,
        "returned": messages.len(),
        "messages": messages,
    })))
}

/// DELETE /api/sessions/{id} -- remove the log file and registry entry.
///
/// Idempotent at the tailer level; a second delete reports not-found.
async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.tailer.delete_session(&id).await {
        Ok(Json(serde_json::json!({ "deleted": true })))
    } else {
        Err(ApiError::NotFound(format!("session '{id}'")))
    }
}

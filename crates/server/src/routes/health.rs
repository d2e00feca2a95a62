// crates/server/src/routes/health.rs
//! Liveness endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

/// GET /api/health -- basic liveness and counters.
async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let sessions = state.tailer.sessions().await.len();
    let live_sessions = state.bridges.list().await.len();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.uptime_secs(),
        "sessions": sessions,
        "liveSessions": live_sessions,
        "clients": state.hub.client_count(),
    }))
}

// crates/server/src/lib.rs
//! agentdeck server: session supervision over HTTP + WebSocket.
//!
//! Wires the Log Tailer (disk-derived sessions), the Subprocess Bridges
//! (live sessions), the Broadcast Hub (client fanout), the Access Guard, and
//! the Snapshot Store into one Axum application. Data flows one way into the
//! hub from the tailer and the bridges; clients read from the hub and write
//! back through bridge control routes.

use std::sync::Arc;

use axum::middleware;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

pub mod bridge;
pub mod error;
pub mod guard;
pub mod hub;
pub mod routes;
pub mod snapshot;
pub mod state;

pub use bridge::{BridgeConfig, BridgeManager};
pub use guard::{AccessGuard, RateLimitConfig};
pub use snapshot::SnapshotStore;
pub use state::AppState;

use agentdeck_core::TailerEvent;
use hub::ClientEvent;

/// Build the Axum application: REST under `/api`, WebSocket at `/ws`, with
/// the access guard applied to every request.
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", routes::api_router())
        .merge(routes::ws::router())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            guard::guard_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Spawn the two forwarder tasks bridging tailer and bridge events into the
/// hub. Clients only ever read from the hub.
pub fn spawn_event_forwarders(state: Arc<AppState>) {
    // Disk-derived events: list updates go to everyone, hook alerts too.
    {
        let state = state.clone();
        let mut rx = state.tailer.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(TailerEvent::HookAlert { session_id, hook }) => {
                        state
                            .hub
                            .broadcast(&ClientEvent::HookAlert { session_id, hook });
                    }
                    Ok(_) => {
                        // Discovered / updated / removed all collapse into
                        // the latest list snapshot.
                        broadcast_sessions_update(&state).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "tailer event stream lagged, resending snapshot");
                        broadcast_sessions_update(&state).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // Process-derived events: per-session messages fan out to subscribers;
    // status transitions also refresh the list for everyone.
    {
        let state = state.clone();
        let mut rx = state.bridges.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let is_status =
                            matches!(event.message, bridge::NormalizedMessage::Status { .. });
                        let session_id = event.session_id;
                        state.hub.send_to_session(
                            &session_id,
                            &ClientEvent::SessionMessage {
                                session_id: session_id.clone(),
                                message: event.message,
                            },
                        );
                        if is_status {
                            broadcast_sessions_update(&state).await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "bridge event stream lagged");
                        broadcast_sessions_update(&state).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

async fn broadcast_sessions_update(state: &Arc<AppState>) {
    let sessions = state.tailer.sessions().await;
    let live_sessions = state.bridges.list().await;
    state.hub.broadcast(&ClientEvent::SessionsUpdate {
        sessions,
        live_sessions,
    });
}

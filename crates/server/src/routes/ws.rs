// crates/server/src/routes/ws.rs
//! Real-time client transport.
//!
//! `GET /ws` upgrades to a WebSocket. On connect the client receives an
//! `init` envelope with the full session snapshot; afterwards it gets
//! `sessions_update` / `hook_alert` broadcasts and, for live sessions it has
//! subscribed to, `session_message` envelopes. The client sends
//! `{"type":"subscribe"|"unsubscribe","sessionId":...}` control envelopes.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::debug;

use crate::hub::ClientEvent;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(ws_handler))
}

/// Control envelopes sent by clients.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientCommand {
    Subscribe {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Unsubscribe {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();

    // Hydrate the client before it joins the fanout.
    let init = ClientEvent::Init {
        sessions: state.tailer.sessions().await,
        live_sessions: state.bridges.list().await,
    };
    let Ok(payload) = serde_json::to_string(&init) else {
        return;
    };
    if sink.send(Message::Text(payload.into())).await.is_err() {
        return;
    }

    let (client_id, mut rx) = state.hub.register();
    debug!(client_id = %client_id, "websocket client connected");

    // Pump the client's hub queue into the socket. A failed send ends the
    // pump; the hub evicts the client on its next delivery attempt.
    let forward_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Read control envelopes until the client goes away.
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(ClientCommand::Subscribe { session_id }) => {
                    state.hub.subscribe(&client_id, &session_id);
                }
                Ok(ClientCommand::Unsubscribe { session_id }) => {
                    state.hub.unsubscribe(&client_id, &session_id);
                }
                Err(e) => {
                    debug!(client_id = %client_id, error = %e, "ignoring malformed client envelope");
                }
            },
            Message::Close(_) => break,
            // Ping/Pong handled by axum.
            _ => {}
        }
    }

    state.hub.deregister(&client_id);
    forward_task.abort();
    debug!(client_id = %client_id, "websocket client disconnected");
}

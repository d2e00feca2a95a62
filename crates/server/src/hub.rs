// crates/server/src/hub.rs
//! Fanout of server events to connected real-time clients.
//!
//! Each client registers an unbounded outbound queue; a per-client pump task
//! (owned by the WebSocket handler) drains it to the socket, so one slow
//! socket never blocks delivery to the rest. A client whose queue is gone
//! (receiver dropped) is evicted on the next send.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bridge::{LiveSessionInfo, NormalizedMessage};
use agentdeck_core::session::{PendingHook, Session};

/// Envelopes sent to real-time clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Full snapshot sent on connect.
    Init {
        sessions: Vec<Session>,
        live_sessions: Vec<LiveSessionInfo>,
    },
    /// Latest session list after any change.
    SessionsUpdate {
        sessions: Vec<Session>,
        live_sessions: Vec<LiveSessionInfo>,
    },
    /// A newly detected pending hook.
    HookAlert {
        session_id: String,
        hook: PendingHook,
    },
    /// One normalized message from a live session's bridge. Delivered only
    /// to clients subscribed to that session.
    SessionMessage {
        session_id: String,
        message: NormalizedMessage,
    },
}

struct HubClient {
    tx: mpsc::UnboundedSender<String>,
    subscriptions: HashSet<String>,
}

/// Registry of connected clients and their per-session subscriptions.
///
/// Lock discipline: the inner `RwLock` is never held across an await; sends
/// go through unbounded channels and cannot block.
#[derive(Default)]
pub struct BroadcastHub {
    clients: RwLock<HashMap<Uuid, HubClient>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client; the returned receiver is the client's outbound
    /// queue, to be pumped into its transport by the caller.
    pub fn register(&self) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.clients
            .write()
            .expect("hub lock poisoned")
            .insert(id, HubClient {
                tx,
                subscriptions: HashSet::new(),
            });
        (id, rx)
    }

    pub fn deregister(&self, id: &Uuid) {
        self.clients.write().expect("hub lock poisoned").remove(id);
    }

    /// Subscribe a client to a live session's message stream.
    pub fn subscribe(&self, id: &Uuid, session_id: &str) {
        if let Some(client) = self.clients.write().expect("hub lock poisoned").get_mut(id) {
            client.subscriptions.insert(session_id.to_string());
        }
    }

    pub fn unsubscribe(&self, id: &Uuid, session_id: &str) {
        if let Some(client) = self.clients.write().expect("hub lock poisoned").get_mut(id) {
            client.subscriptions.remove(session_id);
        }
    }

    /// Deliver to every client. A client whose send fails is deregistered;
    /// remaining clients still receive the event.
    pub fn broadcast(&self, event: &ClientEvent) {
        let Ok(payload) = serde_json::to_string(event) else {
            return;
        };
        let mut dead = Vec::new();
        {
            let clients = self.clients.read().expect("hub lock poisoned");
            for (id, client) in clients.iter() {
                if client.tx.send(payload.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }
        self.evict(dead);
    }

    /// Deliver a per-session event to subscribed clients only.
    pub fn send_to_session(&self, session_id: &str, event: &ClientEvent) {
        let Ok(payload) = serde_json::to_string(event) else {
            return;
        };
        let mut dead = Vec::new();
        {
            let clients = self.clients.read().expect("hub lock poisoned");
            for (id, client) in clients.iter() {
                if !client.subscriptions.contains(session_id) {
                    continue;
                }
                if client.tx.send(payload.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }
        self.evict(dead);
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().expect("hub lock poisoned").len()
    }

    fn evict(&self, dead: Vec<Uuid>) {
        if dead.is_empty() {
            return;
        }
        let mut clients = self.clients.write().expect("hub lock poisoned");
        for id in dead {
            clients.remove(&id);
            tracing::debug!(client_id = %id, "evicted unreachable client");
        }
    }
}

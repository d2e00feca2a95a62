// crates/server/src/state.rs
//! Application state for the Axum server.

use std::sync::Arc;
use std::time::Instant;

use agentdeck_core::SessionTailer;

use crate::bridge::BridgeManager;
use crate::guard::AccessGuard;
use crate::hub::BroadcastHub;
use crate::snapshot::{SnapshotEntry, SnapshotStore};

/// Shared application state accessible from all route handlers.
///
/// Each registry (session map, live-bridge map, client set, rate-limit map)
/// is owned by exactly one component here; handlers get snapshots, never
/// live references into a component's state.
pub struct AppState {
    /// Server start time for uptime tracking.
    pub start_time: Instant,
    /// Disk-derived session registry (Log Tailer).
    pub tailer: Arc<SessionTailer>,
    /// Live subprocess bridges.
    pub bridges: Arc<BridgeManager>,
    /// Real-time client fanout.
    pub hub: Arc<BroadcastHub>,
    /// Token check + rate limiting at the request boundary.
    pub guard: AccessGuard,
    /// Debounced live-session persistence.
    pub snapshots: Arc<SnapshotStore>,
    /// Entries recovered from the snapshot file at startup, offered for
    /// resumption.
    pub resumable: Vec<SnapshotEntry>,
}

impl AppState {
    pub fn new(
        tailer: Arc<SessionTailer>,
        bridges: Arc<BridgeManager>,
        guard: AccessGuard,
        snapshots: Arc<SnapshotStore>,
        resumable: Vec<SnapshotEntry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            start_time: Instant::now(),
            tailer,
            bridges,
            hub: Arc::new(BroadcastHub::new()),
            guard,
            snapshots,
            resumable,
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

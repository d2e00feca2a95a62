// crates/server/src/snapshot.rs
//! Best-effort persistence of live-session identifiers for restart
//! resumption.
//!
//! One JSON document on disk, rewritten with a debounce after changes and
//! read once at startup. Writes are atomic (temp file + rename); a missing
//! or corrupt file is treated as empty, never fatal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Quiet period after the last change before the document is rewritten.
const DEBOUNCE: Duration = Duration::from_secs(2);

/// One persisted live-session entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub id: String,
    pub working_dir: String,
    pub project_name: String,
    pub created_at: i64,
    pub last_activity_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_id: Option<String>,
}

#[derive(Serialize, Deserialize, Default)]
struct SnapshotDocument {
    sessions: Vec<SnapshotEntry>,
}

/// Debounced store of live-session entries.
pub struct SnapshotStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, SnapshotEntry>>,
    dirty_tx: mpsc::UnboundedSender<()>,
}

impl SnapshotStore {
    /// Create the store and spawn its debounced writer task.
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        Self::with_debounce(path, DEBOUNCE)
    }

    pub fn with_debounce(path: impl Into<PathBuf>, debounce: Duration) -> Arc<Self> {
        let (dirty_tx, mut dirty_rx) = mpsc::unbounded_channel();
        let store = Arc::new(Self {
            path: path.into(),
            entries: Mutex::new(HashMap::new()),
            dirty_tx,
        });

        let writer = store.clone();
        tokio::spawn(async move {
            while dirty_rx.recv().await.is_some() {
                // Absorb further changes until a quiet period elapses.
                loop {
                    match tokio::time::timeout(debounce, dirty_rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) => {
                            writer.write_now().await;
                            return;
                        }
                        Err(_) => break,
                    }
                }
                writer.write_now().await;
            }
        });

        store
    }

    /// Read the persisted document once at startup. Missing or corrupt files
    /// yield an empty list.
    pub fn load(path: &Path) -> Vec<SnapshotEntry> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read snapshot file");
                return Vec::new();
            }
        };
        match serde_json::from_str::<SnapshotDocument>(&raw) {
            Ok(doc) => doc.sessions,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt snapshot file, starting empty");
                Vec::new()
            }
        }
    }

    pub fn upsert(&self, entry: SnapshotEntry) {
        self.entries
            .lock()
            .expect("snapshot lock poisoned")
            .insert(entry.id.clone(), entry);
        let _ = self.dirty_tx.send(());
    }

    pub fn remove(&self, id: &str) {
        let removed = self
            .entries
            .lock()
            .expect("snapshot lock poisoned")
            .remove(id)
            .is_some();
        if removed {
            let _ = self.dirty_tx.send(());
        }
    }

    pub fn entries(&self) -> Vec<SnapshotEntry> {
        let mut all: Vec<SnapshotEntry> = self
            .entries
            .lock()
            .expect("snapshot lock poisoned")
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Write immediately, bypassing the debounce. Used on shutdown and in
    /// tests.
    pub async fn flush(&self) {
        self.write_now().await;
    }

    async fn write_now(&self) {
        let doc = SnapshotDocument {
            sessions: self.entries(),
        };
        let path = self.path.clone();

        let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let payload = serde_json::to_vec_pretty(&doc)?;
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, payload)?;
            std::fs::rename(&tmp, &path)?;
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => debug!(path = %self.path.display(), "snapshot written"),
            Ok(Err(e)) => warn!(path = %self.path.display(), error = %e, "snapshot write failed"),
            Err(e) => warn!(error = %e, "snapshot write task panicked"),
        }
    }
}

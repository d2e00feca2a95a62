// crates/core/src/tailer.rs
//! Poll-driven session registry.
//!
//! The `SessionTailer` owns the in-memory map of every session log under the
//! root directory. A fixed-interval poll task enumerates session files,
//! reads only newly appended bytes per file (via [`parse_tail`]), and keeps
//! per-session state current: transcript, message count, pending tool
//! approvals, and activity status.
//!
//! All mutation happens inside the poll task (plus explicit deletes);
//! accessors hand out cloned snapshots, so readers never race an in-flight
//! update.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::paths::{
    project_dir_from_path, project_display_name, scan_session_files, session_id_from_path,
};
use crate::record::{ContentBlock, LogRecord, RecordKind};
use crate::session::{PendingHook, Session, SessionMessage, SessionStatus, TailerEvent};
use crate::tail::{parse_tail, TailFinders};

/// Tailer configuration.
#[derive(Debug, Clone)]
pub struct TailerConfig {
    /// Root directory containing per-project session log directories.
    pub root: PathBuf,
    /// Poll interval; each tick costs O(newly appended bytes).
    pub poll_interval: Duration,
}

impl TailerConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// An unresolved `tool_use` observed in a session log.
#[derive(Debug, Clone)]
struct OutstandingToolUse {
    id: String,
    name: String,
    input: serde_json::Value,
    timestamp: Option<String>,
}

/// Per-session state that persists across poll ticks but is not part of the
/// public snapshot.
#[derive(Default)]
struct SessionAccumulator {
    /// Byte offset for the next `parse_tail` call.
    offset: u64,
    /// Tool uses with no matching `tool_result` yet, in arrival order.
    outstanding: Vec<OutstandingToolUse>,
    /// Tool-use ids already alerted; an id alerts at most once per tailer
    /// lifetime (a restart mid-pending may legitimately re-alert).
    alerted: HashSet<String>,
}

/// Poll-driven registry of on-disk sessions.
pub struct SessionTailer {
    config: TailerConfig,
    sessions: RwLock<HashMap<String, Session>>,
    accumulators: RwLock<HashMap<String, SessionAccumulator>>,
    tx: broadcast::Sender<TailerEvent>,
    finders: Arc<TailFinders>,
    cancel: CancellationToken,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionTailer {
    pub fn new(config: TailerConfig) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(256);
        Arc::new(Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            accumulators: RwLock::new(HashMap::new()),
            tx,
            finders: Arc::new(TailFinders::new()),
            cancel: CancellationToken::new(),
            poll_task: Mutex::new(None),
        })
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<TailerEvent> {
        self.tx.subscribe()
    }

    /// Spawn the poll loop. Idempotent; a second call is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut slot = self.poll_task.lock().await;
        if slot.is_some() {
            return;
        }

        let tailer = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tailer.config.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tailer.cancel.cancelled() => break,
                    _ = interval.tick() => tailer.poll_once().await,
                }
            }
        });
        *slot = Some(handle);
        info!(root = %self.config.root.display(), interval_ms = self.config.poll_interval.as_millis() as u64, "session tailer started");
    }

    /// Cancel the poll loop and wait for it to finish. After this returns no
    /// further events are emitted by the loop.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.poll_task.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Snapshot of all tracked sessions, most recently active first.
    pub async fn sessions(&self) -> Vec<Session> {
        let map = self.sessions.read().await;
        let mut all: Vec<Session> = map.values().cloned().collect();
        all.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        all
    }

    /// Snapshot of a single session.
    pub async fn session(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Delete a session: remove the backing file and the in-memory entry.
    ///
    /// Idempotent — returns `true` if an entry existed, `false` on repeat
    /// calls or unknown ids.
    pub async fn delete_session(&self, id: &str) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(id)
        };
        self.accumulators.write().await.remove(id);

        let Some(session) = removed else {
            return false;
        };

        if let Err(e) = tokio::fs::remove_file(&session.file_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(session_id = %id, error = %e, "failed to remove session file");
            }
        }
        let _ = self.tx.send(TailerEvent::SessionRemoved {
            session_id: id.to_string(),
        });
        true
    }

    /// One poll tick: enumerate session files, fold in appended records,
    /// reconcile removed files, and re-derive statuses.
    ///
    /// Exposed so tests can drive the tailer deterministically without the
    /// interval loop. Any single file's failure is contained to that file.
    pub async fn poll_once(&self) {
        let root = self.config.root.clone();
        let scan = tokio::task::spawn_blocking(move || scan_session_files(&root)).await;

        let files = match scan {
            Ok(Ok(files)) => files,
            Ok(Err(e)) => {
                debug!(error = %e, "session root scan failed");
                return;
            }
            Err(e) => {
                warn!(error = %e, "session scan task panicked");
                return;
            }
        };

        let on_disk: HashSet<String> = files
            .iter()
            .map(|path| session_id_from_path(path))
            .collect();

        for path in &files {
            self.process_file(path).await;
        }

        // Files that vanished from disk take their sessions with them.
        let removed_ids: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .keys()
                .filter(|id| !on_disk.contains(*id))
                .cloned()
                .collect()
        };
        if !removed_ids.is_empty() {
            let mut sessions = self.sessions.write().await;
            let mut accumulators = self.accumulators.write().await;
            for id in removed_ids {
                if sessions.remove(&id).is_some() {
                    accumulators.remove(&id);
                    let _ = self.tx.send(TailerEvent::SessionRemoved { session_id: id });
                }
            }
        }

        // Recency-based status transitions happen even without new records.
        let now = chrono::Utc::now().timestamp();
        let transitions: Vec<Session> = {
            let mut sessions = self.sessions.write().await;
            let mut changed = Vec::new();
            for session in sessions.values_mut() {
                let status = session.derive_status(now);
                if session.status != status {
                    session.status = status;
                    changed.push(session.clone());
                }
            }
            changed
        };
        for session in transitions {
            let _ = self.tx.send(TailerEvent::SessionUpdated { session });
        }
    }

    /// Fold one file's appended records into its session.
    async fn process_file(&self, path: &Path) {
        let session_id = session_id_from_path(path);

        let offset = {
            let accumulators = self.accumulators.read().await;
            accumulators.get(&session_id).map(|a| a.offset).unwrap_or(0)
        };

        let finders = self.finders.clone();
        let path_owned = path.to_path_buf();
        let parsed = tokio::task::spawn_blocking(move || {
            parse_tail(&path_owned, offset, &finders)
        })
        .await;

        let (records, new_offset) = match parsed {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                // File may have been deleted between scan and read; contained
                // to this file, the next tick reconciles.
                debug!(session_id = %session_id, error = %e, "tail read failed");
                return;
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "tail task panicked");
                return;
            }
        };

        let is_new = {
            let sessions = self.sessions.read().await;
            !sessions.contains_key(&session_id)
        };

        if records.is_empty() && !is_new && new_offset == offset {
            return;
        }

        let now = chrono::Utc::now().timestamp();
        let mut alerts: Vec<PendingHook> = Vec::new();

        let snapshot = {
            let mut sessions = self.sessions.write().await;
            let mut accumulators = self.accumulators.write().await;

            let session = sessions.entry(session_id.clone()).or_insert_with(|| {
                let project = project_dir_from_path(path);
                Session {
                    id: session_id.clone(),
                    project_name: project_display_name(&project),
                    project,
                    working_dir: String::new(),
                    file_path: path.display().to_string(),
                    git_branch: None,
                    last_activity_at: file_mtime(path).unwrap_or(now),
                    message_count: 0,
                    status: SessionStatus::Active,
                    pending_hook: None,
                    messages: Vec::new(),
                }
            });
            let acc = accumulators.entry(session_id.clone()).or_default();
            acc.offset = new_offset;

            for record in &records {
                apply_record(session, acc, record, now);
            }

            // The most recent unresolved tool use is the pending hook; one
            // alert per distinct id.
            session.pending_hook = acc.outstanding.last().map(|tu| PendingHook {
                kind: "pre_tool_use".into(),
                tool_use_id: tu.id.clone(),
                tool_name: tu.name.clone(),
                input: tu.input.clone(),
                timestamp: tu.timestamp.clone(),
            });
            if let Some(hook) = &session.pending_hook {
                if acc.alerted.insert(hook.tool_use_id.clone()) {
                    alerts.push(hook.clone());
                }
            }

            session.status = session.derive_status(now);
            session.clone()
        };

        let event = if is_new {
            TailerEvent::SessionDiscovered { session: snapshot }
        } else {
            TailerEvent::SessionUpdated { session: snapshot }
        };
        let _ = self.tx.send(event);

        for hook in alerts {
            let _ = self.tx.send(TailerEvent::HookAlert {
                session_id: session_id.clone(),
                hook,
            });
        }
    }
}

/// Fold a single record into session + accumulator state.
fn apply_record(session: &mut Session, acc: &mut SessionAccumulator, record: &LogRecord, now: i64) {
    if let Some(cwd) = &record.cwd {
        session.working_dir = cwd.clone();
    }
    if let Some(branch) = &record.git_branch {
        session.git_branch = Some(branch.clone());
    }
    session.last_activity_at = record
        .timestamp
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or(now);

    if record.is_conversational() {
        session.message_count += 1;
        let role = record
            .message
            .as_ref()
            .and_then(|m| m.role.clone())
            .unwrap_or_else(|| match record.kind {
                RecordKind::Assistant => "assistant".into(),
                _ => "user".into(),
            });
        session.messages.push(SessionMessage {
            role,
            content: record.blocks().to_vec(),
            timestamp: record.timestamp.clone(),
        });
    }

    for block in record.blocks() {
        match block {
            ContentBlock::ToolUse { id, name, input } => {
                acc.outstanding.push(OutstandingToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                    timestamp: record.timestamp.clone(),
                });
            }
            ContentBlock::ToolResult { tool_use_id, .. } => {
                acc.outstanding.retain(|tu| tu.id != *tool_use_id);
            }
            _ => {}
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp())
}

fn file_mtime(path: &Path) -> Option<i64> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
}

// crates/server/src/bridge/manager.rs
//! Registry of live bridges.
//!
//! The manager spawns one subprocess per live session, wires up its reader
//! and waiter tasks, and removes the bridge when the subprocess exits. It is
//! the only owner of the live-bridge map; callers get snapshots or operate
//! through id-keyed methods that return `false`/not-found instead of
//! erroring once a session is gone.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, warn};

use crate::snapshot::{SnapshotEntry, SnapshotStore};

use super::protocol::StreamDecoder;
use super::session::Bridge;
use super::state::{BridgeEvent, LiveSessionInfo};

/// Errors surfaced when a live session cannot be created.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to spawn agent subprocess `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("subprocess stdio was not captured")]
    MissingStdio,
}

/// Subprocess launch configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Agent CLI binary name or path.
    pub command: String,
    /// Base arguments always passed; `--resume` is appended per session.
    pub args: Vec<String>,
}

impl BridgeConfig {
    pub fn for_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: "claude".into(),
            args: [
                "--input-format",
                "stream-json",
                "--output-format",
                "stream-json",
                "--verbose",
            ]
            .map(String::from)
            .to_vec(),
        }
    }
}

/// Owns every live bridge and the event channel they publish to.
pub struct BridgeManager {
    config: BridgeConfig,
    bridges: RwLock<HashMap<String, Arc<Bridge>>>,
    events: broadcast::Sender<BridgeEvent>,
    snapshots: Arc<SnapshotStore>,
}

impl BridgeManager {
    pub fn new(config: BridgeConfig, snapshots: Arc<SnapshotStore>) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(1024);
        Arc::new(Self {
            config,
            bridges: RwLock::new(HashMap::new()),
            events,
            snapshots,
        })
    }

    /// Subscribe to normalized messages from every bridge.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Spawn a subprocess for a new (or resumed) live session.
    ///
    /// When `resume_id` is given the live session reuses the disk session id
    /// and the subprocess continues that conversation.
    pub async fn start_session(
        self: &Arc<Self>,
        working_dir: &str,
        resume_id: Option<String>,
    ) -> Result<LiveSessionInfo, BridgeError> {
        let id = resume_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut cmd = tokio::process::Command::new(&self.config.command);
        cmd.args(&self.config.args);
        if let Some(resume) = &resume_id {
            cmd.args(["--resume", resume]);
        }
        cmd.current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Strip agent env vars so the child never refuses to start inside
        // another agent session.
        for (key, _) in std::env::vars() {
            if key.starts_with("CLAUDE") {
                cmd.env_remove(&key);
            }
        }

        let mut child = cmd.spawn().map_err(|source| BridgeError::SpawnFailed {
            command: self.config.command.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or(BridgeError::MissingStdio)?;
        let stdout = child.stdout.take().ok_or(BridgeError::MissingStdio)?;
        let stderr = child.stderr.take().ok_or(BridgeError::MissingStdio)?;

        let project_name = Path::new(working_dir)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| working_dir.to_string());

        let (exited_tx, exited_rx) = watch::channel(None);
        let bridge = Arc::new(Bridge::new(
            id.clone(),
            working_dir.to_string(),
            project_name.clone(),
            resume_id.clone(),
            child.id(),
            stdin,
            self.events.clone(),
            exited_rx,
        ));

        self.bridges
            .write()
            .await
            .insert(id.clone(), bridge.clone());

        let info = bridge.info();
        self.snapshots.upsert(SnapshotEntry {
            id: id.clone(),
            working_dir: working_dir.to_string(),
            project_name,
            created_at: info.created_at,
            last_activity_at: info.last_activity_at,
            resume_id,
        });

        info!(session_id = %id, pid = ?child.id(), working_dir, "spawned live session");

        // Stdout reader: decode envelopes and translate in arrival order.
        {
            let bridge = bridge.clone();
            let mut stdout = stdout;
            tokio::spawn(async move {
                let mut decoder = StreamDecoder::new();
                let mut buf = [0u8; 8192];
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            for envelope in decoder.feed(&buf[..n]) {
                                bridge.handle_envelope(envelope);
                            }
                        }
                        Err(e) => {
                            warn!(session_id = %bridge.id, error = %e, "stdout read failed");
                            break;
                        }
                    }
                }
                debug!(session_id = %bridge.id, "stdout closed");
            });
        }

        // Stderr reader: diagnostics only, never fatal.
        {
            let session_id = id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        warn!(session_id = %session_id, line = %line, "subprocess stderr");
                    }
                }
            });
        }

        // Waiter: record exit, emit the terminal status, drop the bridge.
        {
            let manager = self.clone();
            let bridge = bridge.clone();
            tokio::spawn(async move {
                let exit_code = match child.wait().await {
                    Ok(status) => status.code(),
                    Err(e) => {
                        warn!(session_id = %bridge.id, error = %e, "wait on subprocess failed");
                        None
                    }
                };
                bridge.finish(exit_code);
                let _ = exited_tx.send(exit_code.or(Some(-1)));

                manager.bridges.write().await.remove(&bridge.id);
                manager.snapshots.remove(&bridge.id);
            });
        }

        Ok(info)
    }

    /// Snapshots of all live sessions, newest first.
    pub async fn list(&self) -> Vec<LiveSessionInfo> {
        let bridges = self.bridges.read().await;
        let mut infos: Vec<LiveSessionInfo> = bridges.values().map(|b| b.info()).collect();
        infos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        infos
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Bridge>> {
        self.bridges.read().await.get(id).cloned()
    }

    /// Touch the snapshot entry after activity so restart recovery carries a
    /// fresh resume id.
    pub async fn refresh_snapshot(&self, id: &str) {
        if let Some(bridge) = self.get(id).await {
            let info = bridge.info();
            self.snapshots.upsert(SnapshotEntry {
                id: info.id,
                working_dir: info.working_dir,
                project_name: info.project_name,
                created_at: info.created_at,
                last_activity_at: info.last_activity_at,
                resume_id: info.resume_id,
            });
        }
    }

    /// Stop a live session's subprocess. Returns `false` when the id is
    /// unknown (including a second stop after the first completed).
    pub async fn stop_session(&self, id: &str) -> bool {
        let Some(bridge) = self.get(id).await else {
            return false;
        };
        bridge.stop().await;
        true
    }

    /// Stop every live session; used on shutdown.
    pub async fn shutdown(&self) {
        let bridges: Vec<Arc<Bridge>> = self.bridges.read().await.values().cloned().collect();
        for bridge in bridges {
            bridge.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::state::NormalizedMessage;

    fn manager() -> (Arc<BridgeManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = SnapshotStore::new(dir.path().join("live-sessions.json"));
        let manager = BridgeManager::new(
            BridgeConfig {
                command: "cat".into(),
                args: Vec::new(),
            },
            snapshots,
        );
        (manager, dir)
    }

    #[tokio::test]
    async fn test_spawn_failure_is_typed() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = SnapshotStore::new(dir.path().join("s.json"));
        let manager = BridgeManager::new(
            BridgeConfig {
                command: "definitely-not-a-real-binary-9f2d".into(),
                args: Vec::new(),
            },
            snapshots,
        );
        let result = manager.start_session("/tmp", None).await;
        assert!(matches!(result, Err(BridgeError::SpawnFailed { .. })));
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_id_returns_not_found_never_errors() {
        let (manager, _dir) = manager();
        assert!(manager.get("nope").await.is_none());
        assert!(!manager.stop_session("nope").await);
    }

    #[tokio::test]
    async fn test_start_and_stop_session() {
        let (manager, _dir) = manager();
        let info = manager.start_session("/tmp", None).await.unwrap();
        assert_eq!(manager.list().await.len(), 1);

        assert!(manager.stop_session(&info.id).await);

        // The waiter removes the bridge once the process is reaped.
        for _ in 0..50 {
            if manager.get(&info.id).await.is_none() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(manager.get(&info.id).await.is_none());
        // Second stop on the same id: gone, false.
        assert!(!manager.stop_session(&info.id).await);
    }

    #[tokio::test]
    async fn test_resume_id_becomes_session_id() {
        let (manager, _dir) = manager();
        let info = manager
            .start_session("/tmp", Some("disk-session-7".into()))
            .await
            .unwrap();
        assert_eq!(info.id, "disk-session-7");
        assert_eq!(info.resume_id.as_deref(), Some("disk-session-7"));
        manager.stop_session(&info.id).await;
    }

    #[tokio::test]
    async fn test_terminal_status_broadcast_on_exit() {
        let (manager, _dir) = manager();
        let mut rx = manager.subscribe();
        let info = manager.start_session("/tmp", None).await.unwrap();
        manager.stop_session(&info.id).await;

        let mut saw_terminal = false;
        while let Ok(Ok(event)) = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            rx.recv(),
        )
        .await
        {
            if let NormalizedMessage::Status { status, .. } = event.message {
                if status.is_terminal() {
                    saw_terminal = true;
                    break;
                }
            }
        }
        assert!(saw_terminal);
    }
}

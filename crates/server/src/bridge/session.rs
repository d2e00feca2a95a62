// crates/server/src/bridge/session.rs
//! One live bridge: owns a spawned subprocess and translates between its
//! stream-JSON protocol and the normalized message model.
//!
//! Bridges share no mutable state with each other; each owns its process
//! handle, decode buffer, and status. The stdout reader task is the only
//! writer of protocol-derived state, so normalized delivery order equals
//! byte-arrival order.

use std::sync::Mutex;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use agentdeck_core::record::ContentBlock;

use super::protocol::{
    permission_response_line, user_turn_line, ControlSignal, StreamEnvelope,
};
use super::state::{
    BridgeEvent, BridgeStatus, LiveSessionInfo, NormalizedMessage, PendingPermission,
};

/// How long a cooperative SIGTERM gets before escalating to SIGKILL.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Mutable bridge state, owned behind one lock.
struct BridgeState {
    status: BridgeStatus,
    pending_permission: Option<PendingPermission>,
    /// Session id reported by the subprocess init event (for `--resume`).
    backend_session_id: Option<String>,
    last_activity_at: i64,
    /// Set once by `finish()`; guards the single terminal status message.
    finished: bool,
}

/// A live session's bridge to its subprocess.
pub struct Bridge {
    pub id: String,
    pub working_dir: String,
    pub project_name: String,
    pub created_at: i64,
    pid: Option<u32>,
    stdin: AsyncMutex<ChildStdin>,
    state: Mutex<BridgeState>,
    events: broadcast::Sender<BridgeEvent>,
    exited_rx: watch::Receiver<Option<i32>>,
}

impl Bridge {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        working_dir: String,
        project_name: String,
        resume_id: Option<String>,
        pid: Option<u32>,
        stdin: ChildStdin,
        events: broadcast::Sender<BridgeEvent>,
        exited_rx: watch::Receiver<Option<i32>>,
    ) -> Self {
        Self {
            id,
            working_dir,
            project_name,
            created_at: chrono::Utc::now().timestamp(),
            pid,
            stdin: AsyncMutex::new(stdin),
            state: Mutex::new(BridgeState {
                status: BridgeStatus::Starting,
                pending_permission: None,
                backend_session_id: resume_id,
                last_activity_at: chrono::Utc::now().timestamp(),
                finished: false,
            }),
            events,
            exited_rx,
        }
    }

    pub fn status(&self) -> BridgeStatus {
        self.state.lock().expect("bridge state poisoned").status
    }

    /// Snapshot for clients and the snapshot store.
    pub fn info(&self) -> LiveSessionInfo {
        let state = self.state.lock().expect("bridge state poisoned");
        LiveSessionInfo {
            id: self.id.clone(),
            working_dir: self.working_dir.clone(),
            project_name: self.project_name.clone(),
            status: state.status,
            pending_permission: state.pending_permission.clone(),
            resume_id: state.backend_session_id.clone(),
            created_at: self.created_at,
            last_activity_at: state.last_activity_at,
        }
    }

    /// Translate one decoded envelope into state transitions plus zero or
    /// more normalized messages, emitted in envelope order.
    pub(crate) fn handle_envelope(&self, envelope: StreamEnvelope) {
        let mut out: Vec<NormalizedMessage> = Vec::new();

        {
            let mut state = self.state.lock().expect("bridge state poisoned");
            state.last_activity_at = chrono::Utc::now().timestamp();

            match envelope {
                StreamEnvelope::System { subtype, session_id } => {
                    if let Some(sid) = session_id {
                        state.backend_session_id = Some(sid);
                    }
                    if subtype.as_deref() == Some("init")
                        && state.status == BridgeStatus::Starting
                    {
                        state.status = BridgeStatus::Active;
                        out.push(NormalizedMessage::Status {
                            status: BridgeStatus::Active,
                            detail: Some("ready".into()),
                        });
                    }
                }
                StreamEnvelope::Assistant { message } => {
                    // Defensive readiness: output before init still means the
                    // subprocess is up.
                    if state.status == BridgeStatus::Starting {
                        state.status = BridgeStatus::Active;
                        out.push(NormalizedMessage::Status {
                            status: BridgeStatus::Active,
                            detail: Some("ready".into()),
                        });
                    }
                    for block in message.content {
                        match block {
                            ContentBlock::Text { text } => {
                                out.push(NormalizedMessage::Text { text, delta: false })
                            }
                            ContentBlock::ToolUse { id, name, input } => {
                                out.push(NormalizedMessage::ToolUse { id, name, input })
                            }
                            ContentBlock::ToolResult {
                                tool_use_id,
                                content,
                                is_error,
                            } => out.push(NormalizedMessage::ToolResult {
                                tool_use_id,
                                content,
                                is_error,
                            }),
                            ContentBlock::Unknown => {}
                        }
                    }
                }
                StreamEnvelope::User { message } => {
                    // User envelopes echo our own turns; only tool results
                    // carry new information.
                    for block in message.content {
                        if let ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } = block
                        {
                            out.push(NormalizedMessage::ToolResult {
                                tool_use_id,
                                content,
                                is_error,
                            });
                        }
                    }
                }
                StreamEnvelope::ContentBlockDelta { delta } => {
                    if let Some(text) = delta.and_then(|d| d.text) {
                        out.push(NormalizedMessage::Text { text, delta: true });
                    }
                }
                StreamEnvelope::Result {
                    is_error,
                    result,
                    session_id,
                } => {
                    if let Some(sid) = session_id {
                        state.backend_session_id = Some(sid);
                    }
                    // Turn-level result: the subprocess stays alive for the
                    // next user turn, so bridge status is untouched.
                    let status = if is_error.unwrap_or(false) {
                        BridgeStatus::Error
                    } else {
                        BridgeStatus::Completed
                    };
                    out.push(NormalizedMessage::Status {
                        status,
                        detail: result,
                    });
                }
                StreamEnvelope::Error { message } => {
                    out.push(NormalizedMessage::Error {
                        message: message.unwrap_or_else(|| "unknown subprocess error".into()),
                    });
                }
                StreamEnvelope::PermissionRequest {
                    tool_use_id,
                    tool_name,
                    input,
                } => {
                    state.status = BridgeStatus::WaitingPermission;
                    state.pending_permission = Some(PendingPermission {
                        tool_use_id: tool_use_id.clone(),
                        tool_name,
                        input,
                    });
                    out.push(NormalizedMessage::Status {
                        status: BridgeStatus::WaitingPermission,
                        detail: Some(tool_use_id),
                    });
                }
                StreamEnvelope::MessageStart
                | StreamEnvelope::MessageDelta
                | StreamEnvelope::MessageStop
                | StreamEnvelope::ContentBlockStart
                | StreamEnvelope::ContentBlockStop => {}
                StreamEnvelope::Unknown => {
                    debug!(session_id = %self.id, "ignoring unrecognized envelope type");
                }
            }
        }

        for message in out {
            self.emit(message);
        }
    }

    /// Queue one user turn. Fails unless the bridge is `active`.
    pub async fn send_message(&self, text: &str) -> bool {
        if self.status() != BridgeStatus::Active {
            return false;
        }
        self.write_bytes(user_turn_line(text).as_bytes()).await
    }

    /// Answer the pending permission request.
    ///
    /// Returns `false` (never errors) when the session has moved on or the
    /// id does not match the pending request.
    pub async fn send_permission_response(
        &self,
        tool_use_id: &str,
        approved: bool,
        feedback: Option<&str>,
    ) -> bool {
        let cleared = {
            let mut state = self.state.lock().expect("bridge state poisoned");
            let matches = state.status == BridgeStatus::WaitingPermission
                && state
                    .pending_permission
                    .as_ref()
                    .is_some_and(|p| p.tool_use_id == tool_use_id);
            if matches {
                state.pending_permission = None;
                state.status = BridgeStatus::Active;
            }
            matches
        };
        if !cleared {
            return false;
        }

        self.emit(NormalizedMessage::Status {
            status: BridgeStatus::Active,
            detail: Some(format!(
                "permission {} for {tool_use_id}",
                if approved { "granted" } else { "denied" }
            )),
        });
        self.write_bytes(permission_response_line(tool_use_id, approved, feedback).as_bytes())
            .await
    }

    /// Send a named control signal as a single control byte; a `/`-prefixed
    /// string is passed through as an ordinary user turn instead.
    pub async fn send_control_signal(&self, signal: &str) -> bool {
        if signal.starts_with('/') {
            return self.send_message(signal).await;
        }
        let Some(signal) = ControlSignal::parse(signal) else {
            return false;
        };
        if self.status().is_terminal() {
            return false;
        }
        self.write_bytes(&[signal.byte()]).await
    }

    /// Record the subprocess exit and emit the single terminal status
    /// message. Idempotent; only the first call emits.
    pub(crate) fn finish(&self, exit_code: Option<i32>) {
        let emit = {
            let mut state = self.state.lock().expect("bridge state poisoned");
            if state.finished {
                None
            } else {
                state.finished = true;
                state.pending_permission = None;
                state.status = if exit_code == Some(0) {
                    BridgeStatus::Completed
                } else {
                    BridgeStatus::Error
                };
                Some(state.status)
            }
        };

        if let Some(status) = emit {
            info!(session_id = %self.id, ?exit_code, "subprocess exited");
            self.emit(NormalizedMessage::Status {
                status,
                detail: Some(match exit_code {
                    Some(code) => format!("exit code {code}"),
                    None => "killed by signal".into(),
                }),
            });
        }
    }

    /// Stop the subprocess: cooperative SIGTERM, then SIGKILL after the
    /// grace period. Idempotent and bounded; never hangs.
    pub async fn stop(&self) {
        if self.exited_rx.borrow().is_some() {
            return;
        }
        let Some(pid) = self.pid else {
            return;
        };

        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        if self.wait_exit(STOP_GRACE).await {
            return;
        }

        warn!(session_id = %self.id, pid, "grace period elapsed, sending SIGKILL");
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
        // Bounded wait for the waiter task to reap; SIGKILL cannot be ignored.
        self.wait_exit(Duration::from_secs(2)).await;
    }

    async fn wait_exit(&self, timeout: Duration) -> bool {
        let mut rx = self.exited_rx.clone();
        tokio::time::timeout(timeout, async {
            while rx.borrow().is_none() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok()
    }

    fn emit(&self, message: NormalizedMessage) {
        let _ = self.events.send(BridgeEvent {
            session_id: self.id.clone(),
            message,
        });
    }

    async fn write_bytes(&self, bytes: &[u8]) -> bool {
        let mut stdin = self.stdin.lock().await;
        let result = async {
            stdin.write_all(bytes).await?;
            stdin.flush().await
        }
        .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "stdin write failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentdeck_core::record::LogMessage;

    /// Build a bridge around a throwaway `cat` process so stdin writes have
    /// somewhere to go without involving a real agent CLI.
    async fn test_bridge() -> (
        Bridge,
        broadcast::Receiver<BridgeEvent>,
        watch::Sender<Option<i32>>,
        tokio::process::Child,
    ) {
        let mut child = tokio::process::Command::new("cat")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .spawn()
            .expect("spawn cat");
        let stdin = child.stdin.take().expect("stdin piped");
        let (events, rx) = broadcast::channel(64);
        let (exited_tx, exited_rx) = watch::channel(None);
        let bridge = Bridge::new(
            "live-1".into(),
            "/work/widgets".into(),
            "widgets".into(),
            None,
            child.id(),
            stdin,
            events,
            exited_rx,
        );
        (bridge, rx, exited_tx, child)
    }

    fn drain(rx: &mut broadcast::Receiver<BridgeEvent>) -> Vec<NormalizedMessage> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event.message);
        }
        out
    }

    fn envelope(json: &str) -> StreamEnvelope {
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn test_init_envelope_activates() {
        let (bridge, mut rx, _exited, mut child) = test_bridge().await;
        assert_eq!(bridge.status(), BridgeStatus::Starting);

        bridge.handle_envelope(envelope(
            r#"{"type":"system","subtype":"init","session_id":"backend-1"}"#,
        ));
        assert_eq!(bridge.status(), BridgeStatus::Active);
        assert_eq!(bridge.info().resume_id.as_deref(), Some("backend-1"));

        let messages = drain(&mut rx);
        assert!(matches!(
            messages[0],
            NormalizedMessage::Status {
                status: BridgeStatus::Active,
                ..
            }
        ));
        let _ = child.kill().await;
    }

    #[tokio::test]
    async fn test_normalization_preserves_block_order() {
        let (bridge, mut rx, _exited, mut child) = test_bridge().await;
        bridge.handle_envelope(StreamEnvelope::Assistant {
            message: serde_json::from_str::<LogMessage>(
                r#"{"role":"assistant","content":[
                    {"type":"text","text":"let me check"},
                    {"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}},
                    {"type":"text","text":"running"}
                ]}"#,
            )
            .unwrap(),
        });

        let messages = drain(&mut rx);
        // Readiness status first (defensive activation), then blocks in order.
        assert_eq!(messages.len(), 4);
        assert!(matches!(messages[0], NormalizedMessage::Status { .. }));
        assert!(matches!(&messages[1], NormalizedMessage::Text { text, delta: false } if text == "let me check"));
        assert!(matches!(&messages[2], NormalizedMessage::ToolUse { id, .. } if id == "t1"));
        assert!(matches!(&messages[3], NormalizedMessage::Text { text, .. } if text == "running"));
        let _ = child.kill().await;
    }

    #[tokio::test]
    async fn test_send_message_requires_active() {
        let (bridge, _rx, _exited, mut child) = test_bridge().await;
        assert_eq!(bridge.status(), BridgeStatus::Starting);
        assert!(!bridge.send_message("too early").await);

        bridge.handle_envelope(envelope(r#"{"type":"system","subtype":"init"}"#));
        assert!(bridge.send_message("now it works").await);
        let _ = child.kill().await;
    }

    #[tokio::test]
    async fn test_permission_round_trip() {
        let (bridge, mut rx, _exited, mut child) = test_bridge().await;
        bridge.handle_envelope(envelope(r#"{"type":"system","subtype":"init"}"#));
        bridge.handle_envelope(envelope(
            r#"{"type":"permission_request","tool_use_id":"t7","tool_name":"Bash","input":{"command":"rm -rf build"}}"#,
        ));
        assert_eq!(bridge.status(), BridgeStatus::WaitingPermission);
        assert!(!bridge.send_message("blocked").await);

        // Mismatched id is refused without state change.
        assert!(!bridge.send_permission_response("t8", true, None).await);
        assert_eq!(bridge.status(), BridgeStatus::WaitingPermission);

        assert!(bridge.send_permission_response("t7", true, None).await);
        assert_eq!(bridge.status(), BridgeStatus::Active);
        assert!(bridge.info().pending_permission.is_none());

        // Answering again after the session moved on: false, never an error.
        assert!(!bridge.send_permission_response("t7", false, Some("late")).await);

        let statuses: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|m| matches!(m, NormalizedMessage::Status { .. }))
            .collect();
        assert!(statuses.len() >= 3);
        let _ = child.kill().await;
    }

    #[tokio::test]
    async fn test_control_signal_mapping_and_passthrough() {
        let (bridge, _rx, _exited, mut child) = test_bridge().await;
        bridge.handle_envelope(envelope(r#"{"type":"system","subtype":"init"}"#));

        assert!(bridge.send_control_signal("interrupt").await);
        assert!(bridge.send_control_signal("/compact").await);
        assert!(!bridge.send_control_signal("self-destruct").await);
        let _ = child.kill().await;
    }

    #[tokio::test]
    async fn test_finish_emits_single_terminal_status() {
        let (bridge, mut rx, _exited, mut child) = test_bridge().await;
        bridge.handle_envelope(envelope(r#"{"type":"system","subtype":"init"}"#));
        drain(&mut rx);

        bridge.finish(Some(0));
        bridge.finish(Some(0));
        bridge.finish(Some(1));

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            messages[0],
            NormalizedMessage::Status {
                status: BridgeStatus::Completed,
                ..
            }
        ));
        assert_eq!(bridge.status(), BridgeStatus::Completed);
        assert!(!bridge.send_message("after exit").await);
        let _ = child.kill().await;
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let (bridge, mut rx, _exited, mut child) = test_bridge().await;
        bridge.finish(Some(3));
        let messages = drain(&mut rx);
        assert!(matches!(
            messages[0],
            NormalizedMessage::Status {
                status: BridgeStatus::Error,
                ..
            }
        ));
        let _ = child.kill().await;
    }

    #[tokio::test]
    async fn test_result_envelope_does_not_terminate_bridge() {
        let (bridge, mut rx, _exited, mut child) = test_bridge().await;
        bridge.handle_envelope(envelope(r#"{"type":"system","subtype":"init"}"#));
        drain(&mut rx);

        bridge.handle_envelope(envelope(
            r#"{"type":"result","is_error":false,"result":"turn done","session_id":"backend-2"}"#,
        ));
        let messages = drain(&mut rx);
        assert!(matches!(
            &messages[0],
            NormalizedMessage::Status { status: BridgeStatus::Completed, detail: Some(d) } if d == "turn done"
        ));
        // Interactive subprocess stays usable for the next turn.
        assert_eq!(bridge.status(), BridgeStatus::Active);
        assert!(bridge.send_message("next turn").await);
        let _ = child.kill().await;
    }
}

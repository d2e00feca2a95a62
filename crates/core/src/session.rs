// crates/core/src/session.rs
//! Session state types and status derivation.

use serde::Serialize;

use crate::record::ContentBlock;

/// A session with no pending hook is `active` while its log was written
/// within this window, `idle` after.
pub const IDLE_AFTER_SECS: i64 = 300;

/// The current status of a tracked session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Log written recently.
    Active,
    /// No writes for a while.
    Idle,
    /// A tool invocation is awaiting external approval.
    PendingHook,
}

/// A tool invocation awaiting external approval, surfaced to the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingHook {
    /// Hook type; always `pre_tool_use` for approvals detected from the log.
    #[serde(rename = "type")]
    pub kind: String,
    pub tool_use_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
    /// Timestamp of the record that introduced the tool use, if present.
    pub timestamp: Option<String>,
}

/// One conversational message in a session transcript.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub role: String,
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// A snapshot of one tracked session, as served to clients.
///
/// Snapshots are cloned out of the tailer's registry; mutation happens only
/// inside the poll task, so readers never observe a half-updated session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session id (log file stem).
    pub id: String,
    /// Encoded project directory name (as stored on disk).
    pub project: String,
    /// Human-readable project name.
    pub project_name: String,
    /// Working directory reported by the log records.
    pub working_dir: String,
    /// Absolute path to the backing log file.
    pub file_path: String,
    /// Git branch label, if any record carried one.
    pub git_branch: Option<String>,
    /// Unix timestamp of the most recent record (or file mtime at discovery).
    pub last_activity_at: i64,
    /// Number of user/assistant records observed.
    pub message_count: usize,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_hook: Option<PendingHook>,
    /// Ordered transcript.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<SessionMessage>,
}

impl Session {
    /// Derive the status from hook state and recency.
    pub fn derive_status(&self, now: i64) -> SessionStatus {
        if self.pending_hook.is_some() {
            SessionStatus::PendingHook
        } else if now - self.last_activity_at <= IDLE_AFTER_SECS {
            SessionStatus::Active
        } else {
            SessionStatus::Idle
        }
    }
}

/// Events broadcast by the tailer to its subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TailerEvent {
    /// A new session log was discovered on disk.
    SessionDiscovered { session: Session },
    /// An existing session changed (new records, status transition).
    SessionUpdated { session: Session },
    /// A session's log disappeared or was deleted.
    SessionRemoved {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// A new pending hook was detected. Emitted at most once per distinct
    /// tool-use id.
    HookAlert {
        #[serde(rename = "sessionId")]
        session_id: String,
        hook: PendingHook,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(last_activity_at: i64, pending: bool) -> Session {
        Session {
            id: "s1".into(),
            project: "proj".into(),
            project_name: "proj".into(),
            working_dir: "/w".into(),
            file_path: "/root/proj/s1.jsonl".into(),
            git_branch: None,
            last_activity_at,
            message_count: 0,
            status: SessionStatus::Active,
            pending_hook: pending.then(|| PendingHook {
                kind: "pre_tool_use".into(),
                tool_use_id: "t1".into(),
                tool_name: "Bash".into(),
                input: serde_json::json!({}),
                timestamp: None,
            }),
            messages: Vec::new(),
        }
    }

    #[test]
    fn test_recent_session_is_active() {
        let s = session(1_000, false);
        assert_eq!(s.derive_status(1_000 + 10), SessionStatus::Active);
    }

    #[test]
    fn test_stale_session_is_idle() {
        let s = session(1_000, false);
        assert_eq!(
            s.derive_status(1_000 + IDLE_AFTER_SECS + 1),
            SessionStatus::Idle
        );
    }

    #[test]
    fn test_pending_hook_overrides_recency() {
        let s = session(1_000, true);
        assert_eq!(s.derive_status(1_000 + 10), SessionStatus::PendingHook);
        assert_eq!(
            s.derive_status(1_000 + IDLE_AFTER_SECS + 100),
            SessionStatus::PendingHook
        );
    }

    #[test]
    fn test_session_serializes_camel_case() {
        let s = session(5, true);
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["messageCount"], 0);
        assert_eq!(json["status"], "active");
        assert_eq!(json["pendingHook"]["toolUseId"], "t1");
        assert_eq!(json["pendingHook"]["type"], "pre_tool_use");
    }
}

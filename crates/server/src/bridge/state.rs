// crates/server/src/bridge/state.rs
//! Live-session state types and the normalized message vocabulary.

use serde::Serialize;

/// Lifecycle of a live bridge:
/// `starting → active → (waiting_permission ⇄ active)* → completed | error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeStatus {
    Starting,
    Active,
    WaitingPermission,
    Completed,
    Error,
}

impl BridgeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// A permission request the subprocess is blocked on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPermission {
    pub tool_use_id: String,
    pub tool_name: Option<String>,
    pub input: Option<serde_json::Value>,
}

/// A snapshot of one live session, as served to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveSessionInfo {
    /// Live session id; equals the disk session id when resuming.
    pub id: String,
    pub working_dir: String,
    pub project_name: String,
    pub status: BridgeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_permission: Option<PendingPermission>,
    /// Backend session id reported by the subprocess's init event, usable
    /// for a later resume.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_id: Option<String>,
    pub created_at: i64,
    pub last_activity_at: i64,
}

/// The fixed vocabulary every subprocess envelope is normalized into before
/// fanout. Delivery order equals byte-arrival order on the subprocess pipe.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum NormalizedMessage {
    Text {
        text: String,
        /// True for streaming deltas, false for complete blocks.
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        delta: bool,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Error {
        message: String,
    },
    Status {
        status: BridgeStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

/// A normalized message attributed to its live session, as published by
/// bridges to the rest of the server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeEvent {
    pub session_id: String,
    pub message: NormalizedMessage,
}

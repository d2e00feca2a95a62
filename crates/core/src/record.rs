//! Typed model for on-disk session log records.
//!
//! Each line of a session log is one JSON record wrapping an API message:
//! ```json
//! {"type":"user","message":{"role":"user","content":"..."},"timestamp":"...",
//!  "uuid":"...","sessionId":"...","cwd":"/work/dir","gitBranch":"main"}
//! ```
//! Content is either a plain string or an array of content blocks. Unknown
//! record types and block types deserialize into explicit `Other`/`Unknown`
//! variants so new producers never break the parser.

use serde::{Deserialize, Deserializer, Serialize};

/// Broad classification of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    User,
    Assistant,
    System,
    #[serde(other)]
    Other,
}

/// One line of a session log.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    #[serde(rename = "type")]
    pub kind: RecordKind,
    #[serde(default)]
    pub message: Option<LogMessage>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
}

/// The wrapped API message inside a record.
#[derive(Debug, Clone, Deserialize)]
pub struct LogMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default, deserialize_with = "string_or_blocks")]
    pub content: Vec<ContentBlock>,
}

/// A single content block within a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Unknown,
}

/// Content arrives as a plain string or an array of blocks; normalize the
/// string form into a single text block.
fn string_or_blocks<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<ContentBlock>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Content {
        Text(String),
        Blocks(Vec<ContentBlock>),
    }

    match Content::deserialize(d)? {
        Content::Text(text) => Ok(vec![ContentBlock::Text { text }]),
        Content::Blocks(blocks) => Ok(blocks),
    }
}

impl LogRecord {
    /// Whether this record counts toward the session's message count.
    pub fn is_conversational(&self) -> bool {
        matches!(self.kind, RecordKind::User | RecordKind::Assistant)
    }

    /// Content blocks, or an empty slice when the record carries no message.
    pub fn blocks(&self) -> &[ContentBlock] {
        self.message.as_ref().map(|m| m.content.as_slice()).unwrap_or(&[])
    }
}

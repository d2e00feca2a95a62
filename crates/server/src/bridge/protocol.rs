// crates/server/src/bridge/protocol.rs
//! Stream-JSON protocol model for the spawned agent subprocess.
//!
//! The subprocess speaks newline-delimited JSON on stdout: one envelope per
//! line. Envelopes are modeled as a closed tagged union plus an `Unknown`
//! variant so an unrecognized `type` from a newer CLI is logged and ignored
//! instead of crashing the bridge.
//!
//! [`StreamDecoder`] turns raw read chunks into envelopes. Chunk boundaries
//! carry no meaning: an envelope split at any byte offset across any number
//! of reads decodes exactly once, and a trailing partial line is buffered
//! until its newline arrives.

use agentdeck_core::record::LogMessage;
use memchr::memchr;
use serde::{Deserialize, Serialize};

/// One stdout envelope from the subprocess.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEnvelope {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        message: LogMessage,
    },
    User {
        message: LogMessage,
    },
    Result {
        #[serde(default)]
        is_error: Option<bool>,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    MessageStart,
    MessageDelta,
    MessageStop,
    ContentBlockStart,
    ContentBlockDelta {
        #[serde(default)]
        delta: Option<BlockDelta>,
    },
    ContentBlockStop,
    PermissionRequest {
        tool_use_id: String,
        #[serde(default)]
        tool_name: Option<String>,
        #[serde(default)]
        input: Option<serde_json::Value>,
    },
    #[serde(other)]
    Unknown,
}

/// Payload of a `content_block_delta` envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockDelta {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

/// Incremental newline-delimited JSON decoder.
///
/// Owns the undecoded tail of the stream; partial lines survive across
/// `feed` calls and are never discarded or double-processed.
#[derive(Default)]
pub struct StreamDecoder {
    buf: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a read chunk and return every envelope completed by it.
    ///
    /// A line that is not valid JSON is logged and dropped; decoding
    /// continues with the next line.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEnvelope> {
        self.buf.extend_from_slice(bytes);

        let mut envelopes = Vec::new();
        while let Some(pos) = memchr(b'\n', &self.buf) {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = &line[..line.len() - 1]; // strip '\n'
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<StreamEnvelope>(line) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        line = %String::from_utf8_lossy(&line[..line.len().min(200)]),
                        "dropping malformed protocol line"
                    );
                }
            }
        }
        envelopes
    }

    /// Bytes currently buffered waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

/// Serialize a user-turn input envelope (newline-terminated).
pub fn user_turn_line(text: &str) -> String {
    let envelope = serde_json::json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{ "type": "text", "text": text }],
        },
    });
    format!("{envelope}\n")
}

/// Serialize a permission-decision input envelope (newline-terminated).
pub fn permission_response_line(tool_use_id: &str, approved: bool, feedback: Option<&str>) -> String {
    let mut envelope = serde_json::json!({
        "type": "permission_response",
        "tool_use_id": tool_use_id,
        "approved": approved,
    });
    if let Some(feedback) = feedback {
        envelope["feedback"] = serde_json::Value::String(feedback.to_string());
    }
    format!("{envelope}\n")
}

/// Named control signals mapped to single control bytes on the subprocess's
/// stdin. The set is closed; anything else (except `/`-prefixed passthrough,
/// handled by the bridge) is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    Interrupt,
    Retry,
    Clear,
    Expand,
    Eof,
    Quit,
}

impl ControlSignal {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "interrupt" => Some(Self::Interrupt),
            "retry" => Some(Self::Retry),
            "clear" => Some(Self::Clear),
            "expand" => Some(Self::Expand),
            "eof" => Some(Self::Eof),
            "quit" => Some(Self::Quit),
            _ => None,
        }
    }

    pub fn byte(self) -> u8 {
        match self {
            Self::Interrupt => 0x03, // ETX / Ctrl-C
            Self::Retry => 0x12,     // Ctrl-R
            Self::Clear => 0x0C,     // Ctrl-L
            Self::Expand => 0x05,    // Ctrl-E
            Self::Eof => 0x04,       // EOT / Ctrl-D
            Self::Quit => 0x11,      // Ctrl-Q
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentdeck_core::record::ContentBlock;

    #[test]
    fn test_decode_single_envelope() {
        let mut decoder = StreamDecoder::new();
        let envelopes =
            decoder.feed(b"{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"abc\"}\n");
        assert_eq!(envelopes.len(), 1);
        assert!(matches!(
            &envelopes[0],
            StreamEnvelope::System { subtype: Some(s), session_id: Some(id) }
                if s == "init" && id == "abc"
        ));
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_split_envelope_decodes_exactly_once() {
        let line = b"{\"type\":\"assistant\",\"message\":{\"role\":\"assistant\",\"content\":[{\"type\":\"text\",\"text\":\"hello world\"}]}}\n";

        // Every split point must produce exactly one envelope.
        for split in 1..line.len() - 1 {
            let mut decoder = StreamDecoder::new();
            let mut envelopes = decoder.feed(&line[..split]);
            envelopes.extend(decoder.feed(&line[split..]));
            assert_eq!(envelopes.len(), 1, "split at byte {split}");
            assert!(matches!(&envelopes[0], StreamEnvelope::Assistant { .. }));
            assert_eq!(decoder.pending_len(), 0, "split at byte {split}");
        }
    }

    #[test]
    fn test_envelope_split_across_many_reads() {
        let line = b"{\"type\":\"result\",\"is_error\":false,\"result\":\"done\"}\n";
        let mut decoder = StreamDecoder::new();
        let mut envelopes = Vec::new();
        for byte in line.iter() {
            envelopes.extend(decoder.feed(std::slice::from_ref(byte)));
        }
        assert_eq!(envelopes.len(), 1);
        assert!(matches!(
            &envelopes[0],
            StreamEnvelope::Result { is_error: Some(false), result: Some(r), .. } if r == "done"
        ));
    }

    #[test]
    fn test_multiple_envelopes_in_one_chunk() {
        let mut decoder = StreamDecoder::new();
        let chunk = b"{\"type\":\"message_start\"}\n{\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n{\"type\":\"message_stop\"}\n";
        let envelopes = decoder.feed(chunk);
        assert_eq!(envelopes.len(), 3);
        assert!(matches!(envelopes[0], StreamEnvelope::MessageStart));
        assert!(matches!(
            &envelopes[1],
            StreamEnvelope::ContentBlockDelta { delta: Some(d) } if d.text.as_deref() == Some("hi")
        ));
        assert!(matches!(envelopes[2], StreamEnvelope::MessageStop));
    }

    #[test]
    fn test_malformed_line_dropped_stream_continues() {
        let mut decoder = StreamDecoder::new();
        let envelopes = decoder.feed(b"this is not json\n{\"type\":\"message_stop\"}\n");
        assert_eq!(envelopes.len(), 1);
        assert!(matches!(envelopes[0], StreamEnvelope::MessageStop));
    }

    #[test]
    fn test_unknown_type_maps_to_unknown() {
        let mut decoder = StreamDecoder::new();
        let envelopes = decoder.feed(b"{\"type\":\"telemetry\",\"payload\":{}}\n");
        assert_eq!(envelopes.len(), 1);
        assert!(matches!(envelopes[0], StreamEnvelope::Unknown));
    }

    #[test]
    fn test_crlf_tolerated() {
        let mut decoder = StreamDecoder::new();
        let envelopes = decoder.feed(b"{\"type\":\"message_stop\"}\r\n");
        assert_eq!(envelopes.len(), 1);
        assert!(matches!(envelopes[0], StreamEnvelope::MessageStop));
    }

    #[test]
    fn test_assistant_content_blocks_parse() {
        let mut decoder = StreamDecoder::new();
        let envelopes = decoder.feed(b"{\"type\":\"assistant\",\"message\":{\"role\":\"assistant\",\"content\":[{\"type\":\"tool_use\",\"id\":\"t1\",\"name\":\"Bash\",\"input\":{\"command\":\"ls\"}}]}}\n");
        let StreamEnvelope::Assistant { message } = &envelopes[0] else {
            panic!("expected assistant envelope");
        };
        assert!(matches!(
            &message.content[0],
            ContentBlock::ToolUse { id, name, .. } if id == "t1" && name == "Bash"
        ));
    }

    #[test]
    fn test_user_turn_line_shape() {
        let line = user_turn_line("run the tests");
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["type"], "user");
        assert_eq!(value["message"]["content"][0]["text"], "run the tests");
    }

    #[test]
    fn test_permission_response_line_shape() {
        let line = permission_response_line("t9", false, Some("too risky"));
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["type"], "permission_response");
        assert_eq!(value["tool_use_id"], "t9");
        assert_eq!(value["approved"], false);
        assert_eq!(value["feedback"], "too risky");

        let bare = permission_response_line("t9", true, None);
        let value: serde_json::Value = serde_json::from_str(bare.trim_end()).unwrap();
        assert!(value.get("feedback").is_none());
        assert_eq!(value["approved"], true);
    }

    #[test]
    fn test_control_signal_mapping() {
        assert_eq!(ControlSignal::parse("interrupt"), Some(ControlSignal::Interrupt));
        assert_eq!(ControlSignal::parse("eof"), Some(ControlSignal::Eof));
        assert_eq!(ControlSignal::parse("sigkill"), None);
        assert_eq!(ControlSignal::Interrupt.byte(), 0x03);
        assert_eq!(ControlSignal::Eof.byte(), 0x04);
    }
}

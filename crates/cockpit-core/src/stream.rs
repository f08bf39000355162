//! Stream events for incrementally delivered responses.
//!
//! # Ordering contract
//!
//! Within one stream, `sequence` starts at 0 on the `start` event and
//! increases by exactly one per event. Exactly one terminal event (`end` or
//! `error`) closes the stream; nothing follows it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{SessionId, StreamId};

/// One fragment of an in-progress response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Stream this event belongs to.
    pub stream_id: StreamId,
    /// Position within the stream.
    pub sequence: u64,
    /// Variant tag and payload.
    #[serde(flatten)]
    pub kind: StreamEventKind,
}

/// Variant tag plus payload of a [`StreamEvent`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEventKind {
    /// First event of every stream.
    Start {
        /// Session the stream was opened for.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    /// A chunk of generated text.
    Fragment {
        /// Text content.
        content: String,
    },
    /// The generator invoked a tool.
    ToolInvocation {
        /// Tool name.
        tool: String,
        /// Arguments passed to the tool.
        parameters: Value,
    },
    /// A tool returned.
    ToolResult {
        /// Tool name.
        tool: String,
        /// Tool output.
        result: Value,
    },
    /// Terminal failure or cancellation notice.
    Error {
        /// Wire code.
        code: String,
        /// Human-readable message.
        message: String,
    },
    /// Terminal success.
    End {
        /// Summary metadata (fragment count, elapsed time, caller fields).
        summary: Value,
    },
}

impl StreamEventKind {
    /// Wire tag for this variant.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Fragment { .. } => "fragment",
            Self::ToolInvocation { .. } => "tool-invocation",
            Self::ToolResult { .. } => "tool-result",
            Self::Error { .. } => "error",
            Self::End { .. } => "end",
        }
    }

    /// Whether this variant closes the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::End { .. })
    }
}

impl StreamEvent {
    /// Serialize as one server-sent-events record: `data: <json>\n\n`.
    pub fn to_sse_record(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_string(self)?;
        Ok(format!("data: {json}\n\n"))
    }

    /// Whether this event closes the stream.
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

//! Live connection wire protocol.
//!
//! Frames are JSON text tagged by a `type` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{INVALID_MESSAGE, UNKNOWN_MESSAGE_TYPE};
use crate::ids::{SessionId, StreamId, UserId};
use crate::stream::StreamEvent;

/// Messages a client may send.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Application-level keepalive.
    Ping,
    /// Hand a payload to domain logic.
    Submit {
        /// Opaque to this layer.
        payload: Value,
    },
    /// Stop an in-flight stream.
    Cancel {
        /// Stream to stop.
        stream_id: StreamId,
    },
}

/// Messages the server sends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to a client `ping`.
    Pong {
        /// RFC 3339 server time.
        timestamp: String,
    },
    /// First message on every accepted connection.
    Connected {
        /// Session the connection joined.
        session_id: SessionId,
        /// Owning user.
        user_id: UserId,
        /// RFC 3339 accept time.
        connected_at: String,
    },
    /// Domain reply to a `submit`.
    Reply {
        /// Opaque to this layer.
        payload: Value,
    },
    /// Push notification.
    Notification {
        /// Notification body.
        payload: Value,
    },
    /// Failure notice.
    Error {
        /// Wire code.
        code: String,
        /// Human-readable message.
        message: String,
    },
    /// One event of a response streamed over this connection.
    Stream {
        /// The event.
        event: StreamEvent,
    },
}

impl ServerMessage {
    /// Build an `error` message.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build a `pong` stamped with the current time.
    pub fn pong() -> Self {
        Self::Pong {
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Parse an inbound text frame.
///
/// Malformed JSON yields `INVALID_MESSAGE`; valid JSON with an unrecognised
/// or missing `type` yields `UNKNOWN_MESSAGE_TYPE`. The error is returned as
/// the [`ServerMessage`] to send back.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ServerMessage> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ServerMessage::error(INVALID_MESSAGE, format!("invalid JSON: {e}")))?;

    let known = matches!(
        value.get("type").and_then(Value::as_str),
        Some("ping" | "submit" | "cancel")
    );
    if !known {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("<missing>")
            .to_owned();
        return Err(ServerMessage::error(
            UNKNOWN_MESSAGE_TYPE,
            format!("unknown message type: {kind}"),
        ));
    }

    serde_json::from_value(value)
        .map_err(|e| ServerMessage::error(INVALID_MESSAGE, format!("malformed message: {e}")))
}

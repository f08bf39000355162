//! Error taxonomy for the real-time layer.
//!
//! Every variant maps to a stable, machine-readable wire code that is sent to
//! clients inside `{"type":"error","code":..}` messages and stream `error`
//! events.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::ids::{SessionId, StreamId};

// ─────────────────────────────────────────────────────────────────────────────
// Wire codes
// ─────────────────────────────────────────────────────────────────────────────

/// Session already holds the maximum number of live connections.
pub const CAPACITY_EXCEEDED: &str = "CAPACITY_EXCEEDED";
/// Durable write failed; nothing was delivered.
pub const PERSISTENCE_ERROR: &str = "PERSISTENCE_ERROR";
/// Directory unavailable; delivery fell back to this process only.
pub const DELIVERY_DEGRADED: &str = "DELIVERY_DEGRADED";
/// Stream stopped by the client or a disconnect.
pub const STREAM_CANCELLED: &str = "STREAM_CANCELLED";
/// Heartbeat or backpressure deadline passed.
pub const TIMEOUT: &str = "TIMEOUT";
/// Client sent an unparseable frame.
pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
/// Client sent a well-formed message with an unknown `type`.
pub const UNKNOWN_MESSAGE_TYPE: &str = "UNKNOWN_MESSAGE_TYPE";
/// Domain handler failed while processing a submit.
pub const PROCESSING_ERROR: &str = "PROCESSING_ERROR";

// ─────────────────────────────────────────────────────────────────────────────
// RealtimeError
// ─────────────────────────────────────────────────────────────────────────────

/// Which deadline expired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    /// No inbound traffic within the idle window.
    Heartbeat,
    /// Destination did not accept a stream event in time.
    Backpressure,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Heartbeat => f.write_str("heartbeat"),
            Self::Backpressure => f.write_str("backpressure"),
        }
    }
}

/// Errors surfaced by the real-time delivery layer.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Registration refused; existing connections are untouched.
    #[error("session {session_id} already holds {limit} live connections")]
    CapacityExceeded {
        /// Session that is full.
        session_id: SessionId,
        /// Configured per-session maximum.
        limit: usize,
    },

    /// Durable write failed before any delivery attempt.
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// Cross-process lookup failed; delivery continued locally.
    #[error("delivery degraded: {0}")]
    DeliveryDegraded(String),

    /// Stream stopped early.
    #[error("stream {0} cancelled")]
    StreamCancelled(StreamId),

    /// A liveness or backpressure deadline passed.
    #[error("{kind} deadline of {after:?} exceeded")]
    Timeout {
        /// Which deadline.
        kind: TimeoutKind,
        /// Configured limit.
        after: Duration,
    },
}

impl RealtimeError {
    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => CAPACITY_EXCEEDED,
            Self::Persistence(_) => PERSISTENCE_ERROR,
            Self::DeliveryDegraded(_) => DELIVERY_DEGRADED,
            Self::StreamCancelled(_) => STREAM_CANCELLED,
            Self::Timeout { .. } => TIMEOUT,
        }
    }

    /// Whether the error means the peer is gone and its connection should be
    /// dropped.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::StreamCancelled(_)
                | Self::Timeout {
                    kind: TimeoutKind::Heartbeat | TimeoutKind::Backpressure,
                    ..
                }
        )
    }
}

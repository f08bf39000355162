//! Live client connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cockpit_core::{ConnectionId, ServerMessage, SessionId, UserId};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A frame queued for the connection's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// JSON text frame.
    Text(Arc<String>),
    /// Protocol-level ping.
    Ping,
}

/// Why a frame could not be queued.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SendFailure {
    /// The outbound queue is full; the client is not keeping up.
    #[error("outbound queue full")]
    Full,
    /// The writer task is gone.
    #[error("connection closed")]
    Closed,
    /// The queue stayed full past the deadline.
    #[error("outbound queue did not drain within {0:?}")]
    Timeout(Duration),
    /// The message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// One open duplex channel to a client.
///
/// Frames are delivered in the order they are queued; the single bounded
/// queue feeding one writer task is what makes that hold.
pub struct Connection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Owning session.
    pub session_id: SessionId,
    /// Owning user.
    pub user_id: UserId,
    /// Wall-clock accept time.
    pub created_at: DateTime<Utc>,
    connected_at: Instant,
    tx: mpsc::Sender<Outbound>,
    is_alive: AtomicBool,
    missed_heartbeats: AtomicU32,
    last_heartbeat: Mutex<Instant>,
    dropped_messages: AtomicU64,
    closed: CancellationToken,
}

impl Connection {
    /// Create a connection feeding `tx`.
    pub fn new(session_id: SessionId, user_id: UserId, tx: mpsc::Sender<Outbound>) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            session_id,
            user_id,
            created_at: Utc::now(),
            connected_at: now,
            tx,
            is_alive: AtomicBool::new(true),
            missed_heartbeats: AtomicU32::new(0),
            last_heartbeat: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
            closed: CancellationToken::new(),
        }
    }

    /// Queue a text frame without waiting.
    pub fn send_text(&self, text: Arc<String>) -> Result<(), SendFailure> {
        self.try_send(Outbound::Text(text))
    }

    /// Serialize and queue a server message without waiting.
    pub fn send_message(&self, message: &ServerMessage) -> Result<(), SendFailure> {
        let json = serde_json::to_string(message).map_err(|e| SendFailure::Encode(e.to_string()))?;
        self.send_text(Arc::new(json))
    }

    /// Queue a text frame, waiting at most `timeout` for queue space.
    pub async fn send_text_timeout(&self, text: Arc<String>, timeout: Duration) -> Result<(), SendFailure> {
        if self.closed.is_cancelled() {
            return Err(SendFailure::Closed);
        }
        match tokio::time::timeout(timeout, self.tx.send(Outbound::Text(text))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendFailure::Closed),
            Err(_) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(SendFailure::Timeout(timeout))
            }
        }
    }

    /// Queue a protocol ping.
    pub fn ping(&self) -> Result<(), SendFailure> {
        self.try_send(Outbound::Ping)
    }

    fn try_send(&self, frame: Outbound) -> Result<(), SendFailure> {
        if self.closed.is_cancelled() {
            return Err(SendFailure::Closed);
        }
        self.tx.try_send(frame).map_err(|e| {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            match e {
                TrySendError::Full(_) => SendFailure::Full,
                TrySendError::Closed(_) => SendFailure::Closed,
            }
        })
    }

    /// Record inbound traffic.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_heartbeat.lock() = Instant::now();
    }

    /// Check and reset the alive flag.
    ///
    /// Returns `true` if any inbound traffic arrived since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Count one more silent heartbeat tick; returns the new total.
    pub fn record_missed_heartbeat(&self) -> u32 {
        self.missed_heartbeats.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Clear the silent tick counter.
    pub fn reset_missed_heartbeats(&self) {
        self.missed_heartbeats.store(0, Ordering::Relaxed);
    }

    /// Consecutive silent heartbeat ticks.
    pub fn missed_heartbeats(&self) -> u32 {
        self.missed_heartbeats.load(Ordering::Relaxed)
    }

    /// Time since the last inbound traffic (or accept).
    pub fn last_heartbeat_elapsed(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Frames that could not be queued.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Token cancelled when the connection is closed. Streams bound to this
    /// connection use child tokens of it.
    pub fn close_token(&self) -> &CancellationToken {
        &self.closed
    }

    /// Signal the writer and reader to stop.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

//! Cross-process relay.
//!
//! Each process owns an inbox keyed by its process address. A process that
//! needs to reach a session held elsewhere publishes an envelope to the
//! holder's inbox; the holder writes it to the session through its own
//! connection table.

mod inbox;
mod memory;

pub use inbox::start_inbox;
pub use memory::InMemoryRelay;

use async_trait::async_trait;
use cockpit_core::SessionId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// One message bound for a session on another process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Publishing process.
    pub origin: String,
    /// Target session.
    pub session_id: SessionId,
    /// Pre-serialized server message.
    pub message: String,
}

/// Relay failures.
#[derive(Debug, Error)]
pub enum RelayError {
    /// No inbox is registered under the address.
    #[error("no inbox for process {0}")]
    UnknownPeer(String),
    /// The transport could not be reached.
    #[error("relay unavailable: {0}")]
    Unavailable(String),
}

/// Point-to-point transport between processes.
#[async_trait]
pub trait PeerRelay: Send + Sync {
    /// Deliver `envelope` to the inbox of `process_address`.
    async fn publish(&self, process_address: &str, envelope: RelayEnvelope) -> Result<(), RelayError>;

    /// Open the inbox for `process_address`. Opening again replaces the
    /// previous inbox.
    async fn subscribe(&self, process_address: &str) -> Result<mpsc::Receiver<RelayEnvelope>, RelayError>;
}

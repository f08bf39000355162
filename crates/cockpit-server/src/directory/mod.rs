//! Distributed session directory.
//!
//! Maps users to the sessions they hold open and the process address holding
//! each one. Entries are hints: they expire after a TTL unless refreshed, and
//! a missing entry never blocks local delivery.

mod memory;

pub use memory::InMemoryDirectory;

use std::time::Duration;

use async_trait::async_trait;
use cockpit_core::{SessionId, UserId};
use serde::Serialize;
use thiserror::Error;

/// Directory failures.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The backing store could not be reached.
    #[error("session directory unavailable: {0}")]
    Unavailable(String),
}

/// One live session and the process holding it.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize)]
pub struct PresenceRecord {
    /// The session.
    pub session_id: SessionId,
    /// Where the session's connections live.
    pub process_address: String,
}

/// Cross-process session presence.
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    /// Record that `process_address` holds `session_id` for `user_id`, or
    /// refresh the entry. The entry expires `ttl` after the last call.
    async fn announce(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        process_address: &str,
        ttl: Duration,
    ) -> Result<(), DirectoryError>;

    /// Remove the entry. Removing an absent entry is not an error.
    async fn withdraw(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        process_address: &str,
    ) -> Result<(), DirectoryError>;

    /// Unexpired entries for `user_id`.
    async fn lookup(&self, user_id: &UserId) -> Result<Vec<PresenceRecord>, DirectoryError>;
}

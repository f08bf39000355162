//! In-process [`SessionDirectory`] shared by every server in one runtime.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use cockpit_core::{SessionId, UserId};
use dashmap::DashMap;
use tokio::time::Instant;

use super::{DirectoryError, PresenceRecord, SessionDirectory};

/// TTL-respecting directory backed by a concurrent map.
///
/// Clones of an `Arc<InMemoryDirectory>` can be handed to several servers to
/// model processes sharing one directory.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    entries: DashMap<UserId, HashMap<PresenceRecord, Instant>>,
}

impl InMemoryDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored entries, including expired ones not yet pruned.
    pub fn entry_count(&self) -> usize {
        self.entries.iter().map(|e| e.value().len()).sum()
    }
}

#[async_trait]
impl SessionDirectory for InMemoryDirectory {
    async fn announce(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        process_address: &str,
        ttl: Duration,
    ) -> Result<(), DirectoryError> {
        let record = PresenceRecord {
            session_id: session_id.clone(),
            process_address: process_address.to_owned(),
        };
        let expires_at = Instant::now() + ttl;
        let _ = self
            .entries
            .entry(user_id.clone())
            .or_default()
            .insert(record, expires_at);
        Ok(())
    }

    async fn withdraw(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        process_address: &str,
    ) -> Result<(), DirectoryError> {
        let record = PresenceRecord {
            session_id: session_id.clone(),
            process_address: process_address.to_owned(),
        };
        if let Some(mut records) = self.entries.get_mut(user_id) {
            let _ = records.remove(&record);
        }
        let _ = self.entries.remove_if(user_id, |_, records| records.is_empty());
        Ok(())
    }

    async fn lookup(&self, user_id: &UserId) -> Result<Vec<PresenceRecord>, DirectoryError> {
        let now = Instant::now();
        let Some(mut records) = self.entries.get_mut(user_id) else {
            return Ok(Vec::new());
        };
        records.retain(|_, expires_at| *expires_at > now);
        let mut live: Vec<PresenceRecord> = records.keys().cloned().collect();
        drop(records);
        live.sort_by(|a, b| {
            a.process_address
                .cmp(&b.process_address)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(live)
    }
}

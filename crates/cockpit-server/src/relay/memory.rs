//! In-process [`PeerRelay`] for tests and single-binary deployments.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::{PeerRelay, RelayEnvelope, RelayError};

const INBOX_CAPACITY: usize = 1024;

/// Relay backed by one bounded channel per process address.
///
/// Publishing never waits: a full inbox is reported as unavailable.
#[derive(Debug, Default)]
pub struct InMemoryRelay {
    inboxes: DashMap<String, mpsc::Sender<RelayEnvelope>>,
}

impl InMemoryRelay {
    /// Empty relay.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PeerRelay for InMemoryRelay {
    async fn publish(&self, process_address: &str, envelope: RelayEnvelope) -> Result<(), RelayError> {
        let tx = self
            .inboxes
            .get(process_address)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RelayError::UnknownPeer(process_address.to_owned()))?;
        tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RelayError::Unavailable(format!("inbox of {process_address} is full")),
            mpsc::error::TrySendError::Closed(_) => {
                let _ = self
                    .inboxes
                    .remove_if(process_address, |_, current| current.same_channel(&tx));
                RelayError::UnknownPeer(process_address.to_owned())
            }
        })
    }

    async fn subscribe(&self, process_address: &str) -> Result<mpsc::Receiver<RelayEnvelope>, RelayError> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let _ = self.inboxes.insert(process_address.to_owned(), tx);
        Ok(rx)
    }
}

//! Notification dispatcher.
//!
//! Every notification is written to the store before any delivery attempt.
//! Delivery is best-effort: the record is returned whether zero, some, or all
//! live connections receive it, and a failing directory only narrows delivery
//! to this process.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use cockpit_core::{RealtimeError, ServerMessage, SessionId, UserId};
use cockpit_store::{NewNotification, NotificationRecord, NotificationStore};
use metrics::counter;
use serde_json::{Value, json};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::directory::{PresenceRecord, SessionDirectory};
use crate::metrics::{
    NOTIFICATIONS_CREATED_TOTAL, NOTIFICATIONS_DEGRADED_TOTAL, NOTIFICATIONS_DELIVERED_TOTAL,
    NOTIFICATIONS_PERSIST_FAILURES_TOTAL, RELAY_FAILURES_TOTAL, RELAY_PUBLISHED_TOTAL,
};
use crate::relay::{PeerRelay, RelayEnvelope};
use crate::websocket::ConnectionTable;

/// What one delivery attempt reached.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Local sessions targeted.
    pub local_sessions: usize,
    /// Local connections the message was queued on.
    pub local_connections: usize,
    /// Envelopes handed to the relay.
    pub remote_published: usize,
    /// Envelopes the relay refused.
    pub remote_failed: usize,
    /// Set when the directory failed and delivery stayed on this process.
    pub degraded: Option<String>,
}

/// Persists notifications and pushes them to the user's live sessions.
pub struct NotificationDispatcher {
    store: Arc<dyn NotificationStore>,
    table: Arc<ConnectionTable>,
    directory: Arc<dyn SessionDirectory>,
    relay: Arc<dyn PeerRelay>,
    process_address: String,
    call_timeout: Duration,
}

/// Default deadline for one directory lookup or relay publish.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(2);

impl NotificationDispatcher {
    /// Dispatcher for the process reachable at `process_address`.
    pub fn new(
        store: Arc<dyn NotificationStore>,
        table: Arc<ConnectionTable>,
        directory: Arc<dyn SessionDirectory>,
        relay: Arc<dyn PeerRelay>,
        process_address: impl Into<String>,
    ) -> Self {
        Self {
            store,
            table,
            directory,
            relay,
            process_address: process_address.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Bound each directory lookup and relay publish by `call_timeout`.
    #[must_use]
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// The backing store, for the read API.
    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.store
    }

    /// Persist `notification`, then deliver it best-effort.
    ///
    /// Fails only with [`RealtimeError::Persistence`], in which case nothing
    /// was delivered.
    pub async fn notify(&self, notification: NewNotification) -> Result<NotificationRecord, RealtimeError> {
        self.notify_with_report(notification)
            .await
            .map(|(record, _)| record)
    }

    /// [`notify`](Self::notify), also returning what delivery reached.
    #[instrument(skip_all, fields(user_id = %notification.user_id, category = %notification.category))]
    pub async fn notify_with_report(
        &self,
        notification: NewNotification,
    ) -> Result<(NotificationRecord, DeliveryReport), RealtimeError> {
        let record = match self.store.create(notification).await {
            Ok(record) => record,
            Err(e) => {
                counter!(NOTIFICATIONS_PERSIST_FAILURES_TOTAL).increment(1);
                warn!(error = %e, "failed to persist notification");
                return Err(RealtimeError::Persistence(e.to_string()));
            }
        };
        counter!(NOTIFICATIONS_CREATED_TOTAL).increment(1);

        let report = self.deliver(&record).await;
        info!(
            notification_id = %record.id,
            local_connections = report.local_connections,
            remote_published = report.remote_published,
            degraded = report.degraded.is_some(),
            "notification dispatched"
        );
        Ok((record, report))
    }

    /// Push an already-persisted record to every live session of its user.
    ///
    /// Sessions held by this process are served from the connection table
    /// before the directory is consulted. Directory lookups and relay
    /// publishes are bounded by the call timeout.
    pub async fn deliver(&self, record: &NotificationRecord) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let message = ServerMessage::Notification {
            payload: notification_payload(record),
        };
        let json = match serde_json::to_string(&message) {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!(notification_id = %record.id, error = %e, "failed to encode notification");
                return report;
            }
        };

        let mut served: BTreeSet<SessionId> = BTreeSet::new();
        for session_id in self.table.sessions_for_user(&record.user_id) {
            report.local_connections += self.table.send_text(&session_id, Arc::clone(&json));
            let _ = served.insert(session_id);
        }

        let remote = match self.lookup(&record.user_id).await {
            Ok(entries) => {
                let mut remote: BTreeMap<String, BTreeSet<SessionId>> = BTreeMap::new();
                for entry in entries {
                    if entry.process_address != self.process_address {
                        let _ = remote
                            .entry(entry.process_address)
                            .or_default()
                            .insert(entry.session_id);
                    } else if !served.contains(&entry.session_id) {
                        report.local_connections += self.table.send_text(&entry.session_id, Arc::clone(&json));
                        let _ = served.insert(entry.session_id);
                    }
                }
                remote
            }
            Err(reason) => {
                let degraded = RealtimeError::DeliveryDegraded(reason);
                counter!(NOTIFICATIONS_DEGRADED_TOTAL).increment(1);
                warn!(user_id = %record.user_id, error = %degraded, "directory lookup failed, delivering to this process only");
                report.degraded = Some(degraded.to_string());
                BTreeMap::new()
            }
        };
        report.local_sessions = served.len();
        counter!(NOTIFICATIONS_DELIVERED_TOTAL).increment(report.local_connections as u64);

        for (address, sessions) in remote {
            for session_id in sessions {
                let envelope = RelayEnvelope {
                    origin: self.process_address.clone(),
                    session_id,
                    message: json.as_str().to_owned(),
                };
                let failure = match timeout(self.call_timeout, self.relay.publish(&address, envelope)).await {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some(format!("publish timed out after {:?}", self.call_timeout)),
                };
                if let Some(error) = failure {
                    counter!(RELAY_FAILURES_TOTAL).increment(1);
                    warn!(process_address = %address, %error, "relay publish failed");
                    report.remote_failed += 1;
                } else {
                    counter!(RELAY_PUBLISHED_TOTAL).increment(1);
                    report.remote_published += 1;
                }
            }
        }

        debug!(notification_id = %record.id, ?report, "delivery finished");
        report
    }

    /// Directory entries for `user_id`, or why they are unavailable.
    async fn lookup(&self, user_id: &UserId) -> Result<Vec<PresenceRecord>, String> {
        match timeout(self.call_timeout, self.directory.lookup(user_id)).await {
            Ok(Ok(entries)) => Ok(entries),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("directory lookup timed out after {:?}", self.call_timeout)),
        }
    }
}

/// Client-facing body of a `notification` message.
pub fn notification_payload(record: &NotificationRecord) -> Value {
    json!({
        "id": record.id,
        "title": record.title,
        "content": record.content,
        "notification_type": record.category,
        "action": record.action,
        "related_entity_type": record.related.as_ref().map(|r| r.entity_type.as_str()),
        "related_entity_id": record.related.as_ref().map(|r| r.entity_id.as_str()),
        "is_read": record.is_read,
        "created_at": record.created_at.to_rfc3339(),
    })
}

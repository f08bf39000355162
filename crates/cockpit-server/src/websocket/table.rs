//! Per-process connection table.
//!
//! Sessions map to the live connections this process holds for them. Each
//! session slot carries its own lock, so a capacity check and the insert that
//! follows it are atomic with respect to concurrent registrations and
//! removals for the same session, while different sessions never contend.
//!
//! Lock order: a `DashMap` shard guard is never held while a slot lock is
//! taken.

use std::sync::Arc;

use cockpit_core::{ConnectionId, RealtimeError, SessionId, UserId};
use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::connection::{Connection, Outbound};
use super::presence::PresencePublisher;
use crate::metrics::{WS_CAPACITY_REJECTIONS_TOTAL, WS_SEND_FAILURES_TOTAL, WS_SESSIONS_ACTIVE};

#[derive(Default)]
struct SlotState {
    connections: Vec<Arc<Connection>>,
    /// Set once the slot has been unlinked from the map; registrations that
    /// raced the removal retry against a fresh slot.
    retired: bool,
}

#[derive(Default)]
struct SessionSlot {
    state: Mutex<SlotState>,
}

/// Registry of live connections on this process.
pub struct ConnectionTable {
    sessions: DashMap<SessionId, Arc<SessionSlot>>,
    index: DashMap<ConnectionId, Arc<Connection>>,
    max_per_session: usize,
    presence: PresencePublisher,
}

impl ConnectionTable {
    /// Create a table that allows `max_per_session` connections per session.
    pub fn new(max_per_session: usize, presence: PresencePublisher) -> Self {
        Self {
            sessions: DashMap::new(),
            index: DashMap::new(),
            max_per_session,
            presence,
        }
    }

    /// Admit a new connection for `session_id`.
    ///
    /// Fails with [`RealtimeError::CapacityExceeded`] when the session is
    /// full; existing connections are left untouched. On success the session
    /// is announced to the directory without waiting for it.
    pub fn register(
        &self,
        session_id: SessionId,
        user_id: UserId,
        channel: mpsc::Sender<Outbound>,
    ) -> Result<Arc<Connection>, RealtimeError> {
        let connection = Arc::new(Connection::new(session_id.clone(), user_id.clone(), channel));

        loop {
            let slot = Arc::clone(self.sessions.entry(session_id.clone()).or_default().value());
            let mut state = slot.state.lock();
            if state.retired {
                continue;
            }
            if state.connections.len() >= self.max_per_session {
                let held = state.connections.len();
                drop(state);
                counter!(WS_CAPACITY_REJECTIONS_TOTAL).increment(1);
                warn!(%session_id, %user_id, held, limit = self.max_per_session, "session at capacity, rejecting connection");
                return Err(RealtimeError::CapacityExceeded {
                    session_id,
                    limit: self.max_per_session,
                });
            }
            let first = state.connections.is_empty();
            state.connections.push(Arc::clone(&connection));
            let _ = self.index.insert(connection.id.clone(), Arc::clone(&connection));
            let held = state.connections.len();
            drop(state);

            if first {
                gauge!(WS_SESSIONS_ACTIVE).increment(1.0);
            }
            self.presence.announce(&session_id, &user_id);
            debug!(conn_id = %connection.id, %session_id, %user_id, held, "connection registered");
            return Ok(connection);
        }
    }

    /// Remove a connection and close it.
    ///
    /// Idempotent: returns `false` if the connection was already gone. When
    /// the session's last connection leaves, the session is withdrawn from the
    /// directory.
    pub fn deregister(&self, connection_id: &ConnectionId) -> bool {
        let Some((_, connection)) = self.index.remove(connection_id) else {
            return false;
        };
        connection.close();

        let slot = self
            .sessions
            .get(&connection.session_id)
            .map(|entry| Arc::clone(entry.value()));
        let Some(slot) = slot else {
            return true;
        };

        let mut state = slot.state.lock();
        state.connections.retain(|c| c.id != *connection_id);
        let now_empty = state.connections.is_empty() && !state.retired;
        if now_empty {
            state.retired = true;
            let _ = self
                .sessions
                .remove_if(&connection.session_id, |_, current| Arc::ptr_eq(current, &slot));
        }
        drop(state);

        if now_empty {
            gauge!(WS_SESSIONS_ACTIVE).decrement(1.0);
            self.presence.withdraw(&connection.session_id, &connection.user_id);
            debug!(conn_id = %connection_id, session_id = %connection.session_id, "last connection left session");
        } else {
            debug!(conn_id = %connection_id, session_id = %connection.session_id, "connection deregistered");
        }
        true
    }

    /// Serialize `message` once and queue it on every connection of
    /// `session_id`.
    ///
    /// Connections that cannot take the frame are deregistered and skipped.
    /// Returns the number of connections the frame was queued on; an unknown
    /// session yields 0.
    pub fn send<M: Serialize + ?Sized>(&self, session_id: &SessionId, message: &M) -> usize {
        match serde_json::to_string(message) {
            Ok(json) => self.send_text(session_id, Arc::new(json)),
            Err(e) => {
                warn!(%session_id, error = %e, "failed to serialize outbound message");
                0
            }
        }
    }

    /// Queue pre-serialized text on every connection of `session_id`.
    pub fn send_text(&self, session_id: &SessionId, text: Arc<String>) -> usize {
        let targets = self.session_connections(session_id);
        self.fan_out(&targets, &text)
    }

    /// Queue `message` on every connection of every session except
    /// `exclude`. Returns the number of connections reached.
    pub fn broadcast<M: Serialize + ?Sized>(&self, message: &M, exclude: Option<&SessionId>) -> usize {
        let json = match serde_json::to_string(message) {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!(error = %e, "failed to serialize broadcast message");
                return 0;
            }
        };
        let targets: Vec<Arc<Connection>> = self
            .index
            .iter()
            .filter(|entry| exclude != Some(&entry.value().session_id))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.fan_out(&targets, &json)
    }

    fn fan_out(&self, targets: &[Arc<Connection>], text: &Arc<String>) -> usize {
        let mut delivered = 0;
        for conn in targets {
            match conn.send_text(Arc::clone(text)) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    counter!(WS_SEND_FAILURES_TOTAL).increment(1);
                    warn!(conn_id = %conn.id, session_id = %conn.session_id, error = %e, "send failed, dropping connection");
                    let _ = self.deregister(&conn.id);
                }
            }
        }
        delivered
    }

    /// Snapshot of a session's connections.
    pub fn session_connections(&self, session_id: &SessionId) -> Vec<Arc<Connection>> {
        let slot = self
            .sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()));
        slot.map(|slot| slot.state.lock().connections.clone())
            .unwrap_or_default()
    }

    /// Live connections held for `session_id`.
    pub fn session_connection_count(&self, session_id: &SessionId) -> usize {
        self.session_connections(session_id).len()
    }

    /// Whether this process holds at least one connection for `session_id`.
    pub fn has_session(&self, session_id: &SessionId) -> bool {
        self.session_connection_count(session_id) > 0
    }

    /// Sessions on this process owned by `user_id`, sorted.
    pub fn sessions_for_user(&self, user_id: &UserId) -> Vec<SessionId> {
        let mut sessions: Vec<SessionId> = self
            .index
            .iter()
            .filter(|entry| entry.value().user_id == *user_id)
            .map(|entry| entry.value().session_id.clone())
            .collect();
        sessions.sort();
        sessions.dedup();
        sessions
    }

    /// Look up one connection.
    pub fn get(&self, connection_id: &ConnectionId) -> Option<Arc<Connection>> {
        self.index.get(connection_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of every live connection.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.index.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Total live connections.
    pub fn connection_count(&self) -> usize {
        self.index.len()
    }

    /// Sessions with at least one live connection.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Re-announce every local session so directory entries outlive their
    /// TTL. Returns the number of sessions refreshed.
    pub fn refresh_presence(&self) -> usize {
        let owners: Vec<(SessionId, UserId)> = self
            .connections()
            .into_iter()
            .map(|c| (c.session_id.clone(), c.user_id.clone()))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        for (session_id, user_id) in &owners {
            self.presence.announce(session_id, user_id);
        }
        owners.len()
    }

    /// Configured per-session limit.
    pub fn max_per_session(&self) -> usize {
        self.max_per_session
    }

    /// Close and remove every connection.
    pub fn close_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.index.iter().map(|entry| entry.key().clone()).collect();
        ids.iter().filter(|id| self.deregister(id)).count()
    }
}

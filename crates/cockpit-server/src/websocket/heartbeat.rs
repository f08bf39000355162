//! Periodic liveness sweep over every local connection.

use std::sync::Arc;
use std::time::Duration;

use cockpit_core::errors::TIMEOUT;
use cockpit_core::{RealtimeError, ServerMessage, TimeoutKind};
use metrics::counter;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::table::ConnectionTable;
use crate::config::RealtimeConfig;
use crate::metrics::HEARTBEAT_EVICTIONS_TOTAL;

/// Result of one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections examined.
    pub checked: usize,
    /// Silent connections sent a ping.
    pub pinged: usize,
    /// Connections deregistered.
    pub evicted: usize,
    /// Sessions re-announced to the directory.
    pub refreshed_sessions: usize,
}

/// Evicts connections that stay silent for too many ticks and keeps
/// directory entries fresh.
pub struct HeartbeatMonitor {
    table: Arc<ConnectionTable>,
    interval: Duration,
    max_missed: u32,
}

impl HeartbeatMonitor {
    /// Monitor ticking every `interval`, evicting after `max_missed`
    /// consecutive silent ticks (at least 1).
    pub fn new(table: Arc<ConnectionTable>, interval: Duration, max_missed: u32) -> Self {
        Self {
            table,
            interval,
            max_missed: max_missed.max(1),
        }
    }

    /// Monitor using the configured interval and idle timeout.
    pub fn from_config(table: Arc<ConnectionTable>, config: &RealtimeConfig) -> Self {
        Self::new(table, config.heartbeat_interval, config.max_missed_heartbeats())
    }

    /// Consecutive silent ticks tolerated.
    pub fn max_missed(&self) -> u32 {
        self.max_missed
    }

    /// Run one tick.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for conn in self.table.connections() {
            report.checked += 1;
            if conn.check_alive() {
                conn.reset_missed_heartbeats();
                continue;
            }

            let missed = conn.record_missed_heartbeat();
            if missed >= self.max_missed {
                let err = RealtimeError::Timeout {
                    kind: TimeoutKind::Heartbeat,
                    after: conn.last_heartbeat_elapsed(),
                };
                warn!(conn_id = %conn.id, session_id = %conn.session_id, missed, error = %err, "evicting silent connection");
                let _ = conn.send_message(&ServerMessage::error(TIMEOUT, err.to_string()));
                if self.table.deregister(&conn.id) {
                    counter!(HEARTBEAT_EVICTIONS_TOTAL).increment(1);
                    report.evicted += 1;
                }
                continue;
            }

            if conn.ping().is_ok() {
                report.pinged += 1;
            } else if self.table.deregister(&conn.id) {
                debug!(conn_id = %conn.id, "ping failed, connection dropped");
                report.evicted += 1;
            }
        }
        report.refreshed_sessions = self.table.refresh_presence();
        report
    }

    /// Sweep every interval until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        let _ = ticker.tick().await;
        info!(interval = ?self.interval, max_missed = self.max_missed, "heartbeat monitor started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep();
                    debug!(?report, "heartbeat sweep");
                }
            }
        }
        info!("heartbeat monitor stopped");
    }
}

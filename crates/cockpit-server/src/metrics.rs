//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Fails if another recorder
/// is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Live connections on this process (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Sessions with at least one live connection on this process (gauge).
pub const WS_SESSIONS_ACTIVE: &str = "ws_sessions_active";
/// Connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Registrations refused at the per-session limit (counter).
pub const WS_CAPACITY_REJECTIONS_TOTAL: &str = "ws_capacity_rejections_total";
/// Sends that failed and deregistered a connection (counter).
pub const WS_SEND_FAILURES_TOTAL: &str = "ws_send_failures_total";
/// Connections evicted for missing heartbeats (counter).
pub const HEARTBEAT_EVICTIONS_TOTAL: &str = "heartbeat_evictions_total";
/// Directory calls that failed (counter, labels: op).
pub const DIRECTORY_ERRORS_TOTAL: &str = "directory_errors_total";
/// Notifications persisted (counter).
pub const NOTIFICATIONS_CREATED_TOTAL: &str = "notifications_created_total";
/// Notifications that failed to persist (counter).
pub const NOTIFICATIONS_PERSIST_FAILURES_TOTAL: &str = "notifications_persist_failures_total";
/// Connections a notification reached on this process (counter).
pub const NOTIFICATIONS_DELIVERED_TOTAL: &str = "notifications_delivered_total";
/// Deliveries that fell back to local-only (counter).
pub const NOTIFICATIONS_DEGRADED_TOTAL: &str = "notifications_degraded_total";
/// Envelopes published to other processes (counter).
pub const RELAY_PUBLISHED_TOTAL: &str = "relay_published_total";
/// Envelopes that could not be published (counter).
pub const RELAY_FAILURES_TOTAL: &str = "relay_failures_total";
/// Envelopes received from other processes (counter).
pub const RELAY_RECEIVED_TOTAL: &str = "relay_received_total";
/// Streams opened (counter).
pub const STREAMS_STARTED_TOTAL: &str = "streams_started_total";
/// Streams that reached `end` (counter).
pub const STREAMS_COMPLETED_TOTAL: &str = "streams_completed_total";
/// Streams stopped by cancellation, disconnect, or backpressure (counter).
pub const STREAMS_CANCELLED_TOTAL: &str = "streams_cancelled_total";
/// Streams that ended with an `error` event (counter).
pub const STREAMS_ERRORED_TOTAL: &str = "streams_errored_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_SESSIONS_ACTIVE,
            WS_CONNECTION_DURATION_SECONDS,
            WS_CAPACITY_REJECTIONS_TOTAL,
            WS_SEND_FAILURES_TOTAL,
            HEARTBEAT_EVICTIONS_TOTAL,
            DIRECTORY_ERRORS_TOTAL,
            NOTIFICATIONS_CREATED_TOTAL,
            NOTIFICATIONS_PERSIST_FAILURES_TOTAL,
            NOTIFICATIONS_DELIVERED_TOTAL,
            NOTIFICATIONS_DEGRADED_TOTAL,
            RELAY_PUBLISHED_TOTAL,
            RELAY_FAILURES_TOTAL,
            RELAY_RECEIVED_TOTAL,
            STREAMS_STARTED_TOTAL,
            STREAMS_COMPLETED_TOTAL,
            STREAMS_CANCELLED_TOTAL,
            STREAMS_ERRORED_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}

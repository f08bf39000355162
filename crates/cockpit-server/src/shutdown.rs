//! Graceful shutdown: stop accepting, cancel in-flight streams, close live
//! connections, then give background tasks a bounded time to finish.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::stream::ActiveStreams;
use crate::websocket::ConnectionTable;

/// Live work cancelled by [`ShutdownCoordinator::drain`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Streams cancelled.
    pub streams: usize,
    /// Connections closed.
    pub connections: usize,
}

/// Default timeout for graceful shutdown before giving up on tasks.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Coordinates shutdown across the heartbeat, relay inbox, and HTTP tasks.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Trip the token, then cancel every in-flight stream and close every
    /// live connection.
    ///
    /// Streams go first so each open one can still queue its
    /// `STREAM_CANCELLED` notice before its connection closes.
    pub fn drain(&self, streams: &ActiveStreams, table: &ConnectionTable) -> DrainReport {
        self.shutdown();
        let report = DrainReport {
            streams: streams.cancel_all(),
            connections: table.close_all(),
        };
        info!(streams = report.streams, connections = report.connections, "live work cancelled");
        report
    }

    /// Cancel the token, then wait up to `timeout` for `handles` to finish.
    pub async fn graceful_shutdown(&self, handles: Vec<JoinHandle<()>>, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        self.shutdown();
        info!(
            task_count = handles.len(),
            timeout_secs = timeout.as_secs(),
            "waiting for tasks to complete"
        );

        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("shutdown timed out after {timeout:?}, some tasks may still be running");
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

//! Non-blocking directory updates.
//!
//! The connection table must never wait on the directory, so announce and
//! withdraw requests are recorded and applied by a single worker. Pending
//! updates are coalesced per session: only the latest request for a session
//! is kept, so a stalled directory holds at most one entry per live session
//! in memory. Each directory call is bounded by a deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cockpit_core::{SessionId, UserId};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::directory::SessionDirectory;
use crate::metrics::DIRECTORY_ERRORS_TOTAL;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PresenceOp {
    Announce,
    Withdraw,
}

impl PresenceOp {
    fn label(self) -> &'static str {
        match self {
            Self::Announce => "announce",
            Self::Withdraw => "withdraw",
        }
    }
}

type PendingOps = HashMap<(SessionId, UserId), PresenceOp>;

/// Handle for queueing directory updates.
#[derive(Clone, Debug)]
pub struct PresencePublisher {
    pending: Arc<Mutex<PendingOps>>,
    wake: mpsc::Sender<()>,
}

impl PresencePublisher {
    /// Start the worker applying updates for `process_address`, giving each
    /// directory call at most `timeout`.
    ///
    /// The worker exits once every publisher clone is dropped.
    pub fn spawn(
        directory: Arc<dyn SessionDirectory>,
        process_address: String,
        ttl: Duration,
        timeout: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (wake, mut woken) = mpsc::channel::<()>(1);
        let pending: Arc<Mutex<PendingOps>> = Arc::default();
        let queued = Arc::clone(&pending);
        let handle = tokio::spawn(async move {
            while woken.recv().await.is_some() {
                let batch = std::mem::take(&mut *queued.lock());
                for ((session_id, user_id), op) in batch {
                    apply(directory.as_ref(), &process_address, ttl, timeout, &session_id, &user_id, op).await;
                }
            }
        });
        (Self { pending, wake }, handle)
    }

    /// A publisher that discards every update.
    pub fn disabled() -> Self {
        let (wake, _woken) = mpsc::channel(1);
        Self {
            pending: Arc::default(),
            wake,
        }
    }

    /// Queue an announce (or TTL refresh).
    pub fn announce(&self, session_id: &SessionId, user_id: &UserId) {
        self.queue(session_id, user_id, PresenceOp::Announce);
    }

    /// Queue a withdraw.
    pub fn withdraw(&self, session_id: &SessionId, user_id: &UserId) {
        self.queue(session_id, user_id, PresenceOp::Withdraw);
    }

    /// Sessions with an update not yet handed to the directory.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    fn queue(&self, session_id: &SessionId, user_id: &UserId, op: PresenceOp) {
        if self.wake.is_closed() {
            return;
        }
        let _ = self
            .pending
            .lock()
            .insert((session_id.clone(), user_id.clone()), op);
        // A full channel means a wake-up is already pending.
        let _ = self.wake.try_send(());
    }
}

async fn apply(
    directory: &dyn SessionDirectory,
    process_address: &str,
    ttl: Duration,
    timeout: Duration,
    session_id: &SessionId,
    user_id: &UserId,
    op: PresenceOp,
) {
    let action = op.label();
    let call = async {
        match op {
            PresenceOp::Announce => directory.announce(session_id, user_id, process_address, ttl).await,
            PresenceOp::Withdraw => directory.withdraw(session_id, user_id, process_address).await,
        }
    };
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(())) => debug!(action, %session_id, "directory updated"),
        Ok(Err(e)) => {
            counter!(DIRECTORY_ERRORS_TOTAL, "op" => action).increment(1);
            warn!(action, %session_id, error = %e, "directory update failed");
        }
        Err(_) => {
            counter!(DIRECTORY_ERRORS_TOTAL, "op" => action).increment(1);
            warn!(action, %session_id, ?timeout, "directory update timed out");
        }
    }
}

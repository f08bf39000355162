//! Drains this process's relay inbox into the local connection table.

use std::sync::Arc;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{PeerRelay, RelayError};
use crate::metrics::RELAY_RECEIVED_TOTAL;
use crate::websocket::ConnectionTable;

/// Subscribe to the inbox for `process_address` and forward every envelope
/// to the target session's local connections.
///
/// Envelopes for sessions no longer held here are dropped. The task ends
/// when `cancel` fires or the relay closes the inbox.
pub async fn start_inbox(
    relay: Arc<dyn PeerRelay>,
    process_address: &str,
    table: Arc<ConnectionTable>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, RelayError> {
    let mut rx = relay.subscribe(process_address).await?;
    let address = process_address.to_owned();
    info!(process_address = %address, "relay inbox open");

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                envelope = rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    counter!(RELAY_RECEIVED_TOTAL).increment(1);
                    let delivered = table.send_text(&envelope.session_id, Arc::new(envelope.message));
                    debug!(
                        origin = %envelope.origin,
                        session_id = %envelope.session_id,
                        delivered,
                        "relayed message delivered"
                    );
                }
            }
        }
        info!(process_address = %address, "relay inbox closed");
    }))
}

//! Live connection lifecycle: one reader loop plus one writer task per
//! accepted socket, from upgrade through cleanup.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use cockpit_core::errors::INVALID_MESSAGE;
use cockpit_core::{ServerMessage, SessionId, UserId};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use super::connection::Outbound;
use super::handler::{SessionContext, handle_message};
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};
use crate::server::AppState;

/// How long the writer gets to flush queued frames after the reader stops.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Run one live connection.
///
/// 1. Registers with the connection table; a full session gets an error
///    message and a policy-violation close
/// 2. Sends `connected`
/// 3. Forwards queued frames to the socket in order
/// 4. Dispatches inbound frames, marking the connection alive on each
/// 5. Deregisters on disconnect, eviction, or shutdown
#[instrument(skip_all, fields(session_id = %session_id, user_id = %user_id))]
pub async fn run_ws_session(ws: WebSocket, session_id: SessionId, user_id: UserId, state: AppState) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let realtime = &state.config.realtime;

    let (send_tx, mut send_rx) = mpsc::channel::<Outbound>(realtime.send_queue_capacity);
    let connection = match state.table.register(session_id.clone(), user_id.clone(), send_tx) {
        Ok(connection) => connection,
        Err(e) => {
            info!(error = %e, "connection rejected");
            if let Ok(json) = serde_json::to_string(&ServerMessage::error(e.code(), e.to_string())) {
                let _ = ws_tx.send(Message::Text(json.into())).await;
            }
            let close = CloseFrame {
                code: close_code::POLICY,
                reason: "session connection limit reached".into(),
            };
            let _ = ws_tx.send(Message::Close(Some(close))).await;
            return;
        }
    };

    let connection_start = std::time::Instant::now();
    info!(conn_id = %connection.id, "client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let _ = connection.send_message(&ServerMessage::Connected {
        session_id: session_id.clone(),
        user_id: user_id.clone(),
        connected_at: connection.created_at.to_rfc3339(),
    });

    let closed = connection.close_token().clone();
    let mut writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                frame = send_rx.recv() => {
                    let message = match frame {
                        Some(Outbound::Text(text)) => Message::Text(text.as_str().into()),
                        Some(Outbound::Ping) => Message::Ping(Bytes::new()),
                        None => break,
                    };
                    if ws_tx.send(message).await.is_err() {
                        break;
                    }
                }
                () = closed.cancelled() => {
                    let close = CloseFrame {
                        code: close_code::AWAY,
                        reason: "connection closed".into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(close))).await;
                    break;
                }
            }
        }
    });

    let ctx = Arc::new(SessionContext {
        connection: Arc::clone(&connection),
        table: Arc::clone(&state.table),
        handler: Arc::clone(&state.handler),
        streams: Arc::clone(&state.streams),
        backpressure_timeout: realtime.stream_backpressure_timeout,
    });

    loop {
        let frame = tokio::select! {
            () = connection.close_token().cancelled() => {
                debug!(conn_id = %connection.id, "connection closed by server");
                break;
            }
            frame = ws_rx.next() => frame,
        };
        let Some(Ok(message)) = frame else { break };
        connection.mark_alive();

        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Binary(data) => {
                if let Ok(text) = std::str::from_utf8(&data) {
                    text.to_owned()
                } else {
                    let _ = connection.send_message(&ServerMessage::error(
                        INVALID_MESSAGE,
                        "binary frames must be UTF-8 JSON",
                    ));
                    continue;
                }
            }
            Message::Close(_) => {
                info!(conn_id = %connection.id, "client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        handle_message(&text, &ctx);
    }

    let _ = state.table.deregister(&connection.id);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }

    info!(conn_id = %connection.id, dropped = connection.drop_count(), "client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection_start.elapsed().as_secs_f64());
}

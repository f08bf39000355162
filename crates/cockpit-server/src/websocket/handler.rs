//! Inbound message dispatch for one live connection.

use std::sync::Arc;
use std::time::Duration;

use cockpit_core::errors::PROCESSING_ERROR;
use cockpit_core::{ClientMessage, ServerMessage, parse_client_message};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::connection::Connection;
use super::table::ConnectionTable;
use crate::handler::{SubmitHandler, SubmitResponse};
use crate::stream::{ActiveStreams, ConnectionSink, GenerationRequest, StreamEmitter};

/// Everything a connection's reader needs to act on client messages.
pub struct SessionContext {
    /// The connection messages arrive on.
    pub connection: Arc<Connection>,
    /// Table used for session-wide replies.
    pub table: Arc<ConnectionTable>,
    /// Domain logic.
    pub handler: Arc<dyn SubmitHandler>,
    /// In-flight streams.
    pub streams: Arc<ActiveStreams>,
    /// Per-event deadline for streams to this connection.
    pub backpressure_timeout: Duration,
}

/// Handle one inbound text frame.
///
/// `submit` work runs on its own task so the reader keeps draining frames,
/// which is what lets a later `cancel` reach a running stream.
#[instrument(skip_all, fields(conn_id = %ctx.connection.id, kind))]
pub fn handle_message(text: &str, ctx: &Arc<SessionContext>) {
    let message = match parse_client_message(text) {
        Ok(message) => message,
        Err(reply) => {
            warn!("rejected client message");
            let _ = ctx.connection.send_message(&reply);
            return;
        }
    };

    match message {
        ClientMessage::Ping => {
            let _ = tracing::Span::current().record("kind", "ping");
            let _ = ctx.connection.send_message(&ServerMessage::pong());
        }
        ClientMessage::Submit { payload } => {
            let _ = tracing::Span::current().record("kind", "submit");
            let ctx = Arc::clone(ctx);
            drop(tokio::spawn(async move { submit(&ctx, payload).await }));
        }
        ClientMessage::Cancel { stream_id } => {
            let _ = tracing::Span::current().record("kind", "cancel");
            let cancelled = ctx
                .streams
                .cancel_owned(&stream_id, &ctx.connection.session_id);
            debug!(%stream_id, cancelled, "cancel requested");
        }
    }
}

async fn submit(ctx: &SessionContext, payload: Value) {
    let connection = &ctx.connection;
    let request = GenerationRequest {
        session_id: connection.session_id.clone(),
        user_id: connection.user_id.clone(),
        payload,
    };

    match ctx.handler.handle(request).await {
        Ok(SubmitResponse::Reply(payload)) => {
            let delivered = ctx
                .table
                .send(&connection.session_id, &ServerMessage::Reply { payload });
            debug!(session_id = %connection.session_id, delivered, "reply sent");
        }
        Ok(SubmitResponse::Stream(source)) => {
            let (stream_id, token) = ctx
                .streams
                .begin(connection.session_id.clone(), Some(connection.close_token()));
            let sink = ConnectionSink::new(Arc::clone(connection), ctx.backpressure_timeout);
            let emitter =
                StreamEmitter::new(stream_id, sink, token).for_session(connection.session_id.clone());
            let _ = ctx.streams.spawn(emitter, source).await;
        }
        Err(e) => {
            warn!(error = %e, "submit handler failed");
            let _ = connection.send_message(&ServerMessage::error(PROCESSING_ERROR, e.to_string()));
        }
    }
}

//! `POST /chat/stream`: one response streamed as server-sent events.

use std::convert::Infallible;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use cockpit_core::errors::PROCESSING_ERROR;
use cockpit_core::{SessionId, StreamEvent, UserId};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::handler::SubmitResponse;
use crate::server::AppState;
use crate::stream::{ChannelSink, Fragment, FragmentStream, GenerationRequest, StreamEmitter, fragments};

/// Events buffered between the emitter and the response body.
const SSE_BUFFER: usize = 32;

/// Request body for `/chat/stream`.
#[derive(Debug, Deserialize)]
pub struct StreamRequest {
    /// Requesting session.
    pub session_id: SessionId,
    /// Requesting user.
    pub user_id: UserId,
    /// Handed to the submit handler unchanged.
    #[serde(default)]
    pub payload: Value,
}

/// Run the submit handler and stream its output as `data: <json>` records.
///
/// Dropping the response body (client disconnect) cancels the stream.
pub async fn chat_stream(State(state): State<AppState>, Json(request): Json<StreamRequest>) -> Response {
    let session_id = request.session_id.clone();
    let generation = GenerationRequest {
        session_id: request.session_id,
        user_id: request.user_id,
        payload: request.payload,
    };

    let source = match state.handler.handle(generation).await {
        Ok(SubmitResponse::Stream(source)) => source,
        Ok(SubmitResponse::Reply(reply)) => reply_fragments(reply),
        Err(e) => {
            warn!(%session_id, error = %e, "stream request rejected");
            let body = json!({ "code": PROCESSING_ERROR, "message": e.to_string() });
            return (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response();
        }
    };

    let shutdown = state.shutdown.token();
    let (stream_id, token) = state.streams.begin(session_id.clone(), Some(&shutdown));
    let (tx, rx) = mpsc::channel::<StreamEvent>(SSE_BUFFER);

    let watcher_tx = tx.clone();
    let watcher_token = token.clone();
    drop(tokio::spawn(async move {
        tokio::select! {
            () = watcher_tx.closed() => {
                debug!("sse client went away");
                watcher_token.cancel();
            }
            () = watcher_token.cancelled() => {}
        }
    }));

    let sink = ChannelSink::new(tx, state.config.realtime.stream_backpressure_timeout);
    let emitter = StreamEmitter::new(stream_id, sink, token).for_session(session_id);
    drop(state.streams.spawn(emitter, source));

    let body = ReceiverStream::new(rx).map(|event| {
        Ok::<_, Infallible>(
            Event::default()
                .json_data(&event)
                .unwrap_or_else(|_| Event::default().comment("unencodable event")),
        )
    });
    Sse::new(body).into_response()
}

fn reply_fragments(reply: Value) -> FragmentStream {
    let text = match reply.get("text").and_then(Value::as_str) {
        Some(text) => text.to_owned(),
        None => reply.to_string(),
    };
    fragments(vec![Fragment::Text(text)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_text_becomes_single_fragment() {
        let source = reply_fragments(json!({"text": "done"}));
        let collected: Vec<_> = futures::executor::block_on(source.collect());
        assert_eq!(collected, vec![Ok(Fragment::Text("done".into()))]);
    }

    #[test]
    fn non_text_reply_is_serialized() {
        let source = reply_fragments(json!({"n": 1}));
        let collected: Vec<_> = futures::executor::block_on(source.collect());
        assert_eq!(collected, vec![Ok(Fragment::Text(r#"{"n":1}"#.into()))]);
    }

    #[test]
    fn request_payload_defaults_to_null() {
        let req: StreamRequest = serde_json::from_str(r#"{"session_id":"s1","user_id":"u1"}"#).unwrap();
        assert!(req.payload.is_null());
    }
}

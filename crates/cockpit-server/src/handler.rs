//! Domain logic seam for client `submit` messages.

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;

use crate::stream::{ChunkedReplyGenerator, FragmentStream, GenerationRequest};

/// What a handler produced for one submit.
pub enum SubmitResponse {
    /// One complete reply, pushed to the session as a `reply` message.
    Reply(Value),
    /// Fragments to stream back to the requester.
    Stream(FragmentStream),
}

impl std::fmt::Debug for SubmitResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reply(v) => f.debug_tuple("Reply").field(v).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Handler failures, reported to the client as `PROCESSING_ERROR`.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload is not something this handler accepts.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Processing failed.
    #[error("{0}")]
    Failed(String),
}

/// Domain logic invoked for each `submit`.
#[async_trait]
pub trait SubmitHandler: Send + Sync {
    /// Handle one request.
    async fn handle(&self, request: GenerationRequest) -> Result<SubmitResponse, HandlerError>;
}

/// Echoes `payload.text` back, streamed when `payload.stream` is true.
#[derive(Clone, Debug, Default)]
pub struct EchoHandler {
    generator: ChunkedReplyGenerator,
}

impl EchoHandler {
    /// Echo handler streaming through `generator`.
    pub fn new(generator: ChunkedReplyGenerator) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl SubmitHandler for EchoHandler {
    async fn handle(&self, request: GenerationRequest) -> Result<SubmitResponse, HandlerError> {
        let text = request
            .payload
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::InvalidRequest("payload.text must be a string".into()))?;
        let stream = request
            .payload
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if stream {
            Ok(SubmitResponse::Stream(self.generator.generate(text)))
        } else {
            Ok(SubmitResponse::Reply(json!({ "text": text })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Fragment;
    use assert_matches::assert_matches;
    use cockpit_core::{SessionId, UserId};
    use futures::StreamExt;
    use std::time::Duration;

    fn request(payload: Value) -> GenerationRequest {
        GenerationRequest {
            session_id: SessionId::from_raw("s1"),
            user_id: UserId::from_raw("u1"),
            payload,
        }
    }

    #[tokio::test]
    async fn echo_replies() {
        let handler = EchoHandler::default();
        let response = handler.handle(request(json!({"text": "hi"}))).await.unwrap();
        assert_matches!(response, SubmitResponse::Reply(v) if v == json!({"text": "hi"}));
    }

    #[tokio::test]
    async fn echo_streams_when_asked() {
        let handler = EchoHandler::new(ChunkedReplyGenerator::new(Duration::ZERO));
        let response = handler
            .handle(request(json!({"text": "one two", "stream": true})))
            .await
            .unwrap();
        let SubmitResponse::Stream(source) = response else {
            panic!("expected stream");
        };
        let chunks: Vec<_> = source.collect().await;
        assert_eq!(
            chunks,
            vec![Ok(Fragment::Text("one ".into())), Ok(Fragment::Text("two".into()))]
        );
    }

    #[tokio::test]
    async fn echo_rejects_missing_text() {
        let handler = EchoHandler::default();
        let err = handler.handle(request(json!({"stream": true}))).await.unwrap_err();
        assert_matches!(err, HandlerError::InvalidRequest(_));
    }
}

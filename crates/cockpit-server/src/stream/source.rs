//! Upstream fragment sources.

use std::time::Duration;

use cockpit_core::{SessionId, UserId};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

/// One unit produced by a generator.
#[derive(Clone, Debug, PartialEq)]
pub enum Fragment {
    /// Generated text.
    Text(String),
    /// The generator called a tool.
    ToolInvocation {
        /// Tool name.
        tool: String,
        /// Arguments.
        parameters: Value,
    },
    /// A tool returned.
    ToolResult {
        /// Tool name.
        tool: String,
        /// Output.
        result: Value,
    },
}

/// Generator failure; ends the stream with an `error` event.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct GenerationError {
    /// Human-readable reason.
    pub message: String,
}

impl GenerationError {
    /// Wrap a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Boxed fragment source consumed by the emitter.
pub type FragmentStream = BoxStream<'static, Result<Fragment, GenerationError>>;

/// A request handed to domain logic.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationRequest {
    /// Requesting session.
    pub session_id: SessionId,
    /// Requesting user.
    pub user_id: UserId,
    /// Opaque request body.
    pub payload: Value,
}

/// Streams an already-complete reply word by word.
///
/// Fallback for generators that cannot stream natively. Each chunk after the
/// first waits `delay`, which gives cancellation a point to land between
/// fragments.
#[derive(Clone, Copy, Debug)]
pub struct ChunkedReplyGenerator {
    delay: Duration,
}

impl Default for ChunkedReplyGenerator {
    fn default() -> Self {
        Self::new(Duration::from_millis(20))
    }
}

impl ChunkedReplyGenerator {
    /// Generator pausing `delay` between chunks.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Split `text` into chunks that concatenate back to `text`.
    pub fn chunks(text: &str) -> Vec<String> {
        text.split_inclusive(char::is_whitespace)
            .map(str::to_owned)
            .collect()
    }

    /// Stream `text` as [`Fragment::Text`] chunks.
    pub fn generate(&self, text: &str) -> FragmentStream {
        let chunks = Self::chunks(text);
        let delay = self.delay;
        async_stream::stream! {
            for (i, chunk) in chunks.into_iter().enumerate() {
                if i > 0 && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok::<_, GenerationError>(Fragment::Text(chunk));
            }
        }
        .boxed()
    }
}

/// A finished stream yielding `fragments` in order.
pub fn fragments(fragments: Vec<Fragment>) -> FragmentStream {
    futures::stream::iter(fragments.into_iter().map(Ok)).boxed()
}

//! Streaming response state machine.
//!
//! ```text
//! Idle ─start→ Started ─fragment/tool→ Emitting ─end→ Ended
//!                 │                       │
//!                 └──────fail─────────────┴→ Errored
//! any non-terminal state ─cancel / sink failure→ Cancelled
//! ```
//!
//! Every emission first checks the cancellation token, so once the token
//! fires no further fragment is produced.

use std::fmt;
use std::time::Duration;

use cockpit_core::errors::STREAM_CANCELLED;
use cockpit_core::{SessionId, StreamEvent, StreamEventKind, StreamId};
use futures::StreamExt;
use metrics::counter;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::sink::{SinkError, StreamSink};
use super::source::{Fragment, FragmentStream};
use crate::metrics::{
    STREAMS_CANCELLED_TOTAL, STREAMS_COMPLETED_TOTAL, STREAMS_ERRORED_TOTAL, STREAMS_STARTED_TOTAL,
};

/// Emitter lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmitterState {
    /// Nothing emitted yet.
    Idle,
    /// `start` emitted.
    Started,
    /// At least one content event emitted.
    Emitting,
    /// `end` emitted.
    Ended,
    /// Terminal `error` emitted.
    Errored,
    /// Stopped by cancellation or a lost destination.
    Cancelled,
}

impl EmitterState {
    /// Whether no further events may be emitted.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Errored | Self::Cancelled)
    }

    fn is_open(self) -> bool {
        matches!(self, Self::Started | Self::Emitting)
    }
}

impl fmt::Display for EmitterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Started => "started",
            Self::Emitting => "emitting",
            Self::Ended => "ended",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Emitter failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    /// The cancellation token fired.
    #[error("stream {0} cancelled")]
    Cancelled(StreamId),
    /// The destination went away.
    #[error("stream destination disconnected")]
    Disconnected,
    /// The destination stalled past the backpressure timeout.
    #[error("stream destination stalled for {0:?}")]
    Backpressure(Duration),
    /// The operation is not allowed in the current state.
    #[error("cannot {op} a stream in state {state}")]
    InvalidState {
        /// Attempted operation.
        op: &'static str,
        /// State at the time.
        state: EmitterState,
    },
}

impl StreamError {
    /// Wire code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Cancelled(_) | Self::Disconnected => STREAM_CANCELLED,
            Self::Backpressure(_) => cockpit_core::errors::TIMEOUT,
            Self::InvalidState { .. } => cockpit_core::errors::PROCESSING_ERROR,
        }
    }
}

/// How a driven stream finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    /// `end` was emitted.
    Completed,
    /// The source failed and `error` was emitted.
    Failed,
    /// Cancelled, disconnected or stalled.
    Cancelled,
}

/// Emits one stream's events, in order, to one destination.
pub struct StreamEmitter<S> {
    stream_id: StreamId,
    session_id: Option<SessionId>,
    sink: S,
    token: CancellationToken,
    state: EmitterState,
    next_sequence: u64,
    fragment_count: u64,
    started_at: Instant,
}

impl<S: StreamSink> StreamEmitter<S> {
    /// Emitter for `stream_id` writing to `sink`, stopped by `token`.
    pub fn new(stream_id: StreamId, sink: S, token: CancellationToken) -> Self {
        Self {
            stream_id,
            session_id: None,
            sink,
            token,
            state: EmitterState::Idle,
            next_sequence: 0,
            fragment_count: 0,
            started_at: Instant::now(),
        }
    }

    /// Tag the `start` event with the owning session.
    #[must_use]
    pub fn for_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Stream ID.
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Current state.
    pub fn state(&self) -> EmitterState {
        self.state
    }

    /// Sequence number the next event will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Cancellation token for this stream.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Consume the emitter, returning its sink.
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Emit `start` (sequence 0).
    pub async fn start(&mut self) -> Result<(), StreamError> {
        if self.state != EmitterState::Idle {
            return Err(self.invalid("start"));
        }
        self.started_at = Instant::now();
        let kind = StreamEventKind::Start {
            session_id: self.session_id.clone(),
        };
        self.emit(kind).await?;
        self.state = EmitterState::Started;
        Ok(())
    }

    /// Emit a text `fragment`.
    pub async fn fragment(&mut self, content: impl Into<String>) -> Result<(), StreamError> {
        self.content("fragment", StreamEventKind::Fragment {
            content: content.into(),
        })
        .await?;
        self.fragment_count += 1;
        Ok(())
    }

    /// Emit `tool-invocation`.
    pub async fn tool_invocation(&mut self, tool: impl Into<String>, parameters: Value) -> Result<(), StreamError> {
        self.content("tool_invocation", StreamEventKind::ToolInvocation {
            tool: tool.into(),
            parameters,
        })
        .await
    }

    /// Emit `tool-result`.
    pub async fn tool_result(&mut self, tool: impl Into<String>, result: Value) -> Result<(), StreamError> {
        self.content("tool_result", StreamEventKind::ToolResult {
            tool: tool.into(),
            result,
        })
        .await
    }

    /// Emit the terminal `end` event.
    ///
    /// The summary carries `fragment_count` and `elapsed_ms`; fields of an
    /// `extra` object are merged in and win on conflict.
    pub async fn end(&mut self, extra: Value) -> Result<(), StreamError> {
        if !self.state.is_open() {
            return Err(self.invalid("end"));
        }
        let elapsed_ms = u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        let mut summary = Map::new();
        let _ = summary.insert("fragment_count".into(), json!(self.fragment_count));
        let _ = summary.insert("elapsed_ms".into(), json!(elapsed_ms));
        match extra {
            Value::Object(fields) => summary.extend(fields),
            Value::Null => {}
            other => {
                let _ = summary.insert("metadata".into(), other);
            }
        }
        self.emit(StreamEventKind::End {
            summary: Value::Object(summary),
        })
        .await?;
        self.state = EmitterState::Ended;
        debug!(stream_id = %self.stream_id, fragments = self.fragment_count, elapsed_ms, "stream ended");
        Ok(())
    }

    /// Emit the terminal `error` event.
    pub async fn fail(&mut self, code: impl Into<String>, message: impl Into<String>) -> Result<(), StreamError> {
        if !self.state.is_open() {
            return Err(self.invalid("fail"));
        }
        self.emit(StreamEventKind::Error {
            code: code.into(),
            message: message.into(),
        })
        .await?;
        self.state = EmitterState::Errored;
        Ok(())
    }

    /// Stop the stream.
    ///
    /// Idempotent. An open stream gets one best-effort `STREAM_CANCELLED`
    /// error event; delivery failures of that notice are ignored.
    pub async fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        let notify = self.state.is_open();
        self.state = EmitterState::Cancelled;
        self.token.cancel();
        if notify {
            let event = StreamEvent {
                stream_id: self.stream_id.clone(),
                sequence: self.next_sequence,
                kind: StreamEventKind::Error {
                    code: STREAM_CANCELLED.into(),
                    message: "stream cancelled".into(),
                },
            };
            if self.sink.push(&event).await.is_ok() {
                self.next_sequence += 1;
            }
        }
        debug!(stream_id = %self.stream_id, sequence = self.next_sequence, "stream cancelled");
    }

    async fn content(&mut self, op: &'static str, kind: StreamEventKind) -> Result<(), StreamError> {
        if !self.state.is_open() {
            return Err(self.invalid(op));
        }
        self.emit(kind).await?;
        self.state = EmitterState::Emitting;
        Ok(())
    }

    async fn emit(&mut self, kind: StreamEventKind) -> Result<(), StreamError> {
        if self.token.is_cancelled() {
            self.cancel().await;
            return Err(StreamError::Cancelled(self.stream_id.clone()));
        }
        let event = StreamEvent {
            stream_id: self.stream_id.clone(),
            sequence: self.next_sequence,
            kind,
        };
        match self.sink.push(&event).await {
            Ok(()) => {
                self.next_sequence += 1;
                Ok(())
            }
            Err(e) => {
                warn!(stream_id = %self.stream_id, sequence = event.sequence, error = %e, "stream destination lost");
                self.state = EmitterState::Cancelled;
                self.token.cancel();
                Err(match e {
                    SinkError::Closed => StreamError::Disconnected,
                    SinkError::Timeout(after) => StreamError::Backpressure(after),
                })
            }
        }
    }

    fn invalid(&self, op: &'static str) -> StreamError {
        StreamError::InvalidState {
            op,
            state: self.state,
        }
    }
}

/// Run `source` through `emitter`: `start`, one event per fragment, then
/// `end`, or `error` if the source fails.
///
/// The token is raced against the source, so a cancellation lands even while
/// the source is waiting on upstream.
pub async fn drive<S: StreamSink>(mut emitter: StreamEmitter<S>, mut source: FragmentStream) -> StreamOutcome {
    counter!(STREAMS_STARTED_TOTAL).increment(1);
    let token = emitter.token().clone();
    let outcome = run(&mut emitter, &mut source, &token).await;
    match outcome {
        StreamOutcome::Completed => counter!(STREAMS_COMPLETED_TOTAL).increment(1),
        StreamOutcome::Failed => counter!(STREAMS_ERRORED_TOTAL).increment(1),
        StreamOutcome::Cancelled => counter!(STREAMS_CANCELLED_TOTAL).increment(1),
    }
    outcome
}

async fn run<S: StreamSink>(
    emitter: &mut StreamEmitter<S>,
    source: &mut FragmentStream,
    token: &CancellationToken,
) -> StreamOutcome {
    if emitter.start().await.is_err() {
        return StreamOutcome::Cancelled;
    }
    loop {
        let next = tokio::select! {
            biased;
            () = token.cancelled() => None,
            next = source.next() => Some(next),
        };
        let Some(next) = next else {
            emitter.cancel().await;
            return StreamOutcome::Cancelled;
        };
        let result = match next {
            Some(Ok(Fragment::Text(content))) => emitter.fragment(content).await,
            Some(Ok(Fragment::ToolInvocation { tool, parameters })) => {
                emitter.tool_invocation(tool, parameters).await
            }
            Some(Ok(Fragment::ToolResult { tool, result })) => emitter.tool_result(tool, result).await,
            Some(Err(e)) => {
                warn!(stream_id = %emitter.stream_id(), error = %e, "fragment source failed");
                return match emitter.fail(cockpit_core::errors::PROCESSING_ERROR, e.message).await {
                    Ok(()) => StreamOutcome::Failed,
                    Err(_) => StreamOutcome::Cancelled,
                };
            }
            None => {
                return match emitter.end(Value::Null).await {
                    Ok(()) => StreamOutcome::Completed,
                    Err(_) => StreamOutcome::Cancelled,
                };
            }
        };
        if result.is_err() {
            return StreamOutcome::Cancelled;
        }
    }
}

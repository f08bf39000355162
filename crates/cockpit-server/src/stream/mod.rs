//! Incremental response streaming.
//!
//! A [`StreamEmitter`] turns a [`FragmentStream`] into ordered
//! [`StreamEvent`](cockpit_core::StreamEvent)s and pushes them through a
//! [`StreamSink`]: a live connection or an SSE body.

mod emitter;
mod registry;
mod sink;
mod source;

pub use emitter::{EmitterState, StreamEmitter, StreamError, StreamOutcome, drive};
pub use registry::ActiveStreams;
pub use sink::{ChannelSink, ConnectionSink, SinkError, StreamSink};
pub use source::{ChunkedReplyGenerator, Fragment, FragmentStream, GenerationError, GenerationRequest, fragments};

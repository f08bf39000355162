//! In-flight streams, addressable by ID for client `cancel` requests.

use std::sync::Arc;

use cockpit_core::{SessionId, StreamId};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::emitter::{StreamEmitter, StreamOutcome, drive};
use super::sink::StreamSink;
use super::source::FragmentStream;

struct ActiveStream {
    session_id: SessionId,
    token: CancellationToken,
}

/// Registry of running streams on this process.
#[derive(Default)]
pub struct ActiveStreams {
    streams: DashMap<StreamId, ActiveStream>,
}

impl ActiveStreams {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a stream ID and its token.
    ///
    /// With a `parent`, the stream token is a child of it, so cancelling the
    /// parent (e.g. a connection's close token) cancels the stream.
    pub fn begin(&self, session_id: SessionId, parent: Option<&CancellationToken>) -> (StreamId, CancellationToken) {
        let stream_id = StreamId::new();
        let token = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
        let _ = self.streams.insert(
            stream_id.clone(),
            ActiveStream {
                session_id,
                token: token.clone(),
            },
        );
        (stream_id, token)
    }

    /// Cancel a stream regardless of owner. Returns `false` if unknown.
    pub fn cancel(&self, stream_id: &StreamId) -> bool {
        match self.streams.get(stream_id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel a stream only if `session_id` owns it.
    pub fn cancel_owned(&self, stream_id: &StreamId, session_id: &SessionId) -> bool {
        match self.streams.get(stream_id) {
            Some(entry) if entry.session_id == *session_id => {
                entry.token.cancel();
                debug!(%stream_id, %session_id, "stream cancelled by client");
                true
            }
            _ => false,
        }
    }

    /// Forget a finished stream and release anything waiting on its token.
    pub fn finish(&self, stream_id: &StreamId) {
        if let Some((_, stream)) = self.streams.remove(stream_id) {
            stream.token.cancel();
        }
    }

    /// Cancel every stream.
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for entry in &self.streams {
            entry.token.cancel();
            count += 1;
        }
        count
    }

    /// Running streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether no stream is running.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Drive `source` through `emitter` on a new task, forgetting the stream
    /// once it finishes.
    pub fn spawn<S>(self: &Arc<Self>, emitter: StreamEmitter<S>, source: FragmentStream) -> JoinHandle<StreamOutcome>
    where
        S: StreamSink + 'static,
    {
        let streams = Arc::clone(self);
        tokio::spawn(async move {
            let stream_id = emitter.stream_id().clone();
            let outcome = drive(emitter, source).await;
            streams.finish(&stream_id);
            debug!(%stream_id, ?outcome, "stream finished");
            outcome
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::sink::testing::RecordingSink;
    use crate::stream::source::{Fragment, fragments};

    fn sid(s: &str) -> SessionId {
        SessionId::from_raw(s)
    }

    #[test]
    fn begin_registers_stream() {
        let streams = ActiveStreams::new();
        let (id, token) = streams.begin(sid("s1"), None);
        assert!(id.as_str().starts_with("stream_"));
        assert_eq!(streams.len(), 1);
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_owned_checks_session() {
        let streams = ActiveStreams::new();
        let (id, token) = streams.begin(sid("s1"), None);
        assert!(!streams.cancel_owned(&id, &sid("s2")));
        assert!(!token.is_cancelled());
        assert!(streams.cancel_owned(&id, &sid("s1")));
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_unknown_stream() {
        let streams = ActiveStreams::new();
        assert!(!streams.cancel(&StreamId::from_raw("nope")));
    }

    #[test]
    fn parent_cancellation_propagates() {
        let streams = ActiveStreams::new();
        let parent = CancellationToken::new();
        let (_id, token) = streams.begin(sid("s1"), Some(&parent));
        parent.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn finish_removes_and_releases() {
        let streams = ActiveStreams::new();
        let (id, token) = streams.begin(sid("s1"), None);
        streams.finish(&id);
        assert!(streams.is_empty());
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_all_counts() {
        let streams = ActiveStreams::new();
        let (_a, ta) = streams.begin(sid("s1"), None);
        let (_b, tb) = streams.begin(sid("s2"), None);
        assert_eq!(streams.cancel_all(), 2);
        assert!(ta.is_cancelled() && tb.is_cancelled());
    }

    #[tokio::test]
    async fn spawned_stream_is_forgotten_when_done() {
        let streams = Arc::new(ActiveStreams::new());
        let (id, token) = streams.begin(sid("s1"), None);
        let emitter = StreamEmitter::new(id, RecordingSink::default(), token);
        let outcome = streams
            .spawn(emitter, fragments(vec![Fragment::Text("hi".into())]))
            .await
            .unwrap();
        assert_eq!(outcome, StreamOutcome::Completed);
        assert!(streams.is_empty());
    }
}

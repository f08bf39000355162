//! Stream destinations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cockpit_core::{ServerMessage, StreamEvent};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::warn;

use crate::websocket::{Connection, SendFailure};

/// Why a destination refused an event.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    /// The destination is gone.
    #[error("stream destination closed")]
    Closed,
    /// The destination did not take the event in time.
    #[error("stream destination stalled for {0:?}")]
    Timeout(Duration),
}

/// Where stream events go.
#[async_trait]
pub trait StreamSink: Send {
    /// Deliver one event, waiting at most the sink's backpressure timeout.
    async fn push(&mut self, event: &StreamEvent) -> Result<(), SinkError>;
}

/// Delivers events to one live connection as `stream` messages.
///
/// A stalled connection is closed: a client that cannot keep up with a
/// stream is treated as disconnected.
pub struct ConnectionSink {
    connection: Arc<Connection>,
    timeout: Duration,
}

impl ConnectionSink {
    /// Sink writing to `connection`.
    pub fn new(connection: Arc<Connection>, timeout: Duration) -> Self {
        Self { connection, timeout }
    }
}

#[async_trait]
impl StreamSink for ConnectionSink {
    async fn push(&mut self, event: &StreamEvent) -> Result<(), SinkError> {
        let message = ServerMessage::Stream {
            event: event.clone(),
        };
        let json = serde_json::to_string(&message).map_err(|e| {
            warn!(stream_id = %event.stream_id, error = %e, "failed to encode stream event");
            SinkError::Closed
        })?;
        match self
            .connection
            .send_text_timeout(Arc::new(json), self.timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendFailure::Timeout(after)) => {
                warn!(
                    conn_id = %self.connection.id,
                    stream_id = %event.stream_id,
                    ?after,
                    "stream backpressure timeout, closing connection"
                );
                self.connection.close();
                Err(SinkError::Timeout(after))
            }
            Err(_) => Err(SinkError::Closed),
        }
    }
}

/// Delivers events into a channel, e.g. one feeding an SSE body.
pub struct ChannelSink {
    tx: mpsc::Sender<StreamEvent>,
    timeout: Duration,
}

impl ChannelSink {
    /// Sink writing to `tx`.
    pub fn new(tx: mpsc::Sender<StreamEvent>, timeout: Duration) -> Self {
        Self { tx, timeout }
    }
}

#[async_trait]
impl StreamSink for ChannelSink {
    async fn push(&mut self, event: &StreamEvent) -> Result<(), SinkError> {
        self.tx
            .send_timeout(event.clone(), self.timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => SinkError::Timeout(self.timeout),
                SendTimeoutError::Closed(_) => SinkError::Closed,
            })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::Outbound;
    use assert_matches::assert_matches;
    use cockpit_core::{SessionId, StreamEventKind, StreamId, UserId};

    fn event(sequence: u64) -> StreamEvent {
        StreamEvent {
            stream_id: StreamId::from_raw("stream-1"),
            sequence,
            kind: StreamEventKind::Fragment {
                content: "hi".into(),
            },
        }
    }

    #[tokio::test]
    async fn connection_sink_wraps_in_stream_message() {
        let (tx, mut rx) = mpsc::channel(4);
        let conn = Arc::new(Connection::new(SessionId::from_raw("s1"), UserId::from_raw("u1"), tx));
        let mut sink = ConnectionSink::new(conn, Duration::from_secs(1));
        sink.push(&event(0)).await.unwrap();

        let Some(Outbound::Text(text)) = rx.recv().await else {
            panic!("expected text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "stream");
        assert_eq!(value["event"]["type"], "fragment");
        assert_eq!(value["event"]["sequence"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_connection_is_closed() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Arc::new(Connection::new(SessionId::from_raw("s1"), UserId::from_raw("u1"), tx));
        let mut sink = ConnectionSink::new(conn.clone(), Duration::from_millis(100));
        sink.push(&event(0)).await.unwrap();

        let err = sink.push(&event(1)).await.unwrap_err();
        assert_eq!(err, SinkError::Timeout(Duration::from_millis(100)));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn closed_connection_reports_closed() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let conn = Arc::new(Connection::new(SessionId::from_raw("s1"), UserId::from_raw("u1"), tx));
        let mut sink = ConnectionSink::new(conn, Duration::from_secs(1));
        assert_matches!(sink.push(&event(0)).await, Err(SinkError::Closed));
    }

    #[tokio::test]
    async fn channel_sink_delivers() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut sink = ChannelSink::new(tx, Duration::from_secs(1));
        sink.push(&event(0)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), event(0));
    }

    #[tokio::test(start_paused = true)]
    async fn channel_sink_times_out() {
        let (tx, _rx) = mpsc::channel(1);
        let mut sink = ChannelSink::new(tx, Duration::from_millis(50));
        sink.push(&event(0)).await.unwrap();
        assert_matches!(sink.push(&event(1)).await, Err(SinkError::Timeout(_)));
    }

    #[tokio::test]
    async fn channel_sink_reports_closed_receiver() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut sink = ChannelSink::new(tx, Duration::from_secs(1));
        assert_matches!(sink.push(&event(0)).await, Err(SinkError::Closed));
    }
}

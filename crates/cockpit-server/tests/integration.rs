//! End-to-end tests against servers bound to port 0, using real WebSocket
//! and HTTP clients.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use proptest::prelude::*;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use cockpit_core::{SessionId, StreamEvent, StreamId, UserId};
use cockpit_server::directory::{InMemoryDirectory, SessionDirectory};
use cockpit_server::handler::{HandlerError, SubmitHandler, SubmitResponse};
use cockpit_server::relay::InMemoryRelay;
use cockpit_server::stream::{
    ChannelSink, ChunkedReplyGenerator, Fragment, FragmentStream, GenerationRequest, StreamEmitter, StreamOutcome,
    drive,
};
use cockpit_server::{CockpitServer, EchoHandler, RealtimeConfig, ServerConfig, ServerDeps, ServerHandle};
use cockpit_store::{NewNotification, NotificationQuery, NotificationStore, SqliteNotificationStore};
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ── Fixtures ──

/// Streams one fragment, then waits forever.
struct StallingHandler;

#[async_trait]
impl SubmitHandler for StallingHandler {
    async fn handle(&self, _request: GenerationRequest) -> Result<SubmitResponse, HandlerError> {
        let source: FragmentStream = futures::stream::iter(vec![Ok(Fragment::Text("first".into()))])
            .chain(futures::stream::pending())
            .boxed();
        Ok(SubmitResponse::Stream(source))
    }
}

struct Cluster {
    directory: Arc<InMemoryDirectory>,
    relay: Arc<InMemoryRelay>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            directory: Arc::new(InMemoryDirectory::new()),
            relay: Arc::new(InMemoryRelay::new()),
        }
    }
}

fn config(process_address: &str) -> ServerConfig {
    ServerConfig {
        process_address: process_address.into(),
        realtime: RealtimeConfig {
            max_connections_per_session: 2,
            ..RealtimeConfig::default()
        },
        ..ServerConfig::default()
    }
}

async fn boot(
    cluster: &Cluster,
    process_address: &str,
    handler: Arc<dyn SubmitHandler>,
) -> ServerHandle {
    let store = Arc::new(SqliteNotificationStore::in_memory().unwrap());
    let deps = ServerDeps {
        store,
        directory: cluster.directory.clone(),
        relay: cluster.relay.clone(),
        handler,
        metrics: None,
    };
    let server = CockpitServer::start(config(process_address), deps).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    server.spawn(listener).unwrap()
}

async fn boot_single() -> ServerHandle {
    let handler = Arc::new(EchoHandler::new(ChunkedReplyGenerator::new(Duration::from_millis(1))));
    boot(&Cluster::new(), "proc-a", handler).await
}

async fn connect(handle: &ServerHandle, session: &str, user: &str) -> WsStream {
    let url = format!("ws://{}/ws/{session}?user_id={user}", handle.local_addr);
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

/// Connect and consume the `connected` message.
async fn join(handle: &ServerHandle, session: &str, user: &str) -> WsStream {
    let mut ws = connect(handle, session, user).await;
    let hello = next_json(&mut ws).await;
    assert_eq!(hello["type"], "connected");
    ws
}

async fn next_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ── Connection lifecycle ──

#[tokio::test]
async fn connected_message_identifies_session() {
    let handle = boot_single().await;
    let mut ws = connect(&handle, "sess-1", "u1").await;
    let hello = next_json(&mut ws).await;
    assert_eq!(hello["type"], "connected");
    assert_eq!(hello["session_id"], "sess-1");
    assert_eq!(hello["user_id"], "u1");
    assert!(hello["connected_at"].is_string());
    handle.shutdown().await;
}

#[tokio::test]
async fn send_counts_follow_connections() {
    let handle = boot_single().await;
    let mut first = join(&handle, "sess-1", "u1").await;
    let mut second = join(&handle, "sess-1", "u1").await;

    let session = SessionId::from_raw("sess-1");
    let delivered = handle.table().send(&session, &json!({"type": "reply", "payload": 1}));
    assert_eq!(delivered, 2);
    assert_eq!(next_json(&mut first).await["payload"], 1);
    assert_eq!(next_json(&mut second).await["payload"], 1);

    first.close(None).await.unwrap();
    let table = Arc::clone(handle.table());
    wait_until(|| table.session_connection_count(&session) == 1).await;

    assert_eq!(handle.table().send(&session, &json!({"type": "reply", "payload": 2})), 1);
    assert_eq!(next_json(&mut second).await["payload"], 2);
    handle.shutdown().await;
}

#[tokio::test]
async fn capacity_rejection_leaves_existing_connections() {
    let handle = boot_single().await;
    let mut a = join(&handle, "sess-1", "u1").await;
    let _b = join(&handle, "sess-1", "u1").await;

    let mut rejected = connect(&handle, "sess-1", "u1").await;
    let error = next_json(&mut rejected).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "CAPACITY_EXCEEDED");
    let close = timeout(TIMEOUT, rejected.next()).await.unwrap().unwrap().unwrap();
    let Message::Close(Some(frame)) = close else {
        panic!("expected close frame, got {close:?}");
    };
    assert_eq!(frame.code, CloseCode::Policy);

    assert_eq!(handle.table().session_connection_count(&SessionId::from_raw("sess-1")), 2);
    send_json(&mut a, json!({"type": "ping"})).await;
    assert_eq!(next_json(&mut a).await["type"], "pong");
    handle.shutdown().await;
}

#[tokio::test]
async fn client_ping_gets_pong() {
    let handle = boot_single().await;
    let mut ws = join(&handle, "sess-1", "u1").await;
    send_json(&mut ws, json!({"type": "ping"})).await;
    let pong = next_json(&mut ws).await;
    assert_eq!(pong["type"], "pong");
    assert!(pong["timestamp"].is_string());
    handle.shutdown().await;
}

#[tokio::test]
async fn malformed_frames_get_error_messages() {
    let handle = boot_single().await;
    let mut ws = join(&handle, "sess-1", "u1").await;
    ws.send(Message::Text("{oops".into())).await.unwrap();
    assert_eq!(next_json(&mut ws).await["code"], "INVALID_MESSAGE");
    send_json(&mut ws, json!({"type": "teleport"})).await;
    assert_eq!(next_json(&mut ws).await["code"], "UNKNOWN_MESSAGE_TYPE");
    handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_live_connections() {
    let handle = boot_single().await;
    let mut ws = join(&handle, "sess-1", "u1").await;
    handle.shutdown().await;

    let ended = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok());
}

// ── Streaming ──

#[tokio::test]
async fn submitted_stream_is_ordered_and_terminated() {
    let handle = boot_single().await;
    let mut ws = join(&handle, "sess-1", "u1").await;
    send_json(&mut ws, json!({"type": "submit", "payload": {"text": "one two three", "stream": true}})).await;

    let mut events = Vec::new();
    loop {
        let msg = next_json(&mut ws).await;
        assert_eq!(msg["type"], "stream");
        let event: StreamEvent = serde_json::from_value(msg["event"].clone()).unwrap();
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }

    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (0..events.len() as u64).collect::<Vec<_>>());
    let tags: Vec<&str> = events.iter().map(|e| e.kind.tag()).collect();
    assert_eq!(tags, vec!["start", "fragment", "fragment", "fragment", "end"]);
    handle.shutdown().await;
}

#[tokio::test]
async fn cancel_stops_stream_after_current_fragment() {
    let handle = boot(&Cluster::new(), "proc-a", Arc::new(StallingHandler)).await;
    let mut ws = join(&handle, "sess-1", "u1").await;
    send_json(&mut ws, json!({"type": "submit", "payload": {}})).await;

    let start = next_json(&mut ws).await;
    assert_eq!(start["event"]["type"], "start");
    let stream_id = start["event"]["stream_id"].as_str().unwrap().to_owned();
    let fragment = next_json(&mut ws).await;
    assert_eq!(fragment["event"]["type"], "fragment");
    assert_eq!(fragment["event"]["sequence"], 1);

    send_json(&mut ws, json!({"type": "cancel", "stream_id": stream_id})).await;
    let notice = next_json(&mut ws).await;
    assert_eq!(notice["event"]["type"], "error");
    assert_eq!(notice["event"]["code"], "STREAM_CANCELLED");
    assert_eq!(notice["event"]["sequence"], 2);

    send_json(&mut ws, json!({"type": "ping"})).await;
    assert_eq!(next_json(&mut ws).await["type"], "pong");
    handle.shutdown().await;
}

#[tokio::test]
async fn disconnect_cancels_running_stream() {
    let handle = boot(&Cluster::new(), "proc-a", Arc::new(StallingHandler)).await;
    let mut ws = join(&handle, "sess-1", "u1").await;
    send_json(&mut ws, json!({"type": "submit", "payload": {}})).await;
    let _start = next_json(&mut ws).await;
    let _fragment = next_json(&mut ws).await;
    assert_eq!(handle.state().streams.len(), 1);

    drop(ws);
    let streams = Arc::clone(&handle.state().streams);
    wait_until(|| streams.is_empty()).await;
    handle.shutdown().await;
}

#[tokio::test]
async fn sse_stream_emits_data_records() {
    let handle = boot_single().await;
    let url = format!("http://{}/chat/stream", handle.local_addr);
    let body = reqwest::Client::new()
        .post(url)
        .json(&json!({
            "session_id": "sess-1",
            "user_id": "u1",
            "payload": {"text": "alpha beta", "stream": true}
        }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let events: Vec<StreamEvent> = body
        .split("\n\n")
        .filter_map(|record| record.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();
    let tags: Vec<&str> = events.iter().map(|e| e.kind.tag()).collect();
    assert_eq!(tags, vec!["start", "fragment", "fragment", "end"]);
    assert!(events.windows(2).all(|w| w[1].sequence == w[0].sequence + 1));
    handle.shutdown().await;
}

// ── Notifications ──

#[tokio::test]
async fn notify_without_connections_persists_unread() {
    let handle = boot_single().await;
    let user = UserId::from_raw("u1");
    let store = Arc::clone(handle.dispatcher().store());
    let before = store.unread_count(&user).await.unwrap();

    let record = handle
        .dispatcher()
        .notify(NewNotification::new(user.clone(), "task", "Due soon", "Quarterly report"))
        .await
        .unwrap();

    assert!(!record.id.as_str().is_empty());
    assert_eq!(store.unread_count(&user).await.unwrap(), before + 1);
    let page = store.list(&user, NotificationQuery::unread()).await.unwrap();
    assert_eq!(page.notifications[0].id, record.id);
    handle.shutdown().await;
}

#[tokio::test]
async fn notify_reaches_local_connections() {
    let handle = boot_single().await;
    let mut ws = join(&handle, "sess-1", "u1").await;
    let record = handle
        .dispatcher()
        .notify(NewNotification::new(UserId::from_raw("u1"), "calendar", "Standup", "in 5 minutes"))
        .await
        .unwrap();

    let msg = next_json(&mut ws).await;
    assert_eq!(msg["type"], "notification");
    assert_eq!(msg["payload"]["id"], record.id.as_str());
    assert_eq!(msg["payload"]["title"], "Standup");
    handle.shutdown().await;
}

#[tokio::test]
async fn notify_crosses_processes_through_relay() {
    let cluster = Cluster::new();
    let echo: Arc<dyn SubmitHandler> = Arc::new(EchoHandler::default());
    let proc_a = boot(&cluster, "proc-a", Arc::clone(&echo)).await;
    let proc_b = boot(&cluster, "proc-b", echo).await;

    let mut ws = join(&proc_b, "sess-remote", "u1").await;
    let user = UserId::from_raw("u1");
    timeout(TIMEOUT, async {
        loop {
            let entries = cluster.directory.lookup(&user).await.unwrap();
            if entries.iter().any(|e| e.process_address == "proc-b") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let (record, report) = proc_a
        .dispatcher()
        .notify_with_report(NewNotification::new(user.clone(), "email", "New mail", "from Dana"))
        .await
        .unwrap();
    assert_eq!(report.local_connections, 0);
    assert_eq!(report.remote_published, 1);

    let msg = next_json(&mut ws).await;
    assert_eq!(msg["type"], "notification");
    assert_eq!(msg["payload"]["id"], record.id.as_str());

    proc_a.shutdown().await;
    proc_b.shutdown().await;
}

#[tokio::test]
async fn disconnect_withdraws_directory_entry() {
    let cluster = Cluster::new();
    let handle = boot(&cluster, "proc-a", Arc::new(EchoHandler::default())).await;
    let user = UserId::from_raw("u1");

    let mut ws = join(&handle, "sess-1", "u1").await;
    ws.close(None).await.unwrap();

    timeout(TIMEOUT, async {
        loop {
            let table_empty = handle.table().connection_count() == 0;
            if table_empty && cluster.directory.lookup(&user).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    handle.shutdown().await;
}

// ── Sequence invariant ──

fn fragment_strategy() -> impl Strategy<Value = Fragment> {
    prop_oneof![
        "[a-z ]{0,8}".prop_map(Fragment::Text),
        "[a-z]{1,6}".prop_map(|tool| Fragment::ToolInvocation {
            tool,
            parameters: json!({}),
        }),
        "[a-z]{1,6}".prop_map(|tool| Fragment::ToolResult {
            tool,
            result: json!(null),
        }),
    ]
}

proptest! {
    #[test]
    fn sequences_are_gap_free(
        fragments in prop::collection::vec(fragment_strategy(), 0..20),
        cancel_at in prop::option::of(0usize..20),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let events = runtime.block_on(async {
            let (tx, mut rx) = tokio::sync::mpsc::channel(64);
            let token = CancellationToken::new();
            let emitter = StreamEmitter::new(
                StreamId::new(),
                ChannelSink::new(tx, Duration::from_secs(1)),
                token.clone(),
            );
            let limit = cancel_at.unwrap_or(usize::MAX);
            let source_token = token.clone();
            let source = futures::stream::iter(fragments.clone().into_iter().enumerate())
                .map(move |(i, fragment)| {
                    if i == limit {
                        source_token.cancel();
                    }
                    Ok(fragment)
                })
                .boxed();
            let outcome = drive(emitter, source).await;
            let mut events = Vec::new();
            while let Ok(event) = rx.try_recv() {
                events.push(event);
            }
            (outcome, events)
        });
        let (outcome, events) = events;

        prop_assert!(!events.is_empty());
        prop_assert_eq!(events[0].kind.tag(), "start");
        for (i, event) in events.iter().enumerate() {
            prop_assert_eq!(event.sequence, i as u64);
        }
        let terminals = events.iter().filter(|e| e.is_terminal()).count();
        prop_assert_eq!(terminals, 1);
        prop_assert!(events.last().unwrap().is_terminal());

        let content = events.len() - 2;
        match outcome {
            StreamOutcome::Completed => prop_assert_eq!(content, fragments.len()),
            StreamOutcome::Cancelled => {
                let limit = cancel_at.unwrap();
                prop_assert!(content <= limit);
            }
            StreamOutcome::Failed => prop_assert!(false, "source never fails"),
        }
    }
}

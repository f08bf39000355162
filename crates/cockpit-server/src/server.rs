//! `CockpitServer`: axum HTTP, WebSocket and SSE server.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use cockpit_core::{SessionId, UserId};
use cockpit_store::NotificationStore;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::directory::{InMemoryDirectory, SessionDirectory};
use crate::handler::{EchoHandler, SubmitHandler};
use crate::health::{self, HealthResponse};
use crate::notify::NotificationDispatcher;
use crate::relay::{InMemoryRelay, PeerRelay, RelayError, start_inbox};
use crate::shutdown::ShutdownCoordinator;
use crate::sse;
use crate::stream::ActiveStreams;
use crate::websocket::{ConnectionTable, HeartbeatMonitor, PresencePublisher, run_ws_session};

/// How long shutdown waits for background tasks.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Live connections on this process.
    pub table: Arc<ConnectionTable>,
    /// Notification entry point.
    pub dispatcher: Arc<NotificationDispatcher>,
    /// In-flight streams.
    pub streams: Arc<ActiveStreams>,
    /// Domain logic for `submit`.
    pub handler: Arc<dyn SubmitHandler>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Prometheus handle for `/metrics`, if a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
}

/// External collaborators the server is built on.
pub struct ServerDeps {
    /// Durable notification storage.
    pub store: Arc<dyn NotificationStore>,
    /// Cross-process presence.
    pub directory: Arc<dyn SessionDirectory>,
    /// Cross-process inboxes.
    pub relay: Arc<dyn PeerRelay>,
    /// Domain logic for `submit`.
    pub handler: Arc<dyn SubmitHandler>,
    /// Prometheus handle, if a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

impl ServerDeps {
    /// Single-process deployment: in-memory directory and relay, echo
    /// handler, no metrics.
    pub fn single_process(store: Arc<dyn NotificationStore>) -> Self {
        Self {
            store,
            directory: Arc::new(InMemoryDirectory::new()),
            relay: Arc::new(InMemoryRelay::new()),
            handler: Arc::new(EchoHandler::default()),
            metrics: None,
        }
    }
}

/// The Cockpit real-time server.
pub struct CockpitServer {
    state: AppState,
    background: Vec<JoinHandle<()>>,
}

impl CockpitServer {
    /// Wire the connection table, presence worker, relay inbox, heartbeat
    /// monitor and dispatcher.
    ///
    /// Must be called inside a Tokio runtime. Fails if the relay inbox for
    /// this process cannot be opened.
    pub async fn start(config: ServerConfig, deps: ServerDeps) -> Result<Self, RelayError> {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let realtime = &config.realtime;

        let (presence, presence_worker) = PresencePublisher::spawn(
            Arc::clone(&deps.directory),
            config.process_address.clone(),
            realtime.directory_ttl,
            realtime.directory_timeout,
        );
        let table = Arc::new(ConnectionTable::new(realtime.max_connections_per_session, presence));

        let inbox = start_inbox(
            Arc::clone(&deps.relay),
            &config.process_address,
            Arc::clone(&table),
            shutdown.token(),
        )
        .await?;
        let heartbeat = tokio::spawn(HeartbeatMonitor::from_config(Arc::clone(&table), realtime).run(shutdown.token()));

        let dispatcher = Arc::new(NotificationDispatcher::new(
            deps.store,
            Arc::clone(&table),
            deps.directory,
            deps.relay,
            config.process_address.clone(),
        )
        .with_call_timeout(realtime.directory_timeout));

        info!(
            process_address = %config.process_address,
            max_connections_per_session = realtime.max_connections_per_session,
            heartbeat_interval = ?realtime.heartbeat_interval,
            "cockpit server initialised"
        );

        drop(presence_worker);

        Ok(Self {
            state: AppState {
                config: Arc::new(config),
                table,
                dispatcher,
                streams: Arc::new(ActiveStreams::new()),
                handler: deps.handler,
                shutdown,
                metrics: deps.metrics,
                start_time: Instant::now(),
            },
            background: vec![inbox, heartbeat],
        })
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws/{session_id}", get(ws_handler))
            .route("/chat/stream", post(sse::chat_stream))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Shared state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Connection table.
    pub fn table(&self) -> &Arc<ConnectionTable> {
        &self.state.table
    }

    /// Notification dispatcher.
    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.state.dispatcher
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Serve on `listener` in the background.
    pub fn spawn(self, listener: TcpListener) -> io::Result<ServerHandle> {
        let local_addr = listener.local_addr()?;
        let app = self.router();
        let token = self.state.shutdown.token();
        let join = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "http server failed");
            }
        });
        info!(%local_addr, "listening");
        Ok(ServerHandle {
            local_addr,
            state: self.state,
            join,
            background: self.background,
        })
    }
}

/// A running server.
pub struct ServerHandle {
    /// Bound address.
    pub local_addr: SocketAddr,
    state: AppState,
    join: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Shared state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Notification dispatcher.
    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.state.dispatcher
    }

    /// Connection table.
    pub fn table(&self) -> &Arc<ConnectionTable> {
        &self.state.table
    }

    /// Stop accepting, cancel streams, close connections and wait for
    /// background tasks.
    pub async fn shutdown(self) {
        info!("shutting down");
        let _ = self.state.shutdown.drain(&self.state.streams, &self.state.table);

        let mut handles = self.background;
        handles.push(self.join);
        self.state
            .shutdown
            .graceful_shutdown(handles, Some(SHUTDOWN_TIMEOUT))
            .await;
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.table.connection_count(),
        state.table.session_count(),
        state.streams.len(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    user_id: UserId,
}

/// GET /ws/{session_id}?user_id=…
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<SessionId>,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, session_id, query.user_id, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use cockpit_store::SqliteNotificationStore;
    use tower::ServiceExt;

    async fn make_server() -> CockpitServer {
        let store = Arc::new(SqliteNotificationStore::in_memory().unwrap());
        CockpitServer::start(ServerConfig::default(), ServerDeps::single_process(store))
            .await
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn server_with_default_config() {
        let server = make_server().await;
        assert_eq!(server.config().host, "127.0.0.1");
        assert_eq!(server.config().port, 0);
        assert_eq!(server.table().connection_count(), 0);
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server().await;
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let parsed = body_json(resp).await;
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 0);
        assert_eq!(parsed["active_sessions"], 0);
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_not_found() {
        let server = make_server().await;
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_with_handle_renders_text() {
        let store = Arc::new(SqliteNotificationStore::in_memory().unwrap());
        let mut deps = ServerDeps::single_process(store);
        deps.metrics = Some(
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .build_recorder()
                .handle(),
        );
        let server = CockpitServer::start(ServerConfig::default(), deps).await.unwrap();
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ws_without_upgrade_headers_is_rejected() {
        let server = make_server().await;
        let req = Request::builder()
            .uri("/ws/sess-1?user_id=u1")
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn chat_stream_rejects_bad_payload() {
        let server = make_server().await;
        let req = Request::builder()
            .method("POST")
            .uri("/chat/stream")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"session_id":"s1","user_id":"u1","payload":{}}"#))
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_json(resp).await["code"], "PROCESSING_ERROR");
    }

    #[tokio::test]
    async fn chat_stream_emits_sse_records() {
        let server = make_server().await;
        let req = Request::builder()
            .method("POST")
            .uri("/chat/stream")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"session_id":"s1","user_id":"u1","payload":{"text":"hi there"}}"#,
            ))
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/event-stream"
        );

        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let events: Vec<serde_json::Value> = text
            .split("\n\n")
            .filter_map(|record| record.strip_prefix("data: "))
            .map(|json| serde_json::from_str(json).unwrap())
            .collect();
        let tags: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
        assert_eq!(tags, vec!["start", "fragment", "end"]);
        assert_eq!(events[1]["content"], "hi there");
        assert_eq!(events[2]["sequence"], 2);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server().await;
        let req = Request::builder().uri("/nonexistent").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn spawn_and_shutdown() {
        let server = make_server().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = server.spawn(listener).unwrap();
        assert_ne!(handle.local_addr.port(), 0);
        let shutdown = Arc::clone(&handle.state().shutdown);
        handle.shutdown().await;
        assert!(shutdown.is_shutting_down());
    }
}

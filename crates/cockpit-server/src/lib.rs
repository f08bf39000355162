//! # cockpit-server
//!
//! The real-time delivery layer behind the Cockpit REST API.
//!
//! - [`websocket::ConnectionTable`]: per-process registry of live connections,
//!   keyed by session, with a per-session capacity limit
//! - [`directory::SessionDirectory`]: cross-process presence hints with TTL
//! - [`websocket::HeartbeatMonitor`]: evicts silent connections and refreshes
//!   presence
//! - [`relay::PeerRelay`]: per-process inbox used to reach sessions held
//!   elsewhere
//! - [`notify::NotificationDispatcher`]: persist-then-deliver, degrading to
//!   local delivery when the directory is down
//! - [`stream::StreamEmitter`]: ordered, cancellable response streaming over a
//!   live connection or server-sent events
//! - [`server::CockpitServer`]: axum router wiring all of the above

#![deny(unsafe_code)]

pub mod config;
pub mod directory;
pub mod handler;
pub mod health;
pub mod metrics;
pub mod notify;
pub mod relay;
pub mod server;
pub mod shutdown;
pub mod sse;
pub mod stream;
pub mod websocket;

pub use config::{RealtimeConfig, ServerConfig};
pub use handler::{EchoHandler, HandlerError, SubmitHandler, SubmitResponse};
pub use server::{AppState, CockpitServer, ServerDeps, ServerHandle};

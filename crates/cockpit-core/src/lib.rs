//! # cockpit-core
//!
//! Foundation types for the Cockpit real-time delivery layer.
//!
//! This crate provides the vocabulary shared by the store, server, and binary:
//!
//! - **Branded IDs**: `SessionId`, `UserId`, `ConnectionId`, `NotificationId`, `StreamId`
//! - **Wire protocol**: `ClientMessage` / `ServerMessage` for live connections
//! - **Stream events**: `StreamEvent` with its SSE record encoding
//! - **Errors**: `RealtimeError` taxonomy with stable wire codes

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod protocol;
pub mod stream;

pub use errors::{RealtimeError, TimeoutKind};
pub use ids::{ConnectionId, NotificationId, SessionId, StreamId, UserId};
pub use protocol::{ClientMessage, ServerMessage, parse_client_message};
pub use stream::{StreamEvent, StreamEventKind};

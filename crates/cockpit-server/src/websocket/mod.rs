//! Live connection management: the per-process connection table, the
//! heartbeat monitor, message dispatch, and the socket lifecycle.

pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod presence;
pub mod session;
pub mod table;

pub use connection::{Connection, Outbound, SendFailure};
pub use handler::{SessionContext, handle_message};
pub use heartbeat::{HeartbeatMonitor, SweepReport};
pub use presence::PresencePublisher;
pub use session::run_ws_session;
pub use table::ConnectionTable;

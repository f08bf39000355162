//! # cockpit-store
//!
//! Durable, user-scoped notifications.
//!
//! A notification is written before any delivery is attempted and survives
//! whether or not the user had a live connection at the time. Records are
//! only mutated by read-state transitions and only removed on request.
//!
//! - [`NotificationStore`]: async interface used by the dispatcher and the
//!   read API
//! - [`SqliteNotificationStore`]: `r2d2` pool + embedded migrations, queries
//!   run on the blocking thread pool
//! - [`sqlite::NotificationRepo`]: stateless SQL, every method takes `&Connection`

#![deny(unsafe_code)]

pub mod errors;
pub mod sqlite;
pub mod store;
pub mod types;

pub use errors::{Result, StoreError};
pub use store::{NotificationStore, SqliteNotificationStore};
pub use types::{EntityRef, NewNotification, NotificationPage, NotificationQuery, NotificationRecord};

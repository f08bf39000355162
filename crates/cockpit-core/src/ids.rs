//! Branded string identifiers.
//!
//! Each identifier is a `String` newtype so a `SessionId` can never be passed
//! where a `UserId` is expected. Generated values carry a short prefix followed
//! by a `UUIDv7`, which keeps them roughly time-ordered.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh identifier.
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            /// Wrap an existing value without validation.
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Borrow the underlying string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(
    /// Logical conversation scope, stable across reconnects.
    SessionId,
    "sess"
);
branded_id!(
    /// Owner of sessions and notifications.
    UserId,
    "user"
);
branded_id!(
    /// One open duplex channel. Unique per accepted socket.
    ConnectionId,
    "conn"
);
branded_id!(
    /// Durable notification record.
    NotificationId,
    "ntf"
);
branded_id!(
    /// One in-flight streamed response.
    StreamId,
    "stream"
);

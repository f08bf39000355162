//! Error types for notification storage.

use thiserror::Error;

/// Errors that can occur during notification store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `SQLite` database error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON serialization/deserialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// Describes which migration failed and why.
        message: String,
    },

    /// Requested notification was not found.
    #[error("notification not found: {0}")]
    NotFound(String),

    /// Notification belongs to another user.
    #[error("notification {notification_id} does not belong to user {user_id}")]
    PermissionDenied {
        /// Target notification.
        notification_id: String,
        /// Caller.
        user_id: String,
    },

    /// Internal error (e.g. a blocking task panicked).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for store results.
pub type Result<T> = std::result::Result<T, StoreError>;

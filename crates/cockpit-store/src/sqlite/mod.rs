//! `SQLite` backend: connection pool, migrations, and the repository.

pub mod connection;
pub mod migrations;
pub mod repository;

pub use connection::{ConnectionConfig, ConnectionPool, new_file, new_in_memory};
pub use migrations::run_migrations;
pub use repository::NotificationRepo;

//! Settings types.
//!
//! Field names are camelCase on disk. Every struct uses `#[serde(default)]`
//! so a partial file only overrides what it names.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CockpitSettings {
    /// HTTP listener and process identity.
    pub server: ServerSettings,
    /// Connection, heartbeat, directory, and streaming limits.
    pub realtime: RealtimeSettings,
    /// Notification database.
    pub store: StoreSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl CockpitSettings {
    /// Reject combinations the real-time layer cannot run with.
    pub fn validate(&self) -> Result<()> {
        let rt = &self.realtime;
        if rt.max_connections_per_session == 0 {
            return Err(SettingsError::InvalidValue(
                "realtime.maxConnectionsPerSession must be at least 1".into(),
            ));
        }
        if rt.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "realtime.heartbeatIntervalMs must be positive".into(),
            ));
        }
        if rt.idle_timeout_ms < rt.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(format!(
                "realtime.idleTimeoutMs ({}) is shorter than heartbeatIntervalMs ({})",
                rt.idle_timeout_ms, rt.heartbeat_interval_ms
            )));
        }
        if rt.stream_backpressure_timeout_ms == 0
            || rt.stream_backpressure_timeout_ms >= rt.heartbeat_interval_ms
        {
            return Err(SettingsError::InvalidValue(format!(
                "realtime.streamBackpressureTimeoutMs ({}) must be positive and below heartbeatIntervalMs ({})",
                rt.stream_backpressure_timeout_ms, rt.heartbeat_interval_ms
            )));
        }
        if rt.directory_ttl_ms < rt.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(format!(
                "realtime.directoryTtlMs ({}) is shorter than heartbeatIntervalMs ({})",
                rt.directory_ttl_ms, rt.heartbeat_interval_ms
            )));
        }
        if rt.directory_timeout_ms == 0 || rt.directory_timeout_ms >= rt.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(format!(
                "realtime.directoryTimeoutMs ({}) must be positive and below heartbeatIntervalMs ({})",
                rt.directory_timeout_ms, rt.heartbeat_interval_ms
            )));
        }
        if self.server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueueCapacity must be at least 1".into(),
            ));
        }
        if self.store.pool_size == 0 {
            return Err(SettingsError::InvalidValue(
                "store.poolSize must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// HTTP listener and process identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port. `0` picks an ephemeral port.
    pub port: u16,
    /// Address other processes use to reach this one through the relay.
    /// Defaults to `host:port` when unset.
    pub process_address: Option<String>,
    /// Outbound frames buffered per connection before it counts as failed.
    pub send_queue_capacity: usize,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            process_address: None,
            send_queue_capacity: 256,
            max_message_size: 1024 * 1024,
        }
    }
}

impl ServerSettings {
    /// The configured process address, or `host:port`.
    pub fn resolved_process_address(&self) -> String {
        self.process_address
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host, self.port))
    }
}

/// Real-time delivery limits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealtimeSettings {
    /// Live connections one session may hold on one process.
    pub max_connections_per_session: usize,
    /// Heartbeat tick period.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a connection is evicted.
    pub idle_timeout_ms: u64,
    /// Longest a stream waits for its destination to accept one event.
    pub stream_backpressure_timeout_ms: u64,
    /// Lifetime of a directory entry between refreshes.
    pub directory_ttl_ms: u64,
    /// Longest one directory or relay call may take before it counts as failed.
    pub directory_timeout_ms: u64,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            max_connections_per_session: 5,
            heartbeat_interval_ms: 30_000,
            idle_timeout_ms: 300_000,
            stream_backpressure_timeout_ms: 5_000,
            directory_ttl_ms: 90_000,
            directory_timeout_ms: 2_000,
        }
    }
}

/// Notification database settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// `SQLite` file path.
    pub db_path: PathBuf,
    /// Maximum pooled connections.
    pub pool_size: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self {
            db_path: PathBuf::from(home).join(".cockpit").join("cockpit.db"),
            pool_size: 8,
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Log settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

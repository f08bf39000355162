//! Server configuration.

use std::time::Duration;

use cockpit_settings::CockpitSettings;

/// Limits and timings for the real-time layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RealtimeConfig {
    /// Live connections one session may hold on this process.
    pub max_connections_per_session: usize,
    /// Heartbeat tick period.
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is evicted.
    pub idle_timeout: Duration,
    /// Longest a stream waits for its destination to take one event.
    pub stream_backpressure_timeout: Duration,
    /// Directory entry lifetime between refreshes.
    pub directory_ttl: Duration,
    /// Deadline for one directory or relay call.
    pub directory_timeout: Duration,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            max_connections_per_session: 5,
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            stream_backpressure_timeout: Duration::from_secs(5),
            directory_ttl: Duration::from_secs(90),
            directory_timeout: Duration::from_secs(2),
            send_queue_capacity: 256,
        }
    }
}

impl RealtimeConfig {
    /// Consecutive silent heartbeat ticks tolerated before eviction.
    pub fn max_missed_heartbeats(&self) -> u32 {
        let interval = self.heartbeat_interval.as_millis().max(1);
        let ticks = self.idle_timeout.as_millis() / interval;
        u32::try_from(ticks).unwrap_or(u32::MAX).max(1)
    }
}

/// Configuration for the Cockpit server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Address under which this process is announced and reached.
    pub process_address: String,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Real-time limits.
    pub realtime: RealtimeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            process_address: "local".into(),
            max_message_size: 1024 * 1024,
            realtime: RealtimeConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &CockpitSettings) -> Self {
        let rt = &settings.realtime;
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            process_address: settings.server.resolved_process_address(),
            max_message_size: settings.server.max_message_size,
            realtime: RealtimeConfig {
                max_connections_per_session: rt.max_connections_per_session,
                heartbeat_interval: Duration::from_millis(rt.heartbeat_interval_ms),
                idle_timeout: Duration::from_millis(rt.idle_timeout_ms),
                stream_backpressure_timeout: Duration::from_millis(rt.stream_backpressure_timeout_ms),
                directory_ttl: Duration::from_millis(rt.directory_ttl_ms),
                directory_timeout: Duration::from_millis(rt.directory_timeout_ms),
                send_queue_capacity: settings.server.send_queue_capacity,
            },
        }
    }

    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_realtime_limits() {
        let cfg = RealtimeConfig::default();
        assert_eq!(cfg.max_connections_per_session, 5);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.send_queue_capacity, 256);
    }

    #[test]
    fn max_missed_from_idle_timeout() {
        let cfg = RealtimeConfig::default();
        assert_eq!(cfg.max_missed_heartbeats(), 10);
    }

    #[test]
    fn max_missed_never_zero() {
        let cfg = RealtimeConfig {
            heartbeat_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(10),
            ..RealtimeConfig::default()
        };
        assert_eq!(cfg.max_missed_heartbeats(), 1);
    }

    #[test]
    fn from_settings_maps_every_field() {
        let mut settings = CockpitSettings::default();
        settings.server.host = "10.0.0.1".into();
        settings.server.port = 9000;
        settings.realtime.max_connections_per_session = 2;
        settings.realtime.heartbeat_interval_ms = 1_000;
        settings.realtime.stream_backpressure_timeout_ms = 250;

        let cfg = ServerConfig::from_settings(&settings);
        assert_eq!(cfg.bind_addr(), "10.0.0.1:9000");
        assert_eq!(cfg.process_address, "10.0.0.1:9000");
        assert_eq!(cfg.realtime.max_connections_per_session, 2);
        assert_eq!(cfg.realtime.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(cfg.realtime.stream_backpressure_timeout, Duration::from_millis(250));
        assert_eq!(cfg.realtime.idle_timeout, Duration::from_secs(300));
        assert_eq!(cfg.realtime.directory_timeout, Duration::from_secs(2));
    }

    #[test]
    fn explicit_process_address_wins() {
        let mut settings = CockpitSettings::default();
        settings.server.process_address = Some("node-a".into());
        assert_eq!(ServerConfig::from_settings(&settings).process_address, "node-a");
    }
}

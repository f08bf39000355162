//! # cockpit-logging
//!
//! Structured logging with `tracing`.
//!
//! - [`init_subscriber`] installs the process-wide subscriber (compact stderr
//!   or JSON lines), filtered by `RUST_LOG` when set.
//! - [`capture_logs`] installs a thread-local capture layer so tests can
//!   assert on emitted events.

#![deny(unsafe_code)]

pub mod test_utils;

pub use cockpit_settings::LogFormat;
pub use test_utils::{CapturedEvent, CapturedLogs, capture_logs};

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins over `level` when set. Subsequent calls are no-ops.
pub fn init_subscriber(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Compact => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_writer(std::io::stderr)
                .compact();
            // try_init is a no-op if a global subscriber is already set
            let _ = subscriber.try_init();
        }
        LogFormat::Json => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_writer(std::io::stderr)
                .json()
                .with_span_list(true);
            let _ = subscriber.try_init();
        }
    }
}

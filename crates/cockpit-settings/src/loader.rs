//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`CockpitSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `COCKPIT_*` environment overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{CockpitSettings, LogFormat};

/// Resolve the path to the settings file (`~/.cockpit/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".cockpit").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<CockpitSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a combination rejected by
/// [`CockpitSettings::validate`] is an error.
pub fn load_settings_from_path(path: &Path) -> Result<CockpitSettings> {
    load_with_env(path, |name| std::env::var(name).ok())
}

/// Same as [`load_settings_from_path`] with an injectable environment.
pub fn load_with_env(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<CockpitSettings> {
    let defaults = serde_json::to_value(CockpitSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: CockpitSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, env);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment overrides read through `env`.
///
/// Invalid values are logged and ignored (the file/default value stays).
pub fn apply_env_overrides(settings: &mut CockpitSettings, env: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { get: env };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("COCKPIT_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("COCKPIT_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.string("COCKPIT_PROCESS_ADDRESS") {
        settings.server.process_address = Some(v);
    }
    if let Some(v) = env.usize("COCKPIT_SEND_QUEUE_CAPACITY", 1, 65_536) {
        settings.server.send_queue_capacity = v;
    }

    // ── Realtime ────────────────────────────────────────────────────
    if let Some(v) = env.usize("COCKPIT_MAX_CONNECTIONS_PER_SESSION", 1, 1_000) {
        settings.realtime.max_connections_per_session = v;
    }
    if let Some(v) = env.u64("COCKPIT_HEARTBEAT_INTERVAL_MS", 100, 600_000) {
        settings.realtime.heartbeat_interval_ms = v;
    }
    if let Some(v) = env.u64("COCKPIT_IDLE_TIMEOUT_MS", 100, 86_400_000) {
        settings.realtime.idle_timeout_ms = v;
    }
    if let Some(v) = env.u64("COCKPIT_STREAM_BACKPRESSURE_TIMEOUT_MS", 10, 600_000) {
        settings.realtime.stream_backpressure_timeout_ms = v;
    }
    if let Some(v) = env.u64("COCKPIT_DIRECTORY_TTL_MS", 100, 86_400_000) {
        settings.realtime.directory_ttl_ms = v;
    }
    if let Some(v) = env.u64("COCKPIT_DIRECTORY_TIMEOUT_MS", 10, 600_000) {
        settings.realtime.directory_timeout_ms = v;
    }

    // ── Store ───────────────────────────────────────────────────────
    if let Some(v) = env.string("COCKPIT_DB_PATH") {
        settings.store.db_path = PathBuf::from(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("COCKPIT_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("COCKPIT_LOG_JSON") {
        settings.logging.format = if v { LogFormat::Json } else { LogFormat::Compact };
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────────────

struct EnvReader<F> {
    get: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.get)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.get)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.get)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.get)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.get)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

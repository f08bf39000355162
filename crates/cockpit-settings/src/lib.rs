//! # cockpit-settings
//!
//! Configuration for the Cockpit real-time layer, loaded in three layers:
//!
//! 1. Compiled defaults ([`CockpitSettings::default()`])
//! 2. A JSON file deep-merged over the defaults
//! 3. `COCKPIT_*` environment variables
//!
//! Settings are loaded once at startup and passed explicitly to the
//! components that need them.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_settings, load_settings_from_path, load_with_env,
    settings_path,
};
pub use types::{
    CockpitSettings, LogFormat, LoggingSettings, RealtimeSettings, ServerSettings, StoreSettings,
};

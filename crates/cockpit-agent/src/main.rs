//! # cockpit-agent
//!
//! Cockpit server binary: loads settings, opens the notification store and
//! serves the real-time layer until Ctrl-C.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cockpit_server::metrics::install_recorder;
use cockpit_server::{CockpitServer, ServerConfig, ServerDeps};
use cockpit_settings::CockpitSettings;
use cockpit_store::SqliteNotificationStore;
use tokio::net::TcpListener;

/// Cockpit real-time server.
#[derive(Parser, Debug)]
#[command(name = "cockpit-agent", about = "Cockpit real-time server")]
struct Cli {
    /// Settings file (defaults to `~/.cockpit/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the `SQLite` notification database (overrides settings).
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Log filter directive, e.g. `debug` or `cockpit_server=trace`.
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// Fold command-line overrides into loaded settings.
    fn apply(self, settings: &mut CockpitSettings) {
        if let Some(host) = self.host {
            settings.server.host = host;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(db_path) = self.db_path {
            settings.store.db_path = db_path;
        }
        if let Some(level) = self.log_level {
            settings.logging.level = level;
        }
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn load(cli: Cli) -> Result<CockpitSettings> {
    let path = cli.config.clone().unwrap_or_else(cockpit_settings::settings_path);
    let mut settings = cockpit_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = load(Cli::parse())?;
    cockpit_logging::init_subscriber(&settings.logging.level, settings.logging.format);

    ensure_parent_dir(&settings.store.db_path)?;
    let store = SqliteNotificationStore::open(&settings.store.db_path, settings.store.pool_size)
        .context("Failed to open notification store")?;

    let metrics = match install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "metrics disabled");
            None
        }
    };

    let config = ServerConfig::from_settings(&settings);
    let bind_addr = config.bind_addr();
    let deps = ServerDeps {
        metrics,
        ..ServerDeps::single_process(Arc::new(store))
    };
    let server = CockpitServer::start(config, deps)
        .await
        .context("Failed to start server")?;

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    let handle = server.spawn(listener).context("Failed to serve")?;

    tracing::info!(
        addr = %handle.local_addr,
        process_address = %handle.state().config.process_address,
        "cockpit agent listening"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    handle.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

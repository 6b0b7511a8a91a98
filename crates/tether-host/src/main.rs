//! # tether-host
//!
//! Tether server binary: loads settings, mounts the demo services and serves
//! them over the WebSocket gateway. `SIGHUP` starts a new server generation
//! that adopts every live socket.

#![deny(unsafe_code)]

mod services;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tether_core::logging::{LogFormat, init_subscriber};
use tether_server::settings::Settings;
use tether_server::{ContinuityStore, Gateway, GenerationSlot, Server, load_settings};

/// Tether RPC server.
#[derive(Parser, Debug)]
#[command(name = "tether-host", about = "Tether RPC server")]
struct Cli {
    /// Settings file (default `~/.tether/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides settings, 0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Log filter when `RUST_LOG` is unset (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Log output: `compact` or `json` (overrides settings).
    #[arg(long)]
    log_format: Option<String>,
}

impl Cli {
    /// Command-line flags win over file and environment values.
    fn apply(&self, settings: &mut Settings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if let Some(format) = &self.log_format {
            settings.logging.format.clone_from(format);
        }
    }
}

/// Start the next server generation on `store`.
fn start_generation(settings: &Settings, store: &dyn ContinuityStore) -> Result<Arc<Server>> {
    let tree = services::handler_tree().context("Failed to build handler tree")?;
    Ok(Server::new(settings.server.rpc.clone(), tree, store))
}

#[cfg(unix)]
async fn reload_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut hangup = signal(SignalKind::hangup()).context("Failed to listen for SIGHUP")?;
    let _ = hangup.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn reload_signal() -> Result<()> {
    futures::future::pending::<()>().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let mut settings = load_settings(args.config.as_deref()).context("Failed to load settings")?;
    args.apply(&mut settings);

    let format = LogFormat::parse(&settings.logging.format).unwrap_or_default();
    init_subscriber(&settings.logging.level, format);

    let store: Arc<dyn ContinuityStore> = Arc::new(GenerationSlot::new());
    let first = start_generation(&settings, store.as_ref())?;

    let mut gateway = Gateway::new(settings.server.clone(), Arc::clone(&store));
    match tether_server::metrics::install_recorder() {
        Ok(handle) => gateway = gateway.with_metrics(handle),
        Err(e) => tracing::warn!(error = %e, "metrics recorder not installed"),
    }

    let (addr, handle) = gateway.listen().await.context("Failed to bind server")?;
    tracing::info!(
        generation = first.generation(),
        paths = ?first.handlers().tree().paths(),
        "Tether listening on ws://{addr}/ws"
    );
    drop(first);

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for ctrl-c")?;
                break;
            }
            result = reload_signal() => {
                result?;
                match load_settings(args.config.as_deref()) {
                    Ok(mut reloaded) => {
                        args.apply(&mut reloaded);
                        settings = reloaded;
                    }
                    Err(e) => tracing::warn!(error = %e, "settings reload failed, keeping previous settings"),
                }
                let next = start_generation(&settings, store.as_ref())?;
                tracing::info!(
                    generation = next.generation(),
                    connections = next.connection_count(),
                    "reloaded server generation"
                );
            }
        }
    }

    tracing::info!("Shutting down...");
    gateway
        .shutdown()
        .graceful_shutdown(store.as_ref(), vec![handle], Some(Duration::from_secs(10)))
        .await;
    tracing::info!("Shutdown complete");
    Ok(())
}

//! # Dayflow Relay
//!
//! WebSocket relay hosting the shared remote tree for Dayflow devices.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Relay Process                                  │
//! │                                                                         │
//! │  Device A ──┐                                                          │
//! │             ├──► ws://host:8787/ws ───► RelayServer ───► MemoryRemote  │
//! │  Device B ──┘                                                          │
//! │                  http://host:8787/health                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Environment: `RELAY_PORT`, `RELAY_BIND_ADDR`, `RUST_LOG`.

mod config;

use tracing::info;
use tracing_subscriber::EnvFilter;

use dayflow_sync::RelayServer;

use crate::config::RelaySettings;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("Starting Dayflow relay...");

    let settings = RelaySettings::load()?;
    info!(
        port = settings.port,
        bind_addr = %settings.bind_addr,
        "Configuration loaded"
    );

    let relay = RelayServer::new(settings.relay_config()).start().await?;
    info!(url = %relay.ws_url(), "Relay ready");

    shutdown_signal().await?;

    relay.shutdown().await?;
    info!("Relay shutdown complete");
    Ok(())
}

/// Waits for Ctrl+C or SIGTERM.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received, starting graceful shutdown...");
    Ok(())
}

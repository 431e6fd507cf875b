//! Switchyard Gateway
//!
//! Loads configuration, starts every component in order and serves until
//! Ctrl+C or SIGTERM, then drains and shuts down.

use anyhow::{Context, Result};
use clap::Parser;
use switchyard_gateway::{Args, Config, Gateway};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args).context("invalid configuration")?;

    // Initialize tracing (prefer RUST_LOG, fallback to the configured level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting switchyard gateway");
    info!(
        registry_url = config.registry_url.as_deref().unwrap_or_default(),
        listener_count = config.listeners.len(),
        route_count = config.routes.len(),
        admin_addr = ?config.admin_addr,
        "Configuration loaded"
    );

    let gateway = Gateway::init(config)?;
    if let Err(e) = gateway.start().await {
        error!(error = %format!("{e:#}"), "Gateway failed to start");
        gateway.destroy();
        return Err(e);
    }

    shutdown_signal().await;
    info!("Received shutdown signal");

    gateway.stop().await;
    gateway.destroy();
    info!("Gateway shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

//! # tether-server
//!
//! Server binary: loads settings, starts the broker and serves sockets until
//! ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tether_broker::{Broker, BrokerEvent, OpenAuthenticator};
use tether_server::config::ServerConfig;
use tether_server::server::TetherServer;
use tether_settings::TetherSettings;
use tokio::sync::broadcast::error::RecvError;

/// Tether pub/sub server.
#[derive(Parser, Debug)]
#[command(name = "tether-server", about = "Tether pub/sub server")]
struct Cli {
    /// Settings file (defaults to `~/.tether/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Log filter (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// Fold command-line overrides into loaded settings.
    fn apply(&self, settings: &mut TetherSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

/// Log subscription changes until the broker stops.
async fn log_broker_events(broker: Broker) {
    let mut events = broker.subscribe();
    loop {
        match events.recv().await {
            Ok(BrokerEvent::Connected { uid, channel_id }) => {
                tracing::info!(%uid, %channel_id, "subscription established");
            }
            Ok(BrokerEvent::Disconnected { uid, channel_id }) => {
                tracing::info!(%uid, %channel_id, "subscription ended");
            }
            Ok(BrokerEvent::Error { channel_id, error }) => {
                tracing::warn!(%channel_id, %error, "channel error");
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "broker event log lagged"),
            Err(RecvError::Closed) => return,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = cli
        .config
        .clone()
        .unwrap_or_else(tether_settings::settings_path);
    let mut settings = tether_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    tether_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let metrics = tether_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let broker = Broker::new(Arc::new(OpenAuthenticator));
    drop(tokio::spawn(log_broker_events(broker.clone())));

    let server = TetherServer::new(ServerConfig::from_settings(&settings), broker.clone())
        .with_metrics(metrics);
    let (addr, handle) = server.listen().await.context("Failed to bind listener")?;
    tracing::info!(%addr, "tether server started");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown().shutdown();
    server.shutdown().graceful_shutdown(vec![handle], None).await;
    broker.shutdown();

    tracing::info!("Shutdown complete");
    Ok(())
}

//! Qanban Relay Server
//!
//! A WebSocket relay that routes contract envelopes between named parties.
//! The server provides:
//! - Login by party name, one live connection per party
//! - Routing by receiver list, within the namespace named by the URL path
//! - An offline queue for parties that are not connected
//!
//! Usage:
//!   qanban-relay [--config relay.toml] [--port 7475] [--host 0.0.0.0]

use anyhow::Context;
use clap::Parser;
use qanban::relay::{Relay, RelayConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Qanban Relay Server
#[derive(Parser)]
#[command(name = "qanban-relay")]
#[command(about = "WebSocket relay server for Qanban contract replication")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "QANBAN_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "QANBAN_RELAY_PORT")]
    port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "QANBAN_RELAY_HOST")]
    host: Option<String>,

    /// SQLite file for the durable offline queue
    #[arg(long, env = "QANBAN_RELAY_QUEUE")]
    queue_path: Option<PathBuf>,

    /// Refuse connections that do not name a namespace
    #[arg(long)]
    require_namespace: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<RelayConfig> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => RelayConfig::default(),
        };
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if self.queue_path.is_some() {
            config.queue_path = self.queue_path;
        }
        config.require_namespace |= self.require_namespace;
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("qanban=info".parse()?),
        )
        .init();

    let config = Args::parse().into_config()?;
    let relay = Relay::from_config(config).context("creating relay")?;
    info!(
        require_namespace = relay.config().require_namespace,
        durable_queue = relay.config().queue_path.is_some(),
        "Starting Qanban relay"
    );

    Arc::new(relay)
        .run()
        .await
        .context("relay server stopped")
}

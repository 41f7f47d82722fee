use anyhow::Context;
use clap::Parser;
use dacgate_core::{GatewayConfig, JsonCommandDispatcher, Listener};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// dacgate Server - authenticated access-control gateway
#[derive(Parser)]
#[command(name = "dacgate-server")]
#[command(about = "dacgate gateway: authenticated session listener")]
#[command(version)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override the bind address
    #[arg(short, long)]
    pub address: Option<String>,

    /// Override the listening port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => GatewayConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    if let Some(address) = cli.address {
        config.network.bind_address = address;
    }
    if let Some(port) = cli.port {
        config.network.port = port;
    }

    let identity = config
        .load_identity()
        .with_context(|| format!("Failed to load identity key {}", config.key_path().display()))?;
    let trust = config.trust_store().context("Invalid peer list")?;
    if trust.is_empty() {
        info!("No trusted peers configured; every handshake will be rejected");
    }

    let listener = Listener::bind(
        &config.listen_address(),
        config.network.listener_settings(),
        Arc::new(identity),
        Arc::new(trust),
        Arc::new(JsonCommandDispatcher::new()),
    )
    .await
    .context("Failed to start listener")?;

    let shutdown = listener.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                shutdown.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    listener.run().await?;
    info!("dacgate server stopped");
    Ok(())
}

//! dacgate CLI implementation

use crate::client::{ClientConfig, GatewayClient};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// dacgate Client - talk to an access-control gateway
#[derive(Parser)]
#[command(name = "dacgate-client")]
#[command(about = "dacgate client for authenticated gateway requests")]
#[command(version)]
pub struct Cli {
    /// Gateway address
    #[arg(short, long, default_value = "localhost")]
    pub server: String,

    /// Gateway port
    #[arg(short, long, default_value_t = dacgate_core::DEFAULT_PORT)]
    pub port: u16,

    /// Our identification string
    #[arg(short, long, default_value = "client-1")]
    pub identification: String,

    /// Identity key file (hex seed)
    #[arg(short, long)]
    pub key: PathBuf,

    /// Identification the gateway must present
    #[arg(long, default_value = "server-1")]
    pub server_id: String,

    /// Gateway identity public key (hex)
    #[arg(long)]
    pub server_key: String,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check that the gateway answers
    Ping,

    /// Send a raw JSON request and print the response
    Send {
        /// JSON request body
        #[arg(value_name = "JSON")]
        request: String,
    },
}

/// Run CLI application
pub async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = ClientConfig {
        server_address: cli.server,
        server_port: cli.port,
        identification: cli.identification,
        key_path: Some(cli.key),
        server_identification: cli.server_id,
        server_public_key: Some(cli.server_key),
        ..Default::default()
    };
    let address = config.address();

    let mut client = GatewayClient::from_config(config).context("Failed to load client identity")?;
    client
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", address))?;

    match cli.command {
        Commands::Ping => {
            if client.ping().await? {
                println!("pong");
            } else {
                println!("Gateway answered, but not with pong");
            }
        }

        Commands::Send { request } => {
            let request: serde_json::Value =
                serde_json::from_str(&request).context("Request is not valid JSON")?;
            let response = client.command(&request).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }

    client.disconnect().await?;
    Ok(())
}

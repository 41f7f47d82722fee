use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dacgate_core::LocalIdentity;
use std::path::PathBuf;

/// dacgate Tools - identity key management
#[derive(Parser)]
#[command(name = "dacgate-tools")]
#[command(about = "dacgate identity key management tools")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a new Ed25519 identity key
    Keygen {
        /// Output key file (hex seed, mode 0600)
        #[arg(short, long)]
        output: PathBuf,

        /// Identification string the key belongs to
        #[arg(short, long, default_value = "server-1")]
        identification: String,

        /// Overwrite an existing key file
        #[arg(long)]
        force: bool,
    },

    /// Print the public key of an existing identity key
    Pubkey {
        /// Key file (hex seed)
        #[arg(short, long)]
        key: PathBuf,

        /// Identification string the key belongs to
        #[arg(short, long, default_value = "server-1")]
        identification: String,
    },
}

fn print_peer_entry(identity: &LocalIdentity) {
    println!("public key: {}", identity.public_key_hex());
    println!();
    println!("# trust entry for the peer's configuration");
    println!("[[peers]]");
    println!("identification = \"{}\"", identity.identification());
    println!("public_key = \"{}\"", identity.public_key_hex());
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen {
            output,
            identification,
            force,
        } => {
            if output.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", output.display());
            }
            let identity =
                LocalIdentity::generate(identification).context("Key generation failed")?;
            identity
                .save(&output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Wrote identity key to {}", output.display());
            print_peer_entry(&identity);
        }

        Commands::Pubkey { key, identification } => {
            let identity = LocalIdentity::load(identification, &key)
                .with_context(|| format!("Failed to read {}", key.display()))?;
            print_peer_entry(&identity);
        }
    }

    Ok(())
}

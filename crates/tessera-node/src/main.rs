//! Tessera Node - Main entry point
//!
//! Runs key generation and signing for a configured group on a local devnet.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tessera_core::RunId;
use tessera_node::{agreed_public_key, Devnet, NodeConfig};

#[derive(Parser)]
#[command(name = "tessera-node")]
#[command(about = "Leaderless threshold key generation and signing on a local devnet", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to $TESSERA_CONFIG, then ./tessera.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Run key generation only
    Dkg {
        /// Key generation seed (hex), overrides the config
        #[arg(long)]
        seed: Option<String>,
    },

    /// Run a signing batch only
    Sign {
        /// Messages to sign (hex), override the config
        #[arg(short, long)]
        message: Vec<String>,

        /// Group key the signatures are bound to (hex); derived from the
        /// key generation seed when omitted
        #[arg(long)]
        group_key: Option<String>,
    },

    /// Run key generation followed by a signing batch
    Devnet,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tessera_node=info,tessera_protocol=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(NodeConfig::default_path);

    if let Commands::InitConfig { force } = cli.command {
        if config_path.exists() && !force {
            bail!("{} already exists; use --force to overwrite", config_path.display());
        }
        NodeConfig::default().save(&config_path)?;
        println!("Wrote default configuration to {}", config_path.display());
        return Ok(());
    }

    let config = if config_path.exists() {
        NodeConfig::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        info!("No config at {:?}, using defaults", config_path);
        NodeConfig::default()
    };

    info!("Starting Tessera node v{}", env!("CARGO_PKG_VERSION"));

    let ctx = CancellationToken::new();
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Received shutdown signal");
                ctx.cancel();
            }
        });
    }

    let devnet = Devnet::new(config.clone())?;
    let chain = ctx.child_token();

    match cli.command {
        Commands::InitConfig { .. } => {}
        Commands::Dkg { seed } => {
            let seed = match seed {
                Some(seed) => RunId::from_hex(&seed)?,
                None => config.dkg_seed()?,
            };
            devnet.start_chain(&chain);
            let reports = devnet.run_key_generation(&ctx, seed).await?;
            print_json(&reports)?;
            match agreed_public_key(&reports) {
                Ok(key) => println!("Group public key: {key}"),
                Err(e) => warn!("{}", e),
            }
        }
        Commands::Sign { message, group_key } => {
            let messages = if message.is_empty() {
                config.messages()?
            } else {
                message
                    .iter()
                    .map(|m| RunId::from_hex(m))
                    .collect::<Result<Vec<_>, _>>()?
            };
            let group_key = match group_key {
                Some(key) => hex::decode(key.trim_start_matches("0x"))
                    .context("group key is not valid hex")?,
                None => Sha256::digest(config.dkg_seed()?.as_bytes()).to_vec(),
            };
            devnet.start_chain(&chain);
            let reports = devnet.run_signing(&ctx, &group_key, &messages).await?;
            print_json(&reports)?;
        }
        Commands::Devnet => {
            let report = devnet.run(&ctx).await?;
            print_json(&report)?;
        }
    }

    chain.cancel();
    info!("Node shutting down");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

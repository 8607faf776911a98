//! Ensemble node binary

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zooweeper::{common::config::DEFAULT_CONFIG_FILE, Node, NodeConfig};

#[derive(Parser)]
#[command(name = "zooweeper")]
#[command(about = "zooweeper ensemble node")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an ensemble node
    Serve {
        /// Config file (TOML)
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,

        /// This node's address (port or host:port)
        #[arg(long)]
        address: Option<String>,

        /// Listen address
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Ensemble members, this node included (comma-separated)
        #[arg(long, value_delimiter = ',')]
        peers: Vec<String>,

        /// Database directory
        #[arg(long)]
        db: Option<PathBuf>,

        /// Base URL for port-only peer addresses
        #[arg(long)]
        base_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            address,
            bind,
            peers,
            db,
            base_url,
        } => {
            // File and environment first, CLI flags have priority
            let mut node_config = NodeConfig::load_from(&config)?;
            if let Some(address) = address {
                node_config.node_address = address;
            }
            if bind.is_some() {
                node_config.bind_addr = bind;
            }
            if !peers.is_empty() {
                node_config.peers = peers;
            }
            if db.is_some() {
                node_config.db_path = db;
            }
            if let Some(base_url) = base_url {
                node_config.base_url = base_url;
            }

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| node_config.log_level.as_str().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            tracing::info!("zooweeper {}", zooweeper::BUILD_INFO);
            node_config.validate()?;
            Node::new(node_config).serve().await?;
        }
    }

    Ok(())
}

//! WolfElect - Fixed-Membership Leader Election
//!
//! Starts one cluster node: `wolfelect <ID> <LEADER>`.

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfelect::config::ElectConfig;
use wolfelect::error::Result;
use wolfelect::node::Node;
use wolfelect::state::NodeId;

/// WolfElect - Fixed-Membership Leader Election
#[derive(Parser)]
#[command(name = "wolfelect")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Identifier of this node
    id: NodeId,

    /// Start as the cluster leader (true|false)
    #[arg(action = ArgAction::Set, default_value_t = false)]
    leader: bool,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Number of nodes when the membership is derived from base ports
    #[arg(long)]
    cluster_size: Option<u64>,

    /// Coordination channel base port
    #[arg(long)]
    coordination_base: Option<u16>,

    /// Query channel base port
    #[arg(long)]
    query_base: Option<u16>,

    /// Host every node listens on
    #[arg(long)]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    // Initialize logging
    init_logging(&config.logging.level);

    run_node(config).await
}

/// Configuration file (or defaults) with command line overrides applied
fn load_config(cli: &Cli) -> Result<ElectConfig> {
    let mut config = match &cli.config {
        Some(path) => ElectConfig::from_file(path)?,
        None => ElectConfig::default(),
    };

    config.node.id = cli.id;
    config.node.bootstrap_leader = cli.leader;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(size) = cli.cluster_size {
        config.cluster.size = size;
    }
    if let Some(base) = cli.coordination_base {
        config.cluster.coordination_base_port = base;
    }
    if let Some(base) = cli.query_base {
        config.cluster.query_base_port = base;
    }
    if let Some(host) = &cli.host {
        config.node.host = host.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Run a node until Ctrl-C
async fn run_node(config: ElectConfig) -> Result<()> {
    tracing::info!(
        "Starting WolfElect node {} ({} members)",
        config.node.id,
        config.member_ids().len()
    );

    let node = match Node::start(config).await {
        Ok(node) => node,
        Err(e) => {
            tracing::error!("Failed to start node: {}", e);
            return Err(e);
        }
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    node.stop().await;

    Ok(())
}

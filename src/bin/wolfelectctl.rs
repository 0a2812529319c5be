//! WolfElectCtl - Command line tool for inspecting WolfElect clusters
//!
//! Usage:
//!   wolfelectctl leader [--node N]   - Ask nodes who the leader is
//!   wolfelectctl status [--node N]   - Probe nodes for their election state
//!   wolfelectctl watch               - Repeat status every second

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use wolfelect::config::ElectConfig;
use wolfelect::network::{Message, NetworkClient};
use wolfelect::query::QueryClient;
use wolfelect::state::{MembershipTable, NodeId};

/// Identifier used by this tool on the coordination channel
const OPERATOR_ID: NodeId = 0;

/// WolfElect Cluster Control Tool
#[derive(Parser)]
#[command(name = "wolfelectctl")]
#[command(about = "Inspect WolfElect clusters", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host the nodes listen on
    #[arg(long)]
    host: Option<String>,

    /// Number of nodes when the membership is derived from base ports
    #[arg(long)]
    cluster_size: Option<u64>,

    /// Coordination channel base port
    #[arg(long)]
    coordination_base: Option<u16>,

    /// Query channel base port
    #[arg(long)]
    query_base: Option<u16>,

    /// Per-node timeout in milliseconds
    #[arg(short, long, default_value_t = 1000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask nodes who the leader is over the query channel
    Leader {
        /// Only ask this node
        #[arg(short, long)]
        node: Option<NodeId>,
    },
    /// Show election state of nodes
    Status {
        /// Only probe this node
        #[arg(short, long)]
        node: Option<NodeId>,
    },
    /// Show status continuously (updates every second, Ctrl+C to exit)
    Watch,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = run(cli).await;
    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let membership = Arc::new(
        MembershipTable::from_config(&config).context("failed to build cluster membership")?,
    );
    let limit = Duration::from_millis(cli.timeout_ms);

    match cli.command {
        Commands::Leader { node } => {
            let targets = select_nodes(&membership, node)?;
            ask_leaders(&config, &membership, &targets, limit).await
        }
        Commands::Status { node } => {
            let targets = select_nodes(&membership, node)?;
            show_status(&membership, &targets, limit).await
        }
        Commands::Watch => watch(&membership, limit).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<ElectConfig> {
    let mut config = match &cli.config {
        Some(path) => ElectConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ElectConfig::default(),
    };

    if let Some(host) = &cli.host {
        config.node.host = host.clone();
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
    Ok(config)
}

fn select_nodes(membership: &MembershipTable, node: Option<NodeId>) -> anyhow::Result<Vec<NodeId>> {
    match node {
        Some(id) if membership.contains(id) => Ok(vec![id]),
        Some(id) => bail!("node {} is not a cluster member", id),
        None => Ok(membership.all_identifiers()),
    }
}

// ============ Commands ============

async fn ask_leaders(
    config: &ElectConfig,
    membership: &MembershipTable,
    targets: &[NodeId],
    limit: Duration,
) -> anyhow::Result<()> {
    let client = QueryClient::new(config.query.encoding);

    for &id in targets {
        let (_, query) = membership.endpoints_for(id)?;
        match client.ask_leader(query, limit).await {
            Ok(Some(leader)) => println!("node {}: leader {}", id, leader),
            Ok(None) => println!("node {}: no leader", id),
            Err(e) => println!("node {}: unreachable ({})", id, e),
        }
    }
    Ok(())
}

async fn show_status(
    membership: &Arc<MembershipTable>,
    targets: &[NodeId],
    limit: Duration,
) -> anyhow::Result<()> {
    let client = NetworkClient::new(Arc::clone(membership), limit, limit);

    println!();
    println!("WolfElect Cluster Status (wolfelectctl v{})", env!("CARGO_PKG_VERSION"));
    println!("==========================================");
    println!();
    println!(
        "{:<8} {:<24} {:<10} {:<10} {:<8} {:<8}",
        "NODE", "COORDINATION", "STATUS", "ROLE", "EPOCH", "LEADER"
    );
    println!("{}", "-".repeat(72));

    for &id in targets {
        let (coordination, _) = membership.endpoints_for(id)?;
        let probe = Message::Probe {
            from: OPERATOR_ID,
            epoch: 0,
        };

        match client.send_to(coordination, &probe).await {
            Ok(Message::ProbeAck {
                epoch, leader, role, ..
            }) => {
                let role_padded = format!("{:<10}", role.to_string());
                let role_colored = if leader == Some(id) {
                    format!("\x1b[1;34m{}\x1b[0m", role_padded) // Bold Blue
                } else {
                    role_padded
                };
                println!(
                    "{:<8} {:<24} \x1b[32m{:<10}\x1b[0m {} {:<8} {:<8}",
                    id,
                    coordination.to_string(),
                    "up",
                    role_colored,
                    epoch,
                    leader.map_or_else(|| "-".to_string(), |l| l.to_string())
                );
            }
            Ok(other) => {
                println!(
                    "{:<8} {:<24} \x1b[33m{:<10}\x1b[0m unexpected {}",
                    id,
                    coordination.to_string(),
                    "error",
                    other.type_name()
                );
            }
            Err(_) => {
                println!(
                    "{:<8} {:<24} \x1b[31m{:<10}\x1b[0m",
                    id,
                    coordination.to_string(),
                    "down"
                );
            }
        }
    }
    println!();

    Ok(())
}

async fn watch(membership: &Arc<MembershipTable>, limit: Duration) -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let targets = membership.all_identifiers();
    while running.load(Ordering::SeqCst) {
        // Clear screen and move cursor to top
        print!("\x1b[H\x1b[J");
        show_status(membership, &targets, limit).await?;
        println!("  Press Ctrl+C to exit");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    Ok(())
}

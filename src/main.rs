//! mmcommit - Three-Phase Commit Coordinator
//!
//! Node daemon: durable log recovery, arbiter transport, peer liveness and
//! the HTTP administration API.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mmcommit::api::{AppState, HttpServer};
use mmcommit::channel::MessageHub;
use mmcommit::commit::{recovery, CommitBarrier};
use mmcommit::config::{CommitConfig, LoggingConfig};
use mmcommit::error::{Error, Result};
use mmcommit::network::{ArbiterClient, ArbiterServer, PeerMonitor};
use mmcommit::state::{ClusterState, NodeId};
use mmcommit::txlog::{DurableLog, SqliteLog};

/// mmcommit - Three-phase commit coordinator for multi-master replication
#[derive(Parser)]
#[command(name = "mmcommit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "mmcommit.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the mmcommit node
    Start,

    /// Check node status
    Status {
        /// Node API address to query
        #[arg(short, long, default_value = "localhost:8080")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "mmcommit.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value_t = 1)]
        node_id: NodeId,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,

    /// Resolve in-doubt transactions of a stopped node
    Resolve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when there is one
    let logging = CommitConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_logging(cli.log_level.as_deref().unwrap_or(&logging.level), &logging);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Status { address } => run_status(address).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Resolve => run_resolve(cli.config).await,
    }
}

/// Initialize logging
fn init_logging(level: &str, logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the mmcommit node
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting mmcommit node...");

    // Load configuration
    let config = match CommitConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    let node_id = config.node.id;
    tracing::info!("Loaded configuration for node: {}", node_id);

    // Open the transaction log and settle what a previous run left open
    let log: Arc<dyn DurableLog> = match SqliteLog::open(config.data_dir()) {
        Ok(l) => Arc::new(l),
        Err(e) => {
            tracing::error!("Failed to open transaction log in {:?}: {}", config.data_dir(), e);
            return Err(e);
        }
    };
    let report = recovery::resolve_in_doubt(node_id, log.as_ref()).await?;
    tracing::info!(
        "Recovery: {} committed, {} aborted, {} waiting for their origin",
        report.committed.len(),
        report.aborted.len(),
        report.pending.len()
    );

    // Cluster state: peers stay disabled until their link comes up
    let cluster = Arc::new(ClusterState::from_config(&config)?);
    let barrier = CommitBarrier::new();
    recovery::enable_node(&cluster, &barrier, node_id).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Arbiter transport
    let hub = MessageHub::new(node_id);
    let (events_tx, events_rx) = mpsc::channel(64);
    let server = Arc::new(ArbiterServer::new(
        node_id,
        config.node.bind_address.clone(),
        hub,
        events_tx,
    ));
    let client = Arc::new(ArbiterClient::new(
        node_id,
        config.peers().map(|p| (p.id, p.address.clone())),
        config.commit.connect_timeout(),
    ));

    let server_handle = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                tracing::error!("Arbiter server error: {}", e);
            }
        })
    };

    spawn_peer_links(&config, Arc::clone(&client), shutdown_rx);
    PeerMonitor::new(Arc::clone(&cluster), barrier.clone()).spawn(events_rx);

    // HTTP API
    if config.api.enabled {
        let state = Arc::new(AppState::new(Arc::clone(&cluster), barrier.clone(), Arc::clone(&log)));
        let http = HttpServer::new(config.api.clone(), state);
        tokio::spawn(async move {
            if let Err(e) = http.start().await {
                tracing::error!("HTTP server error: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    shutdown_tx.send_replace(true);
    server.stop();
    client.close_all().await;
    let _ = server_handle.await;

    tracing::info!("mmcommit node stopped");
    Ok(())
}

/// Keep an outbound link to every peer so it sees this node as connected
fn spawn_peer_links(config: &CommitConfig, client: Arc<ArbiterClient>, mut shutdown: watch::Receiver<bool>) {
    let peers: Vec<NodeId> = config.peers().map(|p| p.id).collect();
    let interval = config.reconnect_interval();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for &peer in &peers {
                        if client.is_connected(peer).await {
                            continue;
                        }
                        if let Err(e) = client.connect(peer).await {
                            tracing::debug!("Node {} unreachable: {}", peer, e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

/// Show node status
async fn run_status(address: String) -> Result<()> {
    let url = format!("http://{}/status", address);

    match reqwest::get(&url).await {
        Ok(response) => {
            let status: serde_json::Value = response
                .json()
                .await
                .map_err(|e| Error::Network(e.to_string()))?;
            let pretty = serde_json::to_string_pretty(&status)
                .map_err(|e| Error::Internal(e.to_string()))?;
            println!("{}", pretty);
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to get status: {}", e);
            Err(Error::Network(e.to_string()))
        }
    }
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: NodeId) -> Result<()> {
    let config_content = format!(r#"# mmcommit Configuration
# Generated configuration file

[node]
id = {node_id}
bind_address = "0.0.0.0:7700"
data_dir = "/var/lib/mmcommit/node-{node_id}"

[cluster]
# Every node of the cluster, this one included
nodes = [
    {{ id = {node_id}, address = "localhost:7700" }},
    # {{ id = 2, address = "node-2.example.com:7700" }},
]
reconnect_interval_ms = 1000

[commit]
abort_on_prepare_drop = true
require_majority = false
connect_timeout_ms = 5000

[api]
enabled = true
bind_address = "0.0.0.0:8080"

[logging]
level = "info"
format = "full"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to list every node of the cluster.");
    println!("Then start with: mmcommit start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match CommitConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Cluster Nodes: {}", config.cluster.nodes.len());
            println!("  Majority Size: {}", config.majority_size());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = CommitConfig::from_file(&config_path)?;

    println!("mmcommit Node Information");
    println!("=========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Data Directory:   {}", config.data_dir().display());
    println!();
    println!("Cluster Configuration:");
    for peer in &config.cluster.nodes {
        println!("  Node {:<3}        {}", peer.id, peer.address);
    }
    println!("  Majority Size:  {}", config.majority_size());
    println!("  Reconnect:      {} ms", config.cluster.reconnect_interval_ms);
    println!();
    println!("Commit Configuration:");
    println!("  Abort on prepare drop: {}", config.commit.abort_on_prepare_drop);
    println!("  Require majority:      {}", config.commit.require_majority);
    println!("  Connect timeout:       {} ms", config.commit.connect_timeout_ms);

    Ok(())
}

/// Resolve in-doubt transactions without starting the node
async fn run_resolve(config_path: PathBuf) -> Result<()> {
    let config = CommitConfig::from_file(&config_path)?;
    let log = SqliteLog::open(config.data_dir())?;

    let report = recovery::resolve_in_doubt(config.node.id, &log).await?;
    println!("Committed: {}", report.committed.len());
    for gid in &report.committed {
        println!("  {}", gid);
    }
    println!("Aborted:   {}", report.aborted.len());
    for gid in &report.aborted {
        println!("  {}", gid);
    }
    println!("Pending:   {}", report.pending.len());
    for gid in &report.pending {
        println!("  {} (waiting for node {})", gid, gid.origin());
    }

    Ok(())
}

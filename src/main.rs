// shardmesh - two-tier distributed object store
//
// A supernode routes client operations across storage clusters; within
// each cluster an elected leader shards uploads across follower nodes and
// replicates every shard to a second location. This binary runs either a
// cluster storage node or the supernode router.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use shardmesh::cli::{Cli, Commands};
use shardmesh::config::Config;
use shardmesh::database::Database;
use shardmesh::file_server::FileServer;
use shardmesh::hybrid_cache::HybridCache;
use shardmesh::leadership::{LeadershipAgent, ManualConsensus};
use shardmesh::load_balancer::LoadPicker;
use shardmesh::logging;
use shardmesh::membership::MembershipTracker;
use shardmesh::metrics::Metrics;
use shardmesh::supernode::SuperNode;
use shardmesh::system_stats::StatsSampler;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load_or_default(cli.config.clone())?;
    logging::init_logging_safe(&config.logging);

    match cli.command {
        Commands::Node {
            addr,
            supernode,
            cluster,
            db_path,
            peer_table,
        } => {
            if let Some(addr) = addr {
                config.network.bind_addr = addr;
            }
            if let Some(supernode) = supernode {
                config.network.supernode_addr = supernode;
            }
            if let Some(cluster) = cluster {
                config.network.cluster_name = cluster;
            }
            if let Some(db_path) = db_path {
                config.storage.db_path = Some(db_path);
            }
            if let Some(peer_table) = peer_table {
                config.network.peer_table = peer_table;
            }
            run_node(config).await
        }
        Commands::Supernode { addr, db_path } => {
            if let Some(addr) = addr {
                config.network.bind_addr = addr;
            }
            if let Some(db_path) = db_path {
                config.storage.db_path = Some(db_path);
            }
            run_supernode(config).await
        }
    }
}

/// Start a cluster storage node: RPC service, membership loop, and the
/// leadership agent.
async fn run_node(config: Config) -> Result<()> {
    let self_addr = config.network.bind_addr.clone();
    let (ip, port) = split_addr(&self_addr)?;

    let metrics = Arc::new(Metrics::new());
    let db = Database::open(&config.db_path()).context("opening local store")?;
    let cache = Arc::new(HybridCache::new(
        config.cache.capacity,
        config.cache.frequency_weight,
        config.cache.recency_weight,
    ));
    metrics.set_cache_capacity(config.cache.capacity as u64);

    let tracker = Arc::new(MembershipTracker::new(
        self_addr.clone(),
        &config.network,
        db.clone(),
        Arc::clone(&metrics),
    ));
    let picker = LoadPicker::new(Arc::clone(&tracker), Arc::clone(&metrics));
    let sampler = Arc::new(StatsSampler::new());

    // The consensus collaborator: a Raft client binds here in multi-node
    // deployments; standalone nodes promote themselves through the agent.
    let consensus = Arc::new(ManualConsensus::new());
    let agent = Arc::new(LeadershipAgent::new(
        db.clone(),
        Arc::clone(&tracker),
        consensus,
        &config.network.supernode_addr,
        config.network.cluster_name.clone(),
        ip,
        port,
        Arc::clone(&metrics),
    ));

    let server = Arc::new(FileServer::new(
        &config,
        self_addr.clone(),
        db,
        cache,
        Arc::clone(&tracker),
        picker,
        sampler,
        metrics,
    ));

    let listener = TcpListener::bind(&self_addr)
        .await
        .with_context(|| format!("binding {}", self_addr))?;
    info!(addr = %self_addr, cluster = %config.network.cluster_name, "starting storage node");

    tokio::spawn(Arc::clone(&tracker).run());
    tokio::spawn(agent.run());
    server.serve(listener).await?;
    Ok(())
}

/// Start the supernode router.
async fn run_supernode(config: Config) -> Result<()> {
    let addr = config.network.bind_addr.clone();
    let metrics = Arc::new(Metrics::new());
    let db = Database::open(&config.db_path()).context("opening local store")?;

    let router = Arc::new(SuperNode::new(
        addr.clone(),
        db,
        config.network.worker_pool_size,
        metrics,
    ));

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(addr = %addr, "starting supernode");
    router.serve(listener).await?;
    Ok(())
}

fn split_addr(addr: &str) -> Result<(String, u16)> {
    let (ip, port) = addr
        .rsplit_once(':')
        .context("bind address must be host:port")?;
    Ok((ip.to_string(), port.parse().context("invalid port")?))
}

/// Command line interface for the shardmesh binary.
///
/// Two roles share the binary: `node` runs a cluster storage node (leader
/// or follower, decided at runtime), `supernode` runs the cross-cluster
/// router. Flags override the corresponding configuration fields.
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Two-tier distributed object store.
#[derive(Parser, Debug, Clone)]
#[command(name = "shardmesh")]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// The role to run
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a cluster storage node
    Node {
        /// Address to bind and announce (host:port)
        #[arg(long)]
        addr: Option<String>,
        /// Supernode address to register leadership with
        #[arg(long)]
        supernode: Option<String>,
        /// Cluster this node belongs to
        #[arg(long)]
        cluster: Option<String>,
        /// Local key-value store path
        #[arg(long)]
        db_path: Option<PathBuf>,
        /// Peer table file listing cluster member addresses
        #[arg(long)]
        peer_table: Option<PathBuf>,
    },
    /// Run the cross-cluster supernode router
    Supernode {
        /// Address to bind (host:port)
        #[arg(long)]
        addr: Option<String>,
        /// Local key-value store path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

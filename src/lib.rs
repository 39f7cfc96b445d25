// ===================================================================================================
// shardmesh - Two-Tier Distributed Object Store
// ===================================================================================================
//
// A supernode routes client operations across storage clusters. Within
// each cluster, one elected leader shards uploaded files across follower
// nodes, replicates every shard to a secondary holder, and serves reads
// from a hybrid recency+frequency cache with fan-out reassembly as the
// fallback. Cluster membership is tracked by periodic probing of a
// configured peer table; leadership comes from a pluggable consensus
// collaborator and is announced to the supernode so routing stays fresh.
//
// ===================================================================================================

// ===== CORE STORAGE AND DATA PLANE =====
pub mod assembly; // Fan-out chunk reads and ordered whole-file reassembly
pub mod database; // sled-backed local key-value store and metadata helpers
pub mod deletion; // Two-phase delete broadcast (chunks, then metadata)
pub mod file_server; // Storage node RPC service and the leader shard pipeline
pub mod hybrid_cache; // Score-based LRU+LFU cache of whole-file artifacts
pub mod metadata; // Shard descriptors and tagged metadata records

// ===== COORDINATION AND ROUTING =====
pub mod leadership; // Consensus contract, primaryStatus upkeep, registration
pub mod load_balancer; // Least-loaded peer selection from heartbeat stats
pub mod membership; // Peer table tracking, channel recycling, liveness probes
pub mod supernode; // Cross-cluster router and entry point

// ===== TRANSPORT =====
pub mod wire; // Framed TCP transport, message types, peer channels

// ===== SYSTEM CONFIGURATION AND OBSERVABILITY =====
pub mod cli; // Command line parsing
pub mod config; // TOML configuration with defaults
pub mod error; // Error types shared across the system
pub mod logging; // Tracing subscriber setup
pub mod metrics; // Process-wide operational counters
pub mod system_stats; // Heartbeat stat sampling

// ===== CONVENIENCE RE-EXPORTS =====

/// Core error and result types
pub use error::{StoreError, StoreResult};

/// Local key-value store handle
pub use database::Database;

/// Leader-side cache
pub use hybrid_cache::HybridCache;

/// Process configuration
pub use config::Config;

//! Operational counters for the storage node and router.
//!
//! A single `Metrics` handle is created at process start and threaded
//! through constructors as `Arc<Metrics>`; there is no global state and no
//! exposition endpoint, only a `snapshot()` for logs and tests.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide metric counters and gauges.
#[derive(Debug, Default)]
pub struct Metrics {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_size: AtomicU64,
    cache_capacity: AtomicU64,
    replication_attempts: AtomicU64,
    replication_successes: AtomicU64,
    replication_failures: AtomicU64,
    metadata_replications: AtomicU64,
    metadata_replication_failures: AtomicU64,
    shards_created: AtomicU64,
    load_balance_decisions: AtomicU64,
    node_failures: AtomicU64,
    node_recoveries: AtomicU64,
    active_nodes: AtomicU64,
    total_nodes: AtomicU64,
    elections: AtomicU64,
    leader_changes: AtomicU64,
    leader_registrations: AtomicU64,
    heartbeat_checks: AtomicU64,
    heartbeat_failures: AtomicU64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_size: u64,
    pub cache_capacity: u64,
    pub replication_attempts: u64,
    pub replication_successes: u64,
    pub replication_failures: u64,
    pub metadata_replications: u64,
    pub metadata_replication_failures: u64,
    pub shards_created: u64,
    pub load_balance_decisions: u64,
    pub node_failures: u64,
    pub node_recoveries: u64,
    pub active_nodes: u64,
    pub total_nodes: u64,
    pub elections: u64,
    pub leader_changes: u64,
    pub leader_registrations: u64,
    pub heartbeat_checks: u64,
    pub heartbeat_failures: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_cache_size(&self, size: u64) {
        self.cache_size.store(size, Ordering::Relaxed);
    }

    pub fn set_cache_capacity(&self, capacity: u64) {
        self.cache_capacity.store(capacity, Ordering::Relaxed);
    }

    pub fn record_replication_attempt(&self) {
        self.replication_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replication_success(&self) {
        self.replication_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replication_failure(&self) {
        self.replication_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_metadata_replication(&self) {
        self.metadata_replications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_metadata_replication_failure(&self) {
        self.metadata_replication_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shard_creation(&self) {
        self.shards_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load_balance_decision(&self) {
        self.load_balance_decisions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_node_failure(&self) {
        self.node_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_node_recovery(&self) {
        self.node_recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active_nodes(&self, count: u64) {
        self.active_nodes.store(count, Ordering::Relaxed);
    }

    pub fn set_total_nodes(&self, count: u64) {
        self.total_nodes.store(count, Ordering::Relaxed);
    }

    pub fn record_election(&self) {
        self.elections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_leader_change(&self) {
        self.leader_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_leader_registration(&self) {
        self.leader_registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat_check(&self) {
        self.heartbeat_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat_failure(&self) {
        self.heartbeat_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters at once.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_size: self.cache_size.load(Ordering::Relaxed),
            cache_capacity: self.cache_capacity.load(Ordering::Relaxed),
            replication_attempts: self.replication_attempts.load(Ordering::Relaxed),
            replication_successes: self.replication_successes.load(Ordering::Relaxed),
            replication_failures: self.replication_failures.load(Ordering::Relaxed),
            metadata_replications: self.metadata_replications.load(Ordering::Relaxed),
            metadata_replication_failures: self
                .metadata_replication_failures
                .load(Ordering::Relaxed),
            shards_created: self.shards_created.load(Ordering::Relaxed),
            load_balance_decisions: self.load_balance_decisions.load(Ordering::Relaxed),
            node_failures: self.node_failures.load(Ordering::Relaxed),
            node_recoveries: self.node_recoveries.load(Ordering::Relaxed),
            active_nodes: self.active_nodes.load(Ordering::Relaxed),
            total_nodes: self.total_nodes.load(Ordering::Relaxed),
            elections: self.elections.load(Ordering::Relaxed),
            leader_changes: self.leader_changes.load(Ordering::Relaxed),
            leader_registrations: self.leader_registrations.load(Ordering::Relaxed),
            heartbeat_checks: self.heartbeat_checks.load(Ordering::Relaxed),
            heartbeat_failures: self.heartbeat_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.set_active_nodes(3);

        let snap = metrics.snapshot();
        assert_eq!(snap.cache_hits, 2);
        assert_eq!(snap.cache_misses, 1);
        assert_eq!(snap.active_nodes, 3);
    }
}

//! Leadership tracking and supernode registration.
//!
//! Consensus itself is a collaborator: anything that can answer "am I the
//! leader", "who is the leader", and expose a change counter plugs in
//! behind the [`Consensus`] trait. This module consumes that contract,
//! maintains the persisted `primaryStatus` flag, and announces the leader
//! to the supernode so the router always has a fresh address per cluster.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::error::StoreResult;
use crate::membership::MembershipTracker;
use crate::metrics::Metrics;
use crate::wire::{ClusterInfo, PeerChannel, Request};

const TICK_PERIOD: Duration = Duration::from_millis(500);
const RECONCILE_EVERY: u64 = 5;
const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Leadership contract provided by the consensus implementation.
pub trait Consensus: Send + Sync {
    /// Whether this node currently holds leadership.
    fn is_leader(&self) -> bool;
    /// Address of the current leader, if any is known.
    fn current_leader(&self) -> Option<String>;
    /// Monotonic counter that advances with consensus activity.
    fn counter(&self) -> u64;
}

/// Externally driven consensus state.
///
/// Serves single-node deployments, where no leader is ever reported and
/// the agent self-promotes, and tests, which flip leadership explicitly.
/// A Raft client binds behind the same trait in multi-node deployments.
#[derive(Debug, Default)]
pub struct ManualConsensus {
    leader: Mutex<Option<String>>,
    is_leader: AtomicBool,
    counter: AtomicU64,
}

impl ManualConsensus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a leadership change observed (or injected) externally.
    pub fn set_leader(&self, leader: Option<String>, is_self: bool) {
        match self.leader.lock() {
            Ok(mut guard) => *guard = leader,
            Err(poisoned) => *poisoned.into_inner() = leader,
        }
        self.is_leader.store(is_self, Ordering::SeqCst);
        self.counter.fetch_add(1, Ordering::SeqCst);
    }
}

impl Consensus for ManualConsensus {
    fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    fn current_leader(&self) -> Option<String> {
        match self.leader.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn counter(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

/// Keeps `primaryStatus` aligned with consensus and the supernode informed.
pub struct LeadershipAgent {
    db: Database,
    tracker: Arc<MembershipTracker>,
    consensus: Arc<dyn Consensus>,
    supernode: PeerChannel,
    metrics: Arc<Metrics>,
    cluster: String,
    ip: String,
    port: u16,
}

impl LeadershipAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        tracker: Arc<MembershipTracker>,
        consensus: Arc<dyn Consensus>,
        supernode_addr: &str,
        cluster: impl Into<String>,
        ip: impl Into<String>,
        port: u16,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            db,
            tracker,
            consensus,
            supernode: PeerChannel::new(supernode_addr),
            metrics,
            cluster: cluster.into(),
            ip: ip.into(),
            port,
        }
    }

    /// Run the leadership loop until the process exits.
    pub async fn run(self: Arc<Self>) {
        // A node that was leader before a restart re-announces itself
        // before the first tick.
        let mut registered = false;
        match self.db.primary_status() {
            Ok(1) => {
                self.register().await;
                registered = true;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not read primary status at startup"),
        }

        let mut ticks: u64 = 0;
        let mut last_counter = self.consensus.counter();
        let mut ticker = tokio::time::interval(TICK_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let counter = self.consensus.counter();
            if counter != last_counter {
                debug!(counter, "consensus advanced");
                last_counter = counter;
            }

            if self.consensus.current_leader().is_none() {
                // Leaderless cluster: the membership count is at least 1
                // (ourselves), so someone must take over.
                if self.tracker.total_active_count() >= 1 && !registered {
                    info!(
                        cluster = %self.cluster,
                        total_active = self.tracker.total_active_count(),
                        "no leader reported, promoting self"
                    );
                    if let Err(e) = self.db.set_primary_status(1) {
                        warn!(error = %e, "failed to persist primary status");
                        continue;
                    }
                    self.register().await;
                    registered = true;
                }
                continue;
            }

            ticks += 1;
            if ticks % RECONCILE_EVERY == 0 {
                if let Err(e) = self.reconcile().await {
                    warn!(error = %e, "leadership reconciliation failed");
                }
            }
        }
    }

    /// Align the persisted `primaryStatus` with what consensus reports.
    ///
    /// A step-down must never re-announce this node: the supernode's
    /// leader record is only ever pushed forward, by whichever node
    /// assumes leadership next.
    async fn reconcile(&self) -> StoreResult<()> {
        let is_leader = self.consensus.is_leader();
        let is_primary = self.db.primary_status()? == 1;

        if is_leader && !is_primary {
            self.db.set_primary_status(1)?;
            self.register().await;
            self.metrics.record_election();
            self.metrics.record_leader_change();
            info!(cluster = %self.cluster, "assumed cluster leadership");
        } else if !is_leader && is_primary {
            self.db.set_primary_status(0)?;
            self.metrics.record_leader_change();
            info!(cluster = %self.cluster, "stepped down from cluster leadership");
        } else if is_leader && is_primary {
            // Idempotent re-announcement so the supernode survives restarts.
            self.register().await;
        }

        Ok(())
    }

    /// Announce this node as the cluster leader to the supernode.
    ///
    /// A transient failure is logged, not retried; the next tick
    /// re-announces anyway.
    async fn register(&self) {
        let request = Request::RegisterLeader(ClusterInfo {
            ip: self.ip.clone(),
            port: self.port,
            cluster: self.cluster.clone(),
        });
        match self.supernode.call_for_ack(request, REGISTER_TIMEOUT).await {
            Ok(ack) if ack.success => {
                debug!(cluster = %self.cluster, supernode = %self.supernode.addr(), "registered as leader");
            }
            Ok(ack) => {
                warn!(cluster = %self.cluster, message = %ack.message, "supernode rejected registration");
            }
            Err(e) => {
                warn!(supernode = %self.supernode.addr(), error = %e, "could not reach supernode");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_consensus_reports_what_was_set() {
        let consensus = ManualConsensus::new();
        assert_eq!(consensus.current_leader(), None);
        assert!(!consensus.is_leader());
        let start = consensus.counter();

        consensus.set_leader(Some("127.0.0.1:7001".into()), true);
        assert_eq!(consensus.current_leader().as_deref(), Some("127.0.0.1:7001"));
        assert!(consensus.is_leader());
        assert!(consensus.counter() > start);

        consensus.set_leader(Some("127.0.0.1:7002".into()), false);
        assert!(!consensus.is_leader());
    }
}

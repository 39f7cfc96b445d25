//! Cluster membership tracking.
//!
//! Keeps the set of configured peer addresses and their channels, and the
//! subset that currently answers a readiness probe. The address list is
//! re-read from the peer table file on every tick, so membership changes
//! are picked up without restarts. The current node never appears in
//! either map; counts that describe the whole cluster add 1 for it, so the
//! total can never be observed as 0 while the process runs.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::database::Database;
use crate::metrics::Metrics;
use crate::wire::PeerChannel;

const TICK_PERIOD: Duration = Duration::from_millis(500);
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Tracks reachable peers and their channels.
pub struct MembershipTracker {
    self_addr: String,
    peer_table: PathBuf,
    peer_table_fallback: PathBuf,
    db: Database,
    metrics: Arc<Metrics>,
    state: Mutex<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    /// One channel per configured peer address (self excluded)
    peers: HashMap<String, PeerChannel>,
    /// Peers that passed the most recent readiness probe
    active: HashMap<String, PeerChannel>,
}

impl MembershipTracker {
    pub fn new(
        self_addr: impl Into<String>,
        network: &NetworkConfig,
        db: Database,
        metrics: Arc<Metrics>,
    ) -> Self {
        let tracker = Self {
            self_addr: self_addr.into(),
            peer_table: network.peer_table.clone(),
            peer_table_fallback: network.peer_table_fallback.clone(),
            db,
            metrics,
            state: Mutex::new(TrackerState::default()),
        };
        // The current node counts from the moment of construction.
        tracker.metrics.set_active_nodes(1);
        tracker
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn self_addr(&self) -> &str {
        &self.self_addr
    }

    /// Snapshot copy of the currently reachable peer channels.
    pub fn get_active_channels(&self) -> HashMap<String, PeerChannel> {
        self.state().active.clone()
    }

    /// Reachable peers, excluding the current node.
    pub fn other_active_count(&self) -> usize {
        self.state().active.len()
    }

    /// Reachable cluster size including the current node; never 0.
    pub fn total_active_count(&self) -> usize {
        self.other_active_count() + 1
    }

    /// Read the configured address list, trying the fallback table when
    /// the primary one is missing.
    pub fn read_peer_table(&self) -> Vec<String> {
        for path in [&self.peer_table, &self.peer_table_fallback] {
            match std::fs::read_to_string(path) {
                Ok(content) => return parse_peer_table(&content),
                Err(_) => continue,
            }
        }
        warn!(
            primary = %self.peer_table.display(),
            fallback = %self.peer_table_fallback.display(),
            "no peer table found"
        );
        Vec::new()
    }

    /// Run the membership loop until the process exits.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(TICK_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.refresh_once().await;
        }
    }

    /// One membership tick: re-read the table, recycle channels, probe.
    pub async fn refresh_once(&self) {
        let addrs = self.read_peer_table();
        self.metrics.set_total_nodes(addrs.len() as u64);

        let to_probe: Vec<(String, PeerChannel)> = {
            let mut state = self.state();
            self.sync_channels_locked(&mut state, &addrs);
            state
                .peers
                .iter()
                .map(|(addr, channel)| (addr.clone(), channel.clone()))
                .collect()
        };

        // Probes may take the full timeout each; they run outside the lock
        // and their results are merged afterwards.
        let probes = to_probe.into_iter().map(|(addr, channel)| async move {
            self.metrics.record_heartbeat_check();
            let alive = channel.is_ready(PROBE_TIMEOUT).await;
            if !alive {
                self.metrics.record_heartbeat_failure();
            }
            (addr, alive)
        });
        let results = join_all(probes).await;

        let (before, after) = {
            let mut state = self.state();
            let before = state.active.len();
            for (addr, alive) in results {
                if alive {
                    if !state.active.contains_key(&addr) {
                        if let Some(channel) = state.peers.get(&addr).cloned() {
                            state.active.insert(addr, channel);
                        }
                    }
                } else {
                    state.active.remove(&addr);
                }
            }
            (before, state.active.len())
        };

        self.metrics.set_active_nodes((after + 1) as u64);
        if before != after {
            info!(
                previous = before + 1,
                current = after + 1,
                "active membership changed"
            );
            if after < before {
                self.metrics.record_node_failure();
            } else {
                self.metrics.record_node_recovery();
            }
        }

        if let Err(e) = self.db.set_ip_addresses(&addrs) {
            debug!(error = %e, "failed to persist membership snapshot");
        }
    }

    /// Reconcile the channel maps with the configured address list,
    /// keeping channels for addresses that remain and dropping channels
    /// whose address left. Must run under the tracker lock.
    fn sync_channels_locked(&self, state: &mut TrackerState, addrs: &[String]) {
        let desired: HashSet<String> = addrs
            .iter()
            .filter(|addr| **addr != self.self_addr)
            .cloned()
            .collect();

        state.peers.retain(|addr, _| desired.contains(addr));
        state.active.retain(|addr, _| desired.contains(addr));
        for addr in desired {
            if !state.peers.contains_key(&addr) {
                debug!(peer = %addr, "opening channel to new peer");
                let channel = PeerChannel::new(addr.clone());
                state.peers.insert(addr, channel);
            }
        }
    }
}

/// Parse a line-oriented peer table: one address per line, `#` comment
/// lines ignored, only the first whitespace-delimited token counts.
pub fn parse_peer_table(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_whitespace().next())
        .map(|token| token.to_string())
        .collect()
}

//! Load-aware shard placement.
//!
//! Each placement decision polls the heartbeat stats of every reachable
//! peer and picks the two least-loaded ones: the first receives the shard,
//! the second its replica. Peers that fail or miss the probe deadline are
//! skipped for that decision only.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::membership::MembershipTracker;
use crate::metrics::Metrics;
use crate::wire::{Request, Response};

const STAT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Target nodes for one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub primary: String,
    pub replica: Option<String>,
}

/// Picks the least-loaded peers for shard placement.
pub struct LoadPicker {
    tracker: Arc<MembershipTracker>,
    metrics: Arc<Metrics>,
}

impl LoadPicker {
    pub fn new(tracker: Arc<MembershipTracker>, metrics: Arc<Metrics>) -> Self {
        Self { tracker, metrics }
    }

    /// The two least-loaded reachable peers, or `None` when no peer
    /// answered its stats probe.
    pub async fn least_loaded(&self) -> Option<Placement> {
        let active = self.tracker.get_active_channels();
        let mut scored = Vec::with_capacity(active.len());

        for (addr, channel) in active {
            match channel.call_unary(Request::IsAlive, STAT_PROBE_TIMEOUT).await {
                Ok(Response::Stats(stats)) => {
                    let score = (stats.cpu + stats.disk + stats.mem) / 3.0;
                    scored.push((addr, score));
                }
                Ok(other) => {
                    debug!(peer = %addr, reply = ?other, "unexpected heartbeat reply");
                }
                Err(e) => {
                    debug!(peer = %addr, error = %e, "heartbeat probe failed");
                }
            }
        }

        let placement = pick_two(scored);
        if placement.is_some() {
            self.metrics.record_load_balance_decision();
        }
        placement
    }
}

/// Fold scored peers into the two minima. Ties keep the earlier entry.
pub(crate) fn pick_two(scored: Vec<(String, f64)>) -> Option<Placement> {
    let mut min1: Option<(String, f64)> = None;
    let mut min2: Option<(String, f64)> = None;

    for (addr, score) in scored {
        match &min1 {
            None => min1 = Some((addr, score)),
            Some((_, best)) if score < *best => {
                min2 = min1.take();
                min1 = Some((addr, score));
            }
            Some(_) => match &min2 {
                None => min2 = Some((addr, score)),
                Some((_, second)) if score < *second => min2 = Some((addr, score)),
                Some(_) => {}
            },
        }
    }

    min1.map(|(primary, _)| Placement {
        primary,
        replica: min2.map(|(addr, _)| addr),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(entries: &[(&str, f64)]) -> Vec<(String, f64)> {
        entries
            .iter()
            .map(|(addr, score)| (addr.to_string(), *score))
            .collect()
    }

    #[test]
    fn no_peers_means_no_placement() {
        assert_eq!(pick_two(Vec::new()), None);
    }

    #[test]
    fn single_peer_has_no_replica() {
        let placement = pick_two(scored(&[("a:1", 40.0)])).unwrap();
        assert_eq!(placement.primary, "a:1");
        assert_eq!(placement.replica, None);
    }

    #[test]
    fn two_minima_are_selected_in_order() {
        let placement = pick_two(scored(&[
            ("a:1", 60.0),
            ("b:1", 10.0),
            ("c:1", 30.0),
            ("d:1", 90.0),
        ]))
        .unwrap();
        assert_eq!(placement.primary, "b:1");
        assert_eq!(placement.replica.as_deref(), Some("c:1"));
    }

    #[test]
    fn ties_keep_the_first_reply() {
        let placement = pick_two(scored(&[("a:1", 20.0), ("b:1", 20.0), ("c:1", 20.0)])).unwrap();
        assert_eq!(placement.primary, "a:1");
        assert_eq!(placement.replica.as_deref(), Some("b:1"));
    }
}

//! Hybrid recency + frequency file cache.
//!
//! The leader keeps recently downloaded files on disk and tracks, per
//! entry, an access counter and a last-access timestamp. Eviction removes
//! the entry with the lowest combined score:
//!
//! ```text
//! score = frequency_weight * freq_score + recency_weight * rec_score
//! ```
//!
//! `freq_score` is log-normalized against the hottest entry so one very
//! popular file cannot flatten everything else; `rec_score` holds at 1.0
//! for five minutes, declines linearly to 0.7 at thirty minutes, then
//! decays exponentially. Victims are found through a min-heap that is
//! rebuilt lazily: accesses only mark it dirty, and a popped candidate is
//! re-verified against a fresh score before it is actually evicted.
//!
//! Values are paths of on-disk artifacts owned jointly with the entry:
//! whenever an entry leaves the cache, its file is removed as well.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Tolerance when comparing a heap entry's score to a fresh one.
const SCORE_EPSILON: f64 = 0.0001;

/// Aggregate cache statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub avg_frequency: f64,
    pub avg_recency_score: f64,
    pub avg_cache_score: f64,
}

#[derive(Debug)]
struct HeapEntry {
    score: f64,
    key: String,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.score.total_cmp(&other.score).is_eq() && self.key == other.key
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.key.cmp(&other.key))
    }
}

struct CacheState {
    entries: HashMap<String, PathBuf>,
    frequency: HashMap<String, u64>,
    recency: HashMap<String, f64>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    heap_dirty: bool,
    frequency_weight: f64,
    recency_weight: f64,
}

/// Thread-safe hybrid cache of whole-file artifacts.
pub struct HybridCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

impl HybridCache {
    pub fn new(capacity: usize, frequency_weight: f64, recency_weight: f64) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                frequency: HashMap::new(),
                recency: HashMap::new(),
                heap: BinaryHeap::new(),
                heap_dirty: true,
                frequency_weight,
                recency_weight,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Membership check; does not touch frequency or recency.
    pub fn contains(&self, key: &str) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Look up an entry, counting the access.
    pub fn get(&self, key: &str) -> Option<PathBuf> {
        let mut state = self.lock();
        if !state.entries.contains_key(key) {
            return None;
        }
        state.touch(key, now_secs());
        state.entries.get(key).cloned()
    }

    /// Insert or update an entry, evicting the lowest-score entry first
    /// when the cache is full.
    pub fn set(&self, key: &str, value: PathBuf) {
        let now = now_secs();
        let mut state = self.lock();

        if state.entries.contains_key(key) {
            state.entries.insert(key.to_string(), value);
            state.touch(key, now);
            return;
        }

        if state.entries.len() >= self.capacity {
            state.evict_lowest(now);
        }

        state.entries.insert(key.to_string(), value);
        state.frequency.insert(key.to_string(), 1);
        state.recency.insert(key.to_string(), now);
        state.heap_dirty = true;
    }

    /// Remove an entry and its on-disk artifact.
    pub fn del(&self, key: &str) {
        self.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        let size = state.entries.len();
        if size == 0 {
            return CacheStats {
                size: 0,
                capacity: self.capacity,
                avg_frequency: 0.0,
                avg_recency_score: 0.0,
                avg_cache_score: 0.0,
            };
        }

        let now = now_secs();
        let avg_frequency =
            state.frequency.values().sum::<u64>() as f64 / state.frequency.len() as f64;
        let avg_recency_score = state
            .recency
            .values()
            .map(|last| recency_score(now - last))
            .sum::<f64>()
            / state.recency.len() as f64;
        let max_freq = state.max_frequency();
        let avg_cache_score = state
            .entries
            .keys()
            .map(|key| state.score_with_max(key, now, max_freq))
            .sum::<f64>()
            / size as f64;

        CacheStats {
            size,
            capacity: self.capacity,
            avg_frequency,
            avg_recency_score,
            avg_cache_score,
        }
    }
}

impl CacheState {
    fn max_frequency(&self) -> u64 {
        self.frequency.values().copied().max().unwrap_or(0)
    }

    fn score_with_max(&self, key: &str, now: f64, max_freq: u64) -> f64 {
        match (self.frequency.get(key), self.recency.get(key)) {
            (Some(freq), Some(last)) => {
                self.frequency_weight * freq_score(*freq, max_freq)
                    + self.recency_weight * recency_score(now - last)
            }
            _ => 0.0,
        }
    }

    fn score(&self, key: &str, now: f64) -> f64 {
        self.score_with_max(key, now, self.max_frequency())
    }

    fn touch(&mut self, key: &str, now: f64) {
        *self.frequency.entry(key.to_string()).or_insert(0) += 1;
        self.recency.insert(key.to_string(), now);
        self.heap_dirty = true;
    }

    fn remove(&mut self, key: &str) {
        if let Some(path) = self.entries.remove(key) {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!(key, path = %path.display(), error = %e, "cache artifact removal failed");
            }
        }
        self.frequency.remove(key);
        self.recency.remove(key);
        self.heap_dirty = true;
    }

    fn rebuild_heap(&mut self, now: f64) {
        let max_freq = self.max_frequency();
        let scored: Vec<(String, f64)> = self
            .entries
            .keys()
            .map(|key| (key.clone(), self.score_with_max(key, now, max_freq)))
            .collect();
        self.heap.clear();
        for (key, score) in scored {
            self.heap.push(Reverse(HeapEntry { score, key }));
        }
        self.heap_dirty = false;
    }

    /// Evict the entry with the lowest score. Always evicts something
    /// when the cache is non-empty.
    fn evict_lowest(&mut self, now: f64) {
        if self.entries.is_empty() {
            return;
        }
        if self.heap_dirty || self.heap.is_empty() {
            self.rebuild_heap(now);
        }

        let max_iterations = self.entries.len() * 2;
        let mut iterations = 0;
        while let Some(Reverse(candidate)) = self.heap.pop() {
            iterations += 1;
            if self.entries.contains_key(&candidate.key) {
                let current = self.score(&candidate.key, now);
                if (current - candidate.score).abs() < SCORE_EPSILON {
                    self.remove(&candidate.key);
                    return;
                }
                // The score drifted since the heap was built; requeue with
                // the fresh value and keep looking.
                self.heap.push(Reverse(HeapEntry {
                    score: current,
                    key: candidate.key,
                }));
            }
            if iterations >= max_iterations {
                break;
            }
        }

        // Stale heap or iteration bound reached: full scan.
        let max_freq = self.max_frequency();
        let victim = self
            .entries
            .keys()
            .map(|key| (key.clone(), self.score_with_max(key, now, max_freq)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(key, _)| key);
        if let Some(key) = victim {
            self.remove(&key);
        }
        self.heap_dirty = true;
    }
}

/// Log-normalized frequency component in `[0, 1]`.
pub(crate) fn freq_score(freq: u64, max_freq: u64) -> f64 {
    if max_freq <= 1 {
        if freq > 0 {
            1.0
        } else {
            0.0
        }
    } else {
        ((1 + freq) as f64).ln() / ((1 + max_freq) as f64).ln()
    }
}

/// Piecewise recency component in `[0, 1]` for a given seconds-since-access.
pub(crate) fn recency_score(delta: f64) -> f64 {
    let delta = delta.max(0.0);
    let score = if delta <= 300.0 {
        1.0
    } else if delta <= 1800.0 {
        1.0 - ((delta - 300.0) / 1500.0) * 0.3
    } else {
        0.7 * (-(delta - 1800.0) / 3600.0).exp()
    };
    score.max(0.0)
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

//! Heartbeat stat sampling.
//!
//! `IsAlive` replies carry the (cpu, disk, mem) triple the load picker and
//! the router's cluster stats both average over.

use std::sync::Mutex;

use sysinfo::{CpuExt, DiskExt, System, SystemExt};

use crate::wire::NodeStats;

/// Samples the local machine's utilization for heartbeat replies.
#[derive(Debug)]
pub struct StatsSampler {
    sys: Mutex<System>,
}

impl StatsSampler {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new_all()),
        }
    }

    /// Current utilization percentages.
    pub fn sample(&self) -> NodeStats {
        let mut sys = match self.sys.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sys.refresh_cpu();
        sys.refresh_memory();
        sys.refresh_disks();

        let cpu = sys.global_cpu_info().cpu_usage() as f64;

        let total_mem = sys.total_memory();
        let mem = if total_mem > 0 {
            sys.used_memory() as f64 / total_mem as f64 * 100.0
        } else {
            0.0
        };

        let (mut disk_total, mut disk_free) = (0u64, 0u64);
        for disk in sys.disks() {
            disk_total += disk.total_space();
            disk_free += disk.available_space();
        }
        let disk = if disk_total > 0 {
            (disk_total - disk_free) as f64 / disk_total as f64 * 100.0
        } else {
            0.0
        };

        NodeStats { cpu, disk, mem }
    }
}

impl Default for StatsSampler {
    fn default() -> Self {
        Self::new()
    }
}

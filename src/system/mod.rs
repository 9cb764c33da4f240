//! Host resource sampling
//!
//! Two consumers: the streamer's memory gate before accepting a transfer,
//! and the periodic device update sent to the signaling service.

use crate::config::StoragePathConfig;
use crate::storage;
use serde::Serialize;
use sysinfo::System;

/// Free-RAM floor below which new transfers are refused, percent of total
pub const MIN_FREE_MEMORY_PERCENT: u64 = 15;

/// Point-in-time memory numbers
#[derive(Debug, Clone, Copy)]
pub struct MemoryStatus {
    pub available: u64,
    pub total: u64,
}

impl MemoryStatus {
    /// Sample current memory state
    pub fn sample() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        Self {
            available: sys.available_memory(),
            total: sys.total_memory(),
        }
    }

    /// True when free RAM has dropped under the configured floor
    pub fn under_pressure(&self) -> bool {
        if self.total == 0 {
            return false;
        }
        self.available * 100 < self.total * MIN_FREE_MEMORY_PERCENT
    }
}

/// Capacity numbers for one storage path, as reported to the service
#[derive(Debug, Clone, Serialize)]
pub struct StorageReport {
    pub path: String,
    pub available: u64,
    pub total: u64,
}

/// Aggregate device stats shipped in the periodic device update
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub cpu_percent: f32,
    pub free_memory: u64,
    pub total_memory: u64,
    pub storage: Vec<StorageReport>,
}

impl DeviceSnapshot {
    /// Collect CPU, memory, and per-path storage capacity
    pub fn collect(paths: &[StoragePathConfig]) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu_usage();

        let storage = paths
            .iter()
            .filter_map(|entry| match storage::probe::volume_stats(&entry.path) {
                Ok(stats) => Some(StorageReport {
                    path: entry.path.display().to_string(),
                    available: storage::apply_threshold(
                        stats.available,
                        stats.total,
                        entry.threshold,
                    ),
                    total: stats.total,
                }),
                Err(err) => {
                    tracing::warn!(path = %entry.path.display(), %err, "storage probe failed");
                    None
                }
            })
            .collect();

        Self {
            cpu_percent: sys.global_cpu_usage(),
            free_memory: sys.available_memory(),
            total_memory: sys.total_memory(),
            storage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sample_is_sane() {
        let mem = MemoryStatus::sample();
        assert!(mem.total > 0);
        assert!(mem.available <= mem.total);
    }

    #[test]
    fn test_pressure_threshold() {
        let ok = MemoryStatus {
            available: 20,
            total: 100,
        };
        assert!(!ok.under_pressure());

        let low = MemoryStatus {
            available: 14,
            total: 100,
        };
        assert!(low.under_pressure());

        // Degenerate total never reports pressure
        let zero = MemoryStatus {
            available: 0,
            total: 0,
        };
        assert!(!zero.under_pressure());
    }

    #[test]
    fn test_snapshot_with_no_paths() {
        let snapshot = DeviceSnapshot::collect(&[]);
        assert!(snapshot.storage.is_empty());
        assert!(snapshot.total_memory > 0);
    }
}

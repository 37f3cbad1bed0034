//! Host resource counters consulted by the move heuristics

use parking_lot::RwLock;
use spanstore_common::{GB, ResourceScores};

/// Page faults per second above which the host counts as swapping
pub const MAJOR_PAGE_FAULTS_THRESHOLD: f64 = 20.0;

/// Free space in the data directory below which shards should be shed
pub const DATA_DIR_FREE_THRESHOLD: u64 = 5 * GB;

/// Free space below which the node is critically short of disk
pub const DATA_DIR_FREE_CRITICAL: u64 = GB / 2;

/// Source of host resource usage
pub trait HostCounters: Send + Sync {
    fn resource_scores(&self) -> ResourceScores;
}

/// Host counters reported explicitly
pub struct StaticHostCounters {
    scores: RwLock<ResourceScores>,
}

impl Default for StaticHostCounters {
    fn default() -> Self {
        Self::new(ResourceScores {
            percent_cpu_time: 0.0,
            major_page_faults_per_sec: 0.0,
            data_dir_bytes_free: 100 * GB,
        })
    }
}

impl StaticHostCounters {
    #[must_use]
    pub const fn new(scores: ResourceScores) -> Self {
        Self {
            scores: RwLock::new(scores),
        }
    }

    pub fn set(&self, scores: ResourceScores) {
        *self.scores.write() = scores;
    }

    pub fn set_cpu(&self, percent_cpu_time: f64) {
        self.scores.write().percent_cpu_time = percent_cpu_time;
    }
}

impl HostCounters for StaticHostCounters {
    fn resource_scores(&self) -> ResourceScores {
        *self.scores.read()
    }
}

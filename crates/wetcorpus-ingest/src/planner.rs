//! Workload planning
//!
//! Decides how many segments a batch needs so that the requested corpus size
//! is reachable under a conservative per-segment size estimate.

use crate::config::CrawlMode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};
use wetcorpus_common::{CorpusError, Result};

/// Upper bound (MB) assumed for one WET segment
pub const DEFAULT_SEGMENT_ESTIMATE_MB: u64 = 300;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Validated `(unit_count, target)` pair for one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadPlan {
    pub mode: CrawlMode,
    pub unit_count: u64,
    pub target_total_mb: u64,
    pub per_unit_estimate_mb: u64,
    /// Whether `unit_count` was recomputed from the target
    pub rebalanced: bool,
}

impl WorkloadPlan {
    pub fn target_bytes(&self) -> u64 {
        self.target_total_mb.saturating_mul(BYTES_PER_MB)
    }

    /// Upper bound of data the planned segments can deliver
    pub fn capacity_mb(&self) -> u64 {
        self.unit_count.saturating_mul(self.per_unit_estimate_mb)
    }
}

#[derive(Debug, Clone)]
pub struct WorkloadPlanner {
    per_unit_estimate_mb: u64,
    supported_modes: HashSet<CrawlMode>,
}

impl Default for WorkloadPlanner {
    fn default() -> Self {
        Self {
            per_unit_estimate_mb: DEFAULT_SEGMENT_ESTIMATE_MB,
            supported_modes: HashSet::from([CrawlMode::Immediate]),
        }
    }
}

impl WorkloadPlanner {
    pub fn new(
        per_unit_estimate_mb: u64,
        supported_modes: impl IntoIterator<Item = CrawlMode>,
    ) -> Result<Self> {
        if per_unit_estimate_mb == 0 {
            return Err(CorpusError::config("Segment size estimate must be greater than 0"));
        }
        let supported_modes: HashSet<_> = supported_modes.into_iter().collect();
        if supported_modes.is_empty() {
            return Err(CorpusError::config("Planner needs at least one supported mode"));
        }
        Ok(Self {
            per_unit_estimate_mb,
            supported_modes,
        })
    }

    pub fn per_unit_estimate_mb(&self) -> u64 {
        self.per_unit_estimate_mb
    }

    pub fn supports(&self, mode: CrawlMode) -> bool {
        self.supported_modes.contains(&mode)
    }

    /// Check `unit_count * estimate >= target_size_mb`, raising `unit_count`
    /// to `ceil(target / estimate)` when it does not hold.
    pub fn validate(&self, mode: CrawlMode, unit_count: u64, target_size_mb: u64) -> Result<WorkloadPlan> {
        if !self.supports(mode) {
            let mut supported: Vec<String> = self.supported_modes.iter().map(|m| m.to_string()).collect();
            supported.sort();
            return Err(CorpusError::config(format!(
                "Crawl mode '{}' is not supported (supported: {})",
                mode,
                supported.join(", ")
            )));
        }

        let estimate = self.per_unit_estimate_mb;
        let capacity = unit_count.saturating_mul(estimate);

        if capacity >= target_size_mb {
            debug!(unit_count, target_size_mb, capacity, "Workload plan is consistent");
            return Ok(WorkloadPlan {
                mode,
                unit_count,
                target_total_mb: target_size_mb,
                per_unit_estimate_mb: estimate,
                rebalanced: false,
            });
        }

        // capacity < target implies target >= 1, so this is at least one unit
        let rebalanced = target_size_mb.div_ceil(estimate);

        warn!(
            requested_units = unit_count,
            target_size_mb,
            estimate_mb = estimate,
            units = rebalanced,
            "Requested segment count cannot reach the target size, rebalancing"
        );

        Ok(WorkloadPlan {
            mode,
            unit_count: rebalanced,
            target_total_mb: target_size_mb,
            per_unit_estimate_mb: estimate,
            rebalanced: true,
        })
    }
}

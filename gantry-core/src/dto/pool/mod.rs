//! Pool DTOs
//!
//! Aggregate pool view pushed on the status channel.

use serde::{Deserialize, Serialize};

/// Summary of a pool's current occupancy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSummary {
    pub repository: String,
    pub dedicated_count: u32,
    pub dynamic_count: u32,
    pub dynamic_ceiling: u32,
    pub busy: u32,
    pub idle: u32,
}

impl PoolSummary {
    /// Fraction of live runners currently busy (0.0 when the pool is empty)
    pub fn utilization(&self) -> f64 {
        let live = self.busy + self.idle;
        if live == 0 {
            return 0.0;
        }
        self.busy as f64 / live as f64
    }
}

//! Repository pool domain types
//!
//! A pool is the set of runner instances (dedicated + dynamic) serving one
//! source repository, together with the limits that govern how the fleet
//! scales it.

use serde::{Deserialize, Serialize};

/// A repository's runner pool definition
///
/// Structure shared between the registry (persists) and the scaling
/// engine (decides). Counts of live instances are derived from the
/// registry's instance records, never stored here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryPool {
    /// Repository this pool serves (e.g., "acme/widget")
    pub repository: String,

    /// Number of always-on dedicated runners, never reaped by scaling
    pub dedicated_count: u32,

    /// Maximum number of dynamic runners that may exist at once
    pub dynamic_ceiling: u32,

    /// Busy fraction at which the pool scales up (1.0 = all runners busy)
    pub scale_up_threshold: f64,

    /// How long a dynamic runner may sit idle before it is reaped
    pub idle_timeout_seconds: u64,

    /// Minimum time between consecutive scaling actions on this pool
    pub cooldown_seconds: u64,

    /// Capability labels granted to every runner in this pool
    pub labels: Vec<String>,

    /// Job types this pool refuses to run
    pub blocked_job_types: Vec<String>,
}

impl RepositoryPool {
    /// Idle timeout as a chrono duration for timestamp arithmetic
    pub fn idle_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_timeout_seconds as i64)
    }

    /// Cooldown window as a chrono duration
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_seconds as i64)
    }

    /// Checks whether this pool accepts a given job type
    pub fn accepts_job_type(&self, job_type: &str) -> bool {
        !self.blocked_job_types.iter().any(|t| t == job_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> RepositoryPool {
        RepositoryPool {
            repository: "acme/widget".to_string(),
            dedicated_count: 1,
            dynamic_ceiling: 3,
            scale_up_threshold: 1.0,
            idle_timeout_seconds: 300,
            cooldown_seconds: 60,
            labels: vec!["linux".to_string()],
            blocked_job_types: vec!["deploy".to_string()],
        }
    }

    #[test]
    fn test_accepts_job_type() {
        let pool = pool();
        assert!(pool.accepts_job_type("build"));
        assert!(!pool.accepts_job_type("deploy"));
    }

    #[test]
    fn test_durations() {
        let pool = pool();
        assert_eq!(pool.idle_timeout(), chrono::Duration::minutes(5));
        assert_eq!(pool.cooldown(), chrono::Duration::minutes(1));
    }
}

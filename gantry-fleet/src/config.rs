//! Fleet configuration
//!
//! Defines all configurable parameters for the fleet manager: platform
//! connection, persistence, control-loop intervals, credential refresh
//! policy, and the per-pool definitions loaded from a JSON file.

use gantry_core::domain::pool::RepositoryPool;
use serde::Deserialize;
use std::time::Duration;

/// Fleet manager configuration
///
/// All timeouts and intervals are configurable to allow tuning for
/// different deployment scenarios (dev vs prod, small vs large fleets).
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// CI platform base URL (e.g., "https://ci.example.com")
    pub platform_url: String,

    /// API token authenticating the fleet manager to the platform
    pub platform_token: String,

    /// Postgres URL for the durable registry store; in-memory when unset
    pub database_url: Option<String>,

    /// Container image every runner is started from
    pub runner_image: String,

    /// Path to the JSON file defining the pools
    pub pools_file: String,

    /// How often the scaling engine evaluates each pool
    pub scaling_interval: Duration,

    /// How often the platform queue is polled for jobs
    pub queue_poll_interval: Duration,

    /// How often the health supervisor sweeps each pool
    pub heartbeat_interval: Duration,

    /// Consecutive missed heartbeats before a runner is unhealthy
    pub heartbeat_miss_threshold: u32,

    /// Fraction of a credential's TTL consumed before proactive refresh
    pub refresh_fraction: f64,

    /// Refresh attempts before forcing re-registration
    pub refresh_max_attempts: u32,

    /// Failed recovery attempts before an instance is quarantined
    pub recovery_max_attempts: u32,
}

impl FleetConfig {
    /// Creates a new configuration with defaults
    pub fn new(platform_url: String, platform_token: String) -> Self {
        Self {
            platform_url,
            platform_token,
            database_url: None,
            runner_image: "ghcr.io/gantry/runner:latest".to_string(),
            pools_file: "pools.json".to_string(),
            scaling_interval: Duration::from_secs(30),
            queue_poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_miss_threshold: 2,
            refresh_fraction: 0.75,
            refresh_max_attempts: 3,
            recovery_max_attempts: 2,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - GANTRY_PLATFORM_URL (required)
    /// - GANTRY_PLATFORM_TOKEN (required)
    /// - GANTRY_DATABASE_URL (optional; in-memory state when unset)
    /// - GANTRY_RUNNER_IMAGE (optional)
    /// - GANTRY_POOLS_FILE (optional, default: pools.json)
    /// - GANTRY_SCALING_INTERVAL (optional, seconds, default: 30)
    /// - GANTRY_QUEUE_POLL_INTERVAL (optional, seconds, default: 5)
    /// - GANTRY_HEARTBEAT_INTERVAL (optional, seconds, default: 30)
    /// - GANTRY_HEARTBEAT_MISS_THRESHOLD (optional, default: 2)
    /// - GANTRY_REFRESH_FRACTION (optional, default: 0.75)
    /// - GANTRY_REFRESH_MAX_ATTEMPTS (optional, default: 3)
    /// - GANTRY_RECOVERY_MAX_ATTEMPTS (optional, default: 2)
    pub fn from_env() -> anyhow::Result<Self> {
        let platform_url = std::env::var("GANTRY_PLATFORM_URL")
            .map_err(|_| anyhow::anyhow!("GANTRY_PLATFORM_URL environment variable not set"))?;

        let platform_token = std::env::var("GANTRY_PLATFORM_TOKEN")
            .map_err(|_| anyhow::anyhow!("GANTRY_PLATFORM_TOKEN environment variable not set"))?;

        let mut config = Self::new(platform_url, platform_token);

        config.database_url = std::env::var("GANTRY_DATABASE_URL").ok();

        if let Ok(image) = std::env::var("GANTRY_RUNNER_IMAGE") {
            config.runner_image = image;
        }

        if let Ok(path) = std::env::var("GANTRY_POOLS_FILE") {
            config.pools_file = path;
        }

        config.scaling_interval = env_seconds("GANTRY_SCALING_INTERVAL", 30);
        config.queue_poll_interval = env_seconds("GANTRY_QUEUE_POLL_INTERVAL", 5);
        config.heartbeat_interval = env_seconds("GANTRY_HEARTBEAT_INTERVAL", 30);

        config.heartbeat_miss_threshold = env_parse("GANTRY_HEARTBEAT_MISS_THRESHOLD", 2);
        config.refresh_fraction = env_parse("GANTRY_REFRESH_FRACTION", 0.75);
        config.refresh_max_attempts = env_parse("GANTRY_REFRESH_MAX_ATTEMPTS", 3);
        config.recovery_max_attempts = env_parse("GANTRY_RECOVERY_MAX_ATTEMPTS", 2);

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.platform_url.starts_with("http://") && !self.platform_url.starts_with("https://") {
            anyhow::bail!("platform_url must start with http:// or https://");
        }

        if self.platform_token.is_empty() {
            anyhow::bail!("platform_token cannot be empty");
        }

        if self.runner_image.is_empty() {
            anyhow::bail!("runner_image cannot be empty");
        }

        if self.scaling_interval.as_secs() == 0 {
            anyhow::bail!("scaling_interval must be greater than 0");
        }

        if self.queue_poll_interval.as_secs() == 0 {
            anyhow::bail!("queue_poll_interval must be greater than 0");
        }

        if self.heartbeat_interval.as_secs() == 0 {
            anyhow::bail!("heartbeat_interval must be greater than 0");
        }

        // One missed heartbeat must never trigger recovery; transient blips
        // are expected.
        if self.heartbeat_miss_threshold < 2 {
            anyhow::bail!("heartbeat_miss_threshold must be at least 2");
        }

        if !(self.refresh_fraction > 0.0 && self.refresh_fraction < 1.0) {
            anyhow::bail!("refresh_fraction must be strictly between 0 and 1");
        }

        if self.refresh_max_attempts == 0 {
            anyhow::bail!("refresh_max_attempts must be at least 1");
        }

        if self.recovery_max_attempts == 0 {
            anyhow::bail!("recovery_max_attempts must be at least 1");
        }

        Ok(())
    }

    /// Loads the pool definitions from the configured JSON file
    pub fn load_pools(&self) -> anyhow::Result<Vec<RepositoryPool>> {
        let raw = std::fs::read_to_string(&self.pools_file).map_err(|e| {
            anyhow::anyhow!("failed to read pools file {}: {}", self.pools_file, e)
        })?;
        parse_pools(&raw)
    }
}

fn env_seconds(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(name)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(default),
    )
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

/// One pool definition as written in the pools file
#[derive(Debug, Deserialize)]
struct PoolFileEntry {
    repository: String,
    #[serde(default = "default_dedicated")]
    dedicated_count: u32,
    #[serde(default = "default_ceiling")]
    dynamic_ceiling: u32,
    #[serde(default = "default_threshold")]
    scale_up_threshold: f64,
    #[serde(default = "default_idle_timeout")]
    idle_timeout_seconds: u64,
    #[serde(default = "default_cooldown")]
    cooldown_seconds: u64,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    blocked_job_types: Vec<String>,
}

fn default_dedicated() -> u32 {
    1
}
fn default_ceiling() -> u32 {
    3
}
fn default_threshold() -> f64 {
    1.0
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_cooldown() -> u64 {
    60
}

fn parse_pools(raw: &str) -> anyhow::Result<Vec<RepositoryPool>> {
    let entries: Vec<PoolFileEntry> =
        serde_json::from_str(raw).map_err(|e| anyhow::anyhow!("invalid pools file: {}", e))?;

    let mut pools = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.repository.trim().is_empty() {
            anyhow::bail!("pool with empty repository");
        }
        if !(entry.scale_up_threshold > 0.0 && entry.scale_up_threshold <= 1.0) {
            anyhow::bail!(
                "pool {}: scale_up_threshold must be in (0, 1]",
                entry.repository
            );
        }

        pools.push(RepositoryPool {
            repository: entry.repository,
            dedicated_count: entry.dedicated_count,
            dynamic_ceiling: entry.dynamic_ceiling,
            scale_up_threshold: entry.scale_up_threshold,
            idle_timeout_seconds: entry.idle_timeout_seconds,
            cooldown_seconds: entry.cooldown_seconds,
            labels: entry.labels,
            blocked_job_types: entry.blocked_job_types,
        });
    }

    Ok(pools)
}

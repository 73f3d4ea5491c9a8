//! Token Lifecycle Manager
//!
//! Keeps every runner's platform credential valid for its whole lifetime.
//! Each instance with a live credential gets its own refresh task that
//! fires at a configurable fraction of the credential's TTL (proactive
//! refresh, never reactive-on-expiry). A refresh that keeps failing is
//! escalated to a full re-registration before the old credential expires:
//! a runner holding an expired credential can silently drop off the
//! platform's roster mid-job, which is worse than a brief outage.

use chrono::Utc;
use gantry_core::domain::credential::Credential;
use gantry_core::domain::event::ScalingReason;
use gantry_core::error::{FleetError, Result};
use gantry_platform::PlatformApi;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::registry::{scale_up_event, PoolRegistry};
use crate::service::lifecycle::Provisioner;

/// Handles to the per-instance refresh tasks
///
/// Shared between the token manager (which schedules) and the provisioner
/// (which cancels during teardown), so destroying an instance
/// deterministically stops its timer.
#[derive(Clone, Default)]
pub struct RefreshTimers {
    inner: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl RefreshTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a refresh task, aborting any previous one for the same runner
    pub fn insert(&self, id: &str, handle: JoinHandle<()>) {
        if let Some(old) = self.inner.lock().unwrap().insert(id.to_string(), handle) {
            old.abort();
        }
    }

    /// Abort and drop a runner's refresh task
    pub fn cancel(&self, id: &str) {
        if let Some(handle) = self.inner.lock().unwrap().remove(id) {
            handle.abort();
            debug!(runner = %id, "refresh timer cancelled");
        }
    }

    /// Drop a runner's handle without aborting the task
    ///
    /// Used by a refresh task about to tear down its own runner; aborting
    /// itself mid-teardown would leave the runner half-destroyed.
    pub fn forget(&self, id: &str) {
        self.inner.lock().unwrap().remove(id);
    }

    #[allow(dead_code)]
    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// Tuning for the refresh schedule and its failure handling
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Fraction of the TTL to consume before refreshing (0.75 of a
    /// 60-minute credential fires at minute 45)
    pub refresh_fraction: f64,

    /// Refresh attempts before falling back to re-registration
    pub max_attempts: u32,

    /// First retry delay; doubles per attempt
    pub backoff_base: Duration,

    /// Upper bound for the retry delay
    pub backoff_cap: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_fraction: 0.75,
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

/// Schedules and runs per-runner credential refresh
pub struct TokenManager {
    registry: Arc<PoolRegistry>,
    platform: Arc<dyn PlatformApi>,
    provisioner: Arc<Provisioner>,
    timers: RefreshTimers,
    config: TokenConfig,
}

impl TokenManager {
    pub fn new(
        registry: Arc<PoolRegistry>,
        platform: Arc<dyn PlatformApi>,
        provisioner: Arc<Provisioner>,
        timers: RefreshTimers,
        config: TokenConfig,
    ) -> Self {
        Self {
            registry,
            platform,
            provisioner,
            timers,
            config,
        }
    }

    /// Start the refresh task for an instance holding a credential
    ///
    /// Replaces any previous task for the same runner. Instances without a
    /// credential (still provisioning, or adopted mid-teardown) are skipped.
    pub fn schedule(self: Arc<Self>, instance: &gantry_core::domain::runner::RunnerInstance) {
        let Some(credential) = &instance.credential else {
            warn!(runner = %instance.id, "no credential to refresh, not scheduling");
            return;
        };

        let delay = until(credential.refresh_at(self.config.refresh_fraction));
        debug!(
            runner = %instance.id,
            delay_secs = delay.as_secs(),
            "credential refresh scheduled"
        );

        let timers = self.timers.clone();
        let repository = instance.repository.clone();
        let id = instance.id.clone();
        let handle = tokio::spawn(async move {
            self.refresh_loop(repository, id, delay).await;
        });

        timers.insert(&instance.id, handle);
    }

    async fn refresh_loop(self: Arc<Self>, repository: String, id: String, mut delay: Duration) {
        loop {
            tokio::time::sleep(delay).await;

            match self.refresh_with_backoff(&repository, &id).await {
                Ok(credential) => {
                    delay = until(credential.refresh_at(self.config.refresh_fraction));
                    info!(
                        runner = %id,
                        expires_at = %credential.expires_at,
                        "credential refreshed"
                    );
                }
                Err(e) if e.is_not_found() => {
                    // Instance torn down between the timer firing and the
                    // refresh; nothing left to do.
                    debug!(runner = %id, "runner gone, refresh loop ending");
                    self.timers.forget(&id);
                    return;
                }
                Err(_) => {
                    self.force_recreate(&repository, &id).await;
                    return;
                }
            }
        }
    }

    /// One refresh, retried with bounded exponential backoff
    ///
    /// Gives up early if the old credential expires while we are retrying;
    /// at that point only re-registration helps.
    async fn refresh_with_backoff(&self, repository: &str, id: &str) -> Result<Credential> {
        let mut backoff = self.config.backoff_base;

        for attempt in 1..=self.config.max_attempts {
            let current = self.registry.get_instance(repository, id).await?;
            if let Some(credential) = &current.credential {
                if credential.is_expired(Utc::now()) {
                    warn!(runner = %id, "credential expired during refresh retries");
                    break;
                }
            }

            match self.platform.refresh_credential(repository, id).await {
                Ok(issued) => {
                    let credential =
                        issued.into_credential(repository.to_string(), id.to_string());
                    let swapped = credential.clone();
                    self.registry
                        .update_instance(repository, id, move |instance| {
                            instance.credential = Some(credential);
                        })
                        .await?;
                    return Ok(swapped);
                }
                Err(e) => {
                    warn!(
                        runner = %id,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        error = %e,
                        "credential refresh attempt failed"
                    );

                    if attempt == self.config.max_attempts {
                        break;
                    }

                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                    tokio::time::sleep(backoff + jitter).await;
                    backoff = (backoff * 2).min(self.config.backoff_cap);
                }
            }
        }

        Err(FleetError::CredentialExhausted(id.to_string()))
    }

    /// Refresh exhausted: rebuild the runner rather than let it run with an
    /// expired credential mid-job
    async fn force_recreate(self: Arc<Self>, repository: &str, id: &str) {
        // This is the runner's own refresh task; drop the handle without
        // aborting so the teardown below can finish.
        self.timers.forget(id);

        error!(
            runner = %id,
            repository = %repository,
            "credential refresh exhausted, force-recreating runner"
        );

        let event = scale_up_event(repository, ScalingReason::ForcedRecreate)
            .with_detail(id.to_string());
        if let Err(e) = self.registry.append_scaling_event(event).await {
            warn!(runner = %id, error = %e, "failed to record forced-recreate event");
        }

        match self.provisioner.recreate(repository, id).await {
            Ok(replacement) => {
                info!(
                    old = %id,
                    new = %replacement.id,
                    "runner re-registered with fresh credential"
                );
                self.clone().schedule(&replacement);
            }
            Err(e) => {
                error!(
                    runner = %id,
                    error = %e,
                    "forced re-registration failed; scaling or recovery will replace the runner"
                );
            }
        }
    }
}

/// Time from now until `at`, saturating at zero for past instants
fn until(at: chrono::DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

//! Health Supervisor
//!
//! Sweeps every pool on a fixed interval: refreshes heartbeats from a
//! container-presence probe, marks runners that missed too many consecutive
//! heartbeats as unhealthy, and repairs them. An unhealthy dedicated runner
//! is recreated in place; an unhealthy dynamic runner is destroyed outright
//! and left for the scaling engine to re-provision on demand. A runner
//! whose recovery keeps failing is quarantined and flagged for the
//! operator instead of being retried forever.

use chrono::{Duration as ChronoDuration, Utc};
use gantry_core::domain::event::ScalingReason;
use gantry_core::domain::runner::{RunnerInstance, RunnerKind, RunnerState};
use gantry_core::error::{FleetError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::registry::{scale_down_event, scale_up_event, PoolRegistry};
use crate::runtime::ContainerRuntime;
use crate::service::lifecycle::Provisioner;
use crate::service::token::TokenManager;

/// Tuning for the heartbeat sweep
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// How often the sweep runs
    pub interval: Duration,

    /// Consecutive missed heartbeats before a runner is unhealthy;
    /// at least 2, so one transient blip never triggers recovery
    pub miss_threshold: u32,

    /// Failed recovery attempts before an instance is quarantined
    pub recovery_attempts: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            miss_threshold: 2,
            recovery_attempts: 2,
        }
    }
}

/// What one sweep of a pool did
#[derive(Debug, Default)]
pub struct SweepSummary {
    pub marked_unhealthy: Vec<String>,
    pub recreated: Vec<String>,
    pub destroyed: Vec<String>,
    pub quarantined: Vec<String>,
}

/// Heartbeats runners, classifies failures, triggers recovery
pub struct HealthSupervisor {
    registry: Arc<PoolRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    provisioner: Arc<Provisioner>,
    tokens: Arc<TokenManager>,
    config: HealthConfig,
    /// Failed recovery attempts per instance id
    recovery_failures: Mutex<HashMap<String, u32>>,
}

impl HealthSupervisor {
    pub fn new(
        registry: Arc<PoolRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        provisioner: Arc<Provisioner>,
        tokens: Arc<TokenManager>,
        config: HealthConfig,
    ) -> Self {
        Self {
            registry,
            runtime,
            provisioner,
            tokens,
            config,
            recovery_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the supervision loop forever
    pub async fn run(self: Arc<Self>) {
        info!(
            interval = ?self.config.interval,
            miss_threshold = self.config.miss_threshold,
            "starting health supervisor"
        );

        let mut interval = time::interval(self.config.interval);

        loop {
            interval.tick().await;

            for repository in self.registry.repositories().await {
                match self.sweep_once(&repository).await {
                    Ok(summary) => {
                        let acted = summary.marked_unhealthy.len()
                            + summary.recreated.len()
                            + summary.destroyed.len()
                            + summary.quarantined.len();
                        if acted > 0 {
                            info!(
                                repository = %repository,
                                unhealthy = summary.marked_unhealthy.len(),
                                recreated = summary.recreated.len(),
                                destroyed = summary.destroyed.len(),
                                quarantined = summary.quarantined.len(),
                                "health sweep acted"
                            );
                        }
                    }
                    Err(e) => error!(repository = %repository, error = %e, "health sweep failed"),
                }
            }
        }
    }

    /// One heartbeat sweep over a single pool
    pub async fn sweep_once(&self, repository: &str) -> Result<SweepSummary> {
        let mut summary = SweepSummary::default();

        self.probe_presence(repository).await;

        // Classify: live runners past the miss budget become unhealthy;
        // stuck provisioning attempts are torn down directly.
        let cutoff = Utc::now()
            - ChronoDuration::seconds(
                self.config.interval.as_secs() as i64 * self.config.miss_threshold as i64,
            );

        for instance in self.registry.list_instances(repository).await? {
            if instance.last_heartbeat_at >= cutoff {
                continue;
            }

            if instance.state.is_live() {
                warn!(
                    runner = %instance.id,
                    last_heartbeat = %instance.last_heartbeat_at,
                    "runner missed its heartbeat budget, marking unhealthy"
                );
                self.registry
                    .transition(repository, &instance.id, RunnerState::Unhealthy)
                    .await?;
                summary.marked_unhealthy.push(instance.id.clone());
            } else if instance.state == RunnerState::Provisioning {
                warn!(runner = %instance.id, "stale provisioning attempt, tearing down");
                if let Err(e) = self.provisioner.decommission(repository, &instance.id).await {
                    warn!(runner = %instance.id, error = %e, "failed to tear down stale attempt");
                } else {
                    summary.destroyed.push(instance.id.clone());
                }
            }
        }

        // Recover everything currently unhealthy, plus drains stuck from a
        // failed destroy on an earlier attempt. Normal decommissioning
        // passes through Draining synchronously, so a Draining record seen
        // by a sweep is a stuck one.
        let instances = self.registry.list_instances(repository).await?;
        for instance in instances
            .iter()
            .filter(|i| matches!(i.state, RunnerState::Unhealthy | RunnerState::Draining))
        {
            self.recover(instance, &mut summary).await;
        }

        self.top_up_dedicated(repository, &mut summary).await?;

        Ok(summary)
    }

    /// Refill dedicated slots whose records are gone entirely
    ///
    /// Covers a failed bootstrap or a crash between destroy and recreate.
    /// A slot still occupied by any record, including a quarantined one
    /// awaiting the operator, is not refilled.
    async fn top_up_dedicated(&self, repository: &str, summary: &mut SweepSummary) -> Result<()> {
        let snapshot = self.registry.snapshot(repository).await?;
        let occupied = snapshot
            .instances
            .iter()
            .filter(|i| i.kind == RunnerKind::Dedicated)
            .count() as u32;

        for _ in occupied..snapshot.pool.dedicated_count {
            match self
                .provisioner
                .provision(repository, RunnerKind::Dedicated)
                .await
            {
                Ok(runner) => {
                    self.tokens.clone().schedule(&runner);
                    let event = scale_up_event(repository, ScalingReason::Recovery)
                        .with_detail(format!("dedicated slot refilled by {}", runner.id));
                    let _ = self.registry.append_scaling_event(event).await;
                    info!(repository = %repository, runner = %runner.id, "dedicated slot refilled");
                    summary.recreated.push(runner.id);
                }
                Err(e) => {
                    warn!(
                        repository = %repository,
                        error = %e,
                        "failed to refill dedicated slot, will retry next sweep"
                    );
                }
            }
        }

        Ok(())
    }

    /// Record a platform-reported liveness signal for a runner
    ///
    /// Entry point for the platform-facing surface (webhook ingestion);
    /// either this or the container probe keeps a runner healthy.
    #[allow(dead_code)]
    pub async fn record_heartbeat(&self, repository: &str, id: &str) -> Result<()> {
        self.registry.record_heartbeat(repository, id).await
    }

    /// Refresh heartbeats of runners whose containers are up
    ///
    /// A probe failure is logged and skipped; recorded heartbeats only go
    /// stale after the full miss budget, so a transient runtime outage does
    /// not take the fleet down with it.
    async fn probe_presence(&self, repository: &str) {
        let infos = match self.runtime.list(Some(repository)).await {
            Ok(infos) => infos,
            Err(e) => {
                warn!(
                    repository = %repository,
                    error = %e,
                    "container presence probe failed, relying on recorded heartbeats"
                );
                return;
            }
        };

        for info in infos
            .iter()
            .filter(|i| i.running && i.repository.as_deref() == Some(repository))
        {
            let Some(runner) = &info.runner_name else {
                continue;
            };
            match self.registry.record_heartbeat(repository, runner).await {
                Ok(()) => {
                    debug!(container = %info.handle, runner = %runner, "heartbeat from container probe")
                }
                Err(e) if e.is_not_found() => {
                    // A running container we have no record of; nothing to
                    // heartbeat. Startup adoption or the operator deals
                    // with strays.
                    debug!(runner = %runner, "running container without registry record");
                }
                Err(e) => warn!(runner = %runner, error = %e, "failed to record heartbeat"),
            }
        }
    }

    async fn recover(&self, instance: &RunnerInstance, summary: &mut SweepSummary) {
        let repository = instance.repository.as_str();
        let id = instance.id.as_str();

        let result: Result<()> = match instance.kind {
            RunnerKind::Dedicated => {
                // Dedicated runners hold a fixed pool slot: replace in place.
                match self.provisioner.recreate(repository, id).await {
                    Ok(replacement) => {
                        self.tokens.clone().schedule(&replacement);
                        let event = scale_up_event(repository, ScalingReason::Recovery)
                            .with_detail(format!("{} -> {}", id, replacement.id));
                        let _ = self.registry.append_scaling_event(event).await;
                        info!(old = %id, new = %replacement.id, "dedicated runner recreated");
                        summary.recreated.push(replacement.id);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            RunnerKind::Dynamic => {
                // Dynamic runners are destroyed outright; the scaling engine
                // re-provisions on the next demand signal.
                match self.provisioner.decommission(repository, id).await {
                    Ok(()) => {
                        let event = scale_down_event(repository, ScalingReason::Recovery)
                            .with_detail(id.to_string());
                        let _ = self.registry.append_scaling_event(event).await;
                        info!(runner = %id, "unhealthy dynamic runner destroyed");
                        summary.destroyed.push(id.to_string());
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        };

        match result {
            Ok(()) => {
                self.recovery_failures.lock().unwrap().remove(id);
            }
            Err(e) => self.note_recovery_failure(repository, id, &e, summary).await,
        }
    }

    async fn note_recovery_failure(
        &self,
        repository: &str,
        id: &str,
        err: &FleetError,
        summary: &mut SweepSummary,
    ) {
        let failures = {
            let mut map = self.recovery_failures.lock().unwrap();
            let count = map.entry(id.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        warn!(
            runner = %id,
            failures,
            max = self.config.recovery_attempts,
            error = %err,
            "recovery attempt failed"
        );

        if failures < self.config.recovery_attempts {
            return;
        }

        // Out of attempts: quarantine instead of retrying forever. The
        // instance leaves the eligible-for-jobs set and waits for an
        // operator.
        self.recovery_failures.lock().unwrap().remove(id);
        match self
            .registry
            .transition(repository, id, RunnerState::Quarantined)
            .await
        {
            Ok(_) => {
                error!(
                    runner = %id,
                    repository = %repository,
                    "runner quarantined after repeated recovery failures, operator attention required"
                );
                summary.quarantined.push(id.to_string());
            }
            Err(e) => {
                // Already torn down or mid-drain; either way it is no
                // longer schedulable.
                warn!(runner = %id, error = %e, "could not quarantine runner");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness_with, test_pool, TestOptions};
    use gantry_core::domain::event::ScalingAction;

    fn stale_by(intervals: f64) -> chrono::DateTime<Utc> {
        Utc::now() - ChronoDuration::seconds((30.0 * intervals) as i64)
    }

    /// A pool with no dedicated baseline, so sweeps only act on the
    /// instances a test creates itself.
    fn dynamic_only_pool() -> gantry_core::domain::pool::RepositoryPool {
        let mut pool = test_pool("acme/widget");
        pool.dedicated_count = 0;
        pool
    }

    async fn mark_stale(h: &crate::testing::Harness, id: &str, intervals: f64) {
        h.registry
            .update_instance("acme/widget", id, |i| {
                i.last_heartbeat_at = stale_by(intervals);
            })
            .await
            .unwrap();
    }

    /// Scenario: two missed 30s heartbeats flip a runner to unhealthy; a
    /// dynamic instance is destroyed and not recreated by the supervisor.
    #[tokio::test]
    async fn test_missed_heartbeats_destroy_dynamic_runner() {
        let h = harness_with(dynamic_only_pool(), TestOptions::default()).await;

        let runner = h
            .provisioner
            .provision("acme/widget", RunnerKind::Dynamic)
            .await
            .unwrap();
        // The probe would refresh the heartbeat; take the container down.
        h.runtime.stop_container(runner.container.as_deref().unwrap());
        mark_stale(&h, &runner.id, 2.5).await;

        let summary = h.health.sweep_once("acme/widget").await.unwrap();
        assert_eq!(summary.marked_unhealthy, vec![runner.id.clone()]);
        assert_eq!(summary.destroyed, vec![runner.id.clone()]);
        assert!(summary.recreated.is_empty());

        // Destroyed, removed, and not replaced by the supervisor.
        let snapshot = h.registry.snapshot("acme/widget").await.unwrap();
        assert!(snapshot.instances.is_empty());
        assert_eq!(
            h.store
                .events_with(ScalingAction::ScaleDown, ScalingReason::Recovery)
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_one_missed_heartbeat_is_tolerated() {
        let h = harness_with(dynamic_only_pool(), TestOptions::default()).await;

        let runner = h
            .provisioner
            .provision("acme/widget", RunnerKind::Dynamic)
            .await
            .unwrap();
        h.runtime.stop_container(runner.container.as_deref().unwrap());
        // One interval late: inside the miss budget of 2.
        mark_stale(&h, &runner.id, 1.2).await;

        let summary = h.health.sweep_once("acme/widget").await.unwrap();
        assert!(summary.marked_unhealthy.is_empty());

        let unchanged = h
            .registry
            .get_instance("acme/widget", &runner.id)
            .await
            .unwrap();
        assert_eq!(unchanged.state, RunnerState::Idle);
    }

    #[tokio::test]
    async fn test_running_container_refreshes_heartbeat() {
        let h = harness_with(dynamic_only_pool(), TestOptions::default()).await;

        let runner = h
            .provisioner
            .provision("acme/widget", RunnerKind::Dynamic)
            .await
            .unwrap();
        // Heartbeat is stale, but the container is still up: the probe
        // refreshes it and the runner stays healthy.
        mark_stale(&h, &runner.id, 5.0).await;

        let summary = h.health.sweep_once("acme/widget").await.unwrap();
        assert!(summary.marked_unhealthy.is_empty());

        let refreshed = h
            .registry
            .get_instance("acme/widget", &runner.id)
            .await
            .unwrap();
        assert_eq!(refreshed.state, RunnerState::Idle);
        assert!(refreshed.last_heartbeat_at > stale_by(1.0));
    }

    #[tokio::test]
    async fn test_unhealthy_dedicated_runner_is_recreated_in_place() {
        let h = harness_with(test_pool("acme/widget"), TestOptions::default()).await;

        let runner = h
            .provisioner
            .provision("acme/widget", RunnerKind::Dedicated)
            .await
            .unwrap();
        h.runtime.stop_container(runner.container.as_deref().unwrap());
        mark_stale(&h, &runner.id, 3.0).await;

        let summary = h.health.sweep_once("acme/widget").await.unwrap();
        assert_eq!(summary.marked_unhealthy, vec![runner.id.clone()]);
        assert_eq!(summary.recreated.len(), 1);

        let snapshot = h.registry.snapshot("acme/widget").await.unwrap();
        assert_eq!(snapshot.instances.len(), 1);
        let replacement = &snapshot.instances[0];
        assert_ne!(replacement.id, runner.id);
        assert_eq!(replacement.kind, RunnerKind::Dedicated);
        assert_eq!(replacement.state, RunnerState::Idle);
        assert_eq!(
            h.store
                .events_with(ScalingAction::ScaleUp, ScalingReason::Recovery)
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_repeated_recovery_failures_quarantine_the_instance() {
        let h = harness_with(dynamic_only_pool(), TestOptions::default()).await;

        let runner = h
            .provisioner
            .provision("acme/widget", RunnerKind::Dynamic)
            .await
            .unwrap();
        h.runtime.stop_container(runner.container.as_deref().unwrap());
        mark_stale(&h, &runner.id, 3.0).await;

        // Both recovery attempts fail to destroy the container.
        h.runtime.fail_next_destroy();
        let summary = h.health.sweep_once("acme/widget").await.unwrap();
        assert_eq!(summary.marked_unhealthy, vec![runner.id.clone()]);
        assert!(summary.quarantined.is_empty());

        h.runtime.fail_next_destroy();
        let summary = h.health.sweep_once("acme/widget").await.unwrap();
        assert_eq!(summary.quarantined, vec![runner.id.clone()]);

        let quarantined = h
            .registry
            .get_instance("acme/widget", &runner.id)
            .await
            .unwrap();
        assert_eq!(quarantined.state, RunnerState::Quarantined);
        assert!(!quarantined.is_schedulable());

        // Quarantined instances are left alone by later sweeps.
        let summary = h.health.sweep_once("acme/widget").await.unwrap();
        assert!(summary.quarantined.is_empty());
        assert!(summary.destroyed.is_empty());
    }

    #[tokio::test]
    async fn test_empty_dedicated_slot_is_refilled() {
        // Pool wants one dedicated runner but has no record of one, e.g.
        // after a failed bootstrap.
        let h = harness_with(test_pool("acme/widget"), TestOptions::default()).await;

        let summary = h.health.sweep_once("acme/widget").await.unwrap();
        assert_eq!(summary.recreated.len(), 1);

        let snapshot = h.registry.snapshot("acme/widget").await.unwrap();
        assert_eq!(snapshot.instances.len(), 1);
        assert_eq!(snapshot.instances[0].kind, RunnerKind::Dedicated);
        assert_eq!(snapshot.instances[0].state, RunnerState::Idle);

        // The slot is full now; the next sweep provisions nothing more.
        let summary = h.health.sweep_once("acme/widget").await.unwrap();
        assert!(summary.recreated.is_empty());
        assert_eq!(h.runtime.created_count(), 1);
    }
}

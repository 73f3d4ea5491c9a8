//! Scaling Decision Engine
//!
//! Runs a fixed-interval cycle per pool: scale up when utilization reaches
//! the pool's threshold (with the ceiling and cooldown as gates), reap at
//! most one idle dynamic runner per cooldown window, never touch dedicated
//! runners. The router's out-of-band scale-up request goes through the same
//! reservation gate, so both paths share one oscillation guard.
//!
//! A runtime failure is logged as a failed scaling event and the cycle
//! simply retries on its next interval; there is no in-cycle retry loop, so
//! cycles stay bounded in time.

use chrono::{DateTime, Utc};
use gantry_core::domain::event::ScalingReason;
use gantry_core::domain::runner::{RunnerInstance, RunnerKind};
use gantry_core::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::registry::{
    scale_down_event, scale_up_event, PoolRegistry, PoolSnapshot, ReserveOutcome,
};
use crate::service::lifecycle::{instance_id, Provisioner};
use crate::service::token::TokenManager;

/// Outcome of one periodic scaling cycle for a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    ScaledUp(String),
    ScaledDown(String),
    NoAction,
    /// Another scaling decision for this pool was already in flight
    DecisionInFlight,
}

/// Outcome of a scale-up request (periodic or out-of-band)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleUpOutcome {
    Provisioned(String),
    /// The dynamic ceiling is reached; backpressure, not a failure
    AtCapacity,
    CooldownActive,
    DecisionInFlight,
}

/// Periodic per-pool scaling evaluation
pub struct ScalingEngine {
    registry: Arc<PoolRegistry>,
    provisioner: Arc<Provisioner>,
    tokens: Arc<TokenManager>,
    interval: Duration,
}

impl ScalingEngine {
    pub fn new(
        registry: Arc<PoolRegistry>,
        provisioner: Arc<Provisioner>,
        tokens: Arc<TokenManager>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            provisioner,
            tokens,
            interval,
        }
    }

    /// Runs the scaling loop forever
    pub async fn run(self: Arc<Self>) {
        info!(interval = ?self.interval, "starting scaling engine");

        let mut interval = time::interval(self.interval);

        loop {
            interval.tick().await;

            for repository in self.registry.repositories().await {
                match self.run_cycle_once(&repository).await {
                    Ok(CycleOutcome::NoAction) | Ok(CycleOutcome::DecisionInFlight) => {}
                    Ok(outcome) => debug!(repository = %repository, ?outcome, "scaling cycle"),
                    Err(e) => error!(repository = %repository, error = %e, "scaling cycle failed"),
                }
            }
        }
    }

    /// Performs a single scaling evaluation for one pool
    pub async fn run_cycle_once(&self, repository: &str) -> Result<CycleOutcome> {
        let Some(_lease) = self.registry.try_scaling_lease(repository).await? else {
            return Ok(CycleOutcome::DecisionInFlight);
        };

        let snapshot = self.registry.snapshot(repository).await?;
        let now = Utc::now();

        let occupancy = snapshot.summary();
        debug!(
            repository = %repository,
            busy = occupancy.busy,
            idle = occupancy.idle,
            dynamic = occupancy.dynamic_count,
            ceiling = occupancy.dynamic_ceiling,
            "scaling evaluation"
        );

        if snapshot.needs_capacity() {
            return match self.try_scale_up(&snapshot).await? {
                ScaleUpOutcome::Provisioned(id) => Ok(CycleOutcome::ScaledUp(id)),
                _ => Ok(CycleOutcome::NoAction),
            };
        }

        if !snapshot.cooldown_elapsed(now) {
            return Ok(CycleOutcome::NoAction);
        }

        // At most one reap per cooldown window.
        let Some(victim) = reap_candidate(&snapshot, now) else {
            return Ok(CycleOutcome::NoAction);
        };

        match self.provisioner.decommission(repository, &victim.id).await {
            Ok(()) => {
                self.registry
                    .append_scaling_event(
                        scale_down_event(repository, ScalingReason::IdleTimeout)
                            .with_detail(victim.id.clone()),
                    )
                    .await?;
                info!(repository = %repository, runner = %victim.id, "idle runner reaped");
                Ok(CycleOutcome::ScaledDown(victim.id))
            }
            Err(e) => {
                warn!(
                    repository = %repository,
                    runner = %victim.id,
                    error = %e,
                    "scale-down failed, will retry next cycle"
                );
                self.registry
                    .append_scaling_event(
                        scale_down_event(repository, ScalingReason::IdleTimeout)
                            .failed()
                            .with_detail(format!("{}: {}", victim.id, e)),
                    )
                    .await?;
                Ok(CycleOutcome::NoAction)
            }
        }
    }

    /// Out-of-band scale-up, called by the job router when no eligible
    /// runner exists
    pub async fn request_scale_up(&self, repository: &str) -> Result<ScaleUpOutcome> {
        let Some(_lease) = self.registry.try_scaling_lease(repository).await? else {
            return Ok(ScaleUpOutcome::DecisionInFlight);
        };

        let snapshot = self.registry.snapshot(repository).await?;
        self.try_scale_up(&snapshot).await
    }

    /// Reserve a slot, provision into it, and record the action
    ///
    /// Caller holds the pool's scaling lease. The reservation inserts the
    /// Provisioning record under the pool lock, so a concurrent decision
    /// can never double-provision past the ceiling.
    async fn try_scale_up(&self, snapshot: &PoolSnapshot) -> Result<ScaleUpOutcome> {
        let repository = snapshot.pool.repository.as_str();

        let instance = RunnerInstance::new(
            instance_id(repository, RunnerKind::Dynamic),
            repository.to_string(),
            RunnerKind::Dynamic,
            snapshot.pool.labels.clone(),
        );

        match self
            .registry
            .reserve_dynamic_slot(repository, instance.clone())
            .await?
        {
            ReserveOutcome::CapacityReached => {
                debug!(repository = %repository, "scale-up blocked: ceiling reached");
                Ok(ScaleUpOutcome::AtCapacity)
            }
            ReserveOutcome::CooldownActive => {
                debug!(repository = %repository, "scale-up blocked: cooldown active");
                Ok(ScaleUpOutcome::CooldownActive)
            }
            ReserveOutcome::Reserved => match self.provisioner.provision_reserved(&instance).await
            {
                Ok(runner) => {
                    self.tokens.clone().schedule(&runner);
                    self.registry
                        .append_scaling_event(
                            scale_up_event(repository, ScalingReason::Demand)
                                .with_detail(runner.id.clone()),
                        )
                        .await?;
                    info!(repository = %repository, runner = %runner.id, "scaled up");
                    Ok(ScaleUpOutcome::Provisioned(runner.id))
                }
                Err(e) => {
                    // The reserved record is already rolled back by the
                    // provisioner; log the failed attempt and let the next
                    // cycle retry.
                    self.registry
                        .append_scaling_event(
                            scale_up_event(repository, ScalingReason::Demand)
                                .failed()
                                .with_detail(e.to_string()),
                        )
                        .await?;
                    Err(e)
                }
            },
        }
    }
}

/// Picks the idle dynamic runner to reap, if any is past its idle-timeout
///
/// Policy: oldest last-busy timestamp first, tie broken by oldest creation.
/// Deployments wanting a different reap order swap this function.
pub(crate) fn reap_candidate(snapshot: &PoolSnapshot, now: DateTime<Utc>) -> Option<RunnerInstance> {
    snapshot
        .instances
        .iter()
        .filter(|i| i.is_reapable() && now - i.idle_since() >= snapshot.pool.idle_timeout())
        .min_by_key(|i| (i.idle_since(), i.created_at))
        .cloned()
}

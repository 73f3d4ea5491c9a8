//! Job Router
//!
//! Matches a queued job's label and affinity requirements to an eligible
//! idle runner in the job's pool. Eligibility is a declarative predicate
//! over a snapshot (label superset, anti-affinity, blocked job type);
//! assignment itself is a compare-and-set through the registry, so a
//! candidate lost to a concurrent assignment just falls through to the
//! next one.
//!
//! When no eligible idle runner exists, the router emits an out-of-band
//! scale-up request and reports the job as still queued; the platform
//! queue retries it on the next poll cycle.

use gantry_core::domain::job::CiJob;
use gantry_core::domain::runner::{RunnerInstance, RunnerKind};
use gantry_core::error::Result;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

use crate::registry::{PoolRegistry, PoolSnapshot};
use crate::service::scaling::{ScaleUpOutcome, ScalingEngine};

/// Where a routed job ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Assigned to an idle runner, now marked busy
    Assigned { runner: String },

    /// No runner available; the job stays on the platform queue
    Queued { reason: QueueReason },
}

/// Why a job stayed queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueReason {
    /// A scale-up was requested (or is already in flight) for the pool
    ScalingUp,

    /// The pool's dynamic ceiling is reached; backpressure
    AtCapacity,

    /// The pool's cooldown window blocks another scale-up for now
    CooldownActive,

    /// The pool's runners can never satisfy the job's label constraints;
    /// scaling up would not help
    LabelsUnsatisfiable,

    /// The pool refuses this job type
    JobTypeBlocked,
}

/// Routes queued jobs onto pool runners
pub struct JobRouter {
    registry: Arc<PoolRegistry>,
    scaling: Arc<ScalingEngine>,
}

impl JobRouter {
    pub fn new(registry: Arc<PoolRegistry>, scaling: Arc<ScalingEngine>) -> Self {
        Self { registry, scaling }
    }

    /// Route one job: assign an idle runner or request capacity
    pub async fn route(&self, job: &CiJob) -> Result<RouteOutcome> {
        let snapshot = self.registry.snapshot(&job.repository).await?;

        if !snapshot.pool.accepts_job_type(&job.job_type) {
            debug!(job = %job.id, job_type = %job.job_type, "job type blocked by pool policy");
            return Ok(RouteOutcome::Queued {
                reason: QueueReason::JobTypeBlocked,
            });
        }

        for candidate in eligible_candidates(&snapshot, job) {
            if self.registry.try_assign(&job.repository, &candidate.id).await? {
                info!(job = %job.id, runner = %candidate.id, "job routed");
                return Ok(RouteOutcome::Assigned {
                    runner: candidate.id.clone(),
                });
            }
            // Lost the race to a concurrent assignment; next candidate.
        }

        // Nothing idle matches. Scaling up only helps if a fresh runner
        // (which carries the pool's labels) could satisfy the job.
        if !pool_can_satisfy(&snapshot, job) {
            debug!(job = %job.id, "job labels unsatisfiable by this pool");
            return Ok(RouteOutcome::Queued {
                reason: QueueReason::LabelsUnsatisfiable,
            });
        }

        let reason = match self.scaling.request_scale_up(&job.repository).await? {
            ScaleUpOutcome::Provisioned(runner) => {
                // The new runner is idle; claim it for this job right away.
                if self.registry.try_assign(&job.repository, &runner).await? {
                    info!(job = %job.id, runner = %runner, "job routed to fresh runner");
                    return Ok(RouteOutcome::Assigned { runner });
                }
                QueueReason::ScalingUp
            }
            ScaleUpOutcome::AtCapacity => QueueReason::AtCapacity,
            ScaleUpOutcome::CooldownActive => QueueReason::CooldownActive,
            ScaleUpOutcome::DecisionInFlight => QueueReason::ScalingUp,
        };

        debug!(job = %job.id, ?reason, "job remains queued");
        Ok(RouteOutcome::Queued { reason })
    }

    /// Release a runner back to idle after its job finished
    ///
    /// Entry point for the platform-facing surface (webhook ingestion or
    /// queue reconciliation) to report completion. Returns false if the
    /// runner was not busy.
    #[allow(dead_code)]
    pub async fn release(&self, repository: &str, runner: &str) -> Result<bool> {
        self.registry.release(repository, runner).await
    }
}

/// Idle instances satisfying the job's constraints, in assignment order:
/// dedicated runners first (no scale-down risk), then dynamic runners
/// most-recently-used first, so idle-timeout reaps the truly cold ones.
fn eligible_candidates<'a>(snapshot: &'a PoolSnapshot, job: &CiJob) -> Vec<&'a RunnerInstance> {
    let mut candidates: Vec<&RunnerInstance> = snapshot
        .instances
        .iter()
        .filter(|i| {
            i.is_schedulable()
                && i.has_labels(&job.required_labels)
                && i.avoids_labels(&job.anti_affinity_labels)
        })
        .collect();

    candidates.sort_by(|a, b| match (a.kind, b.kind) {
        (RunnerKind::Dedicated, RunnerKind::Dynamic) => Ordering::Less,
        (RunnerKind::Dynamic, RunnerKind::Dedicated) => Ordering::Greater,
        _ => b.idle_since().cmp(&a.idle_since()),
    });

    candidates
}

/// Whether a newly provisioned runner for this pool could take the job
fn pool_can_satisfy(snapshot: &PoolSnapshot, job: &CiJob) -> bool {
    job.required_labels
        .iter()
        .all(|l| snapshot.pool.labels.contains(l))
        && !job
            .anti_affinity_labels
            .iter()
            .any(|l| snapshot.pool.labels.contains(l))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, test_job, test_pool};
    use chrono::{Duration as ChronoDuration, Utc};
    use gantry_core::domain::runner::RunnerState;

    #[tokio::test]
    async fn test_unknown_repository_is_not_found() {
        let h = harness(test_pool("acme/widget")).await;
        let job = test_job("acme/other");

        let err = h.router.route(&job).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_prefers_dedicated_then_mru_dynamic() {
        let h = harness(test_pool("acme/widget")).await;

        let ded = h
            .provisioner
            .provision("acme/widget", RunnerKind::Dedicated)
            .await
            .unwrap();
        let dyn_cold = h
            .provisioner
            .provision("acme/widget", RunnerKind::Dynamic)
            .await
            .unwrap();
        let dyn_warm = h
            .provisioner
            .provision("acme/widget", RunnerKind::Dynamic)
            .await
            .unwrap();

        let now = Utc::now();
        h.registry
            .update_instance("acme/widget", &dyn_cold.id, |i| {
                i.last_busy_at = Some(now - ChronoDuration::minutes(30));
            })
            .await
            .unwrap();
        h.registry
            .update_instance("acme/widget", &dyn_warm.id, |i| {
                i.last_busy_at = Some(now - ChronoDuration::minutes(1));
            })
            .await
            .unwrap();

        // Dedicated wins first.
        let outcome = h.router.route(&test_job("acme/widget")).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Assigned { runner: ded.id.clone() });

        // Then the most-recently-used dynamic runner, leaving the cold one
        // for the idle-timeout reaper.
        let outcome = h.router.route(&test_job("acme/widget")).await.unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Assigned {
                runner: dyn_warm.id.clone()
            }
        );

        let outcome = h.router.route(&test_job("acme/widget")).await.unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Assigned {
                runner: dyn_cold.id.clone()
            }
        );
    }

    #[tokio::test]
    async fn test_label_superset_and_anti_affinity() {
        let mut pool = test_pool("acme/widget");
        pool.labels = vec!["linux".to_string(), "x64".to_string()];
        let h = harness(pool).await;

        let runner = h
            .provisioner
            .provision("acme/widget", RunnerKind::Dedicated)
            .await
            .unwrap();

        // Required label the runner lacks: unsatisfiable, no scale-up.
        let mut job = test_job("acme/widget");
        job.required_labels = vec!["gpu".to_string()];
        let outcome = h.router.route(&job).await.unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Queued {
                reason: QueueReason::LabelsUnsatisfiable
            }
        );

        // Anti-affinity against a label the whole pool carries.
        let mut job = test_job("acme/widget");
        job.anti_affinity_labels = vec!["x64".to_string()];
        let outcome = h.router.route(&job).await.unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Queued {
                reason: QueueReason::LabelsUnsatisfiable
            }
        );

        // A subset of the runner's labels matches.
        let mut job = test_job("acme/widget");
        job.required_labels = vec!["linux".to_string()];
        let outcome = h.router.route(&job).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Assigned { runner: runner.id });
    }

    #[tokio::test]
    async fn test_blocked_job_type_stays_queued() {
        let mut pool = test_pool("acme/widget");
        pool.blocked_job_types = vec!["deploy".to_string()];
        let h = harness(pool).await;
        h.provisioner
            .provision("acme/widget", RunnerKind::Dedicated)
            .await
            .unwrap();

        let mut job = test_job("acme/widget");
        job.job_type = "deploy".to_string();
        let outcome = h.router.route(&job).await.unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Queued {
                reason: QueueReason::JobTypeBlocked
            }
        );
    }

    #[tokio::test]
    async fn test_all_busy_scales_up_and_assigns_fresh_runner() {
        let mut pool = test_pool("acme/widget");
        pool.cooldown_seconds = 0;
        let h = harness(pool).await;

        let ded = h
            .provisioner
            .provision("acme/widget", RunnerKind::Dedicated)
            .await
            .unwrap();
        h.registry.try_assign("acme/widget", &ded.id).await.unwrap();

        let outcome = h.router.route(&test_job("acme/widget")).await.unwrap();
        let RouteOutcome::Assigned { runner } = outcome else {
            panic!("expected assignment to a fresh runner, got {:?}", outcome);
        };
        assert_ne!(runner, ded.id);

        let assigned = h
            .registry
            .get_instance("acme/widget", &runner)
            .await
            .unwrap();
        assert_eq!(assigned.state, RunnerState::Busy);
        assert_eq!(assigned.kind, RunnerKind::Dynamic);
    }

    #[tokio::test]
    async fn test_ceiling_reached_is_backpressure() {
        let mut pool = test_pool("acme/widget");
        pool.cooldown_seconds = 0;
        pool.dynamic_ceiling = 0;
        let h = harness(pool).await;

        let ded = h
            .provisioner
            .provision("acme/widget", RunnerKind::Dedicated)
            .await
            .unwrap();
        h.registry.try_assign("acme/widget", &ded.id).await.unwrap();

        let outcome = h.router.route(&test_job("acme/widget")).await.unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Queued {
                reason: QueueReason::AtCapacity
            }
        );
    }

    #[tokio::test]
    async fn test_release_returns_runner_to_idle() {
        let h = harness(test_pool("acme/widget")).await;
        let ded = h
            .provisioner
            .provision("acme/widget", RunnerKind::Dedicated)
            .await
            .unwrap();

        let outcome = h.router.route(&test_job("acme/widget")).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Assigned { runner: ded.id.clone() });

        assert!(h.router.release("acme/widget", &ded.id).await.unwrap());
        let idle = h
            .registry
            .get_instance("acme/widget", &ded.id)
            .await
            .unwrap();
        assert!(idle.is_schedulable());
        assert!(idle.last_busy_at.is_some());
    }
}

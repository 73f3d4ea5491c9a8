//! Runner provisioning and teardown
//!
//! The single path every control loop uses to bring a runner into the
//! fleet (issue credential, start container, mark ready) and to take one
//! out (drain, destroy container, deregister). Scaling, health recovery,
//! and forced re-registration all route through here so the ordering
//! guarantees live in one place:
//!
//! - a runner only reaches `Idle` with a live credential and a running
//!   container behind it;
//! - the container destroy completes (or is confirmed unnecessary) before
//!   the registry record is removed, so no container is left behind with
//!   no record pointing at it;
//! - teardown cancels the instance's credential-refresh timer.

use gantry_core::domain::runner::{RunnerInstance, RunnerKind, RunnerState};
use gantry_core::dto::runner::RegisterRunner;
use gantry_core::error::{FleetError, Result};
use gantry_platform::PlatformApi;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::registry::PoolRegistry;
use crate::runtime::{ContainerRuntime, ContainerSpec};
use crate::service::token::RefreshTimers;

/// Builds runner instances and tears them down again
pub struct Provisioner {
    registry: Arc<PoolRegistry>,
    platform: Arc<dyn PlatformApi>,
    runtime: Arc<dyn ContainerRuntime>,
    timers: RefreshTimers,
    image: String,
}

/// Generates a runner id: repository slug, kind tag, short random suffix
///
/// The id doubles as the platform-facing runner name, so it has to be
/// unique across recreations of the same slot.
pub fn instance_id(repository: &str, kind: RunnerKind) -> String {
    let slug: String = repository
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let tag = match kind {
        RunnerKind::Dedicated => "ded",
        RunnerKind::Dynamic => "dyn",
    };
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", slug, tag, &suffix[..8])
}

impl Provisioner {
    pub fn new(
        registry: Arc<PoolRegistry>,
        platform: Arc<dyn PlatformApi>,
        runtime: Arc<dyn ContainerRuntime>,
        timers: RefreshTimers,
        image: String,
    ) -> Self {
        Self {
            registry,
            platform,
            runtime,
            timers,
            image,
        }
    }

    /// Provision a brand-new runner for a pool
    ///
    /// Inserts the Provisioning record first, then completes it. Dynamic
    /// runners normally arrive through the scaling engine's slot
    /// reservation instead, which inserts the record itself; see
    /// [`Provisioner::provision_reserved`].
    pub async fn provision(&self, repository: &str, kind: RunnerKind) -> Result<RunnerInstance> {
        let snapshot = self.registry.snapshot(repository).await?;
        let instance = RunnerInstance::new(
            instance_id(repository, kind),
            repository.to_string(),
            kind,
            snapshot.pool.labels.clone(),
        );

        self.registry.upsert_instance(instance.clone()).await?;
        self.provision_reserved(&instance).await
    }

    /// Complete provisioning for an instance record already in the registry
    ///
    /// On any failure the record is removed again and the platform
    /// registration (if it happened) is rolled back, so a failed attempt
    /// leaves nothing behind.
    pub async fn provision_reserved(&self, instance: &RunnerInstance) -> Result<RunnerInstance> {
        let repository = instance.repository.as_str();
        let id = instance.id.as_str();

        let issued = match self
            .platform
            .register_runner(&RegisterRunner {
                repository: repository.to_string(),
                runner_name: id.to_string(),
                labels: instance.labels.clone(),
            })
            .await
        {
            Ok(issued) => issued,
            Err(e) => {
                self.abandon(repository, id).await;
                return Err(e.into());
            }
        };

        let credential = issued.into_credential(repository.to_string(), id.to_string());

        let spec = ContainerSpec {
            name: format!("gantry-{}", id),
            image: self.image.clone(),
            repository: repository.to_string(),
            runner_name: id.to_string(),
            labels: instance.labels.clone(),
            credential_value: credential.value.clone(),
        };

        let container = match self.runtime.create(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(remove_err) = self.platform.remove_runner(repository, id).await {
                    warn!(runner = %id, error = %remove_err, "failed to roll back platform registration");
                }
                self.abandon(repository, id).await;
                return Err(FleetError::Runtime(e));
            }
        };

        self.registry
            .update_instance(repository, id, |inst| {
                inst.container = Some(container.clone());
                inst.credential = Some(credential.clone());
            })
            .await?;

        self.registry
            .transition(repository, id, RunnerState::Online)
            .await?;
        // The container coming up is our readiness signal.
        let ready = self
            .registry
            .transition(repository, id, RunnerState::Idle)
            .await?;

        info!(runner = %id, repository = %repository, kind = %ready.kind, "runner provisioned");
        Ok(ready)
    }

    /// Replace a runner in place: tear the old one down, provision a fresh
    /// one of the same kind into the same pool slot
    pub async fn recreate(&self, repository: &str, id: &str) -> Result<RunnerInstance> {
        let old = self.registry.get_instance(repository, id).await?;
        self.decommission(repository, id).await?;
        self.provision(repository, old.kind).await
    }

    /// Drain, destroy, deregister, and forget a runner
    ///
    /// Safe to retry: a runner stuck in Draining after a destroy failure
    /// goes through the same path again on the caller's next cycle.
    pub async fn decommission(&self, repository: &str, id: &str) -> Result<()> {
        let instance = self.registry.get_instance(repository, id).await?;

        if instance.state != RunnerState::Draining {
            self.registry
                .transition(repository, id, RunnerState::Draining)
                .await?;
        }

        self.timers.cancel(id);

        // The container must be gone before the record is; an orphaned
        // container with no registry record would never be cleaned up.
        if let Some(container) = &instance.container {
            self.runtime.destroy(container).await?;
        }

        self.registry
            .transition(repository, id, RunnerState::Terminated)
            .await?;
        self.registry.remove_instance(repository, id).await?;

        if let Err(e) = self.platform.remove_runner(repository, id).await {
            warn!(runner = %id, error = %e, "failed to remove runner from platform roster");
        }

        info!(runner = %id, repository = %repository, "runner decommissioned");
        Ok(())
    }

    /// Drop a half-provisioned record after a failed attempt
    async fn abandon(&self, repository: &str, id: &str) {
        self.timers.cancel(id);
        if let Err(e) = self.registry.remove_instance(repository, id).await {
            if !e.is_not_found() {
                warn!(runner = %id, error = %e, "failed to remove abandoned instance record");
            }
        }
    }
}

//! Gantry Fleet Manager
//!
//! Control plane for a fleet of ephemeral CI-runner containers:
//! - Registry: pool and instance records, lock-guarded and persisted
//! - Runtime: podman adapter that creates and destroys runner containers
//! - Services: scaling engine, token lifecycle, health supervision, job
//!   routing, and queue polling
//!
//! The daemon bootstraps each pool's dedicated runners at startup, then
//! lets the periodic control loops keep the fleet converged with demand.

mod config;
mod events;
mod registry;
mod runtime;
mod service;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use gantry_core::domain::runner::RunnerKind;
use gantry_platform::{PlatformApi, PlatformClient};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::FleetConfig;
use crate::events::{StatusBus, StatusEvent};
use crate::registry::store::{MemoryStore, PgStore, RegistryStore};
use crate::registry::PoolRegistry;
use crate::runtime::{ContainerRuntime, PodmanRuntime};
use crate::service::{
    HealthConfig, HealthSupervisor, JobRouter, Provisioner, QueuePoller, RefreshTimers,
    ScalingEngine, TokenConfig, TokenManager,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gantry_fleet=info,gantry_platform=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Gantry Fleet Manager");

    let config = FleetConfig::from_env().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    let pools = config
        .load_pools()
        .context("failed to load pool definitions")?;
    info!("Loaded {} pool definition(s)", pools.len());

    // Durable state store: Postgres when configured, in-memory otherwise.
    let store: Arc<dyn RegistryStore> = match &config.database_url {
        Some(url) => {
            info!("Connecting to database...");
            Arc::new(
                PgStore::connect(url)
                    .await
                    .context("failed to connect to database")?,
            )
        }
        None => {
            warn!("GANTRY_DATABASE_URL not set, state will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let status = StatusBus::new();
    spawn_status_logger(&status);

    let registry = Arc::new(PoolRegistry::new(store.clone(), status.clone()));
    for pool in pools {
        info!(
            repository = %pool.repository,
            dedicated = pool.dedicated_count,
            ceiling = pool.dynamic_ceiling,
            "pool configured"
        );
        registry.register_pool(pool).await?;
    }

    let adopted = store.load_instances().await?;
    if !adopted.is_empty() {
        info!("Adopting {} persisted instance(s)", adopted.len());
    }
    registry.adopt_instances(adopted).await;

    // External collaborators.
    let platform: Arc<dyn PlatformApi> = Arc::new(PlatformClient::new(
        config.platform_url.clone(),
        config.platform_token.clone(),
    ));

    let podman = PodmanRuntime::new();
    podman
        .check_available()
        .await
        .context("container runtime unavailable")?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(podman);

    // Control services.
    let timers = RefreshTimers::new();
    let provisioner = Arc::new(Provisioner::new(
        registry.clone(),
        platform.clone(),
        runtime.clone(),
        timers.clone(),
        config.runner_image.clone(),
    ));
    let tokens = Arc::new(TokenManager::new(
        registry.clone(),
        platform.clone(),
        provisioner.clone(),
        timers.clone(),
        TokenConfig {
            refresh_fraction: config.refresh_fraction,
            max_attempts: config.refresh_max_attempts,
            ..TokenConfig::default()
        },
    ));
    let scaling = Arc::new(ScalingEngine::new(
        registry.clone(),
        provisioner.clone(),
        tokens.clone(),
        config.scaling_interval,
    ));
    let health = Arc::new(HealthSupervisor::new(
        registry.clone(),
        runtime.clone(),
        provisioner.clone(),
        tokens.clone(),
        HealthConfig {
            interval: config.heartbeat_interval,
            miss_threshold: config.heartbeat_miss_threshold,
            recovery_attempts: config.recovery_max_attempts,
        },
    ));
    let router = Arc::new(JobRouter::new(registry.clone(), scaling.clone()));
    let poller = Arc::new(QueuePoller::new(
        registry.clone(),
        platform.clone(),
        router.clone(),
        config.queue_poll_interval,
    ));

    bootstrap_dedicated(&registry, &provisioner, &tokens).await;

    tokio::spawn(scaling.run());
    tokio::spawn(health.run());
    tokio::spawn(poller.run());

    info!("Gantry fleet manager running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received, exiting");

    Ok(())
}

/// Bring each pool up to its dedicated-runner count and resume credential
/// refresh for adopted instances
///
/// A provisioning failure here is logged, not fatal: the health supervisor
/// and scaling engine converge the pool once the platform or runtime
/// recovers.
async fn bootstrap_dedicated(
    registry: &Arc<PoolRegistry>,
    provisioner: &Arc<Provisioner>,
    tokens: &Arc<TokenManager>,
) {
    for repository in registry.repositories().await {
        let snapshot = match registry.snapshot(&repository).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(repository = %repository, error = %e, "failed to snapshot pool");
                continue;
            }
        };

        for instance in &snapshot.instances {
            if instance.credential.is_some() && instance.state.is_live() {
                tokens.clone().schedule(instance);
            }
        }

        let dedicated = snapshot
            .instances
            .iter()
            .filter(|i| i.kind == RunnerKind::Dedicated && i.state.is_live())
            .count() as u32;

        for _ in dedicated..snapshot.pool.dedicated_count {
            match provisioner.provision(&repository, RunnerKind::Dedicated).await {
                Ok(runner) => {
                    info!(repository = %repository, runner = %runner.id, "dedicated runner ready");
                    tokens.clone().schedule(&runner);
                }
                Err(e) => {
                    warn!(
                        repository = %repository,
                        error = %e,
                        "failed to provision dedicated runner, recovery will retry"
                    );
                }
            }
        }
    }
}

/// Mirror status events into the log for operators without a dashboard
fn spawn_status_logger(status: &StatusBus) {
    let mut rx = status.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(StatusEvent::Transition { instance, from, to }) => {
                    info!(runner = %instance.id, %from, %to, "status: transition");
                }
                Ok(StatusEvent::Scaling(event)) => {
                    info!(
                        repository = %event.repository,
                        action = %event.action,
                        reason = %event.reason,
                        succeeded = event.succeeded,
                        "status: scaling event"
                    );
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "status logger lagged behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

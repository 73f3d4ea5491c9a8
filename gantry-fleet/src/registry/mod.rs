//! Pool Registry
//!
//! The single source of truth for every repository pool and its runner
//! instances. All mutations are atomic per pool: each pool's state sits
//! behind its own async mutex, and every other component works from
//! snapshots, never from private copies that could drift.
//!
//! The data lock is never held across a platform or runtime call. Control
//! loops take a snapshot, decide, act, and then commit the result through
//! one of the mutation methods here, which re-validate state (ceiling,
//! transition legality, compare-and-set assignment) under the lock.
//!
//! Every mutation is written through to the [`RegistryStore`] backend and
//! echoed on the status channel. A store-write failure is logged, not
//! propagated: the in-process registry stays authoritative and later
//! mutations re-write the row.

pub mod store;

use chrono::{DateTime, Utc};
use gantry_core::domain::event::{ScalingAction, ScalingEvent, ScalingReason};
use gantry_core::domain::pool::RepositoryPool;
use gantry_core::domain::runner::{RunnerInstance, RunnerKind, RunnerState};
use gantry_core::dto::pool::PoolSummary;
use gantry_core::error::{FleetError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, warn};

use crate::events::{StatusBus, StatusEvent};
use store::RegistryStore;

/// Registry of all pools and their runner instances
pub struct PoolRegistry {
    pools: RwLock<HashMap<String, Arc<PoolEntry>>>,
    store: Arc<dyn RegistryStore>,
    status: StatusBus,
}

struct PoolEntry {
    data: Mutex<PoolData>,
    /// Per-pool scaling lease: at most one scaling decision (periodic or
    /// out-of-band) in flight per pool. Held for the duration of a
    /// decision, unlike the data lock.
    scaling_lease: Arc<Mutex<()>>,
}

struct PoolData {
    pool: RepositoryPool,
    instances: HashMap<String, RunnerInstance>,
    /// Timestamp of the last successful demand/idle-timeout scaling action,
    /// the cooldown anchor. Recovery and forced-recreate events do not move
    /// it, so repairs never starve scale-up.
    last_scaling_at: Option<DateTime<Utc>>,
}

/// A consistent read of one pool's state
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub pool: RepositoryPool,
    pub instances: Vec<RunnerInstance>,
    pub last_scaling_at: Option<DateTime<Utc>>,
}

impl PoolSnapshot {
    /// Dynamic instances currently counted against the ceiling
    ///
    /// Everything not yet Terminated occupies a slot: a Provisioning or
    /// Draining runner still owns a container.
    pub fn dynamic_count(&self) -> u32 {
        self.instances
            .iter()
            .filter(|i| i.kind == RunnerKind::Dynamic && i.state != RunnerState::Terminated)
            .count() as u32
    }

    /// Instances that currently provide (or are about to provide) capacity
    pub fn capacity_count(&self) -> u32 {
        self.instances
            .iter()
            .filter(|i| {
                matches!(
                    i.state,
                    RunnerState::Provisioning
                        | RunnerState::Online
                        | RunnerState::Idle
                        | RunnerState::Busy
                )
            })
            .count() as u32
    }

    pub fn busy_count(&self) -> u32 {
        self.instances.iter().filter(|i| i.is_busy()).count() as u32
    }

    /// Whether utilization has reached the pool's scale-up threshold
    ///
    /// An empty pool reports false here; re-establishing dead dedicated
    /// runners is the health supervisor's job, and demand against an empty
    /// pool arrives through the router's out-of-band scale-up request.
    pub fn needs_capacity(&self) -> bool {
        let capacity = self.capacity_count();
        if capacity == 0 {
            return false;
        }
        self.busy_count() as f64 / capacity as f64 >= self.pool.scale_up_threshold
    }

    /// Whether the cooldown window since the last scaling action has passed
    pub fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.last_scaling_at {
            Some(at) => now - at >= self.pool.cooldown(),
            None => true,
        }
    }

    /// Occupancy summary for the status surface and logs
    pub fn summary(&self) -> PoolSummary {
        PoolSummary {
            repository: self.pool.repository.clone(),
            dedicated_count: self.pool.dedicated_count,
            dynamic_count: self.dynamic_count(),
            dynamic_ceiling: self.pool.dynamic_ceiling,
            busy: self.busy_count(),
            idle: self
                .instances
                .iter()
                .filter(|i| i.is_schedulable())
                .count() as u32,
        }
    }
}

/// Outcome of attempting to reserve a dynamic-runner slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Slot reserved; a Provisioning record now occupies it
    Reserved,
    /// The pool's dynamic ceiling is reached
    CapacityReached,
    /// The cooldown window since the last scaling action has not elapsed
    CooldownActive,
}

impl PoolRegistry {
    pub fn new(store: Arc<dyn RegistryStore>, status: StatusBus) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            store,
            status,
        }
    }

    /// Register (or reconfigure) a pool
    pub async fn register_pool(&self, pool: RepositoryPool) -> Result<()> {
        {
            let mut pools = self.pools.write().await;
            match pools.get(&pool.repository) {
                Some(entry) => {
                    entry.data.lock().await.pool = pool.clone();
                }
                None => {
                    pools.insert(
                        pool.repository.clone(),
                        Arc::new(PoolEntry {
                            data: Mutex::new(PoolData {
                                pool: pool.clone(),
                                instances: HashMap::new(),
                                last_scaling_at: None,
                            }),
                            scaling_lease: Arc::new(Mutex::new(())),
                        }),
                    );
                }
            }
        }

        self.persist_pool(&pool).await;
        Ok(())
    }

    /// Adopt persisted instances at startup
    ///
    /// Instances referencing unknown pools are dropped with a warning; a
    /// pool removed from configuration takes its stragglers with it (the
    /// containers, if any, show up as unmanaged in the runtime).
    pub async fn adopt_instances(&self, instances: Vec<RunnerInstance>) {
        for instance in instances {
            let Some(entry) = self.entry(&instance.repository).await else {
                warn!(
                    runner = %instance.id,
                    repository = %instance.repository,
                    "dropping persisted instance for unconfigured pool"
                );
                continue;
            };

            let mut data = entry.data.lock().await;
            debug!(runner = %instance.id, state = %instance.state, "adopted persisted instance");
            data.instances.insert(instance.id.clone(), instance);
        }
    }

    /// All configured repositories
    pub async fn repositories(&self) -> Vec<String> {
        self.pools.read().await.keys().cloned().collect()
    }

    /// Consistent snapshot of one pool
    pub async fn snapshot(&self, repository: &str) -> Result<PoolSnapshot> {
        let entry = self.require_entry(repository).await?;
        let data = entry.data.lock().await;

        Ok(PoolSnapshot {
            pool: data.pool.clone(),
            instances: data.instances.values().cloned().collect(),
            last_scaling_at: data.last_scaling_at,
        })
    }

    /// All instance records for a pool
    pub async fn list_instances(&self, repository: &str) -> Result<Vec<RunnerInstance>> {
        Ok(self.snapshot(repository).await?.instances)
    }

    pub async fn get_instance(&self, repository: &str, id: &str) -> Result<RunnerInstance> {
        let entry = self.require_entry(repository).await?;
        let data = entry.data.lock().await;
        data.instances
            .get(id)
            .cloned()
            .ok_or_else(|| FleetError::not_found(format!("runner {}", id)))
    }

    /// Insert or replace an instance record
    pub async fn upsert_instance(&self, instance: RunnerInstance) -> Result<()> {
        let entry = self.require_entry(&instance.repository).await?;

        {
            let mut data = entry.data.lock().await;
            data.instances.insert(instance.id.clone(), instance.clone());
        }

        self.persist_instance(&instance).await;
        Ok(())
    }

    /// Apply an arbitrary mutation to one instance, atomically
    ///
    /// The serialization point for all per-instance updates; concurrent
    /// control loops cannot interleave partial writes.
    pub async fn update_instance<F>(&self, repository: &str, id: &str, f: F) -> Result<RunnerInstance>
    where
        F: FnOnce(&mut RunnerInstance),
    {
        let entry = self.require_entry(repository).await?;

        let updated = {
            let mut data = entry.data.lock().await;
            let instance = data
                .instances
                .get_mut(id)
                .ok_or_else(|| FleetError::not_found(format!("runner {}", id)))?;
            f(instance);
            instance.clone()
        };

        self.persist_instance(&updated).await;
        Ok(updated)
    }

    /// Transition an instance to a new lifecycle state
    ///
    /// Illegal transitions are rejected; legal ones are persisted and
    /// pushed on the status channel.
    pub async fn transition(
        &self,
        repository: &str,
        id: &str,
        to: RunnerState,
    ) -> Result<RunnerInstance> {
        let entry = self.require_entry(repository).await?;

        let (updated, from) = {
            let mut data = entry.data.lock().await;
            let instance = data
                .instances
                .get_mut(id)
                .ok_or_else(|| FleetError::not_found(format!("runner {}", id)))?;

            let from = instance.state;
            if !from.can_transition_to(to) {
                return Err(FleetError::InvalidTransition {
                    runner: id.to_string(),
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }

            if from == RunnerState::Busy {
                instance.last_busy_at = Some(Utc::now());
            }
            instance.state = to;
            (instance.clone(), from)
        };

        debug!(runner = %id, %from, state = %to, "runner state transition");
        self.persist_instance(&updated).await;
        self.status.emit(StatusEvent::Transition {
            instance: (&updated).into(),
            from,
            to,
        });
        Ok(updated)
    }

    /// Compare-and-set assignment: Idle -> Busy
    ///
    /// Returns false when the instance is no longer idle (a concurrent
    /// router or reaper won the race); the caller moves to its next
    /// candidate.
    pub async fn try_assign(&self, repository: &str, id: &str) -> Result<bool> {
        let entry = self.require_entry(repository).await?;

        let updated = {
            let mut data = entry.data.lock().await;
            let instance = data
                .instances
                .get_mut(id)
                .ok_or_else(|| FleetError::not_found(format!("runner {}", id)))?;

            if instance.state != RunnerState::Idle {
                return Ok(false);
            }
            instance.state = RunnerState::Busy;
            instance.last_busy_at = Some(Utc::now());
            instance.clone()
        };

        self.persist_instance(&updated).await;
        self.status.emit(StatusEvent::Transition {
            instance: (&updated).into(),
            from: RunnerState::Idle,
            to: RunnerState::Busy,
        });
        Ok(true)
    }

    /// Compare-and-set release: Busy -> Idle
    pub async fn release(&self, repository: &str, id: &str) -> Result<bool> {
        let entry = self.require_entry(repository).await?;

        let updated = {
            let mut data = entry.data.lock().await;
            let instance = data
                .instances
                .get_mut(id)
                .ok_or_else(|| FleetError::not_found(format!("runner {}", id)))?;

            if instance.state != RunnerState::Busy {
                return Ok(false);
            }
            instance.state = RunnerState::Idle;
            instance.last_busy_at = Some(Utc::now());
            instance.clone()
        };

        self.persist_instance(&updated).await;
        self.status.emit(StatusEvent::Transition {
            instance: (&updated).into(),
            from: RunnerState::Busy,
            to: RunnerState::Idle,
        });
        Ok(true)
    }

    /// Record that a runner was seen alive
    pub async fn record_heartbeat(&self, repository: &str, id: &str) -> Result<()> {
        self.update_instance(repository, id, |instance| {
            instance.last_heartbeat_at = Utc::now();
        })
        .await?;
        Ok(())
    }

    /// Remove an instance record
    ///
    /// Callers must have destroyed (or confirmed absent) the backing
    /// container first; removing the record is the last step of teardown.
    pub async fn remove_instance(&self, repository: &str, id: &str) -> Result<RunnerInstance> {
        let entry = self.require_entry(repository).await?;

        let removed = {
            let mut data = entry.data.lock().await;
            data.instances
                .remove(id)
                .ok_or_else(|| FleetError::not_found(format!("runner {}", id)))?
        };

        if let Err(e) = self.store.delete_instance(repository, id).await {
            warn!(runner = %id, error = %e, "failed to delete instance from store");
        }
        Ok(removed)
    }

    /// Atomically reserve a dynamic-runner slot
    ///
    /// Checks the ceiling and the cooldown window and inserts the
    /// Provisioning record in one critical section. This is the guard
    /// against two concurrent scale-up decisions double-provisioning a
    /// pool.
    pub async fn reserve_dynamic_slot(
        &self,
        repository: &str,
        instance: RunnerInstance,
    ) -> Result<ReserveOutcome> {
        let entry = self.require_entry(repository).await?;

        let reserved = {
            let mut data = entry.data.lock().await;

            let dynamic_count = data
                .instances
                .values()
                .filter(|i| i.kind == RunnerKind::Dynamic && i.state != RunnerState::Terminated)
                .count() as u32;

            if dynamic_count >= data.pool.dynamic_ceiling {
                return Ok(ReserveOutcome::CapacityReached);
            }

            let now = Utc::now();
            if let Some(at) = data.last_scaling_at {
                if now - at < data.pool.cooldown() {
                    return Ok(ReserveOutcome::CooldownActive);
                }
            }

            data.instances.insert(instance.id.clone(), instance.clone());
            instance
        };

        self.persist_instance(&reserved).await;
        Ok(ReserveOutcome::Reserved)
    }

    /// Append a scaling event to the audit log
    ///
    /// Successful demand and idle-timeout actions re-anchor the cooldown
    /// window; failed attempts and recovery actions are recorded but do not
    /// gate future scaling.
    pub async fn append_scaling_event(&self, event: ScalingEvent) -> Result<()> {
        let entry = self.require_entry(&event.repository).await?;

        if event.succeeded
            && matches!(
                event.reason,
                ScalingReason::Demand | ScalingReason::IdleTimeout
            )
        {
            let mut data = entry.data.lock().await;
            data.last_scaling_at = Some(event.occurred_at);
        }

        if let Err(e) = self.store.append_event(&event).await {
            warn!(repository = %event.repository, error = %e, "failed to persist scaling event");
        }
        self.status.emit(StatusEvent::Scaling(event));
        Ok(())
    }

    /// Try to take the pool's scaling lease without waiting
    ///
    /// Returns None when another scaling decision is already in flight for
    /// this pool.
    pub async fn try_scaling_lease(&self, repository: &str) -> Result<Option<OwnedMutexGuard<()>>> {
        let entry = self.require_entry(repository).await?;
        Ok(entry.scaling_lease.clone().try_lock_owned().ok())
    }

    async fn entry(&self, repository: &str) -> Option<Arc<PoolEntry>> {
        self.pools.read().await.get(repository).cloned()
    }

    async fn require_entry(&self, repository: &str) -> Result<Arc<PoolEntry>> {
        self.entry(repository)
            .await
            .ok_or_else(|| FleetError::not_found(format!("pool {}", repository)))
    }

    async fn persist_pool(&self, pool: &RepositoryPool) {
        if let Err(e) = self.store.save_pool(pool).await {
            warn!(repository = %pool.repository, error = %e, "failed to persist pool");
        }
    }

    async fn persist_instance(&self, instance: &RunnerInstance) {
        if let Err(e) = self.store.save_instance(instance).await {
            warn!(runner = %instance.id, error = %e, "failed to persist instance");
        }
    }
}

/// Record a scaling action, marking the action ScaleUp
pub fn scale_up_event(repository: &str, reason: ScalingReason) -> ScalingEvent {
    ScalingEvent::new(repository, ScalingAction::ScaleUp, reason)
}

/// Record a scaling action, marking the action ScaleDown
pub fn scale_down_event(repository: &str, reason: ScalingReason) -> ScalingEvent {
    ScalingEvent::new(repository, ScalingAction::ScaleDown, reason)
}

//! Registry persistence backends
//!
//! The registry's in-memory state is written through to a `RegistryStore`
//! so pools, instances, and the scaling-event log survive a process restart.
//! Two backends: Postgres (production) and in-memory (dev mode, tests).

use async_trait::async_trait;
use gantry_core::domain::event::{ScalingAction, ScalingEvent, ScalingReason};
use gantry_core::domain::pool::RepositoryPool;
use gantry_core::domain::runner::{RunnerInstance, RunnerKind, RunnerState};
use gantry_core::error::{FleetError, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Persistence operations the registry writes through to
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn save_pool(&self, pool: &RepositoryPool) -> Result<()>;
    async fn save_instance(&self, instance: &RunnerInstance) -> Result<()>;
    async fn delete_instance(&self, repository: &str, id: &str) -> Result<()>;
    /// Load all persisted instances, for adoption at startup
    async fn load_instances(&self) -> Result<Vec<RunnerInstance>>;
    async fn append_event(&self, event: &ScalingEvent) -> Result<()>;
}

// =============================================================================
// Postgres backend
// =============================================================================

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to Postgres and run migrations
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(store_err)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pools (
                repository VARCHAR(255) PRIMARY KEY,
                dedicated_count INTEGER NOT NULL,
                dynamic_ceiling INTEGER NOT NULL,
                scale_up_threshold DOUBLE PRECISION NOT NULL,
                idle_timeout_seconds BIGINT NOT NULL,
                cooldown_seconds BIGINT NOT NULL,
                labels TEXT[] NOT NULL DEFAULT '{}',
                blocked_job_types TEXT[] NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runner_instances (
                id VARCHAR(255) PRIMARY KEY,
                repository VARCHAR(255) NOT NULL,
                kind VARCHAR(50) NOT NULL,
                state VARCHAR(50) NOT NULL,
                labels TEXT[] NOT NULL DEFAULT '{}',
                container VARCHAR(255),
                credential JSONB,
                created_at TIMESTAMPTZ NOT NULL,
                last_heartbeat_at TIMESTAMPTZ NOT NULL,
                last_busy_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scaling_events (
                id UUID PRIMARY KEY,
                repository VARCHAR(255) NOT NULL,
                action VARCHAR(50) NOT NULL,
                reason VARCHAR(50) NOT NULL,
                succeeded BOOLEAN NOT NULL,
                detail TEXT,
                occurred_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_instances_repository ON runner_instances(repository)",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_repository ON scaling_events(repository, occurred_at DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        tracing::info!("Database migrations completed successfully");
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for PgStore {
    async fn save_pool(&self, pool: &RepositoryPool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pools (repository, dedicated_count, dynamic_ceiling,
                scale_up_threshold, idle_timeout_seconds, cooldown_seconds,
                labels, blocked_job_types)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (repository) DO UPDATE SET
                dedicated_count = EXCLUDED.dedicated_count,
                dynamic_ceiling = EXCLUDED.dynamic_ceiling,
                scale_up_threshold = EXCLUDED.scale_up_threshold,
                idle_timeout_seconds = EXCLUDED.idle_timeout_seconds,
                cooldown_seconds = EXCLUDED.cooldown_seconds,
                labels = EXCLUDED.labels,
                blocked_job_types = EXCLUDED.blocked_job_types
            "#,
        )
        .bind(&pool.repository)
        .bind(pool.dedicated_count as i32)
        .bind(pool.dynamic_ceiling as i32)
        .bind(pool.scale_up_threshold)
        .bind(pool.idle_timeout_seconds as i64)
        .bind(pool.cooldown_seconds as i64)
        .bind(&pool.labels)
        .bind(&pool.blocked_job_types)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    async fn save_instance(&self, instance: &RunnerInstance) -> Result<()> {
        let credential = instance
            .credential
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| FleetError::Store(format!("credential serialization: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO runner_instances (id, repository, kind, state, labels,
                container, credential, created_at, last_heartbeat_at, last_busy_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                labels = EXCLUDED.labels,
                container = EXCLUDED.container,
                credential = EXCLUDED.credential,
                last_heartbeat_at = EXCLUDED.last_heartbeat_at,
                last_busy_at = EXCLUDED.last_busy_at
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.repository)
        .bind(kind_str(instance.kind))
        .bind(state_str(instance.state))
        .bind(&instance.labels)
        .bind(&instance.container)
        .bind(credential)
        .bind(instance.created_at)
        .bind(instance.last_heartbeat_at)
        .bind(instance.last_busy_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    async fn delete_instance(&self, _repository: &str, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM runner_instances WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        Ok(())
    }

    async fn load_instances(&self) -> Result<Vec<RunnerInstance>> {
        let rows = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT id, repository, kind, state, labels, container, credential,
                   created_at, last_heartbeat_at, last_busy_at
            FROM runner_instances
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn append_event(&self, event: &ScalingEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scaling_events (id, repository, action, reason,
                succeeded, detail, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id)
        .bind(&event.repository)
        .bind(event.action.to_string())
        .bind(event.reason.as_str())
        .bind(event.succeeded)
        .bind(&event.detail)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }
}

fn store_err(err: sqlx::Error) -> FleetError {
    FleetError::Store(err.to_string())
}

fn kind_str(kind: RunnerKind) -> &'static str {
    match kind {
        RunnerKind::Dedicated => "Dedicated",
        RunnerKind::Dynamic => "Dynamic",
    }
}

fn state_str(state: RunnerState) -> &'static str {
    match state {
        RunnerState::Provisioning => "Provisioning",
        RunnerState::Online => "Online",
        RunnerState::Idle => "Idle",
        RunnerState::Busy => "Busy",
        RunnerState::Draining => "Draining",
        RunnerState::Unhealthy => "Unhealthy",
        RunnerState::Quarantined => "Quarantined",
        RunnerState::Terminated => "Terminated",
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: String,
    repository: String,
    kind: String,
    state: String,
    labels: Vec<String>,
    container: Option<String>,
    credential: Option<serde_json::Value>,
    created_at: chrono::DateTime<chrono::Utc>,
    last_heartbeat_at: chrono::DateTime<chrono::Utc>,
    last_busy_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<InstanceRow> for RunnerInstance {
    fn from(row: InstanceRow) -> Self {
        let kind = match row.kind.as_str() {
            "Dedicated" => RunnerKind::Dedicated,
            _ => RunnerKind::Dynamic,
        };

        let state = match row.state.as_str() {
            "Provisioning" => RunnerState::Provisioning,
            "Online" => RunnerState::Online,
            "Idle" => RunnerState::Idle,
            "Busy" => RunnerState::Busy,
            "Draining" => RunnerState::Draining,
            "Quarantined" => RunnerState::Quarantined,
            "Terminated" => RunnerState::Terminated,
            // A runner we cannot classify is treated as unhealthy and left
            // to the supervisor to recover or remove.
            _ => RunnerState::Unhealthy,
        };

        let credential = row
            .credential
            .and_then(|v| serde_json::from_value(v).ok());

        RunnerInstance {
            id: row.id,
            repository: row.repository,
            kind,
            state,
            labels: row.labels,
            container: row.container,
            credential,
            created_at: row.created_at,
            last_heartbeat_at: row.last_heartbeat_at,
            last_busy_at: row.last_busy_at,
        }
    }
}

// =============================================================================
// In-memory backend
// =============================================================================

/// Volatile store for dev mode and tests
///
/// Keeps the same write-through surface as Postgres without a database;
/// state does not survive a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    pools: HashMap<String, RepositoryPool>,
    instances: HashMap<String, RunnerInstance>,
    events: Vec<ScalingEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded scaling events, oldest first (test observability)
    #[allow(dead_code)]
    pub fn events(&self) -> Vec<ScalingEvent> {
        self.inner.lock().unwrap().events.clone()
    }

    /// Recorded events matching an action and reason (test observability)
    #[allow(dead_code)]
    pub fn events_with(&self, action: ScalingAction, reason: ScalingReason) -> Vec<ScalingEvent> {
        self.inner
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.action == action && e.reason == reason)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn save_pool(&self, pool: &RepositoryPool) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .pools
            .insert(pool.repository.clone(), pool.clone());
        Ok(())
    }

    async fn save_instance(&self, instance: &RunnerInstance) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .instances
            .insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn delete_instance(&self, _repository: &str, id: &str) -> Result<()> {
        self.inner.lock().unwrap().instances.remove(id);
        Ok(())
    }

    async fn load_instances(&self) -> Result<Vec<RunnerInstance>> {
        let mut instances: Vec<RunnerInstance> =
            self.inner.lock().unwrap().instances.values().cloned().collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(instances)
    }

    async fn append_event(&self, event: &ScalingEvent) -> Result<()> {
        self.inner.lock().unwrap().events.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();

        let instance = RunnerInstance::new(
            "acme-widget-ded-0".to_string(),
            "acme/widget".to_string(),
            RunnerKind::Dedicated,
            vec!["linux".to_string()],
        );

        store.save_instance(&instance).await.unwrap();
        let loaded = store.load_instances().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, instance.id);

        store
            .delete_instance("acme/widget", &instance.id)
            .await
            .unwrap();
        assert!(store.load_instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_event_log_is_append_only() {
        let store = MemoryStore::new();

        let event = ScalingEvent::new(
            "acme/widget",
            ScalingAction::ScaleUp,
            ScalingReason::Demand,
        );
        store.append_event(&event).await.unwrap();
        store.append_event(&event.clone().failed()).await.unwrap();

        let events = store.events();
        assert_eq!(events.len(), 2);
        assert!(events[0].succeeded);
        assert!(!events[1].succeeded);
    }
}

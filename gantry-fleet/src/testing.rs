//! Test doubles and fixtures
//!
//! Scripted implementations of the platform and runtime seams, plus a
//! fully wired harness over the in-memory store. Only compiled for tests.

use async_trait::async_trait;
use chrono::Utc;
use gantry_core::domain::job::CiJob;
use gantry_core::domain::pool::RepositoryPool;
use gantry_core::dto::job::QueuedJob;
use gantry_core::dto::runner::{IssuedCredential, RegisterRunner};
use gantry_core::error::RuntimeError;
use gantry_platform::error::{PlatformError, Result as PlatformResult};
use gantry_platform::PlatformApi;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::events::StatusBus;
use crate::registry::store::MemoryStore;
use crate::registry::PoolRegistry;
use crate::runtime::{ContainerInfo, ContainerRuntime, ContainerSpec, RuntimeResult};
use crate::service::health::{HealthConfig, HealthSupervisor};
use crate::service::lifecycle::Provisioner;
use crate::service::poller::QueuePoller;
use crate::service::router::JobRouter;
use crate::service::scaling::ScalingEngine;
use crate::service::token::{RefreshTimers, TokenConfig, TokenManager};

// =============================================================================
// Fixtures
// =============================================================================

pub fn test_pool(repository: &str) -> RepositoryPool {
    RepositoryPool {
        repository: repository.to_string(),
        dedicated_count: 1,
        dynamic_ceiling: 3,
        scale_up_threshold: 1.0,
        idle_timeout_seconds: 300,
        cooldown_seconds: 60,
        labels: vec!["linux".to_string()],
        blocked_job_types: vec![],
    }
}

pub fn test_job(repository: &str) -> CiJob {
    CiJob {
        id: Uuid::new_v4(),
        repository: repository.to_string(),
        required_labels: vec![],
        anti_affinity_labels: vec![],
        job_type: "ci".to_string(),
        parameters: std::collections::HashMap::new(),
        queued_at: Utc::now(),
    }
}

pub fn test_queued_job(repository: &str) -> QueuedJob {
    QueuedJob {
        id: Uuid::new_v4(),
        repository: repository.to_string(),
        required_labels: vec![],
        anti_affinity_labels: vec![],
        job_type: "ci".to_string(),
        parameters: std::collections::HashMap::new(),
        queued_at: Utc::now(),
    }
}

// =============================================================================
// Mock platform
// =============================================================================

/// Scripted CI platform: issues credentials with a fixed TTL, can be told
/// to fail upcoming refreshes or queue listings.
pub struct MockPlatform {
    credential_ttl: chrono::Duration,
    refresh_calls: Mutex<u32>,
    refresh_failures: Mutex<u32>,
    queue_failures: Mutex<u32>,
    registered: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
    queued: Mutex<Vec<QueuedJob>>,
}

impl MockPlatform {
    pub fn with_ttl(credential_ttl: chrono::Duration) -> Self {
        Self {
            credential_ttl,
            refresh_calls: Mutex::new(0),
            refresh_failures: Mutex::new(0),
            queue_failures: Mutex::new(0),
            registered: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            queued: Mutex::new(Vec::new()),
        }
    }

    fn issue(&self) -> IssuedCredential {
        IssuedCredential {
            value: format!("tok-{}", Uuid::new_v4().simple()),
            expires_at: Utc::now() + self.credential_ttl,
        }
    }

    /// Fail the next `n` refresh calls with a transient error
    pub fn fail_refreshes(&self, n: u32) {
        *self.refresh_failures.lock().unwrap() = n;
    }

    /// Fail the next `n` queue listings with a transient error
    pub fn fail_queue_listings(&self, n: u32) {
        *self.queue_failures.lock().unwrap() = n;
    }

    pub fn refresh_call_count(&self) -> u32 {
        *self.refresh_calls.lock().unwrap()
    }

    pub fn registered_runners(&self) -> Vec<String> {
        self.registered.lock().unwrap().clone()
    }

    pub fn removed_runners(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn enqueue_job(&self, job: QueuedJob) {
        self.queued.lock().unwrap().push(job);
    }
}

#[async_trait]
impl PlatformApi for MockPlatform {
    async fn register_runner(&self, req: &RegisterRunner) -> PlatformResult<IssuedCredential> {
        self.registered.lock().unwrap().push(req.runner_name.clone());
        Ok(self.issue())
    }

    async fn refresh_credential(
        &self,
        _repository: &str,
        _runner_name: &str,
    ) -> PlatformResult<IssuedCredential> {
        *self.refresh_calls.lock().unwrap() += 1;

        let mut failures = self.refresh_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(PlatformError::api_error(503, "platform unavailable"));
        }
        Ok(self.issue())
    }

    async fn list_queued_jobs(&self, repository: &str) -> PlatformResult<Vec<QueuedJob>> {
        let mut failures = self.queue_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(PlatformError::api_error(503, "platform unavailable"));
        }

        Ok(self
            .queued
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.repository == repository)
            .cloned()
            .collect())
    }

    async fn report_presence(&self, _repository: &str, _runner_name: &str) -> PlatformResult<()> {
        Ok(())
    }

    async fn remove_runner(&self, _repository: &str, runner_name: &str) -> PlatformResult<()> {
        self.removed.lock().unwrap().push(runner_name.to_string());
        Ok(())
    }
}

// =============================================================================
// Mock runtime
// =============================================================================

struct ContainerEntry {
    repository: String,
    runner_name: String,
    running: bool,
}

/// Recording container runtime with scripted failures
pub struct MockRuntime {
    containers: Mutex<HashMap<String, ContainerEntry>>,
    created: Mutex<Vec<String>>,
    destroyed: Mutex<Vec<String>>,
    create_failures: Mutex<VecDeque<RuntimeError>>,
    destroy_failures: Mutex<u32>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
            create_failures: Mutex::new(VecDeque::new()),
            destroy_failures: Mutex::new(0),
        }
    }

    /// Script the next create call to fail
    pub fn fail_next_create(&self, err: RuntimeError) {
        self.create_failures.lock().unwrap().push_back(err);
    }

    /// Script the next destroy call to fail with a retryable error
    pub fn fail_next_destroy(&self) {
        *self.destroy_failures.lock().unwrap() += 1;
    }

    /// Mark a container as stopped without removing it
    pub fn stop_container(&self, handle: &str) {
        if let Some(entry) = self.containers.lock().unwrap().get_mut(handle) {
            entry.running = false;
        }
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn destroyed_handles(&self) -> Vec<String> {
        self.destroyed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        if let Some(err) = self.create_failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        self.containers.lock().unwrap().insert(
            spec.name.clone(),
            ContainerEntry {
                repository: spec.repository.clone(),
                runner_name: spec.runner_name.clone(),
                running: true,
            },
        );
        self.created.lock().unwrap().push(spec.name.clone());
        Ok(spec.name.clone())
    }

    async fn destroy(&self, handle: &str) -> RuntimeResult<()> {
        let mut failures = self.destroy_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(RuntimeError::Unavailable("runtime busy".to_string()));
        }
        drop(failures);

        // Destroying an absent container is fine (idempotency).
        self.containers.lock().unwrap().remove(handle);
        self.destroyed.lock().unwrap().push(handle.to_string());
        Ok(())
    }

    async fn list(&self, repository: Option<&str>) -> RuntimeResult<Vec<ContainerInfo>> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, entry)| repository.is_none_or(|r| entry.repository == r))
            .map(|(name, entry)| ContainerInfo {
                handle: name.clone(),
                running: entry.running,
                repository: Some(entry.repository.clone()),
                runner_name: Some(entry.runner_name.clone()),
            })
            .collect())
    }
}

// =============================================================================
// Wired harness
// =============================================================================

/// Knobs for the harness that individual tests care about
pub struct TestOptions {
    pub credential_ttl: chrono::Duration,
    pub token: TokenConfig,
    pub health: HealthConfig,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            credential_ttl: chrono::Duration::minutes(60),
            token: TokenConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

/// Everything wired together over the in-memory store
pub struct Harness {
    pub registry: Arc<PoolRegistry>,
    pub store: Arc<MemoryStore>,
    pub platform: Arc<MockPlatform>,
    pub runtime: Arc<MockRuntime>,
    pub timers: RefreshTimers,
    pub provisioner: Arc<Provisioner>,
    pub tokens: Arc<TokenManager>,
    pub scaling: Arc<ScalingEngine>,
    pub health: Arc<HealthSupervisor>,
    pub router: Arc<JobRouter>,
    pub poller: Arc<QueuePoller>,
}

pub async fn harness(pool: RepositoryPool) -> Harness {
    harness_with(pool, TestOptions::default()).await
}

pub async fn harness_with(pool: RepositoryPool, options: TestOptions) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(PoolRegistry::new(store.clone(), StatusBus::new()));
    registry.register_pool(pool).await.unwrap();

    let platform = Arc::new(MockPlatform::with_ttl(options.credential_ttl));
    let runtime = Arc::new(MockRuntime::new());
    let timers = RefreshTimers::new();

    let provisioner = Arc::new(Provisioner::new(
        registry.clone(),
        platform.clone(),
        runtime.clone(),
        timers.clone(),
        "ghcr.io/gantry/test-runner:latest".to_string(),
    ));
    let tokens = Arc::new(TokenManager::new(
        registry.clone(),
        platform.clone(),
        provisioner.clone(),
        timers.clone(),
        options.token,
    ));
    let scaling = Arc::new(ScalingEngine::new(
        registry.clone(),
        provisioner.clone(),
        tokens.clone(),
        Duration::from_secs(30),
    ));
    let health = Arc::new(HealthSupervisor::new(
        registry.clone(),
        runtime.clone(),
        provisioner.clone(),
        tokens.clone(),
        options.health,
    ));
    let router = Arc::new(JobRouter::new(registry.clone(), scaling.clone()));
    let poller = Arc::new(QueuePoller::new(
        registry.clone(),
        platform.clone(),
        router.clone(),
        Duration::from_secs(5),
    ));

    Harness {
        registry,
        store,
        platform,
        runtime,
        timers,
        provisioner,
        tokens,
        scaling,
        health,
        router,
        poller,
    }
}

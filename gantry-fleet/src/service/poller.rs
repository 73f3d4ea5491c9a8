//! Queue poller
//!
//! Observes the platform's job queue on a fixed interval and hands each
//! queued job to the router. The platform is the source of truth for
//! queued and running jobs; this loop is how that truth is observed. A job the router could not place stays on the platform queue
//! and is retried on the next cycle; a platform error for one repository
//! is logged and the cycle moves on.

use gantry_core::domain::job::CiJob;
use gantry_platform::PlatformApi;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::PoolRegistry;
use crate::service::router::{JobRouter, RouteOutcome};

/// How long an assigned job id is remembered before the queue listing may
/// show it again (covers the platform's own assignment lag)
const ASSIGNED_MEMORY: Duration = Duration::from_secs(600);

/// Polls the platform queue and routes what it finds
pub struct QueuePoller {
    registry: Arc<PoolRegistry>,
    platform: Arc<dyn PlatformApi>,
    router: Arc<JobRouter>,
    interval: Duration,
    /// Jobs assigned recently; the platform keeps listing a job as queued
    /// until its runner picks it up, and routing it twice would tie up a
    /// second runner.
    assigned: Mutex<HashMap<Uuid, Instant>>,
}

impl QueuePoller {
    pub fn new(
        registry: Arc<PoolRegistry>,
        platform: Arc<dyn PlatformApi>,
        router: Arc<JobRouter>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            platform,
            router,
            interval,
            assigned: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the polling loop forever
    pub async fn run(self: Arc<Self>) {
        info!(interval = ?self.interval, "starting queue poller");

        let mut interval = time::interval(self.interval);

        loop {
            interval.tick().await;

            match self.poll_once().await {
                Ok(routed) if routed > 0 => info!("routed {} job(s) this cycle", routed),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "poll cycle failed"),
            }
        }
    }

    /// One pass over every configured repository's queue
    pub async fn poll_once(&self) -> gantry_core::error::Result<usize> {
        let mut routed = 0;

        for repository in self.registry.repositories().await {
            let jobs = match self.platform.list_queued_jobs(&repository).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(repository = %repository, error = %e, "failed to list queued jobs");
                    continue;
                }
            };

            if jobs.is_empty() {
                debug!(repository = %repository, "queue empty");
                continue;
            }

            for queued in jobs {
                let job: CiJob = queued.into();

                if self.recently_assigned(job.id) {
                    continue;
                }

                match self.router.route(&job).await {
                    Ok(RouteOutcome::Assigned { runner }) => {
                        debug!(job = %job.id, runner = %runner, "queued job assigned");
                        self.remember_assignment(job.id);
                        routed += 1;
                    }
                    Ok(RouteOutcome::Queued { reason }) => {
                        debug!(job = %job.id, ?reason, "job left queued");
                    }
                    Err(e) if e.is_not_found() => {
                        warn!(job = %job.id, repository = %repository, "job for unknown pool");
                    }
                    Err(e) => {
                        warn!(job = %job.id, error = %e, "routing failed");
                    }
                }
            }
        }

        self.prune_assignments();
        Ok(routed)
    }

    fn recently_assigned(&self, job: Uuid) -> bool {
        self.assigned.lock().unwrap().contains_key(&job)
    }

    fn remember_assignment(&self, job: Uuid) {
        self.assigned.lock().unwrap().insert(job, Instant::now());
    }

    fn prune_assignments(&self) {
        let now = Instant::now();
        self.assigned
            .lock()
            .unwrap()
            .retain(|_, at| now.duration_since(*at) < ASSIGNED_MEMORY);
    }
}

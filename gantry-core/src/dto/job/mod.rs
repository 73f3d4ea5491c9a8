//! Job DTOs
//!
//! Wire shape of the platform's queued-job listing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::job::CiJob;

/// A queued job as returned by the platform's queue endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: Uuid,
    pub repository: String,
    #[serde(default)]
    pub required_labels: Vec<String>,
    #[serde(default)]
    pub anti_affinity_labels: Vec<String>,
    #[serde(default = "default_job_type")]
    pub job_type: String,
    #[serde(default)]
    pub parameters: std::collections::HashMap<String, serde_json::Value>,
    pub queued_at: DateTime<Utc>,
}

fn default_job_type() -> String {
    "ci".to_string()
}

impl From<QueuedJob> for CiJob {
    fn from(job: QueuedJob) -> Self {
        CiJob {
            id: job.id,
            repository: job.repository,
            required_labels: job.required_labels,
            anti_affinity_labels: job.anti_affinity_labels,
            job_type: job.job_type,
            parameters: job.parameters,
            queued_at: job.queued_at,
        }
    }
}

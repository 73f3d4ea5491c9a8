//! CI job domain types
//!
//! The platform's view of a queued job. Gantry routes jobs onto runners but
//! never owns job state; the platform queue remains the source of truth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A queued CI job as reported by the platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiJob {
    pub id: Uuid,

    /// Repository the job belongs to; selects the pool
    pub repository: String,

    /// Labels a runner must advertise to be eligible
    pub required_labels: Vec<String>,

    /// Labels a runner must NOT advertise (anti-affinity)
    pub anti_affinity_labels: Vec<String>,

    /// Job type, checked against the pool's blocked list
    pub job_type: String,

    /// Opaque job payload, passed through to the assigned runner
    pub parameters: std::collections::HashMap<String, serde_json::Value>,

    pub queued_at: DateTime<Utc>,
}

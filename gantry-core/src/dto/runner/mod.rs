//! Runner DTOs
//!
//! Wire shapes for runner registration and credential issuance, plus the
//! instance summary pushed on the status channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::credential::Credential;
use crate::domain::runner::{RunnerInstance, RunnerKind, RunnerState};

/// Request to register (or re-register) a runner with the CI platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRunner {
    /// Repository the runner will serve
    pub repository: String,

    /// Platform-facing runner name (the instance id)
    pub runner_name: String,

    /// Capability labels to advertise
    pub labels: Vec<String>,
}

/// Credential returned by the platform for a registered runner
#[derive(Clone, Serialize, Deserialize)]
pub struct IssuedCredential {
    /// Opaque secret
    pub value: String,

    /// When the credential stops being accepted
    pub expires_at: DateTime<Utc>,
}

impl IssuedCredential {
    /// Binds the issued credential to its owning runner identity
    pub fn into_credential(self, repository: String, runner_name: String) -> Credential {
        Credential {
            value: self.value,
            issued_at: Utc::now(),
            expires_at: self.expires_at,
            repository,
            runner_name,
        }
    }
}

impl std::fmt::Debug for IssuedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCredential")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Summary information about a runner instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: String,
    pub repository: String,
    pub kind: RunnerKind,
    pub state: RunnerState,
    pub label_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl From<&RunnerInstance> for InstanceSummary {
    fn from(instance: &RunnerInstance) -> Self {
        InstanceSummary {
            id: instance.id.clone(),
            repository: instance.repository.clone(),
            kind: instance.kind,
            state: instance.state,
            label_count: instance.labels.len(),
            created_at: instance.created_at,
            last_heartbeat_at: instance.last_heartbeat_at,
        }
    }
}

//! Runner instance domain model
//!
//! Represents one CI-job execution container attached to a repository pool,
//! tracked from provisioning through teardown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::credential::Credential;

/// A runner instance belonging to a repository pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerInstance {
    /// Unique identifier for the runner (also its platform-facing name)
    pub id: String,

    /// Repository whose pool owns this instance
    pub repository: String,

    /// Whether this runner is always-on or demand-provisioned
    pub kind: RunnerKind,

    /// Current lifecycle state
    pub state: RunnerState,

    /// Capability labels this runner advertises for job matching
    pub labels: Vec<String>,

    /// Handle of the backing container, once created
    pub container: Option<String>,

    /// Platform-issued registration credential, once issued
    pub credential: Option<Credential>,

    /// When this instance record was created
    pub created_at: DateTime<Utc>,

    /// Last time this runner was seen alive
    pub last_heartbeat_at: DateTime<Utc>,

    /// Last time this runner finished being busy (None = never assigned)
    pub last_busy_at: Option<DateTime<Utc>>,
}

impl RunnerInstance {
    /// Creates a new instance record in the `Provisioning` state
    pub fn new(id: String, repository: String, kind: RunnerKind, labels: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            repository,
            kind,
            state: RunnerState::Provisioning,
            labels,
            container: None,
            credential: None,
            created_at: now,
            last_heartbeat_at: now,
            last_busy_at: None,
        }
    }

    /// The timestamp this runner has been idle since
    ///
    /// A runner that was never assigned a job counts as idle since creation.
    pub fn idle_since(&self) -> DateTime<Utc> {
        self.last_busy_at.unwrap_or(self.created_at)
    }

    /// Whether the scaling engine may reap this instance
    ///
    /// Only idle dynamic runners are candidates; dedicated runners and
    /// runners that are busy, still provisioning, or already draining are
    /// never reaped.
    pub fn is_reapable(&self) -> bool {
        self.kind == RunnerKind::Dynamic && self.state == RunnerState::Idle
    }

    /// Whether this runner can currently accept a job
    pub fn is_schedulable(&self) -> bool {
        self.state == RunnerState::Idle
    }

    /// Whether this runner counts toward pool utilization as occupied
    pub fn is_busy(&self) -> bool {
        self.state == RunnerState::Busy
    }

    /// Checks that this runner's labels cover all required labels
    pub fn has_labels(&self, required: &[String]) -> bool {
        required.iter().all(|r| self.labels.contains(r))
    }

    /// Checks that this runner carries none of the given labels
    pub fn avoids_labels(&self, excluded: &[String]) -> bool {
        !excluded.iter().any(|e| self.labels.contains(e))
    }
}

/// Whether a runner is part of the fixed pool base or demand-provisioned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunnerKind {
    /// Always-on, one of a fixed per-pool count, never reaped by scaling
    Dedicated,

    /// Provisioned on demand, bounded by the pool ceiling, reaped after
    /// idle-timeout
    Dynamic,
}

impl std::fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerKind::Dedicated => write!(f, "Dedicated"),
            RunnerKind::Dynamic => write!(f, "Dynamic"),
        }
    }
}

/// Lifecycle state of a runner instance
///
/// `Provisioning → Online → {Idle ⇄ Busy} → Draining → Terminated`, with
/// `Unhealthy` reachable from any live state on missed heartbeats and
/// `Quarantined` as the operator-visible dead end after failed recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunnerState {
    /// Container creation and platform registration in progress
    Provisioning,

    /// Registered and live, readiness not yet confirmed
    Online,

    /// Ready and waiting for a job
    Idle,

    /// Currently executing a job
    Busy,

    /// Being decommissioned; takes no new jobs
    Draining,

    /// Missed too many consecutive heartbeats; pending recovery
    Unhealthy,

    /// Recovery failed repeatedly; removed from scheduling, flagged for
    /// operator attention
    Quarantined,

    /// Gone; record kept only until removal from the registry
    Terminated,
}

impl RunnerState {
    /// Validates a state transition
    ///
    /// Illegal transitions indicate a logic error in a control loop and are
    /// rejected at the registry boundary.
    pub fn can_transition_to(self, next: RunnerState) -> bool {
        use RunnerState::*;
        matches!(
            (self, next),
            (Provisioning, Online)
                | (Provisioning, Draining)
                | (Provisioning, Terminated)
                | (Online, Idle)
                | (Online, Busy)
                | (Online, Draining)
                | (Online, Unhealthy)
                | (Idle, Busy)
                | (Idle, Draining)
                | (Idle, Unhealthy)
                | (Busy, Idle)
                | (Busy, Draining)
                | (Busy, Unhealthy)
                | (Unhealthy, Online)
                | (Unhealthy, Draining)
                | (Unhealthy, Quarantined)
                | (Unhealthy, Terminated)
                | (Quarantined, Draining)
                | (Quarantined, Terminated)
                | (Draining, Quarantined)
                | (Draining, Terminated)
        )
    }

    /// Whether the runner is live from the health supervisor's perspective
    pub fn is_live(self) -> bool {
        matches!(
            self,
            RunnerState::Online | RunnerState::Idle | RunnerState::Busy
        )
    }
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerState::Provisioning => write!(f, "Provisioning"),
            RunnerState::Online => write!(f, "Online"),
            RunnerState::Idle => write!(f, "Idle"),
            RunnerState::Busy => write!(f, "Busy"),
            RunnerState::Draining => write!(f, "Draining"),
            RunnerState::Unhealthy => write!(f, "Unhealthy"),
            RunnerState::Quarantined => write!(f, "Quarantined"),
            RunnerState::Terminated => write!(f, "Terminated"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(kind: RunnerKind, state: RunnerState) -> RunnerInstance {
        let mut inst = RunnerInstance::new(
            "acme-widget-dyn-1".to_string(),
            "acme/widget".to_string(),
            kind,
            vec!["linux".to_string(), "x64".to_string()],
        );
        inst.state = state;
        inst
    }

    #[test]
    fn test_lifecycle_transitions_valid() {
        use RunnerState::*;
        assert!(Provisioning.can_transition_to(Online));
        assert!(Online.can_transition_to(Idle));
        assert!(Idle.can_transition_to(Busy));
        assert!(Busy.can_transition_to(Idle));
        assert!(Idle.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Terminated));
        assert!(Busy.can_transition_to(Unhealthy));
        assert!(Unhealthy.can_transition_to(Quarantined));
    }

    #[test]
    fn test_lifecycle_transitions_invalid() {
        use RunnerState::*;
        assert!(!Terminated.can_transition_to(Online));
        assert!(!Idle.can_transition_to(Provisioning));
        assert!(!Draining.can_transition_to(Busy));
        assert!(!Provisioning.can_transition_to(Busy));
        assert!(!Quarantined.can_transition_to(Online));
    }

    #[test]
    fn test_only_idle_dynamic_is_reapable() {
        assert!(instance(RunnerKind::Dynamic, RunnerState::Idle).is_reapable());
        assert!(!instance(RunnerKind::Dedicated, RunnerState::Idle).is_reapable());
        assert!(!instance(RunnerKind::Dynamic, RunnerState::Busy).is_reapable());
        assert!(!instance(RunnerKind::Dynamic, RunnerState::Provisioning).is_reapable());
        assert!(!instance(RunnerKind::Dynamic, RunnerState::Draining).is_reapable());
    }

    #[test]
    fn test_label_matching() {
        let inst = instance(RunnerKind::Dedicated, RunnerState::Idle);
        assert!(inst.has_labels(&["linux".to_string()]));
        assert!(inst.has_labels(&[]));
        assert!(!inst.has_labels(&["linux".to_string(), "gpu".to_string()]));
        assert!(inst.avoids_labels(&["gpu".to_string()]));
        assert!(!inst.avoids_labels(&["x64".to_string()]));
    }

    #[test]
    fn test_idle_since_falls_back_to_creation() {
        let mut inst = instance(RunnerKind::Dynamic, RunnerState::Idle);
        assert_eq!(inst.idle_since(), inst.created_at);

        let later = inst.created_at + chrono::Duration::minutes(10);
        inst.last_busy_at = Some(later);
        assert_eq!(inst.idle_since(), later);
    }
}

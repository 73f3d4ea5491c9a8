//! Scaling event log entries
//!
//! Append-only records of every scaling action (attempted or completed) on a
//! pool. The registry uses the most recent successful entry to enforce the
//! cooldown window; the full log is the audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One scaling action on a pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub id: Uuid,
    pub repository: String,
    pub action: ScalingAction,
    pub reason: ScalingReason,
    /// Whether the action completed; failed attempts stay in the log but do
    /// not gate the cooldown window
    pub succeeded: bool,
    /// Free-form context (runner id, error text)
    pub detail: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl ScalingEvent {
    pub fn new(
        repository: impl Into<String>,
        action: ScalingAction,
        reason: ScalingReason,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            repository: repository.into(),
            action,
            reason,
            succeeded: true,
            detail: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn failed(mut self) -> Self {
        self.succeeded = false;
        self
    }
}

/// Direction of a scaling action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
}

impl std::fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalingAction::ScaleUp => write!(f, "scale-up"),
            ScalingAction::ScaleDown => write!(f, "scale-down"),
        }
    }
}

/// Why a scaling action happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalingReason {
    /// Pool utilization demanded another runner
    Demand,

    /// Dynamic runner sat idle past the pool's idle-timeout
    IdleTimeout,

    /// Health supervisor replaced or removed an unhealthy runner
    Recovery,

    /// Credential refresh exhausted its retries; runner rebuilt from scratch
    ForcedRecreate,
}

impl ScalingReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ScalingReason::Demand => "demand",
            ScalingReason::IdleTimeout => "idle-timeout",
            ScalingReason::Recovery => "recovery",
            ScalingReason::ForcedRecreate => "forced-recreate",
        }
    }
}

impl std::fmt::Display for ScalingReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = ScalingEvent::new("acme/widget", ScalingAction::ScaleUp, ScalingReason::Demand)
            .with_detail("acme-widget-dyn-1");

        assert!(event.succeeded);
        assert_eq!(event.detail.as_deref(), Some("acme-widget-dyn-1"));

        let failed = ScalingEvent::new(
            "acme/widget",
            ScalingAction::ScaleUp,
            ScalingReason::Demand,
        )
        .failed();
        assert!(!failed.succeeded);
    }

    #[test]
    fn test_reason_round_trip() {
        assert_eq!(ScalingReason::ForcedRecreate.as_str(), "forced-recreate");
        assert_eq!(ScalingReason::IdleTimeout.to_string(), "idle-timeout");
    }
}

//! Error types shared across Gantry components
//!
//! Local recovery (retry, re-registration) is always preferred over
//! surfacing an error; only `CapacityExceeded` (as router backpressure) and
//! `UnrecoverableInstance` are operator-visible by design.

use thiserror::Error;

/// Result type alias for fleet operations
pub type Result<T> = std::result::Result<T, FleetError>;

/// Errors produced by the fleet control loops
#[derive(Debug, Error)]
pub enum FleetError {
    /// Unknown pool or instance; a caller bug, never retried
    #[error("not found: {0}")]
    NotFound(String),

    /// Rate limit or timeout against the CI platform; retried with backoff
    #[error("transient platform error: {0}")]
    TransientPlatform(String),

    /// Token refresh exhausted its retries before expiry; the runner is
    /// force-recreated rather than left holding an expired credential
    #[error("credential refresh exhausted for runner {0}")]
    CredentialExhausted(String),

    /// Scale-up requested with the ceiling already reached; surfaced to the
    /// router as backpressure, the job stays queued
    #[error("capacity exceeded for pool {repository}: ceiling {ceiling} reached")]
    CapacityExceeded { repository: String, ceiling: u32 },

    /// Repeated health-check failures survived a recovery attempt; the
    /// instance is quarantined and flagged for operator attention
    #[error("instance {0} is unrecoverable and has been quarantined")]
    UnrecoverableInstance(String),

    /// Illegal runner state transition requested by a control loop
    #[error("invalid state transition for runner {runner}: {from} -> {to}")]
    InvalidTransition {
        runner: String,
        from: String,
        to: String,
    },

    /// Durable state store failure
    #[error("state store error: {0}")]
    Store(String),

    /// Container runtime failure
    #[error("container runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

impl FleetError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Whether a caller should retry this error with backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            FleetError::TransientPlatform(_) | FleetError::Store(_) => true,
            FleetError::Runtime(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Whether this error is backpressure rather than a failure
    pub fn is_backpressure(&self) -> bool {
        matches!(self, FleetError::CapacityExceeded { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FleetError::NotFound(_))
    }
}

/// Container runtime errors
///
/// `ResourceExhausted` and `InvalidSpec` are kept distinct because they get
/// different retry policies upstream: exhaustion clears on the next cycle,
/// a bad spec never will.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("resource exhaustion: {0}")]
    ResourceExhausted(String),

    #[error("invalid container spec: {0}")]
    InvalidSpec(String),

    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

impl RuntimeError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RuntimeError::ResourceExhausted(_) | RuntimeError::Unavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(FleetError::TransientPlatform("429".to_string()).is_retryable());
        assert!(FleetError::Store("connection reset".to_string()).is_retryable());
        assert!(
            FleetError::Runtime(RuntimeError::ResourceExhausted("no space".to_string()))
                .is_retryable()
        );
        assert!(
            !FleetError::Runtime(RuntimeError::InvalidSpec("bad image".to_string()))
                .is_retryable()
        );
        assert!(!FleetError::NotFound("pool x".to_string()).is_retryable());
        assert!(!FleetError::CredentialExhausted("r1".to_string()).is_retryable());
    }

    #[test]
    fn test_backpressure_is_not_a_failure() {
        let err = FleetError::CapacityExceeded {
            repository: "acme/widget".to_string(),
            ceiling: 3,
        };
        assert!(err.is_backpressure());
        assert!(!err.is_retryable());
    }
}

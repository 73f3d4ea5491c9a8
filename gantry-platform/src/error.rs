//! Error types for the platform client

use gantry_core::error::FleetError;
use thiserror::Error;

/// Result type alias for platform API operations
pub type Result<T> = std::result::Result<T, PlatformError>;

/// Errors that can occur when talking to the CI platform
#[derive(Debug, Error)]
pub enum PlatformError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// API returned an error status code
    #[error("platform API error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Error message from the platform
        message: String,
    },

    /// Failed to parse response
    #[error("failed to parse response: {0}")]
    ParseError(String),
}

impl PlatformError {
    /// Create an API error from status code and message
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ApiError { status: 404, .. })
    }

    /// Check if this error is worth retrying with backoff
    ///
    /// Timeouts, connection failures, rate limiting, and server errors are
    /// transient; other 4xx responses are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::ApiError { status, .. } => *status == 429 || *status >= 500,
            Self::ParseError(_) => false,
        }
    }
}

impl From<PlatformError> for FleetError {
    fn from(err: PlatformError) -> Self {
        if err.is_not_found() {
            FleetError::NotFound(err.to_string())
        } else {
            // Non-transient platform failures still go through the bounded
            // retry path; exhaustion escalates them.
            FleetError::TransientPlatform(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(PlatformError::api_error(429, "slow down").is_transient());
        assert!(PlatformError::api_error(503, "maintenance").is_transient());
        assert!(!PlatformError::api_error(401, "bad token").is_transient());
        assert!(!PlatformError::api_error(404, "no such repo").is_transient());
        assert!(!PlatformError::ParseError("truncated".to_string()).is_transient());
    }

    #[test]
    fn test_not_found_maps_to_fleet_not_found() {
        let fleet: FleetError = PlatformError::api_error(404, "no such repo").into();
        assert!(fleet.is_not_found());

        let fleet: FleetError = PlatformError::api_error(500, "oops").into();
        assert!(fleet.is_retryable());
    }
}

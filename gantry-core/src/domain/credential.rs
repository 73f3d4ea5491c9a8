//! Runner registration credential
//!
//! The time-limited secret a runner uses to authenticate to the CI platform.
//! Each credential is owned by exactly one runner instance and is never
//! shared; the fleet refreshes it proactively before expiry.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A platform-issued registration credential
///
/// The secret value is excluded from `Debug` output so instances can be
/// logged without leaking it.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Opaque secret issued by the platform
    pub value: String,

    /// When the platform issued this credential
    pub issued_at: DateTime<Utc>,

    /// When this credential stops being accepted
    pub expires_at: DateTime<Utc>,

    /// Repository this credential is scoped to
    pub repository: String,

    /// Runner identity this credential is scoped to
    pub runner_name: String,
}

impl Credential {
    /// Total time-to-live of this credential
    pub fn ttl(&self) -> Duration {
        self.expires_at - self.issued_at
    }

    /// Offset from issue at which the proactive refresh should fire
    ///
    /// `fraction` is the configured share of the TTL to consume before
    /// refreshing (e.g., 0.75 of a 60-minute TTL fires at minute 45).
    pub fn refresh_after(&self, fraction: f64) -> Duration {
        let secs = self.ttl().num_seconds() as f64 * fraction;
        Duration::seconds(secs as i64)
    }

    /// Absolute time at which the proactive refresh should fire
    pub fn refresh_at(&self, fraction: f64) -> DateTime<Utc> {
        self.issued_at + self.refresh_after(fraction)
    }

    /// Whether the credential is past its expiry
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("value", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("repository", &self.repository)
            .field("runner_name", &self.runner_name)
            .finish()
    }
}

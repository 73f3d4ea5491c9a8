//! Container Lifecycle Driver
//!
//! The only component that talks to the container runtime. A deliberately
//! thin, side-effecting adapter: create a runner unit, destroy one, list
//! the units we manage. All policy lives in the services above it.

pub mod podman;

pub use podman::PodmanRuntime;

use async_trait::async_trait;
use gantry_core::error::RuntimeError;

/// Result type alias for container runtime operations
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Specification for one runner container
#[derive(Clone)]
pub struct ContainerSpec {
    /// Container name (also used as the destroy handle)
    pub name: String,

    /// Image to run
    pub image: String,

    /// Repository the runner serves, stamped as a label for list filtering
    pub repository: String,

    /// Runner identity, stamped as a label and passed to the entrypoint
    pub runner_name: String,

    /// Capability labels passed to the runner process
    pub labels: Vec<String>,

    /// Registration credential injected as an environment variable
    pub credential_value: String,
}

impl std::fmt::Debug for ContainerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerSpec")
            .field("name", &self.name)
            .field("image", &self.image)
            .field("repository", &self.repository)
            .field("runner_name", &self.runner_name)
            .field("labels", &self.labels)
            .field("credential_value", &"<redacted>")
            .finish()
    }
}

/// One managed container as reported by the runtime
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    /// Destroy handle (the container name)
    pub handle: String,

    /// Whether the container is currently running
    pub running: bool,

    /// Repository label, if present
    pub repository: Option<String>,

    /// Runner identity label, if present
    pub runner_name: Option<String>,
}

/// Container runtime operations consumed by the fleet
///
/// Guarantees required of implementations:
/// - `destroy` is idempotent: destroying an absent container is Ok.
/// - `create` failures distinguish resource exhaustion from a bad spec,
///   because the two get different retry policies upstream.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a runner container, returning its handle
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    /// Stop and remove a container by handle
    async fn destroy(&self, handle: &str) -> RuntimeResult<()>;

    /// List managed containers, optionally scoped to one repository
    async fn list(&self, repository: Option<&str>) -> RuntimeResult<Vec<ContainerInfo>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_debug_redacts_credential() {
        let spec = ContainerSpec {
            name: "gantry-acme-widget-dyn-1".to_string(),
            image: "ghcr.io/acme/runner:latest".to_string(),
            repository: "acme/widget".to_string(),
            runner_name: "acme-widget-dyn-1".to_string(),
            labels: vec!["linux".to_string()],
            credential_value: "tok-secret-123".to_string(),
        };

        let rendered = format!("{:?}", spec);
        assert!(!rendered.contains("tok-secret-123"));
        assert!(rendered.contains("<redacted>"));
    }
}

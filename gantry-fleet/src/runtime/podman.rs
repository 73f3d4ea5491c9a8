//! Podman container management
//!
//! Shells out to the podman CLI to run, remove, and list runner
//! containers. Every invocation is bounded by a timeout; a timed-out
//! command is reported as the runtime being unavailable, which upstream
//! treats as retryable.

use async_trait::async_trait;
use gantry_core::error::RuntimeError;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{ContainerInfo, ContainerRuntime, ContainerSpec, RuntimeResult};

/// Label stamped on every container we create, used as the list filter
const MANAGED_LABEL: &str = "gantry.managed=true";

/// Upper bound for a single podman invocation
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Container runtime adapter backed by the podman CLI
pub struct PodmanRuntime {
    binary: String,
}

impl PodmanRuntime {
    pub fn new() -> Self {
        Self {
            binary: "podman".to_string(),
        }
    }

    /// Checks that podman is installed and responsive
    pub async fn check_available(&self) -> RuntimeResult<()> {
        let output = self.run(&["--version".to_string()]).await?;

        let version = String::from_utf8_lossy(&output.stdout);
        info!("Podman is available: {}", version.trim());
        Ok(())
    }

    async fn run(&self, args: &[String]) -> RuntimeResult<std::process::Output> {
        let mut command = Command::new(&self.binary);
        command.args(args);

        let result = tokio::time::timeout(COMMAND_TIMEOUT, command.output()).await;

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(RuntimeError::Unavailable(format!(
                    "failed to execute podman: {}",
                    e
                )));
            }
            Err(_) => {
                return Err(RuntimeError::Unavailable(format!(
                    "podman command timed out after {:?}",
                    COMMAND_TIMEOUT
                )));
            }
        };

        Ok(output)
    }
}

impl Default for PodmanRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        info!(
            container = %spec.name,
            image = %spec.image,
            repository = %spec.repository,
            "creating runner container"
        );

        let mut args: Vec<String> = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--label".to_string(),
            MANAGED_LABEL.to_string(),
            "--label".to_string(),
            format!("gantry.repository={}", spec.repository),
            "--label".to_string(),
            format!("gantry.runner={}", spec.runner_name),
            "--env".to_string(),
            format!("RUNNER_TOKEN={}", spec.credential_value),
            "--env".to_string(),
            format!("RUNNER_NAME={}", spec.runner_name),
            "--env".to_string(),
            format!("RUNNER_REPOSITORY={}", spec.repository),
            "--env".to_string(),
            format!("RUNNER_LABELS={}", spec.labels.join(",")),
        ];
        args.push(spec.image.clone());

        let output = self.run(&args).await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !stdout.trim().is_empty() {
            debug!("podman run stdout: {}", stdout.trim());
        }
        if !stderr.trim().is_empty() {
            debug!("podman run stderr: {}", stderr.trim());
        }

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            warn!(
                container = %spec.name,
                exit_code,
                stderr = %stderr.trim(),
                "failed to create container"
            );
            return Err(classify_create_failure(stderr.trim()));
        }

        let container_id = stdout.trim().to_string();
        info!(
            container = %spec.name,
            id = %container_id,
            "container started"
        );

        Ok(spec.name.clone())
    }

    async fn destroy(&self, handle: &str) -> RuntimeResult<()> {
        debug!(container = %handle, "removing container");

        let args = vec!["rm".to_string(), "-f".to_string(), handle.to_string()];
        let output = self.run(&args).await?;

        if output.status.success() {
            debug!(container = %handle, "container removed");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        // Destroying an already-absent container is not an error.
        if is_absent_error(&stderr) {
            debug!(container = %handle, "container already absent");
            return Ok(());
        }

        Err(RuntimeError::Other(format!(
            "failed to remove container {}: {}",
            handle,
            stderr.trim()
        )))
    }

    async fn list(&self, repository: Option<&str>) -> RuntimeResult<Vec<ContainerInfo>> {
        let mut args = vec![
            "ps".to_string(),
            "-a".to_string(),
            "--filter".to_string(),
            format!("label={}", MANAGED_LABEL),
            "--format".to_string(),
            "json".to_string(),
        ];
        if let Some(repository) = repository {
            args.push("--filter".to_string());
            args.push(format!("label=gantry.repository={}", repository));
        }

        let output = self.run(&args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::Other(format!(
                "failed to list containers: {}",
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ps_output(&stdout)
    }
}

/// Classifies a `podman run` failure by its stderr text
///
/// Resource exhaustion clears on a later cycle; a bad spec never will, so
/// the two must not share a retry policy.
fn classify_create_failure(stderr: &str) -> RuntimeError {
    let lowered = stderr.to_lowercase();

    if lowered.contains("no space left")
        || lowered.contains("cannot allocate memory")
        || lowered.contains("disk quota exceeded")
        || lowered.contains("too many")
    {
        return RuntimeError::ResourceExhausted(stderr.to_string());
    }

    if lowered.contains("unable to find image")
        || lowered.contains("manifest unknown")
        || lowered.contains("invalid")
        || lowered.contains("unknown flag")
    {
        return RuntimeError::InvalidSpec(stderr.to_string());
    }

    RuntimeError::Other(stderr.to_string())
}

fn is_absent_error(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    lowered.contains("no such container") || lowered.contains("does not exist")
}

fn parse_ps_output(stdout: &str) -> RuntimeResult<Vec<ContainerInfo>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let rows: Vec<PsRow> = serde_json::from_str(trimmed)
        .map_err(|e| RuntimeError::Other(format!("failed to parse podman ps output: {}", e)))?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

// =============================================================================
// Podman JSON Row Types
// =============================================================================

#[derive(Deserialize)]
struct PsRow {
    #[serde(rename = "Names", default)]
    names: Vec<String>,
    #[serde(rename = "Id", default)]
    id: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Labels", default)]
    labels: HashMap<String, String>,
}

impl From<PsRow> for ContainerInfo {
    fn from(row: PsRow) -> Self {
        let handle = row
            .names
            .first()
            .cloned()
            .unwrap_or_else(|| row.id.clone());

        ContainerInfo {
            handle,
            running: row.state.eq_ignore_ascii_case("running"),
            repository: row.labels.get("gantry.repository").cloned(),
            runner_name: row.labels.get("gantry.runner").cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_failure_classification() {
        assert!(matches!(
            classify_create_failure("Error: no space left on device"),
            RuntimeError::ResourceExhausted(_)
        ));
        assert!(matches!(
            classify_create_failure("Error: unable to find image 'nope:latest'"),
            RuntimeError::InvalidSpec(_)
        ));
        assert!(matches!(
            classify_create_failure("Error: something else entirely"),
            RuntimeError::Other(_)
        ));
    }

    #[test]
    fn test_absent_container_is_not_an_error() {
        assert!(is_absent_error("Error: no such container gantry-x"));
        assert!(is_absent_error("Error: container foo does not exist"));
        assert!(!is_absent_error("Error: permission denied"));
    }

    #[test]
    fn test_parse_ps_output() {
        let json = r#"[
            {
                "Id": "abc123",
                "Names": ["gantry-acme-widget-dyn-1"],
                "State": "running",
                "Labels": {
                    "gantry.managed": "true",
                    "gantry.repository": "acme/widget",
                    "gantry.runner": "acme-widget-dyn-1"
                }
            },
            {
                "Id": "def456",
                "Names": ["gantry-acme-widget-dyn-2"],
                "State": "exited",
                "Labels": {"gantry.managed": "true"}
            }
        ]"#;

        let infos = parse_ps_output(json).unwrap();
        assert_eq!(infos.len(), 2);
        assert!(infos[0].running);
        assert_eq!(infos[0].repository.as_deref(), Some("acme/widget"));
        assert_eq!(infos[0].runner_name.as_deref(), Some("acme-widget-dyn-1"));
        assert!(!infos[1].running);

        assert!(parse_ps_output("").unwrap().is_empty());
    }
}

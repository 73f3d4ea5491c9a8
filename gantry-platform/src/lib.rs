//! Gantry Platform Client
//!
//! A typed HTTP client for the CI platform API consumed by the fleet:
//! credential issuance and refresh, queued-job listing, and runner presence.
//!
//! The [`PlatformApi`] trait is the seam the control loops depend on; the
//! [`PlatformClient`] is its HTTP implementation. Tests substitute their own
//! implementations with scripted behavior.
//!
//! # Example
//!
//! ```no_run
//! use gantry_platform::{PlatformApi, PlatformClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = PlatformClient::new("https://ci.example.com", "api-token");
//!     let jobs = client.list_queued_jobs("acme/widget").await?;
//!     println!("{} job(s) queued", jobs.len());
//!     Ok(())
//! }
//! ```

pub mod error;

mod credentials;
mod queue;
mod runners;

// Re-export commonly used types
pub use error::{PlatformError, Result};
pub use gantry_core::dto::job::QueuedJob;
pub use gantry_core::dto::runner::{IssuedCredential, RegisterRunner};

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// The CI platform operations the fleet consumes
///
/// Every call is bounded by the client's request timeout; a timeout is a
/// retryable failure, never a fatal one.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// Register a runner and obtain its first credential
    async fn register_runner(&self, req: &RegisterRunner) -> Result<IssuedCredential>;

    /// Obtain a fresh credential for an already-registered runner
    async fn refresh_credential(
        &self,
        repository: &str,
        runner_name: &str,
    ) -> Result<IssuedCredential>;

    /// List the jobs currently queued for a repository
    async fn list_queued_jobs(&self, repository: &str) -> Result<Vec<QueuedJob>>;

    /// Report a runner as alive to the platform roster
    async fn report_presence(&self, repository: &str, runner_name: &str) -> Result<()>;

    /// Remove a runner from the platform roster
    async fn remove_runner(&self, repository: &str, runner_name: &str) -> Result<()>;
}

/// Default per-request timeout for platform calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the CI platform API
#[derive(Debug, Clone)]
pub struct PlatformClient {
    /// Base URL of the platform API (e.g., "https://ci.example.com")
    base_url: String,
    /// Bearer token authenticating the fleet manager itself
    api_token: String,
    /// HTTP client instance
    client: Client,
}

impl PlatformClient {
    /// Create a new platform client with the default request timeout
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");

        Self::with_client(base_url, api_token, client)
    }

    /// Create a platform client with a custom HTTP client
    ///
    /// This allows configuring timeouts, proxies, TLS settings, etc.
    pub fn with_client(
        base_url: impl Into<String>,
        api_token: impl Into<String>,
        client: Client,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.into(),
            client,
        }
    }

    /// Get the base URL of the platform
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_token)
    }

    pub(crate) fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_token)
    }

    pub(crate) fn delete(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .delete(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_token)
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle an API response and deserialize JSON
    pub(crate) async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PlatformError::api_error(status.as_u16(), error_text));
        }

        response.json().await.map_err(|e| {
            PlatformError::ParseError(format!("failed to parse JSON response: {}", e))
        })
    }

    /// Handle an API response that returns no content
    pub(crate) async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PlatformError::api_error(status.as_u16(), error_text));
        }

        Ok(())
    }
}

#[async_trait]
impl PlatformApi for PlatformClient {
    async fn register_runner(&self, req: &RegisterRunner) -> Result<IssuedCredential> {
        PlatformClient::register_runner(self, req).await
    }

    async fn refresh_credential(
        &self,
        repository: &str,
        runner_name: &str,
    ) -> Result<IssuedCredential> {
        PlatformClient::refresh_credential(self, repository, runner_name).await
    }

    async fn list_queued_jobs(&self, repository: &str) -> Result<Vec<QueuedJob>> {
        PlatformClient::list_queued_jobs(self, repository).await
    }

    async fn report_presence(&self, repository: &str, runner_name: &str) -> Result<()> {
        PlatformClient::report_presence(self, repository, runner_name).await
    }

    async fn remove_runner(&self, repository: &str, runner_name: &str) -> Result<()> {
        PlatformClient::remove_runner(self, repository, runner_name).await
    }
}

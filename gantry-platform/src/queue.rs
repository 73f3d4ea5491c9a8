//! Job queue endpoints
//!
//! The platform queue is the source of truth for queued and running jobs;
//! the fleet only observes it.

use crate::PlatformClient;
use crate::error::Result;
use gantry_core::dto::job::QueuedJob;

impl PlatformClient {
    /// List the jobs currently queued for a repository
    pub async fn list_queued_jobs(&self, repository: &str) -> Result<Vec<QueuedJob>> {
        let response = self
            .get(&format!("/api/repos/{}/queue", repository))
            .send()
            .await?;

        self.handle_response(response).await
    }
}

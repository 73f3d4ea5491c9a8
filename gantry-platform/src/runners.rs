//! Runner roster endpoints

use crate::PlatformClient;
use crate::error::Result;

impl PlatformClient {
    /// Report a runner as alive to the platform roster
    ///
    /// Keeps the runner listed even when it has not picked up a job
    /// recently. Should be called periodically.
    pub async fn report_presence(&self, repository: &str, runner_name: &str) -> Result<()> {
        let response = self
            .post(&format!(
                "/api/repos/{}/runners/{}/presence",
                repository, runner_name
            ))
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Remove a runner from the platform roster
    ///
    /// Called during decommissioning, after the backing container is gone.
    pub async fn remove_runner(&self, repository: &str, runner_name: &str) -> Result<()> {
        let response = self
            .delete(&format!(
                "/api/repos/{}/runners/{}",
                repository, runner_name
            ))
            .send()
            .await?;

        self.handle_empty_response(response).await
    }
}

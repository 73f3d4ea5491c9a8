//! Credential issuance and refresh endpoints

use crate::PlatformClient;
use crate::error::Result;
use gantry_core::dto::runner::{IssuedCredential, RegisterRunner};

impl PlatformClient {
    /// Register a runner and obtain its first credential
    ///
    /// Registration is idempotent on the platform side: re-registering an
    /// existing runner name returns a fresh credential for it.
    pub async fn register_runner(&self, req: &RegisterRunner) -> Result<IssuedCredential> {
        let response = self
            .post("/api/runners/register")
            .json(req)
            .send()
            .await?;

        tracing::debug!(
            repository = %req.repository,
            runner = %req.runner_name,
            "requested runner registration"
        );

        self.handle_response(response).await
    }

    /// Obtain a fresh credential for an already-registered runner
    pub async fn refresh_credential(
        &self,
        repository: &str,
        runner_name: &str,
    ) -> Result<IssuedCredential> {
        let response = self
            .post(&format!(
                "/api/repos/{}/runners/{}/credential",
                repository, runner_name
            ))
            .send()
            .await?;

        self.handle_response(response).await
    }
}

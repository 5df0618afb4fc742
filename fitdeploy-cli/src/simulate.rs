//! Simulated hosting for runs without a control plane URL.

use async_trait::async_trait;
use fitdeploy_core::error::HostingError;
use fitdeploy_core::hosting::InvocationHandler;
use fitdeploy_core::serving::{LinearHooks, ServingContainer};
use fitdeploy_core::storage::ModelArtifactStore;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Serves the job's final artifact, loaded on the first invocation so that a
/// run can train before anything asks for a prediction.
pub struct ArtifactBackedHandler {
    artifacts: Arc<ModelArtifactStore>,
    job: String,
    container: OnceCell<ServingContainer<LinearHooks>>,
}

impl ArtifactBackedHandler {
    pub fn new(artifacts: Arc<ModelArtifactStore>, job: impl Into<String>) -> Self {
        Self {
            artifacts,
            job: job.into(),
            container: OnceCell::new(),
        }
    }

    async fn container(&self) -> Result<&ServingContainer<LinearHooks>, HostingError> {
        self.container
            .get_or_try_init(|| ServingContainer::load(LinearHooks, &self.artifacts, &self.job))
            .await
            .map_err(|e| HostingError::Api {
                status: e.status_code(),
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl InvocationHandler for ArtifactBackedHandler {
    async fn invoke(
        &self,
        content_type: &str,
        accept: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, HostingError> {
        self.container()
            .await?
            .invoke(content_type, accept, body)
            .await
    }
}

//! End-to-end train → deploy → predict → teardown run.

use crate::error::{ReconcileError, TrainingError};
use crate::hosting::EndpointStatus;
use crate::reconciler::{DeploymentRequest, EndpointHandle, EndpointReconciler, TeardownReport};
use crate::training::{TrainingJob, TrainingOutcome, TrainingRunner};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Results of every stage of one pipeline run.
///
/// A stage that never ran is `None`.
#[derive(Debug, Default)]
pub struct PipelineReport {
    pub training: Option<Result<TrainingOutcome, TrainingError>>,
    pub deployment: Option<Result<EndpointHandle, ReconcileError>>,
    pub prediction: Option<Result<Value, ReconcileError>>,
    pub teardown: Option<TeardownReport>,
}

impl PipelineReport {
    /// Every stage that ran succeeded, the endpoint served, and teardown was clean.
    pub fn succeeded(&self) -> bool {
        let trained = !matches!(self.training, Some(Err(_)));
        let deployed = matches!(&self.deployment, Some(Ok(h)) if h.is_in_service());
        let predicted = matches!(self.prediction, Some(Ok(_)));
        let clean = self.teardown.as_ref().is_some_and(TeardownReport::is_clean);
        trained && deployed && predicted && clean
    }
}

/// One scripted run: optionally train, then deploy, send a sample payload,
/// and tear the endpoint down.
pub struct TrainAndDeploy {
    reconciler: Arc<EndpointReconciler>,
    request: DeploymentRequest,
    payload: Value,
    training: Option<(Arc<TrainingRunner>, TrainingJob)>,
}

impl TrainAndDeploy {
    pub fn new(reconciler: Arc<EndpointReconciler>, request: DeploymentRequest, payload: Value) -> Self {
        Self {
            reconciler,
            request,
            payload,
            training: None,
        }
    }

    /// Train before deploying; the deployment then serves the fresh artifact.
    pub fn with_training(mut self, runner: Arc<TrainingRunner>, job: TrainingJob) -> Self {
        self.training = Some((runner, job));
        self
    }

    pub async fn run(&self) -> PipelineReport {
        let mut report = PipelineReport::default();
        let mut request = self.request.clone();

        if let Some((runner, job)) = &self.training {
            match runner.run(job).await {
                Ok(outcome) => {
                    request.model.model_data = outcome.artifact.uri.clone();
                    report.training = Some(Ok(outcome));
                }
                Err(e) => {
                    warn!(job = %job.job_name, error = %e, "Training failed, skipping deployment");
                    report.training = Some(Err(e));
                    return report;
                }
            }
        }

        let deployment = self.reconciler.deploy(&request).await;
        let handle = match &deployment {
            Ok(handle) => handle.clone(),
            // Creation may have stopped partway; clean up whatever exists.
            Err(e) => {
                warn!(endpoint = %request.endpoint_name, error = %e, "Deployment failed");
                request.handle(EndpointStatus::Absent)
            }
        };

        if deployment.is_ok() {
            let prediction = self.reconciler.predict(&handle, &self.payload).await;
            match &prediction {
                Ok(value) => info!(endpoint = %handle.endpoint_name, %value, "Sample prediction"),
                Err(e) => warn!(endpoint = %handle.endpoint_name, error = %e, "Sample prediction failed"),
            }
            report.prediction = Some(prediction);
        }
        report.deployment = Some(deployment);

        let teardown = self.reconciler.teardown(&handle).await;
        for (step, failure) in teardown.failures() {
            warn!(endpoint = %handle.endpoint_name, ?step, error = %failure, "Teardown step failed");
        }
        report.teardown = Some(teardown);
        report
    }
}

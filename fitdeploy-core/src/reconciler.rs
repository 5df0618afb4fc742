//! Endpoint reconciler: the lifecycle of one named inference endpoint.
//!
//! Guarantees that no stale endpoint or configuration survives under a name
//! before a new deployment is created, waits (bounded) for provisioning to
//! settle, and tears everything down best-effort.
//!
//! Cleanup and teardown never fail. Every problem they hit is captured as a
//! typed [`StepFailure`] inside the returned report and logged at `warn`.
//!
//! Two callers reconciling the same endpoint name at once is not supported;
//! the control plane resolves such races as last-write-wins.

use crate::codec::CodecSpec;
use crate::error::{HostingError, ReconcileError};
use crate::hosting::{EndpointConfigSpec, EndpointStatus, HostingControlPlane, ModelSpec};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Roughly 30 years; stands in for deadlines that overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// How often and for how long to poll the control plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSettings {
    /// Delay between describe calls (the first delay when backing off).
    pub interval: Duration,
    /// Total time to keep polling.
    pub timeout: Duration,
    /// Multiplier applied to the interval after each poll; 1.0 keeps it fixed.
    pub backoff_factor: f64,
    /// Upper bound for the interval when backing off.
    pub max_interval: Duration,
}

impl PollSettings {
    /// Fixed-interval polling.
    pub fn fixed(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            backoff_factor: 1.0,
            max_interval: interval,
        }
    }

    /// Grow the interval by `factor` after every poll, capped at `max_interval`.
    pub fn with_backoff(mut self, factor: f64, max_interval: Duration) -> Self {
        self.backoff_factor = factor.max(1.0);
        self.max_interval = max_interval.max(self.interval);
        self
    }

    /// Hard upper bound on a wait using these settings.
    pub fn bound(&self) -> Duration {
        self.timeout
            .saturating_add(self.max_interval.max(self.interval))
    }

    fn next_interval(&self, current: Duration) -> Duration {
        if self.backoff_factor <= 1.0 {
            return current;
        }
        Duration::try_from_secs_f64(current.as_secs_f64() * self.backoff_factor)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }

    /// When polling must stop, saturating far in the future for huge timeouts.
    fn deadline(&self) -> Instant {
        let now = Instant::now();
        now.checked_add(self.timeout)
            .unwrap_or_else(|| now + FAR_FUTURE)
    }

    /// Provisioning defaults: poll every 30 s for up to 10 minutes.
    pub fn provisioning_default() -> Self {
        Self::fixed(Duration::from_secs(30), Duration::from_secs(600))
    }

    /// Deletion defaults: poll every 5 s for up to 5 minutes.
    pub fn deletion_default() -> Self {
        Self::fixed(Duration::from_secs(5), Duration::from_secs(300))
    }
}

/// How a wait for a terminal status ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WaitOutcome {
    /// The endpoint reached `in_service` or `failed`.
    Terminal { status: EndpointStatus },
    /// The timeout elapsed first; `last` is the most recent status seen.
    TimedOut { last: Option<EndpointStatus> },
    /// The endpoint stopped existing while we were waiting.
    Vanished,
}

impl WaitOutcome {
    /// The final observed status, collapsing the distinction between the variants.
    pub fn last_status(&self) -> Option<EndpointStatus> {
        match self {
            Self::Terminal { status } => Some(*status),
            Self::TimedOut { last } => *last,
            Self::Vanished => Some(EndpointStatus::Absent),
        }
    }

    pub fn is_in_service(&self) -> bool {
        matches!(
            self,
            Self::Terminal {
                status: EndpointStatus::InService
            }
        )
    }
}

/// A cleanup or teardown step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    DescribeEndpoint,
    DeleteModel,
    DeleteEndpoint,
    AwaitDeletion,
    DeleteEndpointConfig,
}

/// Why a best-effort step did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum StepFailure {
    #[error(transparent)]
    Hosting(#[from] HostingError),

    #[error("endpoint still present after {waited_secs}s")]
    StillPresent { waited_secs: u64 },
}

/// Result of one best-effort step.
#[derive(Debug)]
pub enum StepResult {
    Done,
    /// The resource did not exist, which is what the step wanted.
    AlreadyGone,
    Failed(StepFailure),
}

#[derive(Debug)]
pub struct StepOutcome {
    pub step: Step,
    pub result: StepResult,
}

/// What `ensure_absent` found and did.
#[derive(Debug)]
pub struct CleanupReport {
    pub endpoint_name: String,
    /// Status seen before cleanup; `None` if the describe call itself failed.
    pub found: Option<EndpointStatus>,
    pub steps: Vec<StepOutcome>,
}

impl CleanupReport {
    /// No step failed.
    pub fn is_clean(&self) -> bool {
        failures(&self.steps).next().is_none()
    }

    pub fn failures(&self) -> impl Iterator<Item = (Step, &StepFailure)> {
        failures(&self.steps)
    }
}

/// What `teardown` did, one entry per step, in order.
#[derive(Debug)]
pub struct TeardownReport {
    pub endpoint_name: String,
    pub steps: Vec<StepOutcome>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        failures(&self.steps).next().is_none()
    }

    pub fn failures(&self) -> impl Iterator<Item = (Step, &StepFailure)> {
        failures(&self.steps)
    }

    /// Whether the given step was attempted.
    pub fn attempted(&self, step: Step) -> bool {
        self.steps.iter().any(|s| s.step == step)
    }
}

fn failures(steps: &[StepOutcome]) -> impl Iterator<Item = (Step, &StepFailure)> {
    steps.iter().filter_map(|s| match &s.result {
        StepResult::Failed(f) => Some((s.step, f)),
        _ => None,
    })
}

/// Everything needed to stand up an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub endpoint_name: String,
    pub model: ModelSpec,
    pub instance_count: u32,
    pub instance_type: String,
    pub codec: CodecSpec,
}

impl DeploymentRequest {
    fn validate(&self) -> Result<(), ReconcileError> {
        if self.endpoint_name.trim().is_empty() {
            return Err(ReconcileError::InvalidRequest {
                message: "endpoint name must not be empty".into(),
            });
        }
        if self.model.name.trim().is_empty() {
            return Err(ReconcileError::InvalidRequest {
                message: "model name must not be empty".into(),
            });
        }
        if self.instance_count == 0 {
            return Err(ReconcileError::InvalidRequest {
                message: "instance count must be at least 1".into(),
            });
        }
        self.codec.resolve()?;
        Ok(())
    }

    /// The configuration shares the endpoint's name.
    pub fn config_name(&self) -> &str {
        &self.endpoint_name
    }

    /// A handle naming every resource this request creates, for teardown
    /// after a deploy that failed partway.
    pub fn handle(&self, status: EndpointStatus) -> EndpointHandle {
        EndpointHandle {
            endpoint_name: self.endpoint_name.clone(),
            config_name: self.config_name().to_string(),
            model_name: self.model.name.clone(),
            codec: self.codec.clone(),
            status,
            provisioning: None,
        }
    }
}

/// A deployed (or at least requested) endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointHandle {
    pub endpoint_name: String,
    pub config_name: String,
    pub model_name: String,
    pub codec: CodecSpec,
    /// Last status observed by the reconciler.
    pub status: EndpointStatus,
    /// How provisioning ended, when this handle came from `deploy`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning: Option<WaitOutcome>,
}

impl EndpointHandle {
    pub fn is_in_service(&self) -> bool {
        self.status == EndpointStatus::InService
    }
}

/// Drives one endpoint name through deploy, predict and teardown.
///
/// Two reconcilers working the same name at once race at the control plane;
/// the last write wins and neither sees a coherent lifecycle.
pub struct EndpointReconciler {
    plane: Arc<dyn HostingControlPlane>,
    provision_poll: PollSettings,
    delete_poll: PollSettings,
}

impl EndpointReconciler {
    pub fn new(plane: Arc<dyn HostingControlPlane>) -> Self {
        Self {
            plane,
            provision_poll: PollSettings::provisioning_default(),
            delete_poll: PollSettings::deletion_default(),
        }
    }

    pub fn with_provision_poll(mut self, poll: PollSettings) -> Self {
        self.provision_poll = poll;
        self
    }

    pub fn with_delete_poll(mut self, poll: PollSettings) -> Self {
        self.delete_poll = poll;
        self
    }

    pub fn provision_poll(&self) -> &PollSettings {
        &self.provision_poll
    }

    /// Current status, with "not found" reported as [`EndpointStatus::Absent`].
    pub async fn observe(&self, name: &str) -> Result<EndpointStatus, HostingError> {
        match self.plane.describe_endpoint(name).await {
            Ok(desc) => Ok(desc.status),
            Err(e) if e.is_not_found() => Ok(EndpointStatus::Absent),
            Err(e) => Err(e),
        }
    }

    /// Remove any endpoint and configuration living under `name`.
    ///
    /// A name with nothing deployed is a no-op. Failures are recorded in the
    /// report and never stop the remaining steps; a later create call fails
    /// loudly if cleanup did not actually work.
    pub async fn ensure_absent(&self, name: &str) -> CleanupReport {
        let mut report = CleanupReport {
            endpoint_name: name.to_string(),
            found: None,
            steps: Vec::new(),
        };

        let mut described_config = None;
        match self.plane.describe_endpoint(name).await {
            Err(e) if e.is_not_found() => {
                debug!(endpoint = name, "Nothing to clean up");
                report.found = Some(EndpointStatus::Absent);
                return report;
            }
            Ok(desc) => {
                info!(endpoint = name, status = %desc.status, "Removing existing endpoint");
                report.found = Some(desc.status);
                described_config = Some(desc.endpoint_config_name);
            }
            Err(e) => {
                warn!(endpoint = name, error = %e, "Describe failed, attempting cleanup anyway");
                report.steps.push(failed(Step::DescribeEndpoint, e));
            }
        }

        report.steps.push(best_effort(
            Step::DeleteEndpoint,
            name,
            self.plane.delete_endpoint(name).await,
        ));
        report.steps.push(best_effort(
            Step::DeleteEndpointConfig,
            name,
            self.plane.delete_endpoint_config(name).await,
        ));
        // Endpoints created elsewhere may point at a config under another name.
        if let Some(config) = described_config.filter(|c| c != name) {
            report.steps.push(best_effort(
                Step::DeleteEndpointConfig,
                &config,
                self.plane.delete_endpoint_config(&config).await,
            ));
        }
        report.steps.push(self.await_deletion_step(name).await);

        report
    }

    /// Poll until the endpoint reaches a terminal status or `poll.timeout` elapses.
    ///
    /// Returns within `poll.bound()` even if an individual describe call hangs.
    /// A `failed` endpoint is an ordinary outcome, not an error.
    pub async fn await_terminal(&self, name: &str, poll: &PollSettings) -> WaitOutcome {
        let mut last = None;
        let waited =
            tokio::time::timeout(poll.bound(), self.poll_terminal(name, poll, &mut last)).await;
        match waited {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(endpoint = name, "Describe call outlived the polling bound");
                WaitOutcome::TimedOut { last }
            }
        }
    }

    async fn poll_terminal(
        &self,
        name: &str,
        poll: &PollSettings,
        last: &mut Option<EndpointStatus>,
    ) -> WaitOutcome {
        let deadline = poll.deadline();
        let mut interval = poll.interval;

        loop {
            match self.plane.describe_endpoint(name).await {
                Ok(desc) => {
                    *last = Some(desc.status);
                    if desc.status.is_terminal() {
                        if let Some(reason) = &desc.failure_reason {
                            warn!(endpoint = name, reason = %reason, "Endpoint failed");
                        }
                        return WaitOutcome::Terminal {
                            status: desc.status,
                        };
                    }
                    debug!(endpoint = name, status = %desc.status, "Waiting for endpoint");
                }
                Err(e) if e.is_not_found() => return WaitOutcome::Vanished,
                Err(e) => warn!(endpoint = name, error = %e, "Describe failed while polling"),
            }

            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut { last: *last };
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
            interval = poll.next_interval(interval);
        }
    }

    /// Poll until describe reports "not found". Returns whether it did in time.
    pub async fn await_deleted(&self, name: &str, poll: &PollSettings) -> bool {
        tokio::time::timeout(poll.bound(), self.poll_deleted(name, poll))
            .await
            .unwrap_or(false)
    }

    async fn poll_deleted(&self, name: &str, poll: &PollSettings) -> bool {
        let deadline = poll.deadline();
        let mut interval = poll.interval;

        loop {
            match self.plane.describe_endpoint(name).await {
                Err(e) if e.is_not_found() => return true,
                Ok(desc) => debug!(endpoint = name, status = %desc.status, "Waiting for deletion"),
                Err(e) => warn!(endpoint = name, error = %e, "Describe failed while awaiting deletion"),
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
            interval = poll.next_interval(interval);
        }
    }

    async fn await_deletion_step(&self, name: &str) -> StepOutcome {
        let result = if self.await_deleted(name, &self.delete_poll).await {
            StepResult::Done
        } else {
            let failure = StepFailure::StillPresent {
                waited_secs: self.delete_poll.timeout.as_secs(),
            };
            warn!(endpoint = name, error = %failure, "Endpoint deletion not confirmed");
            StepResult::Failed(failure)
        };
        StepOutcome {
            step: Step::AwaitDeletion,
            result,
        }
    }

    /// Replace whatever lives under the request's endpoint name with a fresh
    /// deployment and wait for provisioning to settle.
    ///
    /// A `failed` or timed-out provisioning still returns a handle; inspect
    /// `handle.status` / `handle.provisioning`.
    pub async fn deploy(
        &self,
        request: &DeploymentRequest,
    ) -> Result<EndpointHandle, ReconcileError> {
        request.validate()?;
        let name = request.endpoint_name.as_str();

        let cleanup = self.ensure_absent(name).await;
        if !cleanup.is_clean() {
            debug!(
                endpoint = name,
                failures = cleanup.failures().count(),
                "Proceeding after incomplete cleanup"
            );
        }

        self.create_model_replacing(&request.model).await?;

        let config = EndpointConfigSpec {
            name: request.config_name().to_string(),
            model_name: request.model.name.clone(),
            instance_type: request.instance_type.clone(),
            instance_count: request.instance_count,
        };
        self.create_config_replacing(&config).await?;

        self.plane.create_endpoint(name, &config.name).await?;
        info!(
            endpoint = name,
            instance_type = %request.instance_type,
            instance_count = request.instance_count,
            "Endpoint creation requested"
        );

        let outcome = self.await_terminal(name, &self.provision_poll).await;
        match outcome {
            WaitOutcome::Terminal {
                status: EndpointStatus::InService,
            } => info!(endpoint = name, "Endpoint in service"),
            other => warn!(endpoint = name, outcome = ?other, "Endpoint did not reach in_service"),
        }

        Ok(EndpointHandle {
            endpoint_name: name.to_string(),
            config_name: config.name,
            model_name: request.model.name.clone(),
            codec: request.codec.clone(),
            status: outcome.last_status().unwrap_or(EndpointStatus::Creating),
            provisioning: Some(outcome),
        })
    }

    // A model left behind by an interrupted run blocks re-creation under the
    // same name.
    async fn create_model_replacing(&self, spec: &ModelSpec) -> Result<(), HostingError> {
        match self.plane.create_model(spec).await {
            Err(HostingError::AlreadyExists { .. }) => {
                info!(model = %spec.name, "Replacing existing model");
                self.plane.delete_model(&spec.name).await?;
                self.plane.create_model(spec).await
            }
            other => other,
        }
    }

    // The configuration can outlive its endpoint, since the two are deleted
    // by separate calls.
    async fn create_config_replacing(&self, spec: &EndpointConfigSpec) -> Result<(), HostingError> {
        match self.plane.create_endpoint_config(spec).await {
            Err(HostingError::AlreadyExists { .. }) => {
                info!(config = %spec.name, "Replacing orphaned endpoint configuration");
                self.plane.delete_endpoint_config(&spec.name).await?;
                self.plane.create_endpoint_config(spec).await
            }
            other => other,
        }
    }

    /// Rebuild a handle for an endpoint deployed earlier.
    pub async fn attach(
        &self,
        name: &str,
        model_name: &str,
        codec: CodecSpec,
    ) -> Result<EndpointHandle, ReconcileError> {
        let desc = self.plane.describe_endpoint(name).await?;
        Ok(EndpointHandle {
            endpoint_name: desc.endpoint_name,
            config_name: desc.endpoint_config_name,
            model_name: model_name.to_string(),
            codec,
            status: desc.status,
            provisioning: None,
        })
    }

    /// Send one payload to the endpoint and decode the answer.
    ///
    /// Both content types are checked before anything is sent.
    pub async fn predict(
        &self,
        handle: &EndpointHandle,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, ReconcileError> {
        let codec = handle.codec.resolve()?;
        if !handle.is_in_service() {
            return Err(HostingError::NotInService {
                name: handle.endpoint_name.clone(),
                status: handle.status.to_string(),
            }
            .into());
        }

        let body = codec.request.encode(payload)?;
        let response = self
            .plane
            .invoke_endpoint(
                &handle.endpoint_name,
                codec.request.mime(),
                codec.response.mime(),
                Bytes::from(body),
            )
            .await?;
        debug!(endpoint = %handle.endpoint_name, bytes = response.len(), "Prediction received");
        Ok(codec.response.decode(&response)?)
    }

    /// Delete the model, the endpoint and the configuration, in that order.
    ///
    /// Each step runs regardless of how the previous one went.
    pub async fn teardown(&self, handle: &EndpointHandle) -> TeardownReport {
        let name = handle.endpoint_name.as_str();
        let mut steps = Vec::with_capacity(4);

        steps.push(best_effort(
            Step::DeleteModel,
            &handle.model_name,
            self.plane.delete_model(&handle.model_name).await,
        ));

        let endpoint = best_effort(
            Step::DeleteEndpoint,
            name,
            self.plane.delete_endpoint(name).await,
        );
        let endpoint_failed = matches!(endpoint.result, StepResult::Failed(_));
        steps.push(endpoint);
        if !endpoint_failed {
            steps.push(self.await_deletion_step(name).await);
        }

        steps.push(best_effort(
            Step::DeleteEndpointConfig,
            &handle.config_name,
            self.plane.delete_endpoint_config(&handle.config_name).await,
        ));

        let report = TeardownReport {
            endpoint_name: name.to_string(),
            steps,
        };
        if report.is_clean() {
            info!(endpoint = name, "Endpoint torn down");
        }
        report
    }
}

fn failed(step: Step, err: HostingError) -> StepOutcome {
    StepOutcome {
        step,
        result: StepResult::Failed(StepFailure::Hosting(err)),
    }
}

fn best_effort(step: Step, resource: &str, result: Result<(), HostingError>) -> StepOutcome {
    let result = match result {
        Ok(()) => StepResult::Done,
        Err(e) if e.is_not_found() => StepResult::AlreadyGone,
        Err(e) => {
            warn!(?step, resource, error = %e, "Best-effort step failed");
            StepResult::Failed(StepFailure::Hosting(e))
        }
    };
    StepOutcome { step, result }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_interval_does_not_grow() {
        let poll = PollSettings::fixed(Duration::from_secs(30), Duration::from_secs(600));
        assert_eq!(poll.next_interval(poll.interval), Duration::from_secs(30));
        assert_eq!(poll.bound(), Duration::from_secs(630));
    }

    #[test]
    fn test_backoff_is_capped() {
        let poll = PollSettings::fixed(Duration::from_secs(1), Duration::from_secs(60))
            .with_backoff(2.0, Duration::from_secs(5));
        let mut interval = poll.interval;
        let mut seen = Vec::new();
        for _ in 0..4 {
            interval = poll.next_interval(interval);
            seen.push(interval.as_secs());
        }
        assert_eq!(seen, vec![2, 4, 5, 5]);
        assert_eq!(poll.bound(), Duration::from_secs(65));
    }

    #[test]
    fn test_unbounded_backoff_saturates_at_max_interval() {
        let poll = PollSettings::fixed(Duration::from_millis(1), Duration::from_secs(1))
            .with_backoff(f64::INFINITY, Duration::from_secs(2));
        assert_eq!(poll.next_interval(poll.interval), Duration::from_secs(2));

        let poll = PollSettings::fixed(Duration::from_secs(1), Duration::from_secs(1))
            .with_backoff(1e300, Duration::from_secs(3));
        assert_eq!(poll.next_interval(poll.interval), Duration::from_secs(3));
    }

    #[test]
    fn test_huge_timeout_saturates() {
        let poll = PollSettings::fixed(Duration::from_secs(1), Duration::MAX);
        assert_eq!(poll.bound(), Duration::MAX);
        assert!(poll.deadline() > Instant::now());
    }

    #[test]
    fn test_backoff_factor_below_one_is_clamped() {
        let poll = PollSettings::fixed(Duration::from_secs(2), Duration::from_secs(10))
            .with_backoff(0.5, Duration::from_secs(1));
        assert_eq!(poll.backoff_factor, 1.0);
        assert_eq!(poll.max_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_wait_outcome_last_status() {
        assert_eq!(
            WaitOutcome::Terminal {
                status: EndpointStatus::Failed
            }
            .last_status(),
            Some(EndpointStatus::Failed)
        );
        assert_eq!(
            WaitOutcome::TimedOut {
                last: Some(EndpointStatus::Creating)
            }
            .last_status(),
            Some(EndpointStatus::Creating)
        );
        assert_eq!(
            WaitOutcome::Vanished.last_status(),
            Some(EndpointStatus::Absent)
        );
    }

    #[test]
    fn test_wait_outcome_serde() {
        let json = serde_json::to_value(WaitOutcome::Terminal {
            status: EndpointStatus::InService,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"outcome": "terminal", "status": "in_service"})
        );
    }

    #[test]
    fn test_best_effort_treats_not_found_as_gone() {
        let outcome = best_effort(
            Step::DeleteEndpointConfig,
            "e1",
            Err(HostingError::NotFound {
                kind: crate::error::ResourceKind::EndpointConfig,
                name: "e1".into(),
            }),
        );
        assert!(matches!(outcome.result, StepResult::AlreadyGone));
    }
}

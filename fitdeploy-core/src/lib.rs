//! # fitdeploy Core
//!
//! Core library for fitdeploy: train a tabular model with an external entry
//! point, persist and score it, and reconcile a managed inference endpoint
//! serving it (deploy, predict, tear down).

pub mod codec;
pub mod config;
pub mod error;
pub mod hosting;
pub mod metrics;
pub mod persistence;
pub mod pipeline;
pub mod reconciler;
pub mod serving;
pub mod storage;
pub mod training;

// Re-export commonly used types at the crate root.
pub use codec::{CodecSpec, ContentType};
pub use config::{ConfigOverrides, FitDeployConfig};
pub use error::{
    CodecError, ConfigError, FitDeployError, HostingError, ReconcileError, Result, StorageError,
    TrainingError,
};
pub use hosting::{
    EndpointStatus, HostingControlPlane, HttpControlPlane, InMemoryControlPlane, ModelSpec,
};
pub use metrics::{MetricDefinition, MetricsDispatcher, MetricsSink};
pub use pipeline::{PipelineReport, TrainAndDeploy};
pub use reconciler::{
    CleanupReport, DeploymentRequest, EndpointHandle, EndpointReconciler, PollSettings,
    TeardownReport, WaitOutcome,
};
pub use serving::{LinearHooks, LinearModel, ServingContainer, ServingHooks};
pub use storage::{LocalObjectStore, ModelArtifactStore, ObjectStore};
pub use training::{TrainingJob, TrainingOutcome, TrainingRunner};

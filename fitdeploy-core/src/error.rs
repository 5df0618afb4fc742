//! Error types for fitdeploy.
//!
//! Uses `thiserror` for public API error types, one enum per collaborator
//! (hosting control plane, codecs, object storage, training) and a
//! reconciler error that wraps the ones it can surface.

use std::path::PathBuf;

/// Top-level error type for the fitdeploy library.
#[derive(Debug, thiserror::Error)]
pub enum FitDeployError {
    #[error("Hosting error: {0}")]
    Hosting(#[from] HostingError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Training error: {0}")]
    Training(#[from] TrainingError),

    #[error("Reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Serving error: {0}")]
    Serving(#[from] ServingError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the managed hosting control plane.
#[derive(Debug, thiserror::Error)]
pub enum HostingError {
    /// The named resource does not exist. Cleanup paths treat this as success.
    #[error("{kind} not found: {name}")]
    NotFound { kind: ResourceKind, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: ResourceKind, name: String },

    #[error("Control plane returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Control plane request failed: {message}")]
    Transport { message: String },

    #[error("Unexpected control plane response: {message}")]
    Decode { message: String },

    #[error("Endpoint '{name}' cannot serve requests while {status}")]
    NotInService { name: String, status: String },
}

impl HostingError {
    /// Whether this is a "not found" response from the control plane.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<reqwest::Error> for HostingError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }
}

/// The kinds of resources the control plane manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Model,
    EndpointConfig,
    Endpoint,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Model => write!(f, "Model"),
            Self::EndpointConfig => write!(f, "Endpoint configuration"),
            Self::Endpoint => write!(f, "Endpoint"),
        }
    }
}

/// Errors from request/response encoding.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Content type '{content_type}' is not supported (expected application/json or text/csv)")]
    UnsupportedContentType { content_type: String },

    #[error("Failed to encode {content_type} body: {message}")]
    Encode {
        content_type: &'static str,
        message: String,
    },

    #[error("Failed to decode {content_type} body: {message}")]
    Decode {
        content_type: &'static str,
        message: String,
    },
}

/// Errors from object storage.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("Invalid object key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised inside a serving container's hooks.
#[derive(Debug, thiserror::Error)]
pub enum ServingError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Failed to load model artifact: {0}")]
    Storage(#[from] StorageError),

    #[error("Model artifact is invalid: {message}")]
    InvalidModel { message: String },

    #[error("Invalid prediction input: {message}")]
    InvalidInput { message: String },
}

impl ServingError {
    /// HTTP status a serving container answers with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Codec(CodecError::UnsupportedContentType { .. }) => 415,
            Self::Codec(_) | Self::InvalidInput { .. } => 400,
            Self::Storage(_) | Self::InvalidModel { .. } => 500,
        }
    }
}

/// Errors from running a training entry point.
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("Training channel not usable at {path}: {reason}")]
    Channel { path: PathBuf, reason: String },

    #[error("Failed to spawn training entry point '{command}': {message}")]
    Spawn { command: String, message: String },

    #[error("Training job '{job}' exited with {status}: {stderr}")]
    Failed {
        job: String,
        status: String,
        stderr: String,
    },

    #[error("Training job '{job}' timed out after {timeout_secs}s")]
    Timeout { job: String, timeout_secs: u64 },

    #[error("Training job '{job}' did not produce artifact {path}")]
    MissingArtifact { job: String, path: PathBuf },

    #[error("Invalid training job: {message}")]
    Invalid { message: String },

    #[error("Failed to persist artifact: {0}")]
    Storage(#[from] StorageError),

    #[error("Training IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the endpoint reconciler.
///
/// Cleanup and teardown failures never appear here; they are reported as
/// values in `CleanupReport` and `TeardownReport`.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Invalid deployment request: {message}")]
    InvalidRequest { message: String },

    #[error("Rejected input: {0}")]
    Codec(#[from] CodecError),

    #[error("{0}")]
    Hosting(#[from] HostingError),
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// A type alias for results using the top-level `FitDeployError`.
pub type Result<T> = std::result::Result<T, FitDeployError>;

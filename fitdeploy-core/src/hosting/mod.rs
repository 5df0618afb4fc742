//! Managed hosting control plane: the remote API endpoints are provisioned on.
//!
//! The [`HostingControlPlane`] trait is the seam between the reconciler and
//! the platform. [`HttpControlPlane`] talks to a REST control plane;
//! [`InMemoryControlPlane`] simulates one, including asynchronous
//! provisioning, for tests and dry runs.

pub mod http;
pub mod memory;

pub use http::HttpControlPlane;
pub use memory::{InMemoryControlPlane, SimulationSettings};

use crate::error::HostingError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    /// No endpoint exists under the name.
    Absent,
    Creating,
    Updating,
    InService,
    Failed,
    Deleting,
}

impl EndpointStatus {
    /// Terminal statuses: no further automatic transition happens without a new API call.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::InService | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Creating => "creating",
            Self::Updating => "updating",
            Self::InService => "in_service",
            Self::Failed => "failed",
            Self::Deleting => "deleting",
        }
    }
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndpointStatus {
    type Err = HostingError;

    /// Accepts both `InService` and `in_service` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "absent" => Ok(Self::Absent),
            "creating" => Ok(Self::Creating),
            "updating" => Ok(Self::Updating),
            "inservice" => Ok(Self::InService),
            "failed" => Ok(Self::Failed),
            "deleting" => Ok(Self::Deleting),
            _ => Err(HostingError::Decode {
                message: format!("unknown endpoint status '{s}'"),
            }),
        }
    }
}

/// What the control plane reports about an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointDescription {
    pub endpoint_name: String,
    pub endpoint_config_name: String,
    pub status: EndpointStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// A model resource: an artifact plus the container that serves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    /// Serving container image.
    pub image_uri: String,
    /// Location of the trained model artifact.
    pub model_data: String,
    /// Script the serving container loads its hooks from.
    pub entry_point: String,
}

/// The named specification an endpoint is instantiated from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfigSpec {
    pub name: String,
    pub model_name: String,
    pub instance_type: String,
    pub instance_count: u32,
}

/// Operations consumed from the managed hosting platform.
///
/// Every "does not exist" outcome must be reported as
/// [`HostingError::NotFound`]; the reconciler relies on it to stay idempotent.
#[async_trait]
pub trait HostingControlPlane: Send + Sync {
    fn name(&self) -> &str;

    async fn describe_endpoint(&self, name: &str) -> Result<EndpointDescription, HostingError>;

    async fn create_model(&self, spec: &ModelSpec) -> Result<(), HostingError>;

    async fn delete_model(&self, name: &str) -> Result<(), HostingError>;

    async fn create_endpoint_config(&self, spec: &EndpointConfigSpec) -> Result<(), HostingError>;

    async fn delete_endpoint_config(&self, name: &str) -> Result<(), HostingError>;

    /// Start provisioning. Returns once the request is accepted, not when the
    /// endpoint is in service.
    async fn create_endpoint(&self, name: &str, config_name: &str) -> Result<(), HostingError>;

    async fn delete_endpoint(&self, name: &str) -> Result<(), HostingError>;

    async fn invoke_endpoint(
        &self,
        name: &str,
        content_type: &str,
        accept: &str,
        body: Bytes,
    ) -> Result<Bytes, HostingError>;
}

/// Whatever answers invocations inside a (simulated) serving container.
#[async_trait]
pub trait InvocationHandler: Send + Sync {
    async fn invoke(
        &self,
        content_type: &str,
        accept: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, HostingError>;
}

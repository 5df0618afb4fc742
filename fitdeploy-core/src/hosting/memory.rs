//! In-memory hosting control plane.
//!
//! Simulates the platform's asynchronous provisioning: a new endpoint reports
//! `creating` for a configurable number of describe calls before reaching
//! `in_service` (or `failed`), and a deleted endpoint lingers in `deleting`
//! before it disappears. Invocations are answered by an attached
//! [`InvocationHandler`], normally a `ServingContainer`.

use super::{
    EndpointConfigSpec, EndpointDescription, EndpointStatus, HostingControlPlane,
    InvocationHandler, ModelSpec,
};
use crate::error::{HostingError, ResourceKind};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Knobs for the simulated platform.
#[derive(Debug, Clone, Default)]
pub struct SimulationSettings {
    /// Describe calls answered with `creating` before provisioning settles.
    pub creating_polls: u32,
    /// Describe calls answered with `deleting` before the endpoint disappears.
    pub deleting_polls: u32,
    /// Provisioning ends in `failed` instead of `in_service`.
    pub fail_provisioning: bool,
    /// Artificial latency added to every describe call.
    pub describe_delay: Duration,
}

/// Control plane operations, used to inject failures and inspect the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    DescribeEndpoint,
    CreateModel,
    DeleteModel,
    CreateEndpointConfig,
    DeleteEndpointConfig,
    CreateEndpoint,
    DeleteEndpoint,
    InvokeEndpoint,
}

#[derive(Debug)]
struct SimEndpoint {
    id: Uuid,
    config_name: String,
    status: EndpointStatus,
    polls_remaining: u32,
}

#[derive(Default)]
struct State {
    settings: SimulationSettings,
    models: HashMap<String, ModelSpec>,
    configs: HashMap<String, EndpointConfigSpec>,
    endpoints: HashMap<String, SimEndpoint>,
    failing: HashSet<Operation>,
    calls: Vec<(Operation, String)>,
}

impl State {
    fn record(&mut self, op: Operation, name: &str) -> Result<(), HostingError> {
        self.calls.push((op, name.to_string()));
        if self.failing.contains(&op) {
            return Err(HostingError::Api {
                status: 500,
                message: format!("injected failure for {op:?}"),
            });
        }
        Ok(())
    }
}

/// A simulated [`HostingControlPlane`].
pub struct InMemoryControlPlane {
    state: Mutex<State>,
    handler: Option<Arc<dyn InvocationHandler>>,
}

impl InMemoryControlPlane {
    pub fn new() -> Self {
        Self::with_settings(SimulationSettings::default())
    }

    pub fn with_settings(settings: SimulationSettings) -> Self {
        Self {
            state: Mutex::new(State {
                settings,
                ..State::default()
            }),
            handler: None,
        }
    }

    /// Attach the handler that answers invocations.
    pub fn with_handler(mut self, handler: Arc<dyn InvocationHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub async fn set_settings(&self, settings: SimulationSettings) {
        self.state.lock().await.settings = settings;
    }

    /// Make every future call of `op` fail with an API error.
    pub async fn fail_operation(&self, op: Operation) {
        self.state.lock().await.failing.insert(op);
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failing.clear();
    }

    pub async fn has_endpoint(&self, name: &str) -> bool {
        self.state.lock().await.endpoints.contains_key(name)
    }

    pub async fn has_endpoint_config(&self, name: &str) -> bool {
        self.state.lock().await.configs.contains_key(name)
    }

    pub async fn has_model(&self, name: &str) -> bool {
        self.state.lock().await.models.contains_key(name)
    }

    pub async fn endpoint_config_count(&self) -> usize {
        self.state.lock().await.configs.len()
    }

    /// Number of recorded calls of `op`.
    pub async fn call_count(&self, op: Operation) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|(o, _)| *o == op)
            .count()
    }

    /// The full call log, in order.
    pub async fn calls(&self) -> Vec<(Operation, String)> {
        self.state.lock().await.calls.clone()
    }
}

impl Default for InMemoryControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostingControlPlane for InMemoryControlPlane {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn describe_endpoint(&self, name: &str) -> Result<EndpointDescription, HostingError> {
        let delay = {
            let mut state = self.state.lock().await;
            state.record(Operation::DescribeEndpoint, name)?;
            state.settings.describe_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        let fail_provisioning = state.settings.fail_provisioning;
        let Some(endpoint) = state.endpoints.get_mut(name) else {
            return Err(HostingError::NotFound {
                kind: ResourceKind::Endpoint,
                name: name.to_string(),
            });
        };

        if endpoint.polls_remaining > 0 {
            endpoint.polls_remaining -= 1;
        } else {
            match endpoint.status {
                EndpointStatus::Creating | EndpointStatus::Updating => {
                    endpoint.status = if fail_provisioning {
                        EndpointStatus::Failed
                    } else {
                        EndpointStatus::InService
                    };
                    debug!(endpoint = name, id = %endpoint.id, status = %endpoint.status, "Provisioning settled");
                }
                EndpointStatus::Deleting => {
                    state.endpoints.remove(name);
                    return Err(HostingError::NotFound {
                        kind: ResourceKind::Endpoint,
                        name: name.to_string(),
                    });
                }
                _ => {}
            }
        }

        Ok(EndpointDescription {
            endpoint_name: name.to_string(),
            endpoint_config_name: endpoint.config_name.clone(),
            status: endpoint.status,
            failure_reason: (endpoint.status == EndpointStatus::Failed)
                .then(|| "simulated provisioning failure".to_string()),
        })
    }

    async fn create_model(&self, spec: &ModelSpec) -> Result<(), HostingError> {
        let mut state = self.state.lock().await;
        state.record(Operation::CreateModel, &spec.name)?;
        if state.models.contains_key(&spec.name) {
            return Err(HostingError::AlreadyExists {
                kind: ResourceKind::Model,
                name: spec.name.clone(),
            });
        }
        state.models.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn delete_model(&self, name: &str) -> Result<(), HostingError> {
        let mut state = self.state.lock().await;
        state.record(Operation::DeleteModel, name)?;
        state
            .models
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| HostingError::NotFound {
                kind: ResourceKind::Model,
                name: name.to_string(),
            })
    }

    async fn create_endpoint_config(&self, spec: &EndpointConfigSpec) -> Result<(), HostingError> {
        let mut state = self.state.lock().await;
        state.record(Operation::CreateEndpointConfig, &spec.name)?;
        if state.configs.contains_key(&spec.name) {
            return Err(HostingError::AlreadyExists {
                kind: ResourceKind::EndpointConfig,
                name: spec.name.clone(),
            });
        }
        if !state.models.contains_key(&spec.model_name) {
            return Err(HostingError::NotFound {
                kind: ResourceKind::Model,
                name: spec.model_name.clone(),
            });
        }
        state.configs.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn delete_endpoint_config(&self, name: &str) -> Result<(), HostingError> {
        let mut state = self.state.lock().await;
        state.record(Operation::DeleteEndpointConfig, name)?;
        state
            .configs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| HostingError::NotFound {
                kind: ResourceKind::EndpointConfig,
                name: name.to_string(),
            })
    }

    async fn create_endpoint(&self, name: &str, config_name: &str) -> Result<(), HostingError> {
        let mut state = self.state.lock().await;
        state.record(Operation::CreateEndpoint, name)?;
        if state.endpoints.contains_key(name) {
            return Err(HostingError::AlreadyExists {
                kind: ResourceKind::Endpoint,
                name: name.to_string(),
            });
        }
        if !state.configs.contains_key(config_name) {
            return Err(HostingError::NotFound {
                kind: ResourceKind::EndpointConfig,
                name: config_name.to_string(),
            });
        }
        let polls_remaining = state.settings.creating_polls;
        state.endpoints.insert(
            name.to_string(),
            SimEndpoint {
                id: Uuid::new_v4(),
                config_name: config_name.to_string(),
                status: EndpointStatus::Creating,
                polls_remaining,
            },
        );
        Ok(())
    }

    async fn delete_endpoint(&self, name: &str) -> Result<(), HostingError> {
        let mut state = self.state.lock().await;
        state.record(Operation::DeleteEndpoint, name)?;
        let deleting_polls = state.settings.deleting_polls;
        if deleting_polls == 0 {
            return state
                .endpoints
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| HostingError::NotFound {
                    kind: ResourceKind::Endpoint,
                    name: name.to_string(),
                });
        }
        let endpoint = state
            .endpoints
            .get_mut(name)
            .ok_or_else(|| HostingError::NotFound {
                kind: ResourceKind::Endpoint,
                name: name.to_string(),
            })?;
        endpoint.status = EndpointStatus::Deleting;
        endpoint.polls_remaining = deleting_polls;
        Ok(())
    }

    async fn invoke_endpoint(
        &self,
        name: &str,
        content_type: &str,
        accept: &str,
        body: Bytes,
    ) -> Result<Bytes, HostingError> {
        {
            let mut state = self.state.lock().await;
            state.record(Operation::InvokeEndpoint, name)?;
            let endpoint = state
                .endpoints
                .get(name)
                .ok_or_else(|| HostingError::NotFound {
                    kind: ResourceKind::Endpoint,
                    name: name.to_string(),
                })?;
            if endpoint.status != EndpointStatus::InService {
                return Err(HostingError::NotInService {
                    name: name.to_string(),
                    status: endpoint.status.to_string(),
                });
            }
        }

        let handler = self.handler.as_ref().ok_or_else(|| HostingError::Api {
            status: 501,
            message: format!("endpoint '{name}' has no serving container attached"),
        })?;
        let response = handler.invoke(content_type, accept, &body).await?;
        Ok(Bytes::from(response))
    }
}

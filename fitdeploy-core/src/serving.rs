//! Serving-container hooks.
//!
//! The hosting runtime drives a model through four hooks: load the model,
//! decode the request, predict, encode the response. [`ServingHooks`]
//! captures that contract; [`ServingContainer`] owns a loaded model and
//! answers invocations with it.

use crate::codec::ContentType;
use crate::error::{HostingError, ServingError};
use crate::hosting::InvocationHandler;
use crate::storage::ModelArtifactStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// The hook contract a serving container implements.
pub trait ServingHooks: Send + Sync + 'static {
    type Model: Send + Sync + 'static;

    /// Deserialize a fetched artifact.
    fn load_model(&self, artifact: &[u8]) -> Result<Self::Model, ServingError>;

    fn decode_request(&self, body: &[u8], content_type: &str) -> Result<Value, ServingError> {
        Ok(ContentType::parse(content_type)?.decode(body)?)
    }

    fn predict(&self, model: &Self::Model, input: Value) -> Result<Value, ServingError>;

    fn encode_response(&self, prediction: &Value, accept: &str) -> Result<Vec<u8>, ServingError> {
        Ok(ContentType::parse(accept)?.encode(prediction)?)
    }
}

/// A loaded model plus the hooks that serve it.
pub struct ServingContainer<H: ServingHooks> {
    hooks: H,
    model: H::Model,
}

impl<H: ServingHooks> ServingContainer<H> {
    /// Fetch the job's final artifact and deserialize it.
    pub async fn load(
        hooks: H,
        artifacts: &ModelArtifactStore,
        job: &str,
    ) -> Result<Self, ServingError> {
        let artifact = artifacts.fetch_final(job).await?;
        info!(job, size_bytes = artifact.len(), "Loading model artifact");
        Self::from_artifact(hooks, &artifact)
    }

    pub fn from_artifact(hooks: H, artifact: &[u8]) -> Result<Self, ServingError> {
        let model = hooks.load_model(artifact)?;
        Ok(Self { hooks, model })
    }

    /// Run one request through decode → predict → encode.
    pub fn handle(
        &self,
        body: &[u8],
        content_type: &str,
        accept: &str,
    ) -> Result<Vec<u8>, ServingError> {
        // Reject an unsupported accept type before doing any work.
        ContentType::parse(accept)?;
        let input = self.hooks.decode_request(body, content_type)?;
        let prediction = self.hooks.predict(&self.model, input)?;
        self.hooks.encode_response(&prediction, accept)
    }
}

#[async_trait]
impl<H: ServingHooks> InvocationHandler for ServingContainer<H> {
    async fn invoke(
        &self,
        content_type: &str,
        accept: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, HostingError> {
        self.handle(body, content_type, accept).map_err(|e| {
            debug!(error = %e, "Invocation rejected");
            HostingError::Api {
                status: e.status_code(),
                message: e.to_string(),
            }
        })
    }
}

/// A linear scorer stored as a JSON artifact.
///
/// Regression models answer `{"prediction": score}`; with a `threshold` the
/// model classifies and answers `{"label": 0|1, "score": score}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub intercept: f64,
    pub coefficients: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

impl LinearModel {
    fn score(&self, record: &Map<String, Value>) -> Result<Value, ServingError> {
        let mut score = self.intercept;
        for (feature, weight) in &self.coefficients {
            score += weight * feature_value(feature, record.get(feature))?;
        }
        Ok(match self.threshold {
            Some(t) => json!({"label": i64::from(score >= t), "score": score}),
            None => json!({"prediction": score}),
        })
    }
}

// Missing and null features contribute nothing; booleans count as 0/1.
fn feature_value(name: &str, value: Option<&Value>) -> Result<f64, ServingError> {
    match value {
        None | Some(Value::Null) => Ok(0.0),
        Some(Value::Bool(b)) => Ok(f64::from(u8::from(*b))),
        Some(Value::Number(n)) => n.as_f64().ok_or_else(|| ServingError::InvalidInput {
            message: format!("feature '{name}' is out of range"),
        }),
        Some(other) => Err(ServingError::InvalidInput {
            message: format!("feature '{name}' must be numeric, got {other}"),
        }),
    }
}

/// Hooks serving a [`LinearModel`] over single records or arrays of records.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearHooks;

impl ServingHooks for LinearHooks {
    type Model = LinearModel;

    fn load_model(&self, artifact: &[u8]) -> Result<LinearModel, ServingError> {
        serde_json::from_slice(artifact).map_err(|e| ServingError::InvalidModel {
            message: e.to_string(),
        })
    }

    fn predict(&self, model: &LinearModel, input: Value) -> Result<Value, ServingError> {
        match input {
            Value::Object(record) => model.score(&record),
            Value::Array(records) => records
                .iter()
                .map(|r| match r {
                    Value::Object(record) => model.score(record),
                    other => Err(ServingError::InvalidInput {
                        message: format!("expected a record, got {other}"),
                    }),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Err(ServingError::InvalidInput {
                message: format!("expected a record or an array of records, got {other}"),
            }),
        }
    }
}

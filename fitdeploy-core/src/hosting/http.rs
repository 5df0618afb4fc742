//! REST client for a managed hosting control plane.
//!
//! Resource layout relative to the base URL:
//!
//! | operation                | request                                  |
//! |--------------------------|------------------------------------------|
//! | describe endpoint        | `GET /endpoints/{name}`                  |
//! | create / delete model    | `POST /models`, `DELETE /models/{name}`  |
//! | create / delete config   | `POST /endpoint-configs`, `DELETE /endpoint-configs/{name}` |
//! | create / delete endpoint | `POST /endpoints`, `DELETE /endpoints/{name}` |
//! | invoke                   | `POST /endpoints/{name}/invocations`     |
//!
//! 404 maps to [`HostingError::NotFound`] and 409 to [`HostingError::AlreadyExists`].

use super::{
    EndpointConfigSpec, EndpointDescription, EndpointStatus, HostingControlPlane, ModelSpec,
};
use crate::error::{HostingError, ResourceKind};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// HTTP implementation of [`HostingControlPlane`].
#[derive(Clone)]
pub struct HttpControlPlane {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpControlPlane {
    pub fn new(base_url: impl Into<String>) -> Result<Self, HostingError> {
        Self::with_timeout(base_url, Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
    }

    /// Create a client whose individual requests give up after `timeout`.
    pub fn with_timeout(
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, HostingError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Authenticate every request with a bearer token.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self
            .client
            .request(method, url)
            .header("x-request-id", uuid::Uuid::new_v4().to_string());
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Response, HostingError> {
        let response = builder.send().await?;
        let status = response.status();
        debug!(%status, %kind, name, "Control plane response");

        if status.is_success() {
            return Ok(response);
        }
        match status {
            StatusCode::NOT_FOUND => Err(HostingError::NotFound {
                kind,
                name: name.to_string(),
            }),
            StatusCode::CONFLICT => Err(HostingError::AlreadyExists {
                kind,
                name: name.to_string(),
            }),
            _ => {
                let message = response.text().await.unwrap_or_default();
                Err(HostingError::Api {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }

    async fn delete(&self, path: String, kind: ResourceKind, name: &str) -> Result<(), HostingError> {
        self.send(self.request(Method::DELETE, &path), kind, name)
            .await
            .map(|_| ())
    }
}

/// Describe response as it appears on the wire; status is free-form text.
#[derive(Debug, Deserialize)]
struct WireDescription {
    endpoint_name: String,
    #[serde(default)]
    endpoint_config_name: Option<String>,
    status: String,
    #[serde(default)]
    failure_reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateEndpointBody<'a> {
    name: &'a str,
    endpoint_config_name: &'a str,
}

fn segment(name: &str) -> String {
    urlencoding::encode(name).into_owned()
}

#[async_trait]
impl HostingControlPlane for HttpControlPlane {
    fn name(&self) -> &str {
        "http"
    }

    async fn describe_endpoint(&self, name: &str) -> Result<EndpointDescription, HostingError> {
        let path = format!("/endpoints/{}", segment(name));
        let response = self
            .send(self.request(Method::GET, &path), ResourceKind::Endpoint, name)
            .await?;
        let wire: WireDescription = response.json().await.map_err(|e| HostingError::Decode {
            message: e.to_string(),
        })?;
        let status: EndpointStatus = wire.status.parse()?;
        Ok(EndpointDescription {
            endpoint_config_name: wire
                .endpoint_config_name
                .unwrap_or_else(|| wire.endpoint_name.clone()),
            endpoint_name: wire.endpoint_name,
            status,
            failure_reason: wire.failure_reason,
        })
    }

    async fn create_model(&self, spec: &ModelSpec) -> Result<(), HostingError> {
        let builder = self.request(Method::POST, "/models").json(spec);
        self.send(builder, ResourceKind::Model, &spec.name)
            .await
            .map(|_| ())
    }

    async fn delete_model(&self, name: &str) -> Result<(), HostingError> {
        self.delete(format!("/models/{}", segment(name)), ResourceKind::Model, name)
            .await
    }

    async fn create_endpoint_config(&self, spec: &EndpointConfigSpec) -> Result<(), HostingError> {
        let builder = self.request(Method::POST, "/endpoint-configs").json(spec);
        self.send(builder, ResourceKind::EndpointConfig, &spec.name)
            .await
            .map(|_| ())
    }

    async fn delete_endpoint_config(&self, name: &str) -> Result<(), HostingError> {
        self.delete(
            format!("/endpoint-configs/{}", segment(name)),
            ResourceKind::EndpointConfig,
            name,
        )
        .await
    }

    async fn create_endpoint(&self, name: &str, config_name: &str) -> Result<(), HostingError> {
        let builder = self
            .request(Method::POST, "/endpoints")
            .json(&CreateEndpointBody {
                name,
                endpoint_config_name: config_name,
            });
        self.send(builder, ResourceKind::Endpoint, name)
            .await
            .map(|_| ())
    }

    async fn delete_endpoint(&self, name: &str) -> Result<(), HostingError> {
        self.delete(
            format!("/endpoints/{}", segment(name)),
            ResourceKind::Endpoint,
            name,
        )
        .await
    }

    async fn invoke_endpoint(
        &self,
        name: &str,
        content_type: &str,
        accept: &str,
        body: Bytes,
    ) -> Result<Bytes, HostingError> {
        let path = format!("/endpoints/{}/invocations", segment(name));
        let builder = self
            .request(Method::POST, &path)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::ACCEPT, accept)
            .body(body);
        let response = self.send(builder, ResourceKind::Endpoint, name).await?;
        Ok(response.bytes().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let plane = HttpControlPlane::new("http://localhost:8080/api/").unwrap();
        assert_eq!(plane.base_url(), "http://localhost:8080/api");
    }

    #[test]
    fn test_segment_encodes_names() {
        assert_eq!(segment("model2-endpoint"), "model2-endpoint");
        assert_eq!(segment("a b/c"), "a%20b%2Fc");
    }
}

//! Object storage for trained model artifacts.
//!
//! [`ObjectStore`] is a bucket/key blob store. [`ModelArtifactStore`] lays
//! out a job's artifacts on top of it: one stable "final" copy that serving
//! containers load, plus a timestamped history copy per training run.

use crate::error::StorageError;
use crate::persistence::atomic_write;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// A bucket/key blob store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), StorageError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Addressable URI of an object, as handed to the hosting platform.
    fn uri(&self, bucket: &str, key: &str) -> String;
}

/// Stores objects as files under `<root>/<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        validate_segment(bucket, bucket)?;
        let relative = Path::new(key);
        if key.is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
                reason: "keys must be relative paths without '..'".into(),
            });
        }
        Ok(self.root.join(bucket).join(relative))
    }
}

fn validate_segment(segment: &str, key: &str) -> Result<(), StorageError> {
    if segment.is_empty() || segment.contains(['/', '\\']) || segment == ".." || segment == "." {
        return Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason: format!("'{segment}' is not a valid bucket name"),
        });
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.object_path(bucket, key)?;
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || atomic_write(&path, &data))
            .await
            .map_err(std::io::Error::other)??;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn uri(&self, bucket: &str, key: &str) -> String {
        format!("file://{}", self.root.join(bucket).join(key).display())
    }
}

/// Keeps objects in memory. Used by tests and simulated runs.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All keys stored in `bucket`, sorted.
    pub async fn keys(&self, bucket: &str) -> Vec<String> {
        let objects = self.objects.read().await;
        let mut keys: Vec<String> = objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        self.objects
            .write()
            .await
            .insert((bucket.to_string(), key.to_string()), data.to_vec());
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    fn uri(&self, bucket: &str, key: &str) -> String {
        format!("memory://{bucket}/{key}")
    }
}

/// Where a persisted artifact ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLocation {
    pub bucket: String,
    pub final_key: String,
    pub history_key: String,
    /// URI of the final copy.
    pub uri: String,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Artifact layout for training jobs:
///
/// ```text
/// <prefix>/<job>/final_model.pkl
/// <prefix>/<job>/history/<timestamp>_model
/// ```
pub struct ModelArtifactStore {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
}

impl ModelArtifactStore {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            prefix: "models".to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into().trim_matches('/').to_string();
        self
    }

    pub fn final_key(&self, job: &str) -> String {
        format!("{}/{job}/final_model.pkl", self.prefix)
    }

    pub fn history_key(&self, job: &str, at: DateTime<Utc>) -> String {
        format!(
            "{}/{job}/history/{}_model",
            self.prefix,
            at.format("%Y-%m-%dT%H-%M-%S%.6fZ")
        )
    }

    /// URI of a job's final artifact.
    pub fn final_uri(&self, job: &str) -> String {
        self.store.uri(&self.bucket, &self.final_key(job))
    }

    /// Persist a freshly trained artifact as the job's final copy and as a history entry.
    pub async fn persist(&self, job: &str, data: &[u8]) -> Result<ArtifactLocation, StorageError> {
        self.persist_at(job, data, Utc::now()).await
    }

    pub async fn persist_at(
        &self,
        job: &str,
        data: &[u8],
        at: DateTime<Utc>,
    ) -> Result<ArtifactLocation, StorageError> {
        let final_key = self.final_key(job);
        let history_key = self.history_key(job, at);

        self.store.put(&self.bucket, &final_key, data).await?;
        self.store.put(&self.bucket, &history_key, data).await?;

        let location = ArtifactLocation {
            uri: self.store.uri(&self.bucket, &final_key),
            bucket: self.bucket.clone(),
            final_key,
            history_key,
            sha256: hash_bytes(data),
            size_bytes: data.len() as u64,
        };
        info!(
            job,
            key = %location.final_key,
            history = %location.history_key,
            size_bytes = location.size_bytes,
            "Model artifact persisted"
        );
        Ok(location)
    }

    /// Fetch the job's final artifact.
    pub async fn fetch_final(&self, job: &str) -> Result<Vec<u8>, StorageError> {
        self.store.get(&self.bucket, &self.final_key(job)).await
    }
}

/// SHA-256 of arbitrary bytes, hex encoded.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

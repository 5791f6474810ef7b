//! Per-cluster metadata marker persisted to object storage (spec §6 State
//! persistence), and the Talos secret bundle it travels alongside.
//!
//! Grounded on the bare-metal provisioner's `ClusterState::save`/`load`
//! (`state.rs`), generalized from a local JSON file to an object-storage
//! blob since the core assumes nothing about the local filesystem beyond
//! the kubeconfig write-out (spec §6 Persisted state layout).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `<cluster>_metadata.json` — the run's resumption beacon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub cluster_name: String,
    pub managed_by: String,
    pub created_at: DateTime<Utc>,
}

impl RunMetadata {
    #[must_use]
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            managed_by: "hclaim".to_string(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn object_key(cluster_name: &str) -> String {
        format!("{cluster_name}_metadata.json")
    }
}

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("object storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The object-storage collaborator backing [`RunMetadata`] and the Talos
/// secret bundle. Out of scope to implement in depth (spec §1) — the core
/// only needs `get`/`put` of a named blob.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MetadataError>;
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), MetadataError>;
}

/// Presence of the metadata object is the run's resumption beacon (spec
/// §6): a prior run wrote it, so this run should treat the cluster as
/// partially or fully provisioned rather than empty.
///
/// # Errors
/// Propagates any `MetadataStore` I/O error.
pub async fn load_metadata(
    store: &dyn MetadataStore,
    cluster_name: &str,
) -> Result<Option<RunMetadata>, MetadataError> {
    let key = RunMetadata::object_key(cluster_name);
    match store.get(&key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// # Errors
/// Propagates any `MetadataStore` I/O error.
pub async fn save_metadata(
    store: &dyn MetadataStore,
    metadata: &RunMetadata,
) -> Result<(), MetadataError> {
    let key = RunMetadata::object_key(&metadata.cluster_name);
    let bytes = serde_json::to_vec(metadata)?;
    store.put(&key, &bytes).await
}

/// In-memory `MetadataStore` used by tests and local dry runs.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    blobs: tokio::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MetadataError> {
        Ok(self.blobs.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), MetadataError> {
        self.blobs
            .lock()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn absent_metadata_is_none() {
        let store = InMemoryMetadataStore::default();
        assert!(load_metadata(&store, "test-cluster").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn round_trips_through_store() {
        let store = InMemoryMetadataStore::default();
        let metadata = RunMetadata::new("test-cluster");
        save_metadata(&store, &metadata).await.unwrap();

        let loaded = load_metadata(&store, "test-cluster").await.unwrap().unwrap();
        assert_eq!(loaded.cluster_name, "test-cluster");
        assert_eq!(loaded.managed_by, "hclaim");
    }
}

//! Artifact stores - durable storage for step outputs
//!
//! Payloads are addressed by producer, content hash and output name, so a
//! stored artifact never changes once written.

pub mod local;

pub use local::LocalArtifactStore;

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Trait for artifact store backends
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store a payload and return its uri
    async fn put(&self, producer: &str, name: &str, content_hash: &str, payload: &Value) -> Result<String>;

    /// Load a payload by uri
    async fn get(&self, uri: &str) -> Result<Value>;

    /// Check whether a uri is present
    async fn exists(&self, uri: &str) -> Result<bool>;

    /// Human-readable location of the store
    fn location(&self) -> String;
}

/// In-memory artifact store (for testing or ephemeral use)
pub struct InMemoryArtifactStore {
    payloads: RwLock<HashMap<String, Value>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self {
            payloads: RwLock::new(HashMap::new()),
        }
    }

    /// Drop a payload, simulating a store that lost data
    pub async fn evict(&self, uri: &str) -> bool {
        self.payloads.write().await.remove(uri).is_some()
    }
}

impl Default for InMemoryArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, producer: &str, name: &str, content_hash: &str, payload: &Value) -> Result<String> {
        let uri = format!("memory://{}/{}/{}", producer, content_hash, name);
        self.payloads
            .write()
            .await
            .entry(uri.clone())
            .or_insert_with(|| payload.clone());
        Ok(uri)
    }

    async fn get(&self, uri: &str) -> Result<Value> {
        self.payloads
            .read()
            .await
            .get(uri)
            .cloned()
            .with_context(|| format!("Artifact not found: {}", uri))
    }

    async fn exists(&self, uri: &str) -> Result<bool> {
        Ok(self.payloads.read().await.contains_key(uri))
    }

    fn location(&self) -> String {
        "memory://".to_string()
    }
}

/// Open the artifact store at a path; `memory://` gives an in-memory store
pub fn open_artifact_store(path: &str) -> Result<Arc<dyn ArtifactStore>> {
    if path == "memory://" {
        return Ok(Arc::new(InMemoryArtifactStore::new()));
    }
    Ok(Arc::new(LocalArtifactStore::new(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryArtifactStore::new();
        let uri = store.put("split", "train", "abc", &json!([1, 2])).await.unwrap();
        assert_eq!(uri, "memory://split/abc/train");
        assert!(store.exists(&uri).await.unwrap());
        assert_eq!(store.get(&uri).await.unwrap(), json!([1, 2]));

        assert!(store.evict(&uri).await);
        assert!(!store.exists(&uri).await.unwrap());
        assert!(store.get(&uri).await.is_err());
    }

    #[test]
    fn test_open_in_memory() {
        let store = open_artifact_store("memory://").unwrap();
        assert_eq!(store.location(), "memory://");
    }
}

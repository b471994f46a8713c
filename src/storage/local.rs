//! Filesystem artifact store

use crate::storage::ArtifactStore;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Artifacts as JSON files under `<root>/<producer>/<content_hash>/<name>.json`
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    /// Create a store rooted at `root`, creating the directory if needed
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create artifact store at {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, producer: &str, name: &str, content_hash: &str) -> PathBuf {
        // ':' is not portable in file names
        let producer = producer.replace(':', "_");
        self.root
            .join(producer)
            .join(content_hash)
            .join(format!("{}.json", name))
    }
}

#[async_trait::async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, producer: &str, name: &str, content_hash: &str, payload: &Value) -> Result<String> {
        let path = self.path_for(producer, name, content_hash);
        let uri = path.to_string_lossy().to_string();

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!("Artifact already stored: {}", uri);
            return Ok(uri);
        }

        let dir = path
            .parent()
            .with_context(|| format!("Artifact path has no parent: {}", uri))?;
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let body = serde_json::to_vec_pretty(payload).context("Failed to encode artifact")?;
        let tmp = dir.join(format!(".{}.{}.tmp", name, Uuid::new_v4()));
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move artifact into place at {}", uri))?;

        debug!("Stored artifact {}", uri);
        Ok(uri)
    }

    async fn get(&self, uri: &str) -> Result<Value> {
        let content = tokio::fs::read(uri)
            .await
            .with_context(|| format!("Failed to read artifact {}", uri))?;
        serde_json::from_slice(&content).with_context(|| format!("Artifact {} is not valid JSON", uri))
    }

    async fn exists(&self, uri: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(uri).await?)
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_local_store_round_trip() {
        let root = std::env::temp_dir().join(format!("mlpipeline-artifacts-{}", Uuid::new_v4()));
        let store = LocalArtifactStore::new(&root).unwrap();

        let uri = store
            .put("datasource:iris", "data", "hash1", &json!({ "rows": [1, 2] }))
            .await
            .unwrap();
        assert!(uri.ends_with("data.json"));
        assert!(uri.contains("datasource_iris"));
        assert!(store.exists(&uri).await.unwrap());
        assert_eq!(store.get(&uri).await.unwrap(), json!({ "rows": [1, 2] }));

        // Same address is never rewritten
        let again = store.put("datasource:iris", "data", "hash1", &json!("other")).await.unwrap();
        assert_eq!(again, uri);
        assert_eq!(store.get(&uri).await.unwrap(), json!({ "rows": [1, 2] }));

        std::fs::remove_dir_all(&root).ok();
        assert!(!store.exists(&uri).await.unwrap());
    }
}

//! File-backed secrets manager

use crate::secrets::{apply, Change, SecretValues, SecretsError, SecretsManager};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

type Secrets = BTreeMap<String, SecretValues>;

/// Secrets in one YAML file, readable by the owner only
pub struct LocalSecretsManager {
    path: PathBuf,
    lock: Mutex<()>,
}

impl LocalSecretsManager {
    /// Manager backed by `path`; the file is created on the first write
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create secrets directory {}", dir.display()))?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Secrets, SecretsError> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(Secrets::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        if content.trim().is_empty() {
            return Ok(Secrets::new());
        }
        Ok(serde_yaml::from_str(&content)?)
    }

    async fn save(&self, secrets: &Secrets) -> Result<(), SecretsError> {
        let content = serde_yaml::to_string(secrets)?;
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let tmp = self.path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));
        tokio::fs::write(&tmp, content).await?;
        restrict(&tmp).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn change(&self, name: &str, change: Change) -> Result<(), SecretsError> {
        let _guard = self.lock.lock().await;
        let mut secrets = self.load().await?;
        apply(&mut secrets, name, change)?;
        self.save(&secrets).await?;
        debug!("Saved secrets to {}", self.path.display());
        Ok(())
    }
}

#[cfg(unix)]
async fn restrict(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn restrict(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait::async_trait]
impl SecretsManager for LocalSecretsManager {
    async fn create_secret(&self, name: &str, values: SecretValues) -> Result<(), SecretsError> {
        self.change(name, Change::Create(values)).await
    }

    async fn get_secret(&self, name: &str) -> Result<SecretValues, SecretsError> {
        let _guard = self.lock.lock().await;
        self.load()
            .await?
            .remove(name)
            .ok_or_else(|| SecretsError::NotFound(name.to_string()))
    }

    async fn update_secret(&self, name: &str, values: SecretValues) -> Result<(), SecretsError> {
        self.change(name, Change::Update(values)).await
    }

    async fn delete_secret(&self, name: &str) -> Result<(), SecretsError> {
        self.change(name, Change::Delete).await
    }

    async fn list_secrets(&self) -> Result<Vec<String>, SecretsError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.into_keys().collect())
    }

    fn location(&self) -> String {
        self.path.to_string_lossy().to_string()
    }
}

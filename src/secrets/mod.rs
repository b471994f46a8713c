//! Secrets managers - named sets of key/value credentials kept out of
//! pipeline files

pub mod local;

pub use local::LocalSecretsManager;

use crate::core::config::is_valid_name;
use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Keys and values of one secret
pub type SecretValues = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("secret '{0}' already exists")]
    Exists(String),

    #[error("secret '{0}' not found")]
    NotFound(String),

    #[error("invalid secret name '{0}'")]
    InvalidName(String),

    #[error("secret '{0}' has no values")]
    Empty(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Trait for secrets manager backends
#[async_trait::async_trait]
pub trait SecretsManager: Send + Sync {
    async fn create_secret(&self, name: &str, values: SecretValues) -> Result<(), SecretsError>;

    async fn get_secret(&self, name: &str) -> Result<SecretValues, SecretsError>;

    /// Replace the values of an existing secret
    async fn update_secret(&self, name: &str, values: SecretValues) -> Result<(), SecretsError>;

    async fn delete_secret(&self, name: &str) -> Result<(), SecretsError>;

    /// Secret names, sorted
    async fn list_secrets(&self) -> Result<Vec<String>, SecretsError>;

    /// Human-readable location of the manager
    fn location(&self) -> String;
}

pub(crate) fn check_secret(name: &str, values: &SecretValues) -> Result<(), SecretsError> {
    if !is_valid_name(name) {
        return Err(SecretsError::InvalidName(name.to_string()));
    }
    if values.is_empty() {
        return Err(SecretsError::Empty(name.to_string()));
    }
    Ok(())
}

/// Apply a change to a set of secrets, as every backend does it
pub(crate) fn apply(
    secrets: &mut BTreeMap<String, SecretValues>,
    name: &str,
    change: Change,
) -> Result<Option<SecretValues>, SecretsError> {
    match change {
        Change::Create(values) => {
            check_secret(name, &values)?;
            if secrets.contains_key(name) {
                return Err(SecretsError::Exists(name.to_string()));
            }
            secrets.insert(name.to_string(), values);
            Ok(None)
        }
        Change::Update(values) => {
            check_secret(name, &values)?;
            let current = secrets
                .get_mut(name)
                .ok_or_else(|| SecretsError::NotFound(name.to_string()))?;
            Ok(Some(std::mem::replace(current, values)))
        }
        Change::Delete => secrets
            .remove(name)
            .map(Some)
            .ok_or_else(|| SecretsError::NotFound(name.to_string())),
    }
}

pub(crate) enum Change {
    Create(SecretValues),
    Update(SecretValues),
    Delete,
}

/// In-memory secrets manager (for testing or ephemeral use)
#[derive(Default)]
pub struct InMemorySecretsManager {
    secrets: RwLock<BTreeMap<String, SecretValues>>,
}

impl InMemorySecretsManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SecretsManager for InMemorySecretsManager {
    async fn create_secret(&self, name: &str, values: SecretValues) -> Result<(), SecretsError> {
        apply(&mut *self.secrets.write().await, name, Change::Create(values))?;
        Ok(())
    }

    async fn get_secret(&self, name: &str) -> Result<SecretValues, SecretsError> {
        self.secrets
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SecretsError::NotFound(name.to_string()))
    }

    async fn update_secret(&self, name: &str, values: SecretValues) -> Result<(), SecretsError> {
        apply(&mut *self.secrets.write().await, name, Change::Update(values))?;
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<(), SecretsError> {
        apply(&mut *self.secrets.write().await, name, Change::Delete)?;
        Ok(())
    }

    async fn list_secrets(&self) -> Result<Vec<String>, SecretsError> {
        Ok(self.secrets.read().await.keys().cloned().collect())
    }

    fn location(&self) -> String {
        "memory://".to_string()
    }
}

/// Open the secrets manager at a file path; `memory://` gives an in-memory one
pub fn open_secrets_manager(location: &str) -> Result<Arc<dyn SecretsManager>> {
    if location == "memory://" {
        return Ok(Arc::new(InMemorySecretsManager::new()));
    }
    Ok(Arc::new(LocalSecretsManager::new(location)?))
}

/// Parse `KEY=VALUE` pairs into secret values
pub fn parse_values<I, S>(pairs: I) -> Result<SecretValues>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut values = SecretValues::new();
    for pair in pairs {
        let pair = pair.as_ref();
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Expected KEY=VALUE, got '{}'", pair))?;
        if key.trim().is_empty() {
            anyhow::bail!("Secret key is empty in '{}'", pair);
        }
        values.insert(key.trim().to_string(), value.to_string());
    }
    Ok(values)
}

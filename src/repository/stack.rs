//! Stacks - named combinations of artifact store, metadata store, orchestrator
//! and an optional secrets manager

use crate::backend::BackendRegistry;
use crate::core::config::{validate_metadata, BackendConfig, MetadataConfig, StackOverrides, ORCHESTRATION_BACKENDS};
use crate::execution::{ExecutionEngine, SchedulingStrategy};
use crate::persistence::open_metadata_store;
use crate::repository::component::{ComponentType, StackComponent};
use crate::secrets::{open_secrets_manager, SecretsManager};
use crate::storage::open_artifact_store;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Name of the stack, and of each of its components, every repository starts with
pub const DEFAULT_STACK: &str = "default";

/// A registered stack: the component name used for each type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackDefinition {
    pub artifact_store: String,

    pub metadata_store: String,

    pub orchestrator: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_manager: Option<String>,
}

impl StackDefinition {
    /// Stack made of the components called `name` of every type
    pub fn uniform(name: &str) -> Self {
        Self {
            artifact_store: name.to_string(),
            metadata_store: name.to_string(),
            orchestrator: name.to_string(),
            secrets_manager: Some(name.to_string()),
        }
    }

    /// Referenced components by type
    pub fn components(&self) -> Vec<(ComponentType, &str)> {
        let mut components = vec![
            (ComponentType::ArtifactStore, self.artifact_store.as_str()),
            (ComponentType::MetadataStore, self.metadata_store.as_str()),
            (ComponentType::Orchestrator, self.orchestrator.as_str()),
        ];
        if let Some(secrets) = &self.secrets_manager {
            components.push((ComponentType::SecretsManager, secrets.as_str()));
        }
        components
    }

    pub fn uses(&self, kind: ComponentType, name: &str) -> bool {
        self.components().contains(&(kind, name))
    }
}

/// A stack with its components resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackConfig {
    /// Root path of the artifact store (`memory://` for an in-memory one)
    pub artifact_store: String,

    pub metadata: MetadataConfig,

    /// Orchestration backend
    pub backend: BackendConfig,

    /// Secrets file (`memory://` for an in-memory one)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_manager: Option<String>,
}

impl StackConfig {
    /// Local stack keeping artifacts and metadata under `root`
    pub fn default_local(root: &Path) -> Self {
        #[cfg(feature = "sqlite")]
        let metadata = MetadataConfig::sqlite(root.join("metadata.db").to_string_lossy());
        #[cfg(not(feature = "sqlite"))]
        let metadata = MetadataConfig::in_memory();

        Self {
            artifact_store: root.join("artifacts").to_string_lossy().to_string(),
            metadata,
            backend: BackendConfig::new("local"),
            secrets_manager: Some(root.join("secrets.yaml").to_string_lossy().to_string()),
        }
    }

    /// The components this stack is made of
    pub fn components(&self) -> Vec<(ComponentType, StackComponent)> {
        let mut components = vec![
            (ComponentType::ArtifactStore, StackComponent::from_location(&self.artifact_store)),
            (ComponentType::MetadataStore, StackComponent::metadata(&self.metadata)),
            (ComponentType::Orchestrator, StackComponent::orchestrator(&self.backend)),
        ];
        if let Some(secrets) = &self.secrets_manager {
            components.push((ComponentType::SecretsManager, StackComponent::from_location(secrets)));
        }
        components
    }

    /// Stack in effect for a pipeline file: sections in the file win over the active stack
    pub fn resolve(overrides: &StackOverrides, active: &StackConfig) -> StackConfig {
        StackConfig {
            artifact_store: overrides
                .artifact_store
                .clone()
                .unwrap_or_else(|| active.artifact_store.clone()),
            metadata: overrides.metadata.clone().unwrap_or_else(|| active.metadata.clone()),
            backend: overrides.backend.clone().unwrap_or_else(|| active.backend.clone()),
            secrets_manager: active.secrets_manager.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.artifact_store.trim().is_empty() {
            anyhow::bail!("Stack artifact store path is empty");
        }
        validate_metadata(&self.metadata)?;
        if !ORCHESTRATION_BACKENDS.contains(&self.backend.kind.as_str()) {
            anyhow::bail!(
                "Unknown orchestration backend '{}' (expected one of: {})",
                self.backend.kind,
                ORCHESTRATION_BACKENDS.join(", ")
            );
        }
        Ok(())
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        SchedulingStrategy::from_backend(Some(&self.backend))
    }

    /// Open the secrets manager of this stack
    pub fn secrets(&self) -> Result<Arc<dyn SecretsManager>> {
        let location = self
            .secrets_manager
            .as_deref()
            .context("The stack has no secrets manager")?;
        open_secrets_manager(location)
    }

    /// Open both stores and build an engine on top of them
    pub async fn engine(&self, backends: Arc<BackendRegistry>) -> Result<ExecutionEngine> {
        self.validate()?;
        let artifacts = open_artifact_store(&self.artifact_store)?;
        let metadata = open_metadata_store(&self.metadata).await?;
        Ok(ExecutionEngine::new(artifacts, metadata, backends, self.strategy()))
    }
}

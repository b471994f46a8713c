//! Stack components - stores and orchestrators registered on their own and
//! referenced by name from stacks

use crate::core::config::{BackendConfig, MetadataArgs, MetadataConfig, METADATA_TYPES, ORCHESTRATION_BACKENDS};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::path::Path;

/// Flavors of artifact stores and secrets managers
pub const STORE_FLAVORS: &[&str] = &["local", "memory"];

/// Location string of in-memory stores
pub const MEMORY_LOCATION: &str = "memory://";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    ArtifactStore,
    MetadataStore,
    Orchestrator,
    SecretsManager,
}

impl ComponentType {
    pub const ALL: [ComponentType; 4] = [
        ComponentType::ArtifactStore,
        ComponentType::MetadataStore,
        ComponentType::Orchestrator,
        ComponentType::SecretsManager,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentType::ArtifactStore => "artifact_store",
            ComponentType::MetadataStore => "metadata_store",
            ComponentType::Orchestrator => "orchestrator",
            ComponentType::SecretsManager => "secrets_manager",
        }
    }

    /// Flavors a component of this type may have
    pub fn flavors(&self) -> &'static [&'static str] {
        match self {
            ComponentType::ArtifactStore | ComponentType::SecretsManager => STORE_FLAVORS,
            ComponentType::MetadataStore => METADATA_TYPES,
            ComponentType::Orchestrator => ORCHESTRATION_BACKENDS,
        }
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered component: its flavor plus flavor-specific arguments
///
/// | type            | flavor                   | args                |
/// |-----------------|--------------------------|---------------------|
/// | artifact_store  | `local`, `memory`        | `path` for `local`  |
/// | metadata_store  | `sqlite`, `in_memory`    | `uri`               |
/// | orchestrator    | `local`, `local_parallel`| `max_concurrency`   |
/// | secrets_manager | `local`, `memory`        | `path` for `local`  |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackComponent {
    pub flavor: String,

    #[serde(default = "empty_object")]
    pub args: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl StackComponent {
    pub fn new(flavor: impl Into<String>, args: Value) -> Self {
        Self {
            flavor: flavor.into(),
            args,
        }
    }

    /// Local store (artifact store or secrets manager) at `path`
    pub fn local(path: &Path) -> Self {
        Self::new("local", json!({ "path": path.to_string_lossy() }))
    }

    /// Store kept in memory for the lifetime of the process
    pub fn memory() -> Self {
        Self::new("memory", empty_object())
    }

    /// Store located by a path, or `memory://`
    pub fn from_location(location: &str) -> Self {
        if location == MEMORY_LOCATION {
            Self::memory()
        } else {
            Self::local(Path::new(location))
        }
    }

    pub fn metadata(config: &MetadataConfig) -> Self {
        Self::new(config.kind.clone(), json!({ "uri": config.args.uri }))
    }

    pub fn orchestrator(config: &BackendConfig) -> Self {
        Self::new(config.kind.clone(), config.args.clone())
    }

    /// Check the flavor and required arguments for a component of type `kind`
    pub fn validate(&self, kind: ComponentType) -> Result<()> {
        if !kind.flavors().contains(&self.flavor.as_str()) {
            anyhow::bail!(
                "Unknown {} flavor '{}' (expected one of: {})",
                kind,
                self.flavor,
                kind.flavors().join(", ")
            );
        }
        if !(self.args.is_object() || self.args.is_null()) {
            anyhow::bail!("{} args must be a mapping", kind);
        }
        match kind {
            ComponentType::ArtifactStore | ComponentType::SecretsManager => {
                self.location()?;
            }
            ComponentType::MetadataStore => {
                self.metadata_config()?;
            }
            ComponentType::Orchestrator => {}
        }
        Ok(())
    }

    /// Location of a store component: its path, or `memory://`
    pub fn location(&self) -> Result<String> {
        if self.flavor == "memory" {
            return Ok(MEMORY_LOCATION.to_string());
        }
        let path = self
            .string_arg("path")
            .with_context(|| format!("A '{}' store needs args.path", self.flavor))?;
        Ok(path)
    }

    pub fn metadata_config(&self) -> Result<MetadataConfig> {
        let uri = self
            .string_arg("uri")
            .with_context(|| format!("A '{}' metadata store needs args.uri", self.flavor))?;
        Ok(MetadataConfig {
            kind: self.flavor.clone(),
            args: MetadataArgs { uri },
        })
    }

    pub fn backend_config(&self) -> BackendConfig {
        let mut backend = BackendConfig::new(self.flavor.clone());
        if self.args.is_object() {
            backend.args = self.args.clone();
        }
        backend
    }

    fn string_arg(&self, name: &str) -> Option<String> {
        self.args
            .get(name)
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
            .map(str::to_string)
    }
}

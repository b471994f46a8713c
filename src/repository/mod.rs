//! Repository - on-disk registry of pipelines, datasources, step versions and stacks
//!
//! Layout under the repository root:
//!
//! ```text
//! config.yaml                      version, active stack, components, stacks
//! secrets.yaml                     secrets of the default local secrets manager
//! pipelines/<name>.yaml            registered pipeline configs
//! datasources/<name>/<version>.yaml
//! steps.yaml                       source path -> versions seen
//! ```

pub mod component;
pub mod stack;

pub use component::{ComponentType, StackComponent};
pub use stack::{StackConfig, StackDefinition, DEFAULT_STACK};

use crate::core::config::{is_valid_name, PipelineConfig};
use crate::core::{DatasourceRecord, SourceRef};
use crate::settings::Settings;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Repository layout version
pub const REPOSITORY_VERSION: &str = "1";

const CONFIG_FILE: &str = "config.yaml";
const STEPS_FILE: &str = "steps.yaml";
const PIPELINES_DIR: &str = "pipelines";
const DATASOURCES_DIR: &str = "datasources";

tokio::task_local! {
    /// Set while a step or datasource reader runs
    pub static STEP_EXECUTION: bool;
}

/// Whether the current task is running step code
pub fn in_step_execution() -> bool {
    STEP_EXECUTION.try_with(|running| *running).unwrap_or(false)
}

static GLOBAL: OnceCell<Repository> = OnceCell::new();

/// Error types for repository operations
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("no repository at {0}; run `mlpipe init` first")]
    NotInitialized(PathBuf),

    #[error("the repository cannot be accessed from inside a running step")]
    ForbiddenAccess,

    #[error("pipeline '{0}' is already registered")]
    PipelineExists(String),

    #[error("pipeline '{0}' not found")]
    PipelineNotFound(String),

    #[error("pipeline '{0}' has been executed and is immutable; copy it to a new name to change it")]
    PipelineImmutable(String),

    #[error("datasource '{0}' not found")]
    DatasourceNotFound(String),

    #[error("datasource '{name}' version '{version}' is already registered with different content")]
    DatasourceConflict { name: String, version: String },

    #[error("stack '{0}' already exists")]
    StackExists(String),

    #[error("stack '{0}' not found")]
    StackNotFound(String),

    #[error("stack '{0}' is active and cannot be removed")]
    ActiveStack(String),

    #[error("{kind} '{name}' already exists")]
    ComponentExists { kind: ComponentType, name: String },

    #[error("{kind} '{name}' not found")]
    ComponentNotFound { kind: ComponentType, name: String },

    #[error("{kind} '{name}' is used by stack '{stack}'")]
    ComponentInUse {
        kind: ComponentType,
        name: String,
        stack: String,
    },

    #[error("invalid name '{0}'")]
    InvalidName(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Contents of `config.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub version: String,
    pub active_stack: String,

    /// Registered components by type, then name
    #[serde(default)]
    pub components: BTreeMap<ComponentType, IndexMap<String, StackComponent>>,

    pub stacks: IndexMap<String, StackDefinition>,
}

impl RepositoryConfig {
    pub fn component(&self, kind: ComponentType, name: &str) -> Option<&StackComponent> {
        self.components.get(&kind).and_then(|components| components.get(name))
    }

    /// Resolve the components a stack names into their configuration
    pub fn resolve_stack(&self, stack: &StackDefinition) -> Result<StackConfig, RepositoryError> {
        let component = |kind: ComponentType, name: &str| {
            self.component(kind, name)
                .ok_or_else(|| RepositoryError::ComponentNotFound {
                    kind,
                    name: name.to_string(),
                })
        };
        let invalid = |e: anyhow::Error| RepositoryError::InvalidConfig(format!("{:#}", e));

        let secrets_manager = match &stack.secrets_manager {
            Some(name) => Some(component(ComponentType::SecretsManager, name)?.location().map_err(invalid)?),
            None => None,
        };
        Ok(StackConfig {
            artifact_store: component(ComponentType::ArtifactStore, &stack.artifact_store)?
                .location()
                .map_err(invalid)?,
            metadata: component(ComponentType::MetadataStore, &stack.metadata_store)?
                .metadata_config()
                .map_err(invalid)?,
            backend: component(ComponentType::Orchestrator, &stack.orchestrator)?.backend_config(),
            secrets_manager,
        })
    }
}

/// A pipeline as stored in the repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredPipeline {
    pub registered_at: DateTime<Utc>,
    /// Set after the first run; the config is frozen from then on
    pub executed: bool,
    pub config: PipelineConfig,
}

impl RegisteredPipeline {
    pub fn name(&self) -> &str {
        self.config.name()
    }
}

pub type StepVersions = BTreeMap<String, BTreeSet<String>>;

/// Handle on a repository directory
#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
}

impl Repository {
    /// Create (or reuse) a repository at `root` with a default local stack
    pub fn init<P: AsRef<Path>>(root: P) -> Result<Self, RepositoryError> {
        guard()?;
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join(PIPELINES_DIR))?;
        std::fs::create_dir_all(root.join(DATASOURCES_DIR))?;

        let repository = Self { root };
        if !repository.config_path().exists() {
            let mut components: BTreeMap<ComponentType, IndexMap<String, StackComponent>> = BTreeMap::new();
            for (kind, component) in StackConfig::default_local(&repository.root).components() {
                components
                    .entry(kind)
                    .or_default()
                    .insert(DEFAULT_STACK.to_string(), component);
            }
            let mut stacks = IndexMap::new();
            stacks.insert(DEFAULT_STACK.to_string(), StackDefinition::uniform(DEFAULT_STACK));
            repository.save_config(&RepositoryConfig {
                version: REPOSITORY_VERSION.to_string(),
                active_stack: DEFAULT_STACK.to_string(),
                components,
                stacks,
            })?;
            info!("Initialized repository at {}", repository.root.display());
        } else {
            debug!("Repository already initialized at {}", repository.root.display());
        }

        Ok(repository)
    }

    /// Open an existing repository
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, RepositoryError> {
        guard()?;
        let root = root.as_ref().to_path_buf();
        if !root.join(CONFIG_FILE).exists() {
            return Err(RepositoryError::NotInitialized(root));
        }
        Ok(Self { root })
    }

    /// Process-wide repository at the path from the global settings
    pub fn global() -> Result<&'static Repository, RepositoryError> {
        guard()?;
        GLOBAL.get_or_try_init(|| {
            let settings = Settings::load().map_err(|e| RepositoryError::InvalidConfig(format!("{:#}", e)))?;
            Repository::init(settings.repository_root())
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    fn pipeline_path(&self, name: &str) -> Result<PathBuf, RepositoryError> {
        check_name(name)?;
        Ok(self.root.join(PIPELINES_DIR).join(format!("{}.yaml", name)))
    }

    fn datasource_dir(&self, name: &str) -> Result<PathBuf, RepositoryError> {
        check_name(name)?;
        Ok(self.root.join(DATASOURCES_DIR).join(name))
    }

    fn datasource_path(&self, name: &str, version: &str) -> Result<PathBuf, RepositoryError> {
        check_name(version)?;
        Ok(self.datasource_dir(name)?.join(format!("{}.yaml", version)))
    }

    /// Repository configuration
    pub fn config(&self) -> Result<RepositoryConfig, RepositoryError> {
        guard()?;
        read_yaml(&self.config_path())
    }

    fn save_config(&self, config: &RepositoryConfig) -> Result<(), RepositoryError> {
        write_yaml(&self.config_path(), config)
    }

    // Pipelines

    /// Register a new pipeline
    pub fn register_pipeline(&self, config: &PipelineConfig) -> Result<RegisteredPipeline, RepositoryError> {
        guard()?;
        validate(config)?;
        let name = config.name();
        if self.pipeline_path(name)?.exists() {
            return Err(RepositoryError::PipelineExists(name.to_string()));
        }

        let registered = RegisteredPipeline {
            registered_at: Utc::now(),
            executed: false,
            config: config.clone(),
        };
        write_yaml(&self.pipeline_path(name)?, &registered)?;
        self.record_steps(config)?;
        info!("Registered pipeline {}", name);
        Ok(registered)
    }

    pub fn get_pipeline(&self, name: &str) -> Result<RegisteredPipeline, RepositoryError> {
        guard()?;
        let path = self.pipeline_path(name)?;
        if !path.exists() {
            return Err(RepositoryError::PipelineNotFound(name.to_string()));
        }
        read_yaml(&path)
    }

    /// Registered pipeline names, sorted
    pub fn list_pipelines(&self) -> Result<Vec<String>, RepositoryError> {
        guard()?;
        let mut names = Vec::new();
        for entry in std::fs::read_dir(self.root.join(PIPELINES_DIR))? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "yaml") {
                if let Some(stem) = path.file_stem() {
                    names.push(stem.to_string_lossy().to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Replace the config of a pipeline that has never run
    pub fn update_pipeline(&self, config: &PipelineConfig) -> Result<RegisteredPipeline, RepositoryError> {
        guard()?;
        validate(config)?;
        let mut registered = self.get_pipeline(config.name())?;
        if registered.executed {
            return Err(RepositoryError::PipelineImmutable(config.name().to_string()));
        }

        registered.config = config.clone();
        write_yaml(&self.pipeline_path(config.name())?, &registered)?;
        self.record_steps(config)?;
        info!("Updated pipeline {}", config.name());
        Ok(registered)
    }

    /// Freeze a pipeline after its first run
    pub fn mark_executed(&self, name: &str) -> Result<(), RepositoryError> {
        guard()?;
        let mut registered = self.get_pipeline(name)?;
        if !registered.executed {
            registered.executed = true;
            write_yaml(&self.pipeline_path(name)?, &registered)?;
        }
        Ok(())
    }

    /// Register a copy of `source` under `target`
    pub fn copy_pipeline(&self, source: &str, target: &str) -> Result<RegisteredPipeline, RepositoryError> {
        guard()?;
        check_name(target)?;
        let original = self.get_pipeline(source)?;
        if source == target {
            return Err(RepositoryError::PipelineExists(target.to_string()));
        }
        let registered = self.register_pipeline(&original.config.renamed(target))?;
        info!("Copied pipeline {} to {}", source, target);
        Ok(registered)
    }

    /// Make a pipeline config ready to run.
    ///
    /// New pipelines are registered and unexecuted ones updated. An executed
    /// pipeline may run again only with an identical config.
    pub fn prepare_run(&self, config: &PipelineConfig) -> Result<RegisteredPipeline, RepositoryError> {
        guard()?;
        let existing = match self.get_pipeline(config.name()) {
            Ok(existing) => existing,
            Err(RepositoryError::PipelineNotFound(_)) => return self.register_pipeline(config),
            Err(e) => return Err(e),
        };

        if existing.config == *config {
            debug!("Pipeline {} is unchanged", config.name());
            return Ok(existing);
        }
        if existing.executed {
            return Err(RepositoryError::PipelineImmutable(config.name().to_string()));
        }
        self.update_pipeline(config)
    }

    // Datasources

    /// Record a datasource snapshot; re-registering identical content is a no-op
    pub fn register_datasource(&self, record: &DatasourceRecord) -> Result<(), RepositoryError> {
        guard()?;
        let dir = self.datasource_dir(&record.name)?;
        let path = self.datasource_path(&record.name, &record.version)?;
        if path.exists() {
            let existing: DatasourceRecord = read_yaml(&path)?;
            if existing.content_hash != record.content_hash {
                return Err(RepositoryError::DatasourceConflict {
                    name: record.name.clone(),
                    version: record.version.clone(),
                });
            }
            return Ok(());
        }

        std::fs::create_dir_all(&dir)?;
        write_yaml(&path, record)?;
        info!("Registered datasource {}@{}", record.name, record.version);
        Ok(())
    }

    /// A datasource version, or the latest registered one
    pub fn get_datasource(&self, name: &str, version: Option<&str>) -> Result<DatasourceRecord, RepositoryError> {
        guard()?;
        match version {
            Some(version) => {
                let path = self.datasource_path(name, version)?;
                if !path.exists() {
                    return Err(RepositoryError::DatasourceNotFound(format!("{}@{}", name, version)));
                }
                read_yaml(&path)
            }
            None => self
                .datasource_versions(name)?
                .pop()
                .ok_or_else(|| RepositoryError::DatasourceNotFound(name.to_string())),
        }
    }

    /// Names of registered datasources, sorted
    pub fn list_datasources(&self) -> Result<Vec<String>, RepositoryError> {
        guard()?;
        let mut names = Vec::new();
        for entry in std::fs::read_dir(self.root.join(DATASOURCES_DIR))? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Versions of a datasource, oldest first
    pub fn datasource_versions(&self, name: &str) -> Result<Vec<DatasourceRecord>, RepositoryError> {
        guard()?;
        let dir = self.datasource_dir(name)?;
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut records: Vec<DatasourceRecord> = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "yaml") {
                records.push(read_yaml(&path)?);
            }
        }
        records.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then_with(|| a.version.cmp(&b.version)));
        Ok(records)
    }

    // Step versions

    fn record_steps(&self, config: &PipelineConfig) -> Result<(), RepositoryError> {
        let path = self.root.join(STEPS_FILE);
        let mut versions: StepVersions = if path.exists() { read_yaml(&path)? } else { StepVersions::new() };

        let mut changed = false;
        for step in config.pipeline.steps.values() {
            let source = SourceRef::parse(&step.source).map_err(RepositoryError::InvalidConfig)?;
            changed |= versions
                .entry(source.path.clone())
                .or_default()
                .insert(source.version_or_latest().to_string());
        }

        if changed {
            write_yaml(&path, &versions)?;
        }
        Ok(())
    }

    /// Versions recorded for a step source path
    pub fn step_versions(&self, path: &str) -> Result<Vec<String>, RepositoryError> {
        Ok(self
            .step_sources()?
            .remove(path)
            .map(|versions| versions.into_iter().collect())
            .unwrap_or_default())
    }

    /// Every step source path with its recorded versions
    pub fn step_sources(&self) -> Result<StepVersions, RepositoryError> {
        guard()?;
        let path = self.root.join(STEPS_FILE);
        if !path.exists() {
            return Ok(StepVersions::new());
        }
        read_yaml(&path)
    }

    // Stack components

    pub fn register_stack_component(
        &self,
        kind: ComponentType,
        name: &str,
        component: StackComponent,
    ) -> Result<(), RepositoryError> {
        guard()?;
        check_name(name)?;
        component
            .validate(kind)
            .map_err(|e| RepositoryError::InvalidConfig(format!("{:#}", e)))?;
        let mut config = self.config()?;
        let components = config.components.entry(kind).or_default();
        if components.contains_key(name) {
            return Err(RepositoryError::ComponentExists {
                kind,
                name: name.to_string(),
            });
        }
        components.insert(name.to_string(), component);
        self.save_config(&config)?;
        info!("Registered {} {}", kind, name);
        Ok(())
    }

    pub fn get_stack_component(&self, kind: ComponentType, name: &str) -> Result<StackComponent, RepositoryError> {
        self.config()?
            .component(kind, name)
            .cloned()
            .ok_or_else(|| RepositoryError::ComponentNotFound {
                kind,
                name: name.to_string(),
            })
    }

    /// Components of one type in registration order
    pub fn list_stack_components(&self, kind: ComponentType) -> Result<Vec<(String, StackComponent)>, RepositoryError> {
        Ok(self
            .config()?
            .components
            .remove(&kind)
            .map(|components| components.into_iter().collect())
            .unwrap_or_default())
    }

    /// Remove a component no stack refers to
    pub fn deregister_stack_component(&self, kind: ComponentType, name: &str) -> Result<(), RepositoryError> {
        let mut config = self.config()?;
        if let Some((stack, _)) = config.stacks.iter().find(|(_, stack)| stack.uses(kind, name)) {
            return Err(RepositoryError::ComponentInUse {
                kind,
                name: name.to_string(),
                stack: stack.clone(),
            });
        }
        let removed = config
            .components
            .get_mut(&kind)
            .and_then(|components| components.shift_remove(name));
        if removed.is_none() {
            return Err(RepositoryError::ComponentNotFound {
                kind,
                name: name.to_string(),
            });
        }
        self.save_config(&config)?;
        info!("Deregistered {} {}", kind, name);
        Ok(())
    }

    // Stacks

    /// Register a stack made of already registered components
    pub fn register_stack(&self, name: &str, stack: StackDefinition) -> Result<(), RepositoryError> {
        guard()?;
        check_name(name)?;
        let mut config = self.config()?;
        if config.stacks.contains_key(name) {
            return Err(RepositoryError::StackExists(name.to_string()));
        }
        config
            .resolve_stack(&stack)?
            .validate()
            .map_err(|e| RepositoryError::InvalidConfig(format!("{:#}", e)))?;
        config.stacks.insert(name.to_string(), stack);
        self.save_config(&config)?;
        info!("Registered stack {}", name);
        Ok(())
    }

    /// Component names a stack is made of
    pub fn stack_definition(&self, name: &str) -> Result<StackDefinition, RepositoryError> {
        self.config()?
            .stacks
            .get(name)
            .cloned()
            .ok_or_else(|| RepositoryError::StackNotFound(name.to_string()))
    }

    /// A stack with its components resolved
    pub fn get_stack(&self, name: &str) -> Result<StackConfig, RepositoryError> {
        let config = self.config()?;
        let stack = config
            .stacks
            .get(name)
            .ok_or_else(|| RepositoryError::StackNotFound(name.to_string()))?;
        config.resolve_stack(stack)
    }

    /// Stack names in registration order
    pub fn list_stacks(&self) -> Result<Vec<String>, RepositoryError> {
        Ok(self.config()?.stacks.keys().cloned().collect())
    }

    pub fn activate_stack(&self, name: &str) -> Result<(), RepositoryError> {
        let mut config = self.config()?;
        if !config.stacks.contains_key(name) {
            return Err(RepositoryError::StackNotFound(name.to_string()));
        }
        config.active_stack = name.to_string();
        self.save_config(&config)?;
        info!("Activated stack {}", name);
        Ok(())
    }

    /// Name and resolved configuration of the active stack
    pub fn active_stack(&self) -> Result<(String, StackConfig), RepositoryError> {
        let config = self.config()?;
        let stack = config
            .stacks
            .get(&config.active_stack)
            .ok_or_else(|| RepositoryError::StackNotFound(config.active_stack.clone()))?;
        let resolved = config.resolve_stack(stack)?;
        Ok((config.active_stack, resolved))
    }

    pub fn deregister_stack(&self, name: &str) -> Result<(), RepositoryError> {
        let mut config = self.config()?;
        if config.active_stack == name {
            return Err(RepositoryError::ActiveStack(name.to_string()));
        }
        if config.stacks.shift_remove(name).is_none() {
            return Err(RepositoryError::StackNotFound(name.to_string()));
        }
        self.save_config(&config)?;
        info!("Deregistered stack {}", name);
        Ok(())
    }
}

fn guard() -> Result<(), RepositoryError> {
    if in_step_execution() {
        return Err(RepositoryError::ForbiddenAccess);
    }
    Ok(())
}

/// Names become file and directory names, so they must not contain separators
fn check_name(name: &str) -> Result<(), RepositoryError> {
    if !is_valid_name(name) {
        return Err(RepositoryError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn validate(config: &PipelineConfig) -> Result<(), RepositoryError> {
    config
        .validate()
        .map_err(|e| RepositoryError::InvalidConfig(format!("{:#}", e)))
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, RepositoryError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

/// Write through a temp file so readers never see a partial document
fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<(), RepositoryError> {
    let content = serde_yaml::to_string(value)?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

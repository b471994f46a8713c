//! Pipeline configuration from YAML

use crate::backend::builtin::SPLIT;
use crate::core::{check_input_keys, Pipeline, SourceRef, DEFAULT_OUTPUT};
use anyhow::{Context, Result};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;

/// Config file versions this crate understands
pub const SUPPORTED_VERSIONS: &[&str] = &["1"];

/// Input name that binds the pipeline datasource
pub const DATASOURCE_INPUT: &str = "datasource";

/// Orchestration backend types
pub const ORCHESTRATION_BACKENDS: &[&str] = &["local", "local_parallel"];

/// Metadata store types
pub const METADATA_TYPES: &[&str] = &["sqlite", "in_memory"];

static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("valid name regex"));

/// Whether `name` may be used for a pipeline, step, datasource or output
pub fn is_valid_name(name: &str) -> bool {
    NAME_PATTERN.is_match(name)
}

/// Top-level pipeline file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// File format version
    #[serde(deserialize_with = "deserialize_version")]
    pub version: String,

    /// Root path of the local artifact store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_store: Option<String>,

    /// Orchestration backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendConfig>,

    /// Metadata store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataConfig>,

    pub pipeline: PipelineSection,
}

/// Backend selection: the top-level one orchestrates, per-step ones process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default = "empty_object")]
    pub args: Value,
}

impl BackendConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            source: None,
            args: empty_object(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(rename = "type")]
    pub kind: String,

    pub args: MetadataArgs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataArgs {
    pub uri: String,
}

impl MetadataConfig {
    pub fn sqlite(uri: impl Into<String>) -> Self {
        Self {
            kind: "sqlite".to_string(),
            args: MetadataArgs { uri: uri.into() },
        }
    }

    pub fn in_memory() -> Self {
        Self {
            kind: "in_memory".to_string(),
            args: MetadataArgs {
                uri: ":memory:".to_string(),
            },
        }
    }
}

/// The `pipeline:` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSection {
    pub name: String,

    /// Free-form pipeline kind, e.g. `training`
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default = "default_true")]
    pub enable_cache: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasource: Option<DatasourceConfig>,

    pub steps: IndexMap<String, StepConfig>,

    /// Retries per step (global default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<usize>,

    /// Default step timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_secs: Option<u64>,
}

/// Step configuration as defined in YAML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub source: String,

    #[serde(default = "empty_object")]
    pub args: Value,

    /// Upstream steps; omitted means "the previous step"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<String>>,

    /// Processing backend override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_cache: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl StepConfig {
    /// Output names of the step: declared ones, else one per `split_map` key
    /// for the built-in split, else the single default output
    pub fn resolved_outputs(&self) -> Vec<String> {
        if let Some(outputs) = &self.outputs {
            return outputs.clone();
        }
        if self.is_split() {
            if let Some(split_map) = self.args.get("split_map").and_then(Value::as_object) {
                let keys: BTreeSet<&String> = split_map.keys().collect();
                return keys.into_iter().cloned().collect();
            }
        }
        vec![DEFAULT_OUTPUT.to_string()]
    }

    fn is_split(&self) -> bool {
        SourceRef::parse(&self.source).is_ok_and(|source| source.path == SPLIT)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasourceConfig {
    pub name: String,

    pub source: String,

    #[serde(default = "empty_object")]
    pub args: Value,

    /// Explicit version; derived from the content hash when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Store and backend sections a pipeline file sets explicitly
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StackOverrides {
    pub artifact_store: Option<String>,
    pub metadata: Option<MetadataConfig>,
    pub backend: Option<BackendConfig>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

fn default_true() -> bool {
    true
}

fn deserialize_version<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!("invalid version: {:?}", other))),
    }
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn name(&self) -> &str {
        &self.pipeline.name
    }

    /// Validate the pipeline configuration
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_VERSIONS.contains(&self.version.as_str()) {
            anyhow::bail!(
                "Unsupported config version '{}' (supported: {})",
                self.version,
                SUPPORTED_VERSIONS.join(", ")
            );
        }

        let pipeline = &self.pipeline;
        if !NAME_PATTERN.is_match(&pipeline.name) {
            anyhow::bail!("Invalid pipeline name '{}'", pipeline.name);
        }

        if pipeline.steps.is_empty() {
            anyhow::bail!("Pipeline '{}' has no steps", pipeline.name);
        }

        if let Some(backend) = &self.backend {
            if !ORCHESTRATION_BACKENDS.contains(&backend.kind.as_str()) {
                anyhow::bail!(
                    "Unknown orchestration backend '{}' (expected one of: {})",
                    backend.kind,
                    ORCHESTRATION_BACKENDS.join(", ")
                );
            }
        }

        if let Some(metadata) = &self.metadata {
            validate_metadata(metadata)?;
        }

        if let Some(path) = &self.artifact_store {
            if path.trim().is_empty() {
                anyhow::bail!("artifact_store path is empty");
            }
        }

        if let Some(datasource) = &pipeline.datasource {
            if !NAME_PATTERN.is_match(&datasource.name) {
                anyhow::bail!("Invalid datasource name '{}'", datasource.name);
            }
            if let Some(version) = &datasource.version {
                if !NAME_PATTERN.is_match(version) {
                    anyhow::bail!("Invalid version '{}' for datasource '{}'", version, datasource.name);
                }
            }
            SourceRef::parse(&datasource.source).map_err(|e| anyhow::anyhow!("Datasource: {}", e))?;
        }

        for (name, step) in &pipeline.steps {
            if !NAME_PATTERN.is_match(name) {
                anyhow::bail!("Invalid step name '{}'", name);
            }
            if name == DATASOURCE_INPUT {
                anyhow::bail!("'{}' is reserved and cannot be used as a step name", DATASOURCE_INPUT);
            }
            SourceRef::parse(&step.source).map_err(|e| anyhow::anyhow!("Step '{}': {}", name, e))?;

            if !(step.args.is_object() || step.args.is_null()) {
                anyhow::bail!("Step '{}' args must be a mapping", name);
            }

            if step.is_split() {
                let Some(split_map) = step.args.get("split_map").and_then(Value::as_object) else {
                    anyhow::bail!("Step '{}' needs args.split_map mapping output names to ratios", name);
                };
                if let Some(outputs) = &step.outputs {
                    let declared: BTreeSet<&String> = outputs.iter().collect();
                    let splits: BTreeSet<&String> = split_map.keys().collect();
                    if declared != splits {
                        anyhow::bail!("Step '{}' outputs must match its split_map keys", name);
                    }
                }
            }

            let outputs = step.resolved_outputs();
            if outputs.is_empty() {
                anyhow::bail!("Step '{}' declares an empty output list", name);
            }
            let mut seen = HashSet::new();
            for output in &outputs {
                if !NAME_PATTERN.is_match(output) {
                    anyhow::bail!("Step '{}' has invalid output name '{}'", name, output);
                }
                if !seen.insert(output) {
                    anyhow::bail!("Step '{}' declares output '{}' twice", name, output);
                }
            }
        }

        let outputs: Vec<(&str, Vec<String>)> = pipeline
            .steps
            .iter()
            .map(|(name, step)| (name.as_str(), step.resolved_outputs()))
            .collect();
        check_input_keys(outputs.iter().map(|(name, outputs)| (*name, outputs.as_slice())))
            .map_err(|e| anyhow::anyhow!("Pipeline '{}': {}", pipeline.name, e))?;

        // Check that all inputs reference existing steps
        for name in pipeline.steps.keys() {
            for input in self.resolved_inputs(name) {
                if input == DATASOURCE_INPUT {
                    if pipeline.datasource.is_none() {
                        anyhow::bail!(
                            "Step '{}' consumes the datasource but none is configured",
                            name
                        );
                    }
                    continue;
                }
                if input == *name {
                    anyhow::bail!("Step '{}' cannot consume its own output", name);
                }
                if !pipeline.steps.contains_key(&input) {
                    anyhow::bail!("Step '{}' consumes non-existent step '{}'", name, input);
                }
            }
        }

        self.check_cycles()?;

        Ok(())
    }

    /// Inputs of a step after applying the implicit "previous step" rule
    pub fn resolved_inputs(&self, step_name: &str) -> Vec<String> {
        let steps = &self.pipeline.steps;
        let Some((index, _, step)) = steps.get_full(step_name) else {
            return Vec::new();
        };

        if let Some(inputs) = &step.inputs {
            return inputs.clone();
        }

        if index == 0 {
            if self.pipeline.datasource.is_some() {
                vec![DATASOURCE_INPUT.to_string()]
            } else {
                Vec::new()
            }
        } else {
            steps
                .get_index(index - 1)
                .map(|(previous, _)| vec![previous.clone()])
                .unwrap_or_default()
        }
    }

    /// Check for cycles in the step input graph
    fn check_cycles(&self) -> Result<()> {
        let mut visited = HashSet::new();
        let mut recursion_stack = HashSet::new();

        for name in self.pipeline.steps.keys() {
            if !visited.contains(name) {
                self.dfs_check(name, &mut visited, &mut recursion_stack)?;
            }
        }

        Ok(())
    }

    fn dfs_check(
        &self,
        step_name: &str,
        visited: &mut HashSet<String>,
        recursion_stack: &mut HashSet<String>,
    ) -> Result<()> {
        visited.insert(step_name.to_string());
        recursion_stack.insert(step_name.to_string());

        for dep in self.resolved_inputs(step_name) {
            if dep == DATASOURCE_INPUT {
                continue;
            }
            if recursion_stack.contains(&dep) {
                anyhow::bail!("Cycle detected in step graph involving step '{}'", dep);
            }
            if !visited.contains(&dep) {
                self.dfs_check(&dep, visited, recursion_stack)?;
            }
        }

        recursion_stack.remove(step_name);
        Ok(())
    }

    /// The store and backend sections present in this file
    pub fn stack_overrides(&self) -> StackOverrides {
        StackOverrides {
            artifact_store: self.artifact_store.clone(),
            metadata: self.metadata.clone(),
            backend: self.backend.clone(),
        }
    }

    /// Same pipeline under another name
    pub fn renamed(&self, name: &str) -> Self {
        let mut config = self.clone();
        config.pipeline.name = name.to_string();
        config
    }

    /// Convert config to a Pipeline domain model
    pub fn to_pipeline(&self) -> Result<Pipeline> {
        Pipeline::from_config(self)
    }
}

pub(crate) fn validate_metadata(metadata: &MetadataConfig) -> Result<()> {
    if !METADATA_TYPES.contains(&metadata.kind.as_str()) {
        anyhow::bail!(
            "Unknown metadata store type '{}' (expected one of: {})",
            metadata.kind,
            METADATA_TYPES.join(", ")
        );
    }
    if metadata.args.uri.trim().is_empty() {
        anyhow::bail!("Metadata store uri is empty");
    }
    Ok(())
}

//! Step domain model

use crate::core::{
    config::{BackendConfig, StepConfig, DATASOURCE_INPUT},
    source::SourceRef,
    state::StepState,
};
use anyhow::Result;
use serde_json::Value;
use std::collections::HashSet;

/// Output name used when a step does not declare any
pub const DEFAULT_OUTPUT: &str = "output";

/// Processing backend used when a step does not override it
pub const DEFAULT_BACKEND: &str = "local";

/// A single step in a pipeline
#[derive(Debug, Clone)]
pub struct Step {
    /// Unique step name within the pipeline
    pub name: String,

    /// Code that implements the step
    pub source: SourceRef,

    /// Configuration arguments
    pub args: Value,

    /// Upstream step names, plus `datasource` when bound
    pub inputs: Vec<String>,

    /// Declared output names
    pub outputs: Vec<String>,

    /// Per-step processing backend
    pub backend: Option<BackendConfig>,

    /// Per-step cache switch, inherits the pipeline setting when `None`
    pub enable_cache: Option<bool>,

    /// Maximum number of retries
    pub max_retries: usize,

    /// Timeout in seconds
    pub timeout_secs: u64,

    /// Runtime state
    pub state: StepState,
}

#[derive(Debug, Clone)]
pub struct StepDefaults {
    pub max_retries: usize,
    pub timeout_secs: u64,
}

impl Default for StepDefaults {
    fn default() -> Self {
        Self {
            max_retries: 0,
            timeout_secs: 3600, // 1 hour
        }
    }
}

impl Step {
    pub fn new(
        name: impl Into<String>,
        source: SourceRef,
        args: Value,
        inputs: Vec<String>,
        defaults: &StepDefaults,
    ) -> Self {
        Step {
            name: name.into(),
            source,
            args: normalize_args(args),
            inputs,
            outputs: vec![DEFAULT_OUTPUT.to_string()],
            backend: None,
            enable_cache: None,
            max_retries: defaults.max_retries,
            timeout_secs: defaults.timeout_secs,
            state: StepState::Pending,
        }
    }

    /// Create a step from a step config with already-resolved inputs
    pub fn from_config(
        name: &str,
        config: &StepConfig,
        inputs: Vec<String>,
        defaults: &StepDefaults,
    ) -> Result<Self> {
        let source = SourceRef::parse(&config.source)
            .map_err(|e| anyhow::anyhow!("Step '{}': {}", name, e))?;

        let mut step = Step::new(name, source, config.args.clone(), inputs, defaults);
        step.outputs = config.resolved_outputs();
        step.backend = config.backend.clone();
        step.enable_cache = config.enable_cache;
        step.max_retries = config.retries.unwrap_or(defaults.max_retries);
        step.timeout_secs = config.timeout_secs.unwrap_or(defaults.timeout_secs);

        Ok(step)
    }

    /// Upstream steps, excluding the datasource binding
    pub fn dependencies(&self) -> impl Iterator<Item = &String> {
        self.inputs.iter().filter(|input| input.as_str() != DATASOURCE_INPUT)
    }

    pub fn consumes_datasource(&self) -> bool {
        self.inputs.iter().any(|input| input == DATASOURCE_INPUT)
    }

    /// Check if all upstream steps have completed
    pub fn dependencies_completed(&self, completed_steps: &HashSet<String>) -> bool {
        self.dependencies().all(|dep| completed_steps.contains(dep))
    }

    /// Whether cached artifacts may be reused for this step
    pub fn cache_enabled(&self, pipeline_default: bool) -> bool {
        pipeline_default && self.enable_cache.unwrap_or(true)
    }

    /// Processing backend type
    pub fn backend_kind(&self) -> &str {
        self.backend
            .as_ref()
            .map(|b| b.kind.as_str())
            .unwrap_or(DEFAULT_BACKEND)
    }

    /// Arguments for the processing backend
    pub fn backend_args(&self) -> Value {
        self.backend
            .as_ref()
            .map(|b| b.args.clone())
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    /// Same configuration, fresh state
    pub fn reset(&mut self) {
        self.state = StepState::Pending;
    }
}

fn normalize_args(args: Value) -> Value {
    if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trainer() -> Step {
        Step::new(
            "trainer",
            SourceRef::parse("my.Trainer@1").unwrap(),
            json!({ "epochs": 3 }),
            vec!["datasource".to_string(), "split".to_string()],
            &StepDefaults::default(),
        )
    }

    #[test]
    fn test_dependencies_skip_datasource() {
        let step = trainer();
        let deps: Vec<&String> = step.dependencies().collect();
        assert_eq!(deps, vec!["split"]);
        assert!(step.consumes_datasource());

        let mut completed = HashSet::new();
        assert!(!step.dependencies_completed(&completed));
        completed.insert("split".to_string());
        assert!(step.dependencies_completed(&completed));
    }

    #[test]
    fn test_cache_switches() {
        let mut step = trainer();
        assert!(step.cache_enabled(true));
        assert!(!step.cache_enabled(false));
        step.enable_cache = Some(false);
        assert!(!step.cache_enabled(true));
    }

    #[test]
    fn test_backend_defaults_to_local() {
        let mut step = trainer();
        assert_eq!(step.backend_kind(), "local");
        assert_eq!(step.backend_args(), json!({}));

        let mut backend = BackendConfig::new("command");
        backend.args = json!({ "program": "python3" });
        step.backend = Some(backend);
        assert_eq!(step.backend_kind(), "command");
        assert_eq!(step.backend_args()["program"], "python3");
    }

    #[test]
    fn test_from_config_applies_overrides() {
        let config: StepConfig = serde_yaml::from_str(
            r#"
source: my.Split@2
outputs: [train, eval]
retries: 2
timeout_secs: 10
"#,
        )
        .unwrap();
        let step = Step::from_config("split", &config, vec![], &StepDefaults::default()).unwrap();
        assert_eq!(step.outputs, vec!["train", "eval"]);
        assert_eq!(step.max_retries, 2);
        assert_eq!(step.timeout_secs, 10);
        assert_eq!(step.args, json!({}));
    }
}

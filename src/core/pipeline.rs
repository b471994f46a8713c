//! Pipeline domain model

use crate::core::{
    artifact::check_input_keys,
    config::{BackendConfig, PipelineConfig, DATASOURCE_INPUT},
    datasource::Datasource,
    source::SourceRef,
    state::{ExecutionStatus, PipelineState, StepState},
    step::{Step, StepDefaults},
};
use crate::error::PipelineError;
use anyhow::Result;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashSet;

/// A pipeline definition plus the state of its current run
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Pipeline name
    pub name: String,

    /// Free-form kind from the config (`training`, ...)
    pub kind: Option<String>,

    /// Code that defines the pipeline, informational
    pub source: Option<SourceRef>,

    pub datasource: Option<Datasource>,

    /// Pipeline-wide cache switch
    pub enable_cache: bool,

    /// Orchestration backend from the config file
    pub backend: Option<BackendConfig>,

    /// Steps in declaration order
    steps: IndexMap<String, Step>,

    /// Execution state
    pub state: PipelineState,

    /// Set once the pipeline has been executed
    frozen: bool,

    /// Step execution order (topological sort)
    execution_order: Vec<String>,
}

impl Pipeline {
    /// Create a pipeline from configuration
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let section = &config.pipeline;
        let defaults = StepDefaults {
            max_retries: section.max_retries.unwrap_or(0),
            timeout_secs: section.default_timeout_secs.unwrap_or(3600),
        };

        let mut steps = IndexMap::new();
        for (name, step_config) in &section.steps {
            let inputs = config.resolved_inputs(name);
            let step = Step::from_config(name, step_config, inputs, &defaults)?;
            steps.insert(name.clone(), step);
        }

        let source = match &section.source {
            Some(raw) => Some(SourceRef::parse(raw).map_err(|e| anyhow::anyhow!("Pipeline source: {}", e))?),
            None => None,
        };

        let datasource = match &section.datasource {
            Some(ds) => Some(Datasource::from_config(ds)?),
            None => None,
        };

        let execution_order = Self::topological_sort(&steps);

        Ok(Pipeline {
            name: section.name.clone(),
            kind: section.kind.clone(),
            source,
            datasource,
            enable_cache: section.enable_cache,
            backend: config.backend.clone(),
            steps,
            state: PipelineState::new(),
            frozen: false,
            execution_order,
        })
    }

    /// Get a step by name
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.get(name)
    }

    /// Mutable access for the engine; step configuration is guarded by the public mutators
    pub(crate) fn step_mut(&mut self, name: &str) -> Option<&mut Step> {
        self.steps.get_mut(name)
    }

    /// Steps in declaration order
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.values()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Mark the pipeline as executed; all further mutation is refused
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    fn ensure_mutable(&self) -> Result<(), PipelineError> {
        if self.frozen {
            return Err(PipelineError::Immutable(self.name.clone()));
        }
        Ok(())
    }

    /// Replace the arguments of a step
    pub fn set_step_args(&mut self, name: &str, args: Value) -> Result<(), PipelineError> {
        self.ensure_mutable()?;
        let step = self
            .steps
            .get_mut(name)
            .ok_or_else(|| PipelineError::StepNotFound(name.to_string()))?;
        step.args = args;
        Ok(())
    }

    /// Append a step whose inputs already exist
    pub fn add_step(&mut self, step: Step) -> Result<(), PipelineError> {
        self.ensure_mutable()?;
        if self.steps.contains_key(&step.name) {
            return Err(PipelineError::StepExists(step.name));
        }
        if step.name == DATASOURCE_INPUT {
            return Err(PipelineError::Invalid(format!(
                "'{}' is reserved and cannot be used as a step name",
                DATASOURCE_INPUT
            )));
        }
        if step.consumes_datasource() && self.datasource.is_none() {
            return Err(PipelineError::Invalid(format!(
                "step '{}' consumes the datasource but none is configured",
                step.name
            )));
        }
        if let Some(missing) = step.dependencies().find(|dep| !self.steps.contains_key(*dep)) {
            return Err(PipelineError::Invalid(format!(
                "step '{}' consumes non-existent step '{}'",
                step.name, missing
            )));
        }
        let existing = self.steps.values().map(|s| (s.name.as_str(), s.outputs.as_slice()));
        check_input_keys(existing.chain([(step.name.as_str(), step.outputs.as_slice())]))
            .map_err(PipelineError::Invalid)?;

        self.steps.insert(step.name.clone(), step);
        self.execution_order = Self::topological_sort(&self.steps);
        Ok(())
    }

    /// Remove a step nothing depends on
    pub fn remove_step(&mut self, name: &str) -> Result<Step, PipelineError> {
        self.ensure_mutable()?;
        if !self.steps.contains_key(name) {
            return Err(PipelineError::StepNotFound(name.to_string()));
        }
        if let Some(dependent) = self
            .steps
            .values()
            .find(|s| s.dependencies().any(|dep| dep == name))
        {
            return Err(PipelineError::Invalid(format!(
                "step '{}' is consumed by '{}'",
                name, dependent.name
            )));
        }

        let removed = self
            .steps
            .shift_remove(name)
            .ok_or_else(|| PipelineError::StepNotFound(name.to_string()))?;
        self.execution_order = Self::topological_sort(&self.steps);
        Ok(removed)
    }

    /// Copy this pipeline under a new name, ready to diverge and run
    pub fn copy_as(&self, new_name: &str) -> Result<Pipeline, PipelineError> {
        if new_name.trim().is_empty() {
            return Err(PipelineError::Invalid("pipeline name is empty".to_string()));
        }
        if new_name == self.name {
            return Err(PipelineError::Invalid(format!(
                "copy of '{}' needs a different name",
                self.name
            )));
        }

        let mut copy = self.clone();
        copy.name = new_name.to_string();
        copy.state = PipelineState::new();
        copy.frozen = false;
        for step in copy.steps.values_mut() {
            step.reset();
        }
        Ok(copy)
    }

    /// Names of completed steps
    pub fn completed_steps(&self) -> HashSet<String> {
        self.steps
            .values()
            .filter(|s| matches!(s.state, StepState::Completed { .. }))
            .map(|s| s.name.clone())
            .collect()
    }

    /// Get steps ready to execute (all upstream steps completed)
    pub fn ready_steps(&self) -> Vec<&Step> {
        let completed = self.completed_steps();

        self.execution_order
            .iter()
            .filter_map(|name| self.steps.get(name))
            .filter(|s| matches!(s.state, StepState::Pending) && s.dependencies_completed(&completed))
            .collect()
    }

    /// Check if every step reached a terminal state
    pub fn is_complete(&self) -> bool {
        self.steps.values().all(|s| s.state.is_terminal())
    }

    /// Check if any step failed
    pub fn has_failed(&self) -> bool {
        self.state.status == ExecutionStatus::Failed
            || self
                .steps
                .values()
                .any(|s| matches!(s.state, StepState::Failed { .. }))
    }

    /// Get execution order (topological sort)
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// All steps downstream of `name`, in execution order
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        let mut affected: HashSet<&str> = HashSet::new();
        affected.insert(name);

        let mut result = Vec::new();
        for candidate in &self.execution_order {
            if let Some(step) = self.steps.get(candidate) {
                if step.dependencies().any(|dep| affected.contains(dep.as_str())) {
                    affected.insert(candidate.as_str());
                    result.push(candidate.clone());
                }
            }
        }
        result
    }

    /// Calculate topological sort of steps, ties broken by declaration order
    fn topological_sort(steps: &IndexMap<String, Step>) -> Vec<String> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();

        for name in steps.keys() {
            if !visited.contains(name) {
                Self::visit(name, steps, &mut visited, &mut result);
            }
        }

        result
    }

    fn visit(name: &str, steps: &IndexMap<String, Step>, visited: &mut HashSet<String>, result: &mut Vec<String>) {
        if !visited.insert(name.to_string()) {
            return;
        }

        if let Some(step) = steps.get(name) {
            for dep in step.dependencies() {
                Self::visit(dep, steps, visited, result);
            }
        }

        result.push(name.to_string());
    }
}

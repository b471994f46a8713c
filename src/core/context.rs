//! Execution context handed to a step

use crate::core::SourceRef;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Everything a backend needs to run one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepContext {
    pub pipeline_name: String,

    pub run_id: Uuid,

    pub step_name: String,

    pub source: SourceRef,

    /// Step configuration arguments
    pub args: Value,

    /// Input payloads keyed by `step.output`, `step` (single-output producers) or `datasource`
    pub inputs: BTreeMap<String, Value>,

    /// Keys in `inputs` that repeat another input under its producer's name
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub aliases: BTreeSet<String>,

    /// Arguments of the processing backend
    #[serde(default)]
    pub backend_args: Value,
}

impl StepContext {
    /// Get an input payload by key
    pub fn input(&self, key: &str) -> Option<&Value> {
        self.inputs.get(key)
    }

    /// Inputs without their aliases, one entry per consumed artifact
    pub fn artifact_inputs(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.inputs.iter().filter(|(key, _)| !self.aliases.contains(*key))
    }

    /// The only input, when exactly one artifact was handed over
    pub fn single_input(&self) -> Option<&Value> {
        let mut inputs = self.artifact_inputs();
        let (_, first) = inputs.next()?;
        match inputs.next() {
            None => Some(first),
            Some(_) => None,
        }
    }

    /// Deserialize an argument
    pub fn arg<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.args
            .get(name)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

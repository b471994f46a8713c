//! Built-in steps and datasource readers

use crate::backend::{BackendError, DatasourceReader, StepFunction, StepOutputs};
use crate::core::StepContext;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const IDENTITY: &str = "mlpipeline.steps.Identity";
pub const SPLIT: &str = "mlpipeline.steps.Split";
pub const INLINE: &str = "mlpipeline.datasources.Inline";
pub const JSON_FILE: &str = "mlpipeline.datasources.JsonFile";

const RATIO_TOLERANCE: f64 = 1e-6;

/// Passes its input through unchanged; several inputs become one object keyed by input
pub struct Identity;

#[async_trait]
impl StepFunction for Identity {
    async fn run(&self, ctx: &StepContext) -> Result<StepOutputs, BackendError> {
        if ctx.inputs.is_empty() {
            return Err(BackendError::InvalidArgs(format!(
                "step '{}' has no input to pass through",
                ctx.step_name
            )));
        }

        let value = match ctx.single_input() {
            Some(value) => value.clone(),
            None => Value::Object(
                ctx.artifact_inputs()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect::<Map<String, Value>>(),
            ),
        };

        Ok(StepOutputs::single(value))
    }
}

/// Splits an array input into contiguous parts by `split_map` ratios
///
/// Parts are cut in key order, so the same input and ratios always give the
/// same split.
pub struct Split;

#[async_trait]
impl StepFunction for Split {
    async fn run(&self, ctx: &StepContext) -> Result<StepOutputs, BackendError> {
        let split_map: BTreeMap<String, f64> = ctx
            .arg("split_map")
            .ok_or_else(|| BackendError::InvalidArgs("split_map must map names to ratios".to_string()))?;

        if split_map.is_empty() {
            return Err(BackendError::InvalidArgs("split_map is empty".to_string()));
        }
        if let Some((name, ratio)) = split_map.iter().find(|(_, ratio)| !(**ratio > 0.0)) {
            return Err(BackendError::InvalidArgs(format!(
                "split '{}' has non-positive ratio {}",
                name, ratio
            )));
        }
        let total: f64 = split_map.values().sum();
        if (total - 1.0).abs() > RATIO_TOLERANCE {
            return Err(BackendError::InvalidArgs(format!(
                "split ratios sum to {}, expected 1",
                total
            )));
        }

        let rows = ctx
            .single_input()
            .and_then(Value::as_array)
            .ok_or_else(|| BackendError::InvalidArgs("split needs a single array input".to_string()))?;

        let mut outputs = StepOutputs::new();
        let mut start = 0usize;
        let mut cumulative = 0.0;
        let last = split_map.len() - 1;
        for (index, (name, ratio)) in split_map.iter().enumerate() {
            cumulative += ratio;
            let end = if index == last {
                rows.len()
            } else {
                ((cumulative * rows.len() as f64).round() as usize).clamp(start, rows.len())
            };
            outputs.insert(name.clone(), Value::Array(rows[start..end].to_vec()));
            start = end;
        }

        Ok(outputs)
    }
}

/// Data written directly in the pipeline file under `args.data`
pub struct Inline;

#[async_trait]
impl DatasourceReader for Inline {
    async fn read(&self, args: &Value) -> Result<Value, BackendError> {
        args.get("data")
            .cloned()
            .ok_or_else(|| BackendError::InvalidArgs("inline datasource needs args.data".to_string()))
    }
}

/// A JSON document on disk at `args.path`
pub struct JsonFile;

#[async_trait]
impl DatasourceReader for JsonFile {
    async fn read(&self, args: &Value) -> Result<Value, BackendError> {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::InvalidArgs("json datasource needs args.path".to_string()))?;

        let content = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&content)
            .map_err(|e| BackendError::Failed(format!("{} is not valid JSON: {}", path, e)))
    }
}

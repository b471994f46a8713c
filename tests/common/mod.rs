//! Shared helpers for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use mlpipeline::backend::{step_fn, BackendError, BackendRegistry, StepFunction, StepOutputs, StepRegistry};
use mlpipeline::core::config::PipelineConfig;
use mlpipeline::core::{Pipeline, StepContext};
use mlpipeline::execution::ExecutionEngine;
use mlpipeline::repository::StackConfig;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Directory removed when dropped
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new(prefix: &str) -> Self {
        let path = std::env::temp_dir().join(format!("mlpipeline-{}-{}", prefix, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.path).ok();
    }
}

/// Counts how often step code actually ran
#[derive(Clone, Default)]
pub struct Calls(Arc<AtomicUsize>);

impl Calls {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn numbers(value: Option<&Value>) -> Result<Vec<i64>, BackendError> {
    serde_json::from_value(value.cloned().unwrap_or_default()).map_err(|e| BackendError::InvalidArgs(e.to_string()))
}

/// Sleeps, then passes its input through while tracking peak concurrency
pub struct SlowIdentity {
    pub delay: Duration,
    pub running: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

#[async_trait]
impl StepFunction for SlowIdentity {
    async fn run(&self, ctx: &StepContext) -> Result<StepOutputs, BackendError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(StepOutputs::single(ctx.single_input().cloned().unwrap_or(Value::Null)))
    }
}

/// Registry with the built-ins plus a few numeric test steps:
///
/// - `steps.Scale` multiplies every number by `args.factor`, reading `args.input` if set
/// - `steps.Total` sums its single input
/// - `steps.Flaky` fails until its `args.succeed_on` attempt
/// - `steps.Broken` always fails without retry
pub fn test_registry(calls: &Calls) -> StepRegistry {
    let mut registry = StepRegistry::with_builtins();

    let counter = calls.clone();
    registry.register_step(
        "steps.Scale",
        step_fn(move |ctx| {
            counter.hit();
            let factor: i64 = ctx.arg("factor").unwrap_or(1);
            let data = match ctx.arg::<String>("input") {
                Some(key) => numbers(ctx.input(&key))?,
                None => numbers(ctx.single_input())?,
            };
            Ok(StepOutputs::single(json!(data.iter().map(|x| x * factor).collect::<Vec<_>>())))
        }),
    );

    let counter = calls.clone();
    registry.register_step(
        "steps.Total",
        step_fn(move |ctx| {
            counter.hit();
            let data = numbers(ctx.single_input())?;
            Ok(StepOutputs::single(json!(data.iter().sum::<i64>())))
        }),
    );

    let counter = calls.clone();
    registry.register_step(
        "steps.Flaky",
        step_fn(move |ctx| {
            let attempt = counter.hit();
            let succeed_on: usize = ctx.arg("succeed_on").unwrap_or(1);
            if attempt < succeed_on {
                return Err(BackendError::Failed(format!("transient failure {}", attempt)));
            }
            Ok(StepOutputs::single(json!(attempt)))
        }),
    );

    registry.register_step(
        "steps.Broken",
        step_fn(|_ctx| Err(BackendError::InvalidArgs("bad input".to_string()))),
    );

    registry
}

pub fn backends(registry: StepRegistry) -> Arc<BackendRegistry> {
    Arc::new(BackendRegistry::with_defaults(Arc::new(registry)))
}

/// Engine on a local SQLite stack rooted at `root`
pub async fn local_engine(root: &Path, calls: &Calls) -> ExecutionEngine {
    StackConfig::default_local(root)
        .engine(backends(test_registry(calls)))
        .await
        .unwrap()
}

pub fn pipeline(yaml: &str) -> Pipeline {
    PipelineConfig::from_yaml(yaml).unwrap().to_pipeline().unwrap()
}

/// Payload of a step's first output
pub async fn output_of(engine: &ExecutionEngine, pipeline: &Pipeline, step: &str) -> Value {
    let artifact = &pipeline.step(step).unwrap().state.artifacts()[0];
    engine.artifact_store().get(&artifact.uri).await.unwrap()
}

pub const TRAINING_YAML: &str = r#"
version: 1
pipeline:
  name: training
  type: training
  datasource:
    name: numbers
    source: mlpipeline.datasources.Inline
    args:
      data: [1, 2, 3, 4]
  steps:
    scale:
      source: steps.Scale
      args:
        factor: 2
    total:
      source: steps.Total
"#;

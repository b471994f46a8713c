//! In-process backend and the registry of step implementations

use crate::backend::{builtin, BackendError, StepBackend, StepOutputs};
use crate::core::StepContext;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Code behind a step source path
#[async_trait]
pub trait StepFunction: Send + Sync {
    async fn run(&self, ctx: &StepContext) -> Result<StepOutputs, BackendError>;
}

/// Code behind a datasource source path
#[async_trait]
pub trait DatasourceReader: Send + Sync {
    async fn read(&self, args: &Value) -> Result<Value, BackendError>;
}

struct FnStep<F>(F);

#[async_trait]
impl<F> StepFunction for FnStep<F>
where
    F: Fn(&StepContext) -> Result<StepOutputs, BackendError> + Send + Sync,
{
    async fn run(&self, ctx: &StepContext) -> Result<StepOutputs, BackendError> {
        (self.0)(ctx)
    }
}

/// Wrap a synchronous closure as a step function
pub fn step_fn<F>(f: F) -> Arc<dyn StepFunction>
where
    F: Fn(&StepContext) -> Result<StepOutputs, BackendError> + Send + Sync + 'static,
{
    Arc::new(FnStep(f))
}

/// Step functions and datasource readers by source path
#[derive(Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn StepFunction>>,
    readers: HashMap<String, Arc<dyn DatasourceReader>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in steps and readers
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_step(builtin::IDENTITY, Arc::new(builtin::Identity));
        registry.register_step(builtin::SPLIT, Arc::new(builtin::Split));
        registry.register_reader(builtin::INLINE, Arc::new(builtin::Inline));
        registry.register_reader(builtin::JSON_FILE, Arc::new(builtin::JsonFile));
        registry
    }

    pub fn register_step(&mut self, path: impl Into<String>, step: Arc<dyn StepFunction>) {
        self.steps.insert(path.into(), step);
    }

    pub fn register_reader(&mut self, path: impl Into<String>, reader: Arc<dyn DatasourceReader>) {
        self.readers.insert(path.into(), reader);
    }

    pub fn step(&self, path: &str) -> Result<Arc<dyn StepFunction>, BackendError> {
        self.steps
            .get(path)
            .cloned()
            .ok_or_else(|| BackendError::UnknownSource(path.to_string()))
    }

    pub fn reader(&self, path: &str) -> Result<Arc<dyn DatasourceReader>, BackendError> {
        self.readers
            .get(path)
            .cloned()
            .ok_or_else(|| BackendError::UnknownSource(path.to_string()))
    }

    /// Registered step source paths, sorted
    pub fn step_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.steps.keys().cloned().collect();
        paths.sort();
        paths
    }
}

/// Runs registered step functions in the current process
pub struct LocalBackend {
    steps: Arc<StepRegistry>,
}

impl LocalBackend {
    pub fn new(steps: Arc<StepRegistry>) -> Self {
        Self { steps }
    }
}

#[async_trait]
impl StepBackend for LocalBackend {
    fn kind(&self) -> &str {
        "local"
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepOutputs, BackendError> {
        let function = self.steps.step(&ctx.source.path)?;
        debug!("Running step {} in-process ({})", ctx.step_name, ctx.source);
        function.run(ctx).await
    }
}

//! Processing backends - run a single step somewhere
//!
//! The orchestration side (ordering and concurrency) lives in
//! [`crate::execution`]; a backend only turns a [`StepContext`] into
//! [`StepOutputs`].

pub mod builtin;
pub mod command;
pub mod local;

use crate::core::StepContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

pub use command::CommandBackend;
pub use local::{step_fn, DatasourceReader, LocalBackend, StepFunction, StepRegistry};

/// Error types for backend operations
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no step or datasource registered for source '{0}'")]
    UnknownSource(String),

    #[error("unknown backend type '{0}'")]
    UnknownBackend(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("step failed: {0}")]
    Failed(String),

    #[error("timeout after {0} seconds")]
    Timeout(u64),

    #[error("step did not produce declared output '{0}'")]
    MissingOutput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::Failed(_) | BackendError::Timeout(_) | BackendError::Io(_)
        )
    }
}

/// Named JSON payloads produced by a step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepOutputs(BTreeMap<String, Value>);

impl StepOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single payload under the default output name
    pub fn single(value: Value) -> Self {
        Self::new().with(crate::core::DEFAULT_OUTPUT, value)
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, Value>> for StepOutputs {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

/// Trait for processing backends - allows for different implementations
#[async_trait]
pub trait StepBackend: Send + Sync {
    /// Backend type as written in the `backend.type` key
    fn kind(&self) -> &str;

    /// Run one step
    async fn run(&self, ctx: &StepContext) -> Result<StepOutputs, BackendError>;
}

/// Processing backends by type, plus the step registry the local ones use
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn StepBackend>>,
    steps: Arc<StepRegistry>,
}

impl BackendRegistry {
    /// Registry without any backend
    pub fn new(steps: Arc<StepRegistry>) -> Self {
        Self {
            backends: HashMap::new(),
            steps,
        }
    }

    /// Registry with the `local` and `command` backends installed
    pub fn with_defaults(steps: Arc<StepRegistry>) -> Self {
        let mut registry = Self::new(steps.clone());
        registry.register(Arc::new(LocalBackend::new(steps)));
        registry.register(Arc::new(CommandBackend::new()));
        registry
    }

    /// Register a backend under its kind, replacing any previous one
    pub fn register(&mut self, backend: Arc<dyn StepBackend>) {
        self.backends.insert(backend.kind().to_string(), backend);
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn StepBackend>, BackendError> {
        self.backends
            .get(kind)
            .cloned()
            .ok_or_else(|| BackendError::UnknownBackend(kind.to_string()))
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.backends.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn step_registry(&self) -> &StepRegistry {
        &self.steps
    }
}

//! Error types for pipelines and the execution engine

use thiserror::Error;

use crate::backend::BackendError;

/// Errors raised while building, mutating or executing a pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline '{0}' has already been executed and is immutable; copy it under a new name to change it")]
    Immutable(String),

    #[error("step '{0}' not found")]
    StepNotFound(String),

    #[error("step '{0}' already exists")]
    StepExists(String),

    #[error("invalid pipeline: {0}")]
    Invalid(String),

    #[error("datasource '{name}' could not be loaded: {reason}")]
    Datasource { name: String, reason: String },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

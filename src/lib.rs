//! mlpipeline - machine-learning pipelines with artifact caching and lineage

pub mod backend;
pub mod cli;
pub mod core;
pub mod error;
pub mod execution;
pub mod persistence;
pub mod repository;
pub mod secrets;
pub mod settings;
pub mod storage;

// Re-export commonly used types
pub use backend::{step_fn, BackendError, BackendRegistry, StepBackend, StepFunction, StepOutputs, StepRegistry};
pub use core::config::PipelineConfig;
pub use core::{Artifact, Datasource, ExecutionStatus, Pipeline, Step, StepContext, StepState};
pub use error::PipelineError;
pub use execution::{ExecutionEngine, ExecutionEvent, RunSummary, SchedulingStrategy};
pub use repository::{Repository, StackConfig};

//! Pipeline execution engine

pub mod engine;
pub mod executor;
pub mod scheduler;

pub use engine::{EventHandler, ExecutionEngine, ExecutionEvent, RunSummary};
pub use executor::{ExecutionResult, StepExecutor};
pub use scheduler::{ExecutionScheduler, SchedulingStrategy};

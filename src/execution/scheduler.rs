//! Execution scheduler - determines which steps to run next

use crate::core::config::BackendConfig;
use crate::core::Pipeline;

/// Strategy for scheduling step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingStrategy {
    /// Execute steps in dependency order, one at a time
    #[default]
    Sequential,

    /// Execute all ready steps in parallel
    Parallel,

    /// Limited parallelism (max N concurrent steps)
    LimitedParallel(usize),
}

impl SchedulingStrategy {
    /// Strategy for an orchestration backend section.
    ///
    /// `local` runs one step at a time; `local_parallel` runs every ready
    /// step at once, or at most `args.max_concurrency` of them.
    pub fn from_backend(backend: Option<&BackendConfig>) -> Self {
        match backend {
            Some(backend) if backend.kind == "local_parallel" => {
                match backend.args.get("max_concurrency").and_then(|v| v.as_u64()) {
                    Some(max) if max > 0 => SchedulingStrategy::LimitedParallel(max as usize),
                    _ => SchedulingStrategy::Parallel,
                }
            }
            _ => SchedulingStrategy::Sequential,
        }
    }
}

/// Scheduler for determining which steps to run
pub struct ExecutionScheduler {
    strategy: SchedulingStrategy,
}

impl ExecutionScheduler {
    pub fn new(strategy: SchedulingStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    /// Get the next batch of steps to execute
    pub fn next_steps(&self, pipeline: &Pipeline) -> Vec<String> {
        let ready = pipeline.ready_steps().into_iter().map(|s| s.name.clone());

        match self.strategy {
            SchedulingStrategy::Sequential => ready.take(1).collect(),
            SchedulingStrategy::Parallel => ready.collect(),
            SchedulingStrategy::LimitedParallel(max) => ready.take(max.max(1)).collect(),
        }
    }

    /// Check if there are more steps to run
    pub fn has_more(&self, pipeline: &Pipeline) -> bool {
        !self.next_steps(pipeline).is_empty()
    }
}

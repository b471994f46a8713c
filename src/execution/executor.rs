//! Step executor - runs individual steps on their processing backend

use crate::backend::{BackendError, BackendRegistry, StepBackend, StepOutputs};
use crate::core::{Step, StepContext};
use crate::repository::STEP_EXECUTION;
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

/// Result of executing a step
#[derive(Debug)]
pub enum ExecutionResult {
    /// Step produced every declared output
    Success { outputs: StepOutputs, attempts: usize },

    /// Step failed after all attempts
    Failed { error: String, attempts: usize },
}

/// Called with the upcoming attempt number and the error that caused the retry
pub type RetryCallback<'a> = &'a (dyn Fn(usize, &BackendError) + Send + Sync);

/// Executes a single step
pub struct StepExecutor {
    backends: Arc<BackendRegistry>,
}

impl StepExecutor {
    pub fn new(backends: Arc<BackendRegistry>) -> Self {
        Self { backends }
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    /// Execute a step, retrying transient failures up to `step.max_retries` times
    pub async fn execute(&self, step: &Step, ctx: &StepContext, on_retry: RetryCallback<'_>) -> ExecutionResult {
        let backend = match self.backends.get(step.backend_kind()) {
            Ok(backend) => backend,
            Err(e) => {
                error!("Step {} cannot run: {}", step.name, e);
                return ExecutionResult::Failed {
                    error: e.to_string(),
                    attempts: 0,
                };
            }
        };

        let max_attempts = step.max_retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            info!(
                "Executing step: {} ({}) on {} [attempt {}/{}]",
                step.name,
                step.source,
                backend.kind(),
                attempt,
                max_attempts
            );

            let result = STEP_EXECUTION
                .scope(true, self.run_once(backend.as_ref(), step, ctx))
                .await;

            match result {
                Ok(outputs) => {
                    info!("Step {} completed successfully", step.name);
                    return ExecutionResult::Success {
                        outputs,
                        attempts: attempt,
                    };
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!("Step {} failed on attempt {}: {}; retrying", step.name, attempt, e);
                    on_retry(attempt + 1, &e);
                }
                Err(e) => {
                    error!("Step {} failed: {}", step.name, e);
                    return ExecutionResult::Failed {
                        error: e.to_string(),
                        attempts: attempt,
                    };
                }
            }
        }
    }

    async fn run_once(&self, backend: &dyn StepBackend, step: &Step, ctx: &StepContext) -> Result<StepOutputs, BackendError> {
        let outputs = match timeout(Duration::from_secs(step.timeout_secs), backend.run(ctx)).await {
            Ok(result) => result?,
            Err(_) => {
                error!("Timeout for step {} after {}s", step.name, step.timeout_secs);
                return Err(BackendError::Timeout(step.timeout_secs));
            }
        };

        debug!(
            "Step {} returned outputs: {}",
            step.name,
            outputs.names().cloned().collect::<Vec<_>>().join(", ")
        );
        check_outputs(step, outputs)
    }
}

/// Keep exactly the declared outputs
fn check_outputs(step: &Step, mut outputs: StepOutputs) -> Result<StepOutputs, BackendError> {
    let mut checked = StepOutputs::new();
    for name in &step.outputs {
        let value = outputs
            .remove(name)
            .ok_or_else(|| BackendError::MissingOutput(name.clone()))?;
        checked.insert(name.clone(), value);
    }

    if !outputs.is_empty() {
        warn!(
            "Step {} returned undeclared outputs, dropping: {}",
            step.name,
            outputs.names().cloned().collect::<Vec<_>>().join(", ")
        );
    }

    Ok(checked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{step_fn, StepFunction, StepRegistry};
    use crate::core::step::StepDefaults;
    use crate::core::SourceRef;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn step(source: &str, max_retries: usize) -> Step {
        let defaults = StepDefaults {
            max_retries,
            timeout_secs: 5,
        };
        Step::new("trainer", SourceRef::parse(source).unwrap(), json!({}), vec![], &defaults)
    }

    fn context(step: &Step) -> StepContext {
        StepContext {
            pipeline_name: "training".to_string(),
            run_id: Uuid::new_v4(),
            step_name: step.name.clone(),
            source: step.source.clone(),
            args: step.args.clone(),
            inputs: Default::default(),
            aliases: Default::default(),
            backend_args: step.backend_args(),
        }
    }

    fn executor(registry: StepRegistry) -> StepExecutor {
        StepExecutor::new(Arc::new(BackendRegistry::with_defaults(Arc::new(registry))))
    }

    #[tokio::test]
    async fn test_step_success() {
        let mut registry = StepRegistry::new();
        registry.register_step(
            "steps.Trainer",
            step_fn(|_ctx| Ok(StepOutputs::single(json!({ "weights": [0.5] })).with("debug", json!(1)))),
        );

        let step = step("steps.Trainer", 0);
        let result = executor(registry).execute(&step, &context(&step), &|_, _| {}).await;

        match result {
            ExecutionResult::Success { outputs, attempts } => {
                assert_eq!(attempts, 1);
                assert_eq!(outputs.names().collect::<Vec<_>>(), vec!["output"]);
            }
            other => panic!("Expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut registry = StepRegistry::new();
        registry.register_step(
            "steps.Flaky",
            step_fn(move |_ctx| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BackendError::Failed("connection reset".to_string()))
                } else {
                    Ok(StepOutputs::single(json!("ok")))
                }
            }),
        );

        let retries = Arc::new(AtomicUsize::new(0));
        let seen = retries.clone();
        let step = step("steps.Flaky", 2);
        let result = executor(registry)
            .execute(&step, &context(&step), &move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert!(matches!(result, ExecutionResult::Success { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let mut registry = StepRegistry::new();
        registry.register_step(
            "steps.Broken",
            step_fn(|_ctx| Err(BackendError::Failed("boom".to_string()))),
        );

        let step = step("steps.Broken", 1);
        let result = executor(registry).execute(&step, &context(&step), &|_, _| {}).await;
        match result {
            ExecutionResult::Failed { error, attempts } => {
                assert_eq!(attempts, 2);
                assert!(error.contains("boom"));
            }
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_output_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut registry = StepRegistry::new();
        registry.register_step(
            "steps.Split",
            step_fn(move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(StepOutputs::new().with("train", json!([1])))
            }),
        );

        let mut step = step("steps.Split", 3);
        step.outputs = vec!["train".to_string(), "eval".to_string()];
        let result = executor(registry).execute(&step, &context(&step), &|_, _| {}).await;

        match result {
            ExecutionResult::Failed { error, attempts } => {
                assert_eq!(attempts, 1);
                assert!(error.contains("eval"));
            }
            other => panic!("Expected failure, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct Slow;

    #[async_trait::async_trait]
    impl StepFunction for Slow {
        async fn run(&self, _ctx: &StepContext) -> Result<StepOutputs, BackendError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(StepOutputs::single(json!(null)))
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let mut registry = StepRegistry::new();
        registry.register_step("steps.Slow", Arc::new(Slow));

        let mut step = step("steps.Slow", 0);
        step.timeout_secs = 1;
        let result = executor(registry).execute(&step, &context(&step), &|_, _| {}).await;
        match result {
            ExecutionResult::Failed { error, attempts } => {
                assert_eq!(attempts, 1);
                assert_eq!(error, "timeout after 1 seconds");
            }
            other => panic!("Expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_backend() {
        let mut step = step("steps.Anything", 0);
        step.backend = Some(crate::core::config::BackendConfig::new("kubernetes"));
        let result = executor(StepRegistry::new()).execute(&step, &context(&step), &|_, _| {}).await;
        assert!(matches!(result, ExecutionResult::Failed { attempts: 0, .. }));
    }
}

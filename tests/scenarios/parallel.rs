//! Concurrency limits of the orchestration backends

use crate::common::*;
use mlpipeline::core::config::{BackendConfig, MetadataConfig};
use mlpipeline::execution::{ExecutionEngine, SchedulingStrategy};
use mlpipeline::repository::StackConfig;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const FAN_OUT_YAML: &str = r#"
version: 1
pipeline:
  name: fan_out
  datasource:
    name: rows
    source: mlpipeline.datasources.Inline
    args:
      data: [1, 2, 3]
  steps:
    a:
      source: steps.Slow
      inputs: [datasource]
    b:
      source: steps.Slow
      inputs: [datasource]
    c:
      source: steps.Slow
      inputs: [datasource]
    d:
      source: steps.Slow
      inputs: [datasource]
    join:
      source: mlpipeline.steps.Identity
      inputs: [a, b, c, d]
"#;

struct Concurrency {
    peak: Arc<AtomicUsize>,
}

async fn engine(backend: BackendConfig) -> (ExecutionEngine, Concurrency) {
    let peak = Arc::new(AtomicUsize::new(0));
    let mut registry = test_registry(&Calls::default());
    registry.register_step(
        "steps.Slow",
        Arc::new(SlowIdentity {
            delay: Duration::from_millis(100),
            running: Arc::new(AtomicUsize::new(0)),
            peak: peak.clone(),
        }),
    );

    let stack = StackConfig {
        artifact_store: "memory://".to_string(),
        metadata: MetadataConfig::in_memory(),
        backend,
        secrets_manager: None,
    };
    let engine = stack.engine(backends(registry)).await.unwrap();
    (engine, Concurrency { peak })
}

#[tokio::test]
async fn test_local_backend_runs_one_step_at_a_time() {
    let (engine, concurrency) = engine(BackendConfig::new("local")).await;
    let mut pipeline = pipeline(FAN_OUT_YAML);

    let summary = engine.execute(&mut pipeline).await.unwrap();
    assert!(summary.is_success());
    assert_eq!(concurrency.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_parallel_backend_respects_max_concurrency() {
    let mut backend = BackendConfig::new("local_parallel");
    backend.args = json!({ "max_concurrency": 2 });
    let (engine, concurrency) = engine(backend).await;
    let mut pipeline = pipeline(FAN_OUT_YAML);

    let summary = engine.execute(&mut pipeline).await.unwrap();
    assert!(summary.is_success());
    assert_eq!(summary.executed, 5);
    assert_eq!(concurrency.peak.load(Ordering::SeqCst), 2);
    assert_eq!(
        output_of(&engine, &pipeline, "join").await,
        json!({
            "a.output": [1, 2, 3],
            "b.output": [1, 2, 3],
            "c.output": [1, 2, 3],
            "d.output": [1, 2, 3],
        })
    );
}

#[tokio::test]
async fn test_strategy_override_runs_all_ready_steps() {
    let (engine, concurrency) = engine(BackendConfig::new("local")).await;
    let engine = engine.with_strategy(SchedulingStrategy::Parallel);
    let mut pipeline = pipeline(FAN_OUT_YAML);

    let summary = engine.execute(&mut pipeline).await.unwrap();
    assert!(summary.is_success());
    assert_eq!(concurrency.peak.load(Ordering::SeqCst), 4);
    assert_eq!(pipeline.step("join").unwrap().state.artifacts().len(), 1);
}

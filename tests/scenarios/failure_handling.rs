//! Retries, failures and skipped dependents

use crate::common::*;
use mlpipeline::core::{ExecutionStatus, StepState};
use mlpipeline::execution::ExecutionEvent;
use serde_json::json;
use std::sync::{Arc, Mutex};

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let dir = TempDir::new("retry");
    let calls = Calls::default();
    let mut engine = local_engine(dir.path(), &calls).await;

    let retries = Arc::new(Mutex::new(Vec::new()));
    let sink = retries.clone();
    engine.add_event_handler(move |event| {
        if let ExecutionEvent::StepRetrying { attempt, .. } = event {
            sink.lock().unwrap().push(attempt);
        }
    });

    let mut pipeline = pipeline(
        r#"
version: 1
pipeline:
  name: flaky
  steps:
    fetch:
      source: steps.Flaky
      retries: 2
      args:
        succeed_on: 3
"#,
    );
    let summary = engine.execute(&mut pipeline).await.unwrap();

    assert!(summary.is_success());
    assert!(matches!(
        pipeline.step("fetch").unwrap().state,
        StepState::Completed { attempts: 3, .. }
    ));
    assert_eq!(output_of(&engine, &pipeline, "fetch").await, json!(3));
    assert_eq!(*retries.lock().unwrap(), vec![2, 3]);
}

#[tokio::test]
async fn test_retries_exhausted_fails_the_run() {
    let dir = TempDir::new("retry-exhausted");
    let calls = Calls::default();
    let engine = local_engine(dir.path(), &calls).await;

    let mut pipeline = pipeline(
        r#"
version: 1
pipeline:
  name: flaky
  steps:
    fetch:
      source: steps.Flaky
      retries: 1
      args:
        succeed_on: 5
    report:
      source: mlpipeline.steps.Identity
"#,
    );
    let summary = engine.execute(&mut pipeline).await.unwrap();

    assert_eq!(summary.status, ExecutionStatus::Failed);
    assert_eq!(calls.get(), 2);
    match &pipeline.step("fetch").unwrap().state {
        StepState::Failed { error, attempts, .. } => {
            assert_eq!(*attempts, 2);
            assert!(error.contains("transient failure 2"));
        }
        other => panic!("Expected failed step, got {:?}", other),
    }
    assert!(matches!(
        pipeline.step("report").unwrap().state,
        StepState::Skipped { .. }
    ));
}

/// Independent branches keep running when a sibling fails
#[tokio::test]
async fn test_failure_only_skips_downstream() {
    let dir = TempDir::new("failure-branches");
    let calls = Calls::default();
    let engine = local_engine(dir.path(), &calls).await;

    let mut pipeline = pipeline(
        r#"
version: 1
pipeline:
  name: branches
  datasource:
    name: numbers
    source: mlpipeline.datasources.Inline
    args:
      data: [1, 2, 3]
  steps:
    scale:
      source: steps.Scale
      args:
        factor: 10
    total:
      source: steps.Total
    broken:
      source: steps.Broken
      inputs: [datasource]
      retries: 3
    after_broken:
      source: mlpipeline.steps.Identity
      inputs: [broken]
"#,
    );
    let summary = engine.execute(&mut pipeline).await.unwrap();

    assert_eq!(summary.status, ExecutionStatus::Failed);
    assert_eq!(summary.executed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(output_of(&engine, &pipeline, "total").await, json!(60));
    assert!(matches!(
        pipeline.step("broken").unwrap().state,
        StepState::Failed { attempts: 1, .. }
    ));

    let run = engine.metadata_store().load_run(summary.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, ExecutionStatus::Failed);
    assert_eq!(run.completed_steps, 2);
}

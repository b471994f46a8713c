//! Executed pipelines are frozen; changes go through a copy

use crate::common::*;
use mlpipeline::core::config::PipelineConfig;
use mlpipeline::error::PipelineError;
use mlpipeline::repository::{Repository, RepositoryError};
use serde_json::json;

#[tokio::test]
async fn test_executed_pipeline_cannot_change() {
    let dir = TempDir::new("immutable");
    let repository = Repository::init(dir.path()).unwrap();
    let calls = Calls::default();
    let (_, stack) = repository.active_stack().unwrap();
    let engine = stack.engine(backends(test_registry(&calls))).await.unwrap();

    let config = PipelineConfig::from_yaml(TRAINING_YAML).unwrap();
    let registered = repository.prepare_run(&config).unwrap();
    let mut pipeline = registered.config.to_pipeline().unwrap();
    engine.execute(&mut pipeline).await.unwrap();
    repository.mark_executed(&pipeline.name).unwrap();

    // The same in-memory pipeline cannot run twice
    assert!(matches!(
        engine.execute(&mut pipeline).await,
        Err(PipelineError::Immutable(_))
    ));

    // Running the identical file again is allowed
    assert!(repository.prepare_run(&config).is_ok());

    let changed = PipelineConfig::from_yaml(&TRAINING_YAML.replace("factor: 2", "factor: 5")).unwrap();
    assert!(matches!(
        repository.prepare_run(&changed),
        Err(RepositoryError::PipelineImmutable(name)) if name == "training"
    ));
    assert_eq!(calls.get(), 2);
}

#[tokio::test]
async fn test_copy_diverges_and_reuses_upstream() {
    let dir = TempDir::new("immutable-copy");
    let repository = Repository::init(dir.path()).unwrap();
    let calls = Calls::default();
    let (_, stack) = repository.active_stack().unwrap();
    let engine = stack.engine(backends(test_registry(&calls))).await.unwrap();

    let config = PipelineConfig::from_yaml(TRAINING_YAML).unwrap();
    let mut original = repository.prepare_run(&config).unwrap().config.to_pipeline().unwrap();
    engine.execute(&mut original).await.unwrap();
    repository.mark_executed("training").unwrap();

    let copy = repository.copy_pipeline("training", "training_v2").unwrap();
    assert!(!copy.executed);
    assert!(matches!(
        repository.copy_pipeline("training", "training_v2"),
        Err(RepositoryError::PipelineExists(_))
    ));

    // Only the total step changes; scale is served from the cache
    let mut edited = copy.config.clone();
    if let Some(step) = edited.pipeline.steps.get_mut("total") {
        step.source = "mlpipeline.steps.Identity".to_string();
    }
    let registered = repository.prepare_run(&edited).unwrap();
    let mut diverged = registered.config.to_pipeline().unwrap();
    let summary = engine.execute(&mut diverged).await.unwrap();

    assert_eq!(summary.cached, 1);
    assert_eq!(summary.executed, 1);
    assert_eq!(output_of(&engine, &diverged, "total").await, json!([2, 4, 6, 8]));
    assert_eq!(calls.get(), 2);

    let original_config = repository.get_pipeline("training").unwrap().config;
    assert_eq!(original_config.pipeline.steps["total"].source, "steps.Total");
}

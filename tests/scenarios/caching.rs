//! Artifact reuse across runs and processes

use crate::common::*;
use mlpipeline::core::StepState;
use serde_json::json;

/// A second engine on the same stack sees the first engine's cache
#[tokio::test]
async fn test_cache_survives_engine_restart() {
    let dir = TempDir::new("cache-restart");
    let calls = Calls::default();

    let first_engine = local_engine(dir.path(), &calls).await;
    let mut first = pipeline(TRAINING_YAML);
    let summary = first_engine.execute(&mut first).await.unwrap();
    assert!(summary.is_success());
    assert_eq!(summary.executed, 2);
    assert_eq!(output_of(&first_engine, &first, "total").await, json!(20));
    drop(first_engine);

    let second_engine = local_engine(dir.path(), &calls).await;
    let mut second = first.copy_as("training_v2").unwrap();
    let summary = second_engine.execute(&mut second).await.unwrap();

    assert_eq!(summary.cached, 2);
    assert_eq!(summary.executed, 0);
    assert_eq!(calls.get(), 2);
    assert_eq!(output_of(&second_engine, &second, "total").await, json!(20));
    for step in second.steps() {
        assert!(matches!(step.state, StepState::Completed { cached: true, .. }));
    }
}

/// New datasource content invalidates every step that depends on it
#[tokio::test]
async fn test_new_datasource_version_reruns_steps() {
    let dir = TempDir::new("cache-datasource");
    let calls = Calls::default();
    let engine = local_engine(dir.path(), &calls).await;

    let mut first = pipeline(TRAINING_YAML);
    let first_summary = engine.execute(&mut first).await.unwrap();

    let changed = TRAINING_YAML
        .replace("name: training\n", "name: training_more_data\n")
        .replace("[1, 2, 3, 4]", "[1, 2, 3, 4, 5]");
    let mut second = pipeline(&changed);
    let second_summary = engine.execute(&mut second).await.unwrap();

    assert_eq!(second_summary.executed, 2);
    assert_eq!(second_summary.cached, 0);
    assert_eq!(calls.get(), 4);
    assert_eq!(output_of(&engine, &second, "total").await, json!(30));

    let first_ds = first_summary.datasource.unwrap();
    let second_ds = second_summary.datasource.unwrap();
    assert_eq!(first_ds.name, second_ds.name);
    assert_ne!(first_ds.version, second_ds.version);
}

/// The pipeline name is not part of a step fingerprint
#[tokio::test]
async fn test_same_content_reuses_cache_regardless_of_pipeline_name() {
    let dir = TempDir::new("cache-content");
    let calls = Calls::default();
    let engine = local_engine(dir.path(), &calls).await;

    let mut first = pipeline(TRAINING_YAML);
    engine.execute(&mut first).await.unwrap();

    let renamed = TRAINING_YAML.replace("name: training\n", "name: another_team_training\n");
    let mut second = pipeline(&renamed);
    let summary = engine.execute(&mut second).await.unwrap();
    assert_eq!(summary.cached, 2);
    assert_eq!(calls.get(), 2);
}

#[tokio::test]
async fn test_disabled_cache_on_a_step() {
    let dir = TempDir::new("cache-step-disabled");
    let calls = Calls::default();
    let engine = local_engine(dir.path(), &calls).await;

    let yaml = TRAINING_YAML.replace(
        "    total:\n      source: steps.Total\n",
        "    total:\n      source: steps.Total\n      enable_cache: false\n",
    );
    let mut first = pipeline(&yaml);
    engine.execute(&mut first).await.unwrap();

    let mut second = first.copy_as("training_again").unwrap();
    let summary = engine.execute(&mut second).await.unwrap();
    assert_eq!(summary.cached, 1);
    assert_eq!(summary.executed, 1);
    assert!(matches!(
        second.step("total").unwrap().state,
        StepState::Completed { cached: false, .. }
    ));
}

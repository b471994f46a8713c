//! Tracing artifacts back through steps to the datasource

use crate::common::*;
use mlpipeline::core::Artifact;
use mlpipeline::persistence::trace_lineage;
use serde_json::json;

const SPLIT_YAML: &str = r#"
version: 1
pipeline:
  name: split_training
  datasource:
    name: rows
    source: mlpipeline.datasources.Inline
    args:
      data: [1, 2, 3, 4, 5, 6, 7, 8, 9, 10]
  steps:
    split:
      source: mlpipeline.steps.Split
      outputs: [train, eval]
      args:
        split_map:
          train: 0.8
          eval: 0.2
    scale:
      source: steps.Scale
      inputs: [split]
      args:
        factor: 3
        input: split.train
"#;

#[tokio::test]
async fn test_split_outputs_and_lineage() {
    let dir = TempDir::new("lineage");
    let calls = Calls::default();
    let engine = local_engine(dir.path(), &calls).await;

    let mut pipeline = pipeline(SPLIT_YAML);
    let summary = engine.execute(&mut pipeline).await.unwrap();
    assert!(summary.is_success());

    let split = pipeline.step("split").unwrap().state.artifacts().to_vec();
    let names: Vec<&str> = split.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["train", "eval"]);
    // Parts are cut in key order, so eval takes the leading rows
    let train = engine.artifact_store().get(&split[0].uri).await.unwrap();
    assert_eq!(train, json!([3, 4, 5, 6, 7, 8, 9, 10]));
    let eval = engine.artifact_store().get(&split[1].uri).await.unwrap();
    assert_eq!(eval, json!([1, 2]));
    assert_eq!(output_of(&engine, &pipeline, "scale").await, json!([9, 12, 15, 18, 21, 24, 27, 30]));

    let scaled = pipeline.step("scale").unwrap().state.artifacts()[0].clone();
    let lineage = trace_lineage(engine.metadata_store().as_ref(), scaled.id).await.unwrap();

    let root = lineage.node(scaled.id).unwrap();
    assert_eq!(root.step.as_deref(), Some("scale"));
    assert_eq!(root.source.as_deref(), Some("steps.Scale"));

    for artifact in &split {
        assert!(lineage.ancestors().contains(&artifact.id));
    }
    let datasources = lineage.datasources();
    assert_eq!(datasources.len(), 1);
    assert_eq!(datasources[0].producer, Artifact::datasource_producer("rows"));
}

/// Cached artifacts keep pointing at the execution that computed them
#[tokio::test]
async fn test_lineage_of_cached_artifact() {
    let dir = TempDir::new("lineage-cached");
    let calls = Calls::default();
    let engine = local_engine(dir.path(), &calls).await;

    let mut first = pipeline(SPLIT_YAML);
    let first_summary = engine.execute(&mut first).await.unwrap();
    let mut second = first.copy_as("split_training_v2").unwrap();
    let second_summary = engine.execute(&mut second).await.unwrap();
    assert_eq!(second_summary.cached, 2);

    let scaled = second.step("scale").unwrap().state.artifacts()[0].clone();
    let lineage = trace_lineage(engine.metadata_store().as_ref(), scaled.id).await.unwrap();
    let root = lineage.node(scaled.id).unwrap();
    assert_eq!(root.run_id, Some(first_summary.run_id));

    assert!(trace_lineage(engine.metadata_store().as_ref(), uuid::Uuid::new_v4())
        .await
        .is_err());
}

#[tokio::test]
async fn test_split_without_declared_outputs() {
    let dir = TempDir::new("lineage-split-outputs");
    let calls = Calls::default();
    let engine = local_engine(dir.path(), &calls).await;

    let yaml = SPLIT_YAML.replace("      outputs: [train, eval]\n", "");
    let mut pipeline = pipeline(&yaml);
    let summary = engine.execute(&mut pipeline).await.unwrap();
    assert!(summary.is_success());

    let names: Vec<String> = pipeline
        .step("split")
        .unwrap()
        .state
        .artifacts()
        .iter()
        .map(|a| a.name.clone())
        .collect();
    assert_eq!(names, vec!["eval", "train"]);
    assert_eq!(output_of(&engine, &pipeline, "scale").await, json!([9, 12, 15, 18, 21, 24, 27, 30]));
}

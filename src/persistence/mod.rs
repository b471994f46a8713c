//! Metadata store - run provenance for caching and lineage

pub mod lineage;

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteMetadataStore;

pub use crate::core::ExecutionStatus;
pub use lineage::{trace_lineage, Lineage, LineageNode};

use crate::core::config::{validate_metadata, MetadataConfig};
use crate::core::{Artifact, Pipeline};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Summary of a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunRecord {
    /// Unique run ID
    pub run_id: Uuid,

    /// Pipeline name
    pub pipeline_name: String,

    /// Run status
    pub status: ExecutionStatus,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run finished (if finished)
    pub completed_at: Option<DateTime<Utc>>,

    /// Progress (0.0 to 1.0)
    pub progress: f64,

    /// Number of completed steps, cached ones included
    pub completed_steps: usize,

    /// Number of steps served from the cache
    pub cached_steps: usize,

    /// Total number of steps
    pub total_steps: usize,

    /// `name@version` of the datasource snapshot
    pub datasource: Option<String>,
}

/// One execution (or cache hit) of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    pub execution_id: Uuid,
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub step_name: String,
    /// `path@version` of the step source
    pub source: String,
    pub fingerprint: String,
    /// `Completed` or `Failed`
    pub status: ExecutionStatus,
    /// Outputs were reused from an earlier execution
    pub cached: bool,
    /// Artifacts consumed
    pub inputs: Vec<Uuid>,
    /// Artifacts produced
    pub outputs: Vec<Uuid>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Trait for metadata store backends
#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    /// Save (insert or replace) a pipeline run
    async fn save_run(&self, run: &PipelineRunRecord) -> Result<()>;

    /// Load a run by ID
    async fn load_run(&self, run_id: Uuid) -> Result<Option<PipelineRunRecord>>;

    /// List runs of a pipeline, newest first
    async fn list_runs(&self, pipeline_name: &str) -> Result<Vec<PipelineRunRecord>>;

    /// List all pipeline names with recorded runs
    async fn list_pipelines(&self) -> Result<Vec<String>>;

    /// Record a step execution
    async fn record_step(&self, execution: &StepExecutionRecord) -> Result<()>;

    /// Step executions of a run, in start order
    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepExecutionRecord>>;

    /// Record an artifact
    async fn record_artifact(&self, artifact: &Artifact) -> Result<()>;

    /// Load an artifact by ID
    async fn load_artifact(&self, artifact_id: Uuid) -> Result<Option<Artifact>>;

    /// Latest completed execution with this fingerprint
    async fn find_cached(&self, fingerprint: &str) -> Result<Option<StepExecutionRecord>>;

    /// Execution that produced an artifact, preferring the one that computed it
    async fn producer_of(&self, artifact_id: Uuid) -> Result<Option<StepExecutionRecord>>;
}

/// In-memory metadata store (for testing or ephemeral use)
pub struct InMemoryMetadataStore {
    runs: RwLock<HashMap<Uuid, PipelineRunRecord>>,
    executions: RwLock<Vec<StepExecutionRecord>>,
    artifacts: RwLock<HashMap<Uuid, Artifact>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            executions: RwLock::new(Vec::new()),
            artifacts: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn save_run(&self, run: &PipelineRunRecord) -> Result<()> {
        self.runs.write().await.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<PipelineRunRecord>> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn list_runs(&self, pipeline_name: &str) -> Result<Vec<PipelineRunRecord>> {
        let runs = self.runs.read().await;
        let mut result: Vec<PipelineRunRecord> = runs
            .values()
            .filter(|run| run.pipeline_name == pipeline_name)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(result)
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let runs = self.runs.read().await;
        let mut names: Vec<String> = runs.values().map(|run| run.pipeline_name.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn record_step(&self, execution: &StepExecutionRecord) -> Result<()> {
        self.executions.write().await.push(execution.clone());
        Ok(())
    }

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepExecutionRecord>> {
        let executions = self.executions.read().await;
        let mut result: Vec<StepExecutionRecord> = executions
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(result)
    }

    async fn record_artifact(&self, artifact: &Artifact) -> Result<()> {
        self.artifacts.write().await.insert(artifact.id, artifact.clone());
        Ok(())
    }

    async fn load_artifact(&self, artifact_id: Uuid) -> Result<Option<Artifact>> {
        Ok(self.artifacts.read().await.get(&artifact_id).cloned())
    }

    async fn find_cached(&self, fingerprint: &str) -> Result<Option<StepExecutionRecord>> {
        let executions = self.executions.read().await;
        Ok(executions
            .iter()
            .filter(|e| e.fingerprint == fingerprint && e.status == ExecutionStatus::Completed)
            .max_by_key(|e| e.completed_at)
            .cloned())
    }

    async fn producer_of(&self, artifact_id: Uuid) -> Result<Option<StepExecutionRecord>> {
        let executions = self.executions.read().await;
        let mut producers: Vec<&StepExecutionRecord> = executions
            .iter()
            .filter(|e| e.outputs.contains(&artifact_id))
            .collect();
        producers.sort_by_key(|e| (e.cached, e.started_at));
        Ok(producers.first().map(|e| (*e).clone()))
    }
}

/// Create a run record from a pipeline
pub fn create_run_record(pipeline: &Pipeline, datasource: Option<String>) -> PipelineRunRecord {
    PipelineRunRecord {
        run_id: pipeline.state.run_id,
        pipeline_name: pipeline.name.clone(),
        status: pipeline.state.status,
        started_at: pipeline.state.started_at.unwrap_or_else(Utc::now),
        completed_at: pipeline.state.completed_at,
        progress: pipeline.state.progress(),
        completed_steps: pipeline.state.completed_steps,
        cached_steps: pipeline.state.cached_steps,
        total_steps: pipeline.state.total_steps,
        datasource,
    }
}

/// Open the metadata store described by a stack or pipeline file
pub async fn open_metadata_store(config: &MetadataConfig) -> Result<Arc<dyn MetadataStore>> {
    validate_metadata(config)?;
    match config.kind.as_str() {
        "in_memory" => Ok(Arc::new(InMemoryMetadataStore::new())),
        #[cfg(feature = "sqlite")]
        "sqlite" => Ok(Arc::new(SqliteMetadataStore::new(&config.args.uri).await?)),
        #[cfg(not(feature = "sqlite"))]
        "sqlite" => anyhow::bail!("This build does not include SQLite support"),
        other => anyhow::bail!("Unknown metadata store type '{}'", other),
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[tokio::test]
    async fn test_runs_by_pipeline() {
        let store = InMemoryMetadataStore::new();
        let first = run("training", ExecutionStatus::Completed);
        let mut second = run("training", ExecutionStatus::Failed);
        second.started_at = first.started_at + chrono::Duration::seconds(1);
        store.save_run(&first).await.unwrap();
        store.save_run(&second).await.unwrap();
        store.save_run(&run("scoring", ExecutionStatus::Completed)).await.unwrap();

        assert_eq!(store.list_pipelines().await.unwrap(), vec!["scoring", "training"]);
        let runs = store.list_runs("training").await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, second.run_id);
        assert_eq!(store.load_run(first.run_id).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_find_cached_ignores_failures() {
        let store = InMemoryMetadataStore::new();
        let mut failed = execution("trainer", "fp1", vec![], vec![], false);
        failed.status = ExecutionStatus::Failed;
        store.record_step(&failed).await.unwrap();
        assert!(store.find_cached("fp1").await.unwrap().is_none());

        let ok = execution("trainer", "fp1", vec![], vec![Uuid::new_v4()], false);
        store.record_step(&ok).await.unwrap();
        assert_eq!(store.find_cached("fp1").await.unwrap().unwrap().execution_id, ok.execution_id);
        assert!(store.find_cached("fp2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_producer_prefers_computed_execution() {
        let store = InMemoryMetadataStore::new();
        let artifact = Uuid::new_v4();
        let hit = execution("trainer", "fp", vec![], vec![artifact], true);
        let computed = execution("trainer", "fp", vec![], vec![artifact], false);
        store.record_step(&hit).await.unwrap();
        store.record_step(&computed).await.unwrap();

        let producer = store.producer_of(artifact).await.unwrap().unwrap();
        assert_eq!(producer.execution_id, computed.execution_id);
        assert!(store.producer_of(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_rejects_unknown_type() {
        let mut config = MetadataConfig::in_memory();
        assert!(open_metadata_store(&config).await.is_ok());
        config.kind = "mysql".to_string();
        assert!(open_metadata_store(&config).await.is_err());
    }
}

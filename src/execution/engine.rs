//! Main execution engine - orchestrates the entire pipeline run

use crate::{
    backend::{BackendRegistry, StepOutputs},
    core::{
        config::DATASOURCE_INPUT, fingerprint, Artifact, DatasourceRecord, ExecutionStatus, Pipeline, Step,
        StepContext, StepState,
    },
    error::PipelineError,
    execution::{ExecutionResult, ExecutionScheduler, SchedulingStrategy, StepExecutor},
    persistence::{create_run_record, MetadataStore, StepExecutionRecord},
    repository::STEP_EXECUTION,
    storage::ArtifactStore,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Events that can occur during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStarted {
        run_id: Uuid,
        pipeline_name: String,
        total_steps: usize,
    },
    DatasourceLoaded {
        name: String,
        version: String,
        artifact_id: Uuid,
    },
    StepStarted {
        step: String,
        attempt: usize,
    },
    StepRetrying {
        step: String,
        attempt: usize,
        max_retries: usize,
    },
    StepCached {
        step: String,
        fingerprint: String,
    },
    StepCompleted {
        step: String,
        outputs: Vec<String>,
    },
    StepFailed {
        step: String,
        error: String,
    },
    StepSkipped {
        step: String,
        reason: String,
    },
    PipelineCompleted {
        run_id: Uuid,
        status: ExecutionStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Outcome of one pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub status: ExecutionStatus,
    /// Steps whose code ran
    pub executed: usize,
    /// Steps served from the cache
    pub cached: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Datasource snapshot the run consumed
    pub datasource: Option<DatasourceRecord>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

#[derive(Clone)]
struct EventSink(Arc<Vec<EventHandler>>);

impl EventSink {
    fn emit(&self, event: ExecutionEvent) {
        for handler in self.0.iter() {
            handler(event.clone());
        }
    }
}

/// Everything a step job needs, shareable across tasks
#[derive(Clone)]
struct JobRuntime {
    artifacts: Arc<dyn ArtifactStore>,
    metadata: Arc<dyn MetadataStore>,
    executor: Arc<StepExecutor>,
    events: EventSink,
}

/// A step ready to run, with its inputs resolved
struct StepJob {
    step: Step,
    pipeline_name: String,
    run_id: Uuid,
    inputs: Vec<Artifact>,
    fingerprint: String,
    use_cache: bool,
}

enum StepOutcome {
    Completed {
        artifacts: Vec<Artifact>,
        cached: bool,
        attempts: usize,
        started_at: DateTime<Utc>,
    },
    Failed {
        error: String,
        attempts: usize,
    },
}

/// Main pipeline execution engine
pub struct ExecutionEngine {
    artifacts: Arc<dyn ArtifactStore>,
    metadata: Arc<dyn MetadataStore>,
    executor: Arc<StepExecutor>,
    scheduler: ExecutionScheduler,
    event_handlers: Arc<Vec<EventHandler>>,
    cache: bool,
}

impl ExecutionEngine {
    pub fn new(
        artifacts: Arc<dyn ArtifactStore>,
        metadata: Arc<dyn MetadataStore>,
        backends: Arc<BackendRegistry>,
        strategy: SchedulingStrategy,
    ) -> Self {
        Self {
            artifacts,
            metadata,
            executor: Arc::new(StepExecutor::new(backends)),
            scheduler: ExecutionScheduler::new(strategy),
            event_handlers: Arc::new(Vec::new()),
            cache: true,
        }
    }

    /// Turn artifact reuse off for every run of this engine
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache = enabled;
        self
    }

    pub fn with_strategy(mut self, strategy: SchedulingStrategy) -> Self {
        self.scheduler = ExecutionScheduler::new(strategy);
        self
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&mut self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.event_handlers).push(Arc::new(handler));
    }

    pub fn artifact_store(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    pub fn metadata_store(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    fn events(&self) -> EventSink {
        EventSink(self.event_handlers.clone())
    }

    fn runtime(&self) -> JobRuntime {
        JobRuntime {
            artifacts: self.artifacts.clone(),
            metadata: self.metadata.clone(),
            executor: self.executor.clone(),
            events: self.events(),
        }
    }

    /// Execute the entire pipeline.
    ///
    /// Step failures do not make this return `Err`: they fail the run, skip
    /// downstream steps and are reported in the summary. Errors are reserved
    /// for a frozen pipeline, an unreadable datasource and store failures.
    pub async fn execute(&self, pipeline: &mut Pipeline) -> Result<RunSummary, PipelineError> {
        if pipeline.is_frozen() {
            return Err(PipelineError::Immutable(pipeline.name.clone()));
        }

        let run_id = pipeline.state.run_id;
        let events = self.events();

        info!("Starting pipeline execution: {} ({})", pipeline.name, run_id);
        pipeline.state.start(pipeline.len());
        pipeline.freeze();
        events.emit(ExecutionEvent::PipelineStarted {
            run_id,
            pipeline_name: pipeline.name.clone(),
            total_steps: pipeline.len(),
        });
        self.metadata.save_run(&create_run_record(pipeline, None)).await?;

        let datasource = match self.load_datasource(pipeline).await {
            Ok(datasource) => datasource,
            Err(e) => return Err(self.abort(pipeline, None, &events, e).await),
        };
        let datasource_label = datasource.as_ref().map(|(record, _)| format!("{}@{}", record.name, record.version));
        let datasource_artifact = datasource.as_ref().map(|(_, artifact)| artifact.clone());
        self.metadata
            .save_run(&create_run_record(pipeline, datasource_label.clone()))
            .await?;

        let runtime = self.runtime();
        loop {
            let batch = self.scheduler.next_steps(pipeline);
            if batch.is_empty() {
                break;
            }
            debug!("Scheduling batch: {}", batch.join(", "));

            let mut jobs = Vec::with_capacity(batch.len());
            for name in &batch {
                match self.prepare_job(pipeline, name, datasource_artifact.as_ref()) {
                    Ok(job) => jobs.push(job),
                    Err(e) => return Err(self.abort(pipeline, datasource_label.clone(), &events, e).await),
                }
            }
            for name in &batch {
                if let Some(step) = pipeline.step_mut(name) {
                    step.state = StepState::Running {
                        started_at: Utc::now(),
                        attempt: 1,
                    };
                }
            }

            if jobs.len() == 1 {
                let job = jobs.remove(0);
                let name = job.step.name.clone();
                let outcome = run_job(runtime.clone(), job).await;
                self.apply_outcome(pipeline, &name, outcome, &events);
            } else {
                let mut set = JoinSet::new();
                for job in jobs {
                    let runtime = runtime.clone();
                    set.spawn(async move {
                        let name = job.step.name.clone();
                        (name, run_job(runtime, job).await)
                    });
                }
                while let Some(joined) = set.join_next().await {
                    match joined {
                        Ok((name, outcome)) => self.apply_outcome(pipeline, &name, outcome, &events),
                        Err(e) => error!("Step task ended abnormally: {}", e),
                    }
                }
                for name in &batch {
                    let still_running = pipeline
                        .step(name)
                        .is_some_and(|s| matches!(s.state, StepState::Running { .. }));
                    if still_running {
                        let outcome = StepOutcome::Failed {
                            error: "step task panicked".to_string(),
                            attempts: 1,
                        };
                        self.apply_outcome(pipeline, name, outcome, &events);
                    }
                }
            }
        }

        // Anything left pending could never become ready
        let stranded: Vec<String> = pipeline
            .steps()
            .filter(|s| matches!(s.state, StepState::Pending))
            .map(|s| s.name.clone())
            .collect();
        for name in stranded {
            warn!("Step {} never became ready", name);
            self.skip(pipeline, &name, "inputs never became available".to_string(), &events);
        }

        let summary = self.finish(pipeline, datasource.map(|(record, _)| record));
        self.metadata
            .save_run(&create_run_record(pipeline, datasource_label))
            .await?;

        info!(
            "Pipeline execution finished: {} - {} ({} executed, {} cached, {} failed, {} skipped)",
            pipeline.name, summary.status, summary.executed, summary.cached, summary.failed, summary.skipped
        );
        events.emit(ExecutionEvent::PipelineCompleted {
            run_id,
            status: summary.status,
        });

        Ok(summary)
    }

    /// End a run that cannot go on: pending steps are skipped and the failed run is recorded
    async fn abort(
        &self,
        pipeline: &mut Pipeline,
        datasource_label: Option<String>,
        events: &EventSink,
        error: PipelineError,
    ) -> PipelineError {
        error!("Pipeline {} aborted: {}", pipeline.name, error);
        let pending: Vec<String> = pipeline
            .steps()
            .filter(|s| matches!(s.state, StepState::Pending))
            .map(|s| s.name.clone())
            .collect();
        for name in pending {
            self.skip(pipeline, &name, "run aborted".to_string(), events);
        }

        pipeline.state.fail();
        if let Err(e) = self
            .metadata
            .save_run(&create_run_record(pipeline, datasource_label))
            .await
        {
            warn!("Failed to record aborted run {}: {:#}", pipeline.state.run_id, e);
        }
        events.emit(ExecutionEvent::PipelineCompleted {
            run_id: pipeline.state.run_id,
            status: ExecutionStatus::Failed,
        });
        error
    }

    /// Read and store the datasource snapshot for this run
    async fn load_datasource(&self, pipeline: &Pipeline) -> Result<Option<(DatasourceRecord, Artifact)>, PipelineError> {
        let Some(datasource) = &pipeline.datasource else {
            return Ok(None);
        };
        let failure = |reason: String| PipelineError::Datasource {
            name: datasource.name.clone(),
            reason,
        };

        let reader = self
            .executor
            .backends()
            .step_registry()
            .reader(&datasource.source.path)
            .map_err(|e| failure(e.to_string()))?;
        let payload = STEP_EXECUTION
            .scope(true, reader.read(&datasource.args))
            .await
            .map_err(|e| failure(e.to_string()))?;

        let snapshot = datasource.snapshot(payload);
        let producer = Artifact::datasource_producer(&snapshot.name);
        let uri = self
            .artifacts
            .put(&producer, "data", &snapshot.content_hash, &snapshot.payload)
            .await?;
        let artifact = Artifact::new(
            "data",
            producer,
            pipeline.state.run_id,
            snapshot.content_hash.clone(),
            snapshot.content_hash.clone(),
            uri,
        );
        self.metadata.record_artifact(&artifact).await?;

        info!("Loaded datasource {} ({})", snapshot.label(), artifact.uri);
        self.events().emit(ExecutionEvent::DatasourceLoaded {
            name: snapshot.name.clone(),
            version: snapshot.version.clone(),
            artifact_id: artifact.id,
        });

        Ok(Some((snapshot.record(&datasource.source), artifact)))
    }

    /// Resolve a step's input artifacts and cache key
    fn prepare_job(&self, pipeline: &Pipeline, name: &str, datasource: Option<&Artifact>) -> Result<StepJob, PipelineError> {
        let step = pipeline
            .step(name)
            .ok_or_else(|| PipelineError::StepNotFound(name.to_string()))?;

        let mut inputs = Vec::new();
        for input in &step.inputs {
            if input == DATASOURCE_INPUT {
                let artifact = datasource.ok_or_else(|| {
                    PipelineError::Invalid(format!("step '{}' consumes the datasource but none was loaded", name))
                })?;
                inputs.push(artifact.clone());
            } else {
                let upstream = pipeline
                    .step(input)
                    .ok_or_else(|| PipelineError::StepNotFound(input.clone()))?;
                inputs.extend(upstream.state.artifacts().iter().cloned());
            }
        }

        let input_hashes: BTreeMap<String, String> = inputs
            .iter()
            .map(|a| (a.input_key(), a.content_hash.clone()))
            .collect();
        let fingerprint = fingerprint::step_fingerprint(step, &input_hashes);
        debug!("Step {} fingerprint {}", name, fingerprint);

        Ok(StepJob {
            step: step.clone(),
            pipeline_name: pipeline.name.clone(),
            run_id: pipeline.state.run_id,
            inputs,
            fingerprint,
            use_cache: self.cache && step.cache_enabled(pipeline.enable_cache),
        })
    }

    fn apply_outcome(&self, pipeline: &mut Pipeline, name: &str, outcome: StepOutcome, events: &EventSink) {
        let running = pipeline
            .step(name)
            .is_some_and(|s| matches!(s.state, StepState::Running { .. }));
        if !running {
            warn!("Ignoring outcome for step {} which is not running", name);
            return;
        }

        match outcome {
            StepOutcome::Completed {
                artifacts,
                cached,
                attempts,
                started_at,
            } => {
                let fingerprint = artifacts
                    .first()
                    .map(|a| a.fingerprint.clone())
                    .unwrap_or_default();
                let outputs: Vec<String> = artifacts.iter().map(|a| a.name.clone()).collect();
                if let Some(step) = pipeline.step_mut(name) {
                    step.state = StepState::Completed {
                        artifacts,
                        fingerprint: fingerprint.clone(),
                        cached,
                        attempts,
                        started_at,
                        completed_at: Utc::now(),
                    };
                }
                if cached {
                    events.emit(ExecutionEvent::StepCached {
                        step: name.to_string(),
                        fingerprint,
                    });
                } else {
                    events.emit(ExecutionEvent::StepCompleted {
                        step: name.to_string(),
                        outputs,
                    });
                }
            }
            StepOutcome::Failed { error, attempts } => {
                if let Some(step) = pipeline.step_mut(name) {
                    step.state = StepState::Failed {
                        error: error.clone(),
                        attempts,
                        failed_at: Utc::now(),
                    };
                }
                events.emit(ExecutionEvent::StepFailed {
                    step: name.to_string(),
                    error,
                });

                for dependent in pipeline.dependents_of(name) {
                    self.skip(pipeline, &dependent, format!("upstream step '{}' failed", name), events);
                }
            }
        }
    }

    fn skip(&self, pipeline: &mut Pipeline, name: &str, reason: String, events: &EventSink) {
        let Some(step) = pipeline.step_mut(name) else {
            return;
        };
        if !matches!(step.state, StepState::Pending) {
            return;
        }
        info!("Skipping step {}: {}", name, reason);
        step.state = StepState::Skipped { reason: reason.clone() };
        events.emit(ExecutionEvent::StepSkipped {
            step: name.to_string(),
            reason,
        });
    }

    /// Settle the pipeline state and build the summary
    fn finish(&self, pipeline: &mut Pipeline, datasource: Option<DatasourceRecord>) -> RunSummary {
        let mut executed = 0;
        let mut cached = 0;
        let mut failed = 0;
        let mut skipped = 0;
        for step in pipeline.steps() {
            match &step.state {
                StepState::Completed { cached: true, .. } => cached += 1,
                StepState::Completed { .. } => executed += 1,
                StepState::Failed { .. } => failed += 1,
                StepState::Skipped { .. } => skipped += 1,
                _ => {}
            }
        }

        pipeline.state.completed_steps = executed + cached;
        pipeline.state.cached_steps = cached;
        pipeline.state.failed_steps = failed;
        if failed > 0 {
            pipeline.state.fail();
        } else {
            pipeline.state.complete();
        }

        RunSummary {
            run_id: pipeline.state.run_id,
            pipeline_name: pipeline.name.clone(),
            status: pipeline.state.status,
            executed,
            cached,
            failed,
            skipped,
            datasource,
        }
    }
}

/// Run one step: reuse a cached execution or compute and persist its outputs
async fn run_job(runtime: JobRuntime, job: StepJob) -> StepOutcome {
    let started_at = Utc::now();
    let name = job.step.name.clone();

    if job.use_cache {
        match find_reusable(&runtime, &job).await {
            Ok(Some(artifacts)) => {
                info!("Step {} served from cache ({})", name, job.fingerprint);
                let record = execution_record(&job, &artifacts, started_at, None, true);
                if let Err(e) = runtime.metadata.record_step(&record).await {
                    return StepOutcome::Failed {
                        error: format!("Failed to record cached execution: {:#}", e),
                        attempts: 0,
                    };
                }
                return StepOutcome::Completed {
                    artifacts,
                    cached: true,
                    attempts: 0,
                    started_at,
                };
            }
            Ok(None) => debug!("No reusable execution for step {}", name),
            Err(e) => warn!("Cache lookup for step {} failed, running it: {:#}", name, e),
        }
    }

    runtime.events.emit(ExecutionEvent::StepStarted {
        step: name.clone(),
        attempt: 1,
    });

    let ctx = match build_context(&runtime, &job).await {
        Ok(ctx) => ctx,
        Err(e) => return record_failure(&runtime, &job, started_at, format!("{:#}", e), 0).await,
    };

    let events = runtime.events.clone();
    let max_retries = job.step.max_retries;
    let step_name = name.clone();
    let on_retry = move |attempt: usize, _error: &crate::backend::BackendError| {
        events.emit(ExecutionEvent::StepRetrying {
            step: step_name.clone(),
            attempt,
            max_retries,
        });
    };

    match runtime.executor.execute(&job.step, &ctx, &on_retry).await {
        ExecutionResult::Success { outputs, attempts } => match store_outputs(&runtime, &job, &outputs).await {
            Ok(artifacts) => {
                let record = execution_record(&job, &artifacts, started_at, None, false);
                if let Err(e) = runtime.metadata.record_step(&record).await {
                    return StepOutcome::Failed {
                        error: format!("Failed to record execution: {:#}", e),
                        attempts,
                    };
                }
                StepOutcome::Completed {
                    artifacts,
                    cached: false,
                    attempts,
                    started_at,
                }
            }
            Err(e) => record_failure(&runtime, &job, started_at, format!("{:#}", e), attempts).await,
        },
        ExecutionResult::Failed { error, attempts } => record_failure(&runtime, &job, started_at, error, attempts).await,
    }
}

/// Artifacts of the latest execution with the same fingerprint, if all are still stored
async fn find_reusable(runtime: &JobRuntime, job: &StepJob) -> Result<Option<Vec<Artifact>>> {
    let Some(execution) = runtime.metadata.find_cached(&job.fingerprint).await? else {
        return Ok(None);
    };

    let mut artifacts = Vec::with_capacity(execution.outputs.len());
    for id in &execution.outputs {
        let Some(artifact) = runtime.metadata.load_artifact(*id).await? else {
            debug!("Cached artifact {} has no metadata", id);
            return Ok(None);
        };
        if !runtime.artifacts.exists(&artifact.uri).await? {
            warn!("Cached artifact {} is missing from the store", artifact.uri);
            return Ok(None);
        }
        artifacts.push(artifact);
    }

    if artifacts.len() != job.step.outputs.len() {
        return Ok(None);
    }
    Ok(Some(artifacts))
}

/// Load input payloads into a step context
async fn build_context(runtime: &JobRuntime, job: &StepJob) -> Result<StepContext> {
    let mut per_producer: HashMap<&str, usize> = HashMap::new();
    for artifact in &job.inputs {
        *per_producer.entry(artifact.producer.as_str()).or_default() += 1;
    }

    let mut inputs = BTreeMap::new();
    let mut aliases = BTreeSet::new();
    for artifact in &job.inputs {
        let payload = runtime.artifacts.get(&artifact.uri).await?;
        // Single-output producers are also reachable by step name
        if !artifact.is_datasource() && per_producer.get(artifact.producer.as_str()) == Some(&1) {
            inputs.insert(artifact.producer.clone(), payload.clone());
            aliases.insert(artifact.producer.clone());
        }
        inputs.insert(artifact.input_key(), payload);
    }

    Ok(StepContext {
        pipeline_name: job.pipeline_name.clone(),
        run_id: job.run_id,
        step_name: job.step.name.clone(),
        source: job.step.source.clone(),
        args: job.step.args.clone(),
        inputs,
        aliases,
        backend_args: job.step.backend_args(),
    })
}

/// Persist step outputs as artifacts, in declaration order
async fn store_outputs(runtime: &JobRuntime, job: &StepJob, outputs: &StepOutputs) -> Result<Vec<Artifact>> {
    let mut artifacts = Vec::with_capacity(outputs.len());
    for name in &job.step.outputs {
        let Some(payload) = outputs.get(name) else {
            anyhow::bail!("Step '{}' did not produce '{}'", job.step.name, name);
        };
        let content_hash = fingerprint::content_hash(payload);
        let uri = runtime
            .artifacts
            .put(&job.step.name, name, &content_hash, payload)
            .await?;
        let artifact = Artifact::new(name, job.step.name.clone(), job.run_id, job.fingerprint.clone(), content_hash, uri);
        runtime.metadata.record_artifact(&artifact).await?;
        debug!("Stored artifact {} ({})", artifact.id, artifact.uri);
        artifacts.push(artifact);
    }
    Ok(artifacts)
}

async fn record_failure(
    runtime: &JobRuntime,
    job: &StepJob,
    started_at: DateTime<Utc>,
    error: String,
    attempts: usize,
) -> StepOutcome {
    let record = execution_record(job, &[], started_at, Some(error.clone()), false);
    if let Err(e) = runtime.metadata.record_step(&record).await {
        warn!("Failed to record failure of step {}: {:#}", job.step.name, e);
    }
    StepOutcome::Failed { error, attempts }
}

fn execution_record(
    job: &StepJob,
    outputs: &[Artifact],
    started_at: DateTime<Utc>,
    error: Option<String>,
    cached: bool,
) -> StepExecutionRecord {
    StepExecutionRecord {
        execution_id: Uuid::new_v4(),
        run_id: job.run_id,
        pipeline_name: job.pipeline_name.clone(),
        step_name: job.step.name.clone(),
        source: job.step.source.to_string(),
        fingerprint: job.fingerprint.clone(),
        status: if error.is_some() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        },
        cached,
        inputs: job.inputs.iter().map(|a| a.id).collect(),
        outputs: outputs.iter().map(|a| a.id).collect(),
        started_at,
        completed_at: Utc::now(),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{step_fn, BackendError, StepRegistry};
    use crate::core::config::PipelineConfig;
    use crate::persistence::InMemoryMetadataStore;
    use crate::storage::InMemoryArtifactStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const YAML: &str = r#"
version: 1
pipeline:
  name: training
  datasource:
    name: numbers
    source: mlpipeline.datasources.Inline
    args:
      data: [1, 2, 3, 4]
  steps:
    double:
      source: steps.Double
    total:
      source: steps.Total
"#;

    struct Fixture {
        engine: ExecutionEngine,
        artifacts: Arc<InMemoryArtifactStore>,
        metadata: Arc<InMemoryMetadataStore>,
        calls: Arc<AtomicUsize>,
    }

    fn fixture(strategy: SchedulingStrategy) -> Fixture {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = StepRegistry::with_builtins();
        let counter = calls.clone();
        registry.register_step(
            "steps.Double",
            step_fn(move |ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                let data: Vec<i64> = serde_json::from_value(ctx.input("datasource").cloned().unwrap_or_default())
                    .map_err(|e| BackendError::InvalidArgs(e.to_string()))?;
                Ok(StepOutputs::single(json!(data.iter().map(|x| x * 2).collect::<Vec<_>>())))
            }),
        );
        let counter = calls.clone();
        registry.register_step(
            "steps.Total",
            step_fn(move |ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                let data: Vec<i64> = serde_json::from_value(ctx.single_input().cloned().unwrap_or_default())
                    .map_err(|e| BackendError::InvalidArgs(e.to_string()))?;
                Ok(StepOutputs::single(json!(data.iter().sum::<i64>())))
            }),
        );
        let counter = calls.clone();
        registry.register_step(
            "steps.Scale",
            step_fn(move |ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                let factor: i64 = ctx.arg("factor").unwrap_or(1);
                let data: Vec<i64> = serde_json::from_value(ctx.input("datasource").cloned().unwrap_or_default())
                    .map_err(|e| BackendError::InvalidArgs(e.to_string()))?;
                Ok(StepOutputs::single(json!(data.iter().map(|x| x * factor).collect::<Vec<_>>())))
            }),
        );
        registry.register_step(
            "steps.Broken",
            step_fn(|_ctx| Err(BackendError::InvalidArgs("bad input".to_string()))),
        );

        let artifacts = Arc::new(InMemoryArtifactStore::new());
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let engine = ExecutionEngine::new(
            artifacts.clone(),
            metadata.clone(),
            Arc::new(BackendRegistry::with_defaults(Arc::new(registry))),
            strategy,
        );
        Fixture {
            engine,
            artifacts,
            metadata,
            calls,
        }
    }

    fn pipeline(yaml: &str) -> Pipeline {
        PipelineConfig::from_yaml(yaml).unwrap().to_pipeline().unwrap()
    }

    async fn output_of(engine: &ExecutionEngine, pipeline: &Pipeline, step: &str) -> serde_json::Value {
        let artifact = &pipeline.step(step).unwrap().state.artifacts()[0];
        engine.artifact_store().get(&artifact.uri).await.unwrap()
    }

    #[tokio::test]
    async fn test_execute_simple_pipeline() {
        let fx = fixture(SchedulingStrategy::Sequential);
        let mut pipeline = pipeline(YAML);

        let summary = fx.engine.execute(&mut pipeline).await.unwrap();
        assert!(summary.is_success());
        assert_eq!(summary.executed, 2);
        assert_eq!(summary.cached, 0);
        assert_eq!(summary.datasource.as_ref().unwrap().name, "numbers");
        assert!(pipeline.is_complete());
        assert!(pipeline.is_frozen());
        assert_eq!(output_of(&fx.engine, &pipeline, "total").await, json!(20));

        let run = fx.metadata.load_run(summary.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, ExecutionStatus::Completed);
        assert_eq!(run.completed_steps, 2);
        assert_eq!(fx.metadata.list_steps(summary.run_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_frozen_pipeline_is_not_executed_again() {
        let fx = fixture(SchedulingStrategy::Sequential);
        let mut pipeline = pipeline(YAML);
        fx.engine.execute(&mut pipeline).await.unwrap();

        assert!(matches!(
            fx.engine.execute(&mut pipeline).await,
            Err(PipelineError::Immutable(_))
        ));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_copy_reuses_cached_artifacts() {
        let fx = fixture(SchedulingStrategy::Sequential);
        let mut original = pipeline(YAML);
        fx.engine.execute(&mut original).await.unwrap();

        let mut copy = original.copy_as("training_v2").unwrap();
        let summary = fx.engine.execute(&mut copy).await.unwrap();
        assert_eq!(summary.cached, 2);
        assert_eq!(summary.executed, 0);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            copy.step("total").unwrap().state.artifacts()[0].id,
            original.step("total").unwrap().state.artifacts()[0].id
        );
    }

    #[tokio::test]
    async fn test_changed_step_reruns_downstream_only() {
        let fx = fixture(SchedulingStrategy::Sequential);
        let yaml = r#"
version: 1
pipeline:
  name: training
  datasource:
    name: numbers
    source: mlpipeline.datasources.Inline
    args:
      data: [1, 2, 3, 4]
  steps:
    scale:
      source: steps.Scale
      args:
        factor: 2
    total:
      source: steps.Total
    raw:
      source: mlpipeline.steps.Identity
      inputs: [datasource]
"#;
        let mut original = pipeline(yaml);
        fx.engine.execute(&mut original).await.unwrap();
        assert_eq!(output_of(&fx.engine, &original, "total").await, json!(20));

        let mut copy = original.copy_as("training_v2").unwrap();
        copy.set_step_args("scale", json!({ "factor": 3 })).unwrap();
        let summary = fx.engine.execute(&mut copy).await.unwrap();

        assert_eq!(summary.executed, 2);
        assert_eq!(summary.cached, 1);
        assert!(matches!(
            copy.step("raw").unwrap().state,
            StepState::Completed { cached: true, .. }
        ));
        assert_eq!(output_of(&fx.engine, &copy, "total").await, json!(30));
    }

    #[tokio::test]
    async fn test_no_cache_engine_recomputes() {
        let fx = fixture(SchedulingStrategy::Sequential);
        let mut first = pipeline(YAML);
        fx.engine.execute(&mut first).await.unwrap();

        let engine = fx.engine.with_cache(false);
        let mut second = first.copy_as("again").unwrap();
        let summary = engine.execute(&mut second).await.unwrap();
        assert_eq!(summary.executed, 2);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents() {
        let fx = fixture(SchedulingStrategy::Parallel);
        let yaml = r#"
version: 1
pipeline:
  name: broken
  datasource:
    name: numbers
    source: mlpipeline.datasources.Inline
    args:
      data: [1]
  steps:
    double:
      source: steps.Double
    broken:
      source: steps.Broken
      inputs: [datasource]
    total:
      source: steps.Total
      inputs: [double, broken]
"#;
        let mut pipeline = pipeline(yaml);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let mut engine = fx.engine;
        engine.add_event_handler(move |event| sink.lock().unwrap().push(event));

        let summary = engine.execute(&mut pipeline).await.unwrap();
        assert_eq!(summary.status, ExecutionStatus::Failed);
        assert_eq!(summary.executed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert!(matches!(pipeline.step("total").unwrap().state, StepState::Skipped { .. }));
        assert!(pipeline.is_frozen());

        let events = events.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, ExecutionEvent::StepSkipped { step, .. } if step == "total")));
        assert!(matches!(
            events.last(),
            Some(ExecutionEvent::PipelineCompleted {
                status: ExecutionStatus::Failed,
                ..
            })
        ));

        let failed: Vec<StepExecutionRecord> = fx
            .metadata
            .list_steps(summary.run_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.status == ExecutionStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].step_name, "broken");
    }

    #[tokio::test]
    async fn test_failed_executions_are_not_cached() {
        let fx = fixture(SchedulingStrategy::Sequential);
        let yaml = r#"
version: 1
pipeline:
  name: broken
  steps:
    broken:
      source: steps.Broken
      inputs: []
"#;
        let mut first = pipeline(yaml);
        fx.engine.execute(&mut first).await.unwrap();
        let mut second = first.copy_as("broken_again").unwrap();
        let summary = fx.engine.execute(&mut second).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.cached, 0);
    }

    #[tokio::test]
    async fn test_unreadable_datasource_aborts_run() {
        let fx = fixture(SchedulingStrategy::Sequential);
        let yaml = r#"
version: 1
pipeline:
  name: training
  datasource:
    name: numbers
    source: datasources.Missing
  steps:
    double:
      source: steps.Double
"#;
        let mut pipeline = pipeline(yaml);
        let run_id = pipeline.state.run_id;
        let result = fx.engine.execute(&mut pipeline).await;
        assert!(matches!(result, Err(PipelineError::Datasource { .. })));

        let run = fx.metadata.load_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, ExecutionStatus::Failed);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_evicted_artifact_is_recomputed() {
        let fx = fixture(SchedulingStrategy::Sequential);
        let mut first = pipeline(YAML);
        fx.engine.execute(&mut first).await.unwrap();

        let lost = first.step("double").unwrap().state.artifacts()[0].uri.clone();
        assert!(fx.artifacts.evict(&lost).await);

        let mut second = first.copy_as("training_v2").unwrap();
        let summary = fx.engine.execute(&mut second).await.unwrap();
        assert!(summary.is_success());
        assert!(matches!(
            second.step("double").unwrap().state,
            StepState::Completed { cached: false, .. }
        ));
        // Recomputed output has the same content, so the consumer still hits
        assert!(matches!(
            second.step("total").unwrap().state,
            StepState::Completed { cached: true, .. }
        ));
        assert_eq!(summary.executed, 1);
        assert_eq!(summary.cached, 1);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 3);
        assert!(fx.artifacts.exists(&lost).await.unwrap());
    }

    #[tokio::test]
    async fn test_unresolvable_input_aborts_and_records_run() {
        let fx = fixture(SchedulingStrategy::Sequential);
        let mut pipeline = pipeline(YAML);
        // `double` still consumes the datasource
        pipeline.datasource = None;
        let run_id = pipeline.state.run_id;

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let mut engine = fx.engine;
        engine.add_event_handler(move |event| sink.lock().unwrap().push(event));

        let result = engine.execute(&mut pipeline).await;
        assert!(matches!(result, Err(PipelineError::Invalid(_))));
        assert_eq!(pipeline.state.status, ExecutionStatus::Failed);
        assert!(pipeline
            .steps()
            .all(|step| matches!(step.state, StepState::Skipped { .. })));

        let run = fx.metadata.load_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, ExecutionStatus::Failed);
        assert!(matches!(
            events.lock().unwrap().last(),
            Some(ExecutionEvent::PipelineCompleted {
                status: ExecutionStatus::Failed,
                ..
            })
        ));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
    }
}

//! SQLite-based metadata store

use crate::core::Artifact;
use crate::persistence::{ExecutionStatus, MetadataStore, PipelineRunRecord, StepExecutionRecord};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

const RUN_COLUMNS: &str =
    "id, pipeline_name, status, started_at, completed_at, progress, completed_steps, cached_steps, total_steps, datasource";

const STEP_COLUMNS: &str = "id, run_id, pipeline_name, step_name, source, fingerprint, status, cached, inputs, outputs, started_at, completed_at, error";

const ARTIFACT_COLUMNS: &str = "id, name, producer, run_id, fingerprint, content_hash, uri, created_at";

/// SQLite metadata store
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    /// Open (or create) a store; `:memory:` keeps everything on one private connection
    pub async fn new(db_path: &str) -> Result<Self> {
        let pool = if db_path == ":memory:" {
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
                .await
                .context("Failed to open in-memory database")?
        } else {
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
            }
            let options = SqliteConnectOptions::new()
                .filename(db_path)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .connect_with(options)
                .await
                .context("Failed to connect to database")?
        };

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                pipeline_name TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                progress REAL NOT NULL DEFAULT 0.0,
                completed_steps INTEGER NOT NULL DEFAULT 0,
                cached_steps INTEGER NOT NULL DEFAULT 0,
                total_steps INTEGER NOT NULL DEFAULT 0,
                datasource TEXT
            );

            CREATE TABLE IF NOT EXISTS step_executions (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                pipeline_name TEXT NOT NULL,
                step_name TEXT NOT NULL,
                source TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                status TEXT NOT NULL,
                cached INTEGER NOT NULL DEFAULT 0,
                inputs TEXT NOT NULL,
                outputs TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT NOT NULL,
                error TEXT
            );

            CREATE TABLE IF NOT EXISTS execution_artifacts (
                execution_id TEXT NOT NULL,
                artifact_id TEXT NOT NULL,
                role TEXT NOT NULL,
                PRIMARY KEY (execution_id, artifact_id, role)
            );

            CREATE TABLE IF NOT EXISTS artifacts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                producer TEXT NOT NULL,
                run_id TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                uri TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_runs_pipeline_name ON runs(pipeline_name);
            CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at);
            CREATE INDEX IF NOT EXISTS idx_steps_run_id ON step_executions(run_id);
            CREATE INDEX IF NOT EXISTS idx_steps_fingerprint ON step_executions(fingerprint);
            CREATE INDEX IF NOT EXISTS idx_execution_artifacts_artifact ON execution_artifacts(artifact_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fixed-width UTC timestamps so text ordering matches time ordering
    fn to_text(dt: DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn from_text(value: &str) -> Result<DateTime<Utc>> {
        Ok(DateTime::parse_from_rfc3339(value)
            .with_context(|| format!("Invalid timestamp '{}'", value))?
            .with_timezone(&Utc))
    }

    fn parse_status(value: &str) -> Result<ExecutionStatus> {
        ExecutionStatus::parse(value).with_context(|| format!("Unknown status '{}'", value))
    }

    fn run_from_row(row: &SqliteRow) -> Result<PipelineRunRecord> {
        Ok(PipelineRunRecord {
            run_id: Uuid::parse_str(&row.try_get::<String, _>("id")?)?,
            pipeline_name: row.try_get("pipeline_name")?,
            status: Self::parse_status(&row.try_get::<String, _>("status")?)?,
            started_at: Self::from_text(&row.try_get::<String, _>("started_at")?)?,
            completed_at: row
                .try_get::<Option<String>, _>("completed_at")?
                .map(|value| Self::from_text(&value))
                .transpose()?,
            progress: row.try_get("progress")?,
            completed_steps: row.try_get::<i64, _>("completed_steps")? as usize,
            cached_steps: row.try_get::<i64, _>("cached_steps")? as usize,
            total_steps: row.try_get::<i64, _>("total_steps")? as usize,
            datasource: row.try_get("datasource")?,
        })
    }

    fn step_from_row(row: &SqliteRow) -> Result<StepExecutionRecord> {
        Ok(StepExecutionRecord {
            execution_id: Uuid::parse_str(&row.try_get::<String, _>("id")?)?,
            run_id: Uuid::parse_str(&row.try_get::<String, _>("run_id")?)?,
            pipeline_name: row.try_get("pipeline_name")?,
            step_name: row.try_get("step_name")?,
            source: row.try_get("source")?,
            fingerprint: row.try_get("fingerprint")?,
            status: Self::parse_status(&row.try_get::<String, _>("status")?)?,
            cached: row.try_get::<i64, _>("cached")? != 0,
            inputs: serde_json::from_str(&row.try_get::<String, _>("inputs")?)?,
            outputs: serde_json::from_str(&row.try_get::<String, _>("outputs")?)?,
            started_at: Self::from_text(&row.try_get::<String, _>("started_at")?)?,
            completed_at: Self::from_text(&row.try_get::<String, _>("completed_at")?)?,
            error: row.try_get("error")?,
        })
    }

    fn artifact_from_row(row: &SqliteRow) -> Result<Artifact> {
        Ok(Artifact {
            id: Uuid::parse_str(&row.try_get::<String, _>("id")?)?,
            name: row.try_get("name")?,
            producer: row.try_get("producer")?,
            run_id: Uuid::parse_str(&row.try_get::<String, _>("run_id")?)?,
            fingerprint: row.try_get("fingerprint")?,
            content_hash: row.try_get("content_hash")?,
            uri: row.try_get("uri")?,
            created_at: Self::from_text(&row.try_get::<String, _>("created_at")?)?,
        })
    }
}

#[async_trait::async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn save_run(&self, run: &PipelineRunRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO runs
            (id, pipeline_name, status, started_at, completed_at, progress, completed_steps, cached_steps, total_steps, datasource)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(run.run_id.to_string())
        .bind(&run.pipeline_name)
        .bind(run.status.as_str())
        .bind(Self::to_text(run.started_at))
        .bind(run.completed_at.map(Self::to_text))
        .bind(run.progress)
        .bind(run.completed_steps as i64)
        .bind(run.cached_steps as i64)
        .bind(run.total_steps as i64)
        .bind(&run.datasource)
        .execute(&self.pool)
        .await
        .context("Failed to save run")?;

        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<PipelineRunRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS))
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load run")?;

        row.as_ref().map(Self::run_from_row).transpose()
    }

    async fn list_runs(&self, pipeline_name: &str) -> Result<Vec<PipelineRunRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM runs WHERE pipeline_name = ?1 ORDER BY started_at DESC",
            RUN_COLUMNS
        ))
        .bind(pipeline_name)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list runs")?;

        rows.iter().map(Self::run_from_row).collect()
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT pipeline_name FROM runs ORDER BY pipeline_name ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list pipelines")?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("pipeline_name").map_err(Into::into))
            .collect()
    }

    async fn record_step(&self, execution: &StepExecutionRecord) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to start transaction")?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO step_executions
            (id, run_id, pipeline_name, step_name, source, fingerprint, status, cached, inputs, outputs, started_at, completed_at, error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(execution.execution_id.to_string())
        .bind(execution.run_id.to_string())
        .bind(&execution.pipeline_name)
        .bind(&execution.step_name)
        .bind(&execution.source)
        .bind(&execution.fingerprint)
        .bind(execution.status.as_str())
        .bind(execution.cached as i64)
        .bind(serde_json::to_string(&execution.inputs)?)
        .bind(serde_json::to_string(&execution.outputs)?)
        .bind(Self::to_text(execution.started_at))
        .bind(Self::to_text(execution.completed_at))
        .bind(&execution.error)
        .execute(&mut *tx)
        .await
        .context("Failed to record step execution")?;

        let links = execution
            .inputs
            .iter()
            .map(|id| (id, "input"))
            .chain(execution.outputs.iter().map(|id| (id, "output")));
        for (artifact_id, role) in links {
            sqlx::query(
                "INSERT OR IGNORE INTO execution_artifacts (execution_id, artifact_id, role) VALUES (?1, ?2, ?3)",
            )
            .bind(execution.execution_id.to_string())
            .bind(artifact_id.to_string())
            .bind(role)
            .execute(&mut *tx)
            .await
            .context("Failed to link execution artifacts")?;
        }

        tx.commit().await.context("Failed to commit step execution")?;
        Ok(())
    }

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepExecutionRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM step_executions WHERE run_id = ?1 ORDER BY started_at ASC",
            STEP_COLUMNS
        ))
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list step executions")?;

        rows.iter().map(Self::step_from_row).collect()
    }

    async fn record_artifact(&self, artifact: &Artifact) -> Result<()> {
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO artifacts ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            ARTIFACT_COLUMNS
        ))
        .bind(artifact.id.to_string())
        .bind(&artifact.name)
        .bind(&artifact.producer)
        .bind(artifact.run_id.to_string())
        .bind(&artifact.fingerprint)
        .bind(&artifact.content_hash)
        .bind(&artifact.uri)
        .bind(Self::to_text(artifact.created_at))
        .execute(&self.pool)
        .await
        .context("Failed to record artifact")?;

        Ok(())
    }

    async fn load_artifact(&self, artifact_id: Uuid) -> Result<Option<Artifact>> {
        let row = sqlx::query(&format!("SELECT {} FROM artifacts WHERE id = ?1", ARTIFACT_COLUMNS))
            .bind(artifact_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load artifact")?;

        row.as_ref().map(Self::artifact_from_row).transpose()
    }

    async fn find_cached(&self, fingerprint: &str) -> Result<Option<StepExecutionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM step_executions WHERE fingerprint = ?1 AND status = ?2 ORDER BY completed_at DESC LIMIT 1",
            STEP_COLUMNS
        ))
        .bind(fingerprint)
        .bind(ExecutionStatus::Completed.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up cached execution")?;

        row.as_ref().map(Self::step_from_row).transpose()
    }

    async fn producer_of(&self, artifact_id: Uuid) -> Result<Option<StepExecutionRecord>> {
        let columns: Vec<String> = STEP_COLUMNS
            .split(", ")
            .map(|column| format!("e.{}", column))
            .collect();
        let row = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM step_executions e
            JOIN execution_artifacts a ON a.execution_id = e.id
            WHERE a.artifact_id = ?1 AND a.role = 'output'
            ORDER BY e.cached ASC, e.started_at ASC
            LIMIT 1
            "#,
            columns.join(", ")
        ))
        .bind(artifact_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up artifact producer")?;

        row.as_ref().map(Self::step_from_row).transpose()
    }
}

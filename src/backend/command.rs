//! Command backend - runs a step as an external process
//!
//! The step context is written to the child's stdin as JSON, and the child
//! answers with a JSON object of outputs on stdout.

use crate::backend::{BackendError, StepBackend, StepOutputs};
use crate::core::StepContext;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// `backend.args` of a `command` step
#[derive(Debug, Clone, Deserialize)]
pub struct CommandArgs {
    /// Executable to spawn
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory of the child
    #[serde(default)]
    pub cwd: Option<String>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Backend that executes each step through a subprocess
#[derive(Debug, Clone, Default)]
pub struct CommandBackend;

impl CommandBackend {
    pub fn new() -> Self {
        Self
    }

    async fn spawn(&self, args: &CommandArgs, ctx: &StepContext) -> Result<std::process::Output, BackendError> {
        let payload = serde_json::to_vec(ctx)
            .map_err(|e| BackendError::Failed(format!("Failed to encode step context: {}", e)))?;

        let mut command = Command::new(&args.program);
        command
            .args(&args.args)
            .envs(&args.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &args.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            BackendError::Failed(format!("Failed to spawn '{}': {}", args.program, e))
        })?;

        // Feed stdin concurrently so a chatty child cannot block on a full stdout pipe
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!("Child closed stdin early: {}", e);
                }
            });
        }

        Ok(child.wait_with_output().await?)
    }
}

#[async_trait]
impl StepBackend for CommandBackend {
    fn kind(&self) -> &str {
        "command"
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepOutputs, BackendError> {
        let args: CommandArgs = serde_json::from_value(ctx.backend_args.clone())
            .map_err(|e| BackendError::InvalidArgs(format!("command backend: {}", e)))?;

        debug!("Spawning '{}' for step {}", args.program, ctx.step_name);

        let output = match args.timeout_secs {
            Some(secs) => timeout(Duration::from_secs(secs), self.spawn(&args, ctx))
                .await
                .map_err(|_| BackendError::Timeout(secs))??,
            None => self.spawn(&args, ctx).await?,
        };

        // Check exit code
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            warn!(
                "'{}' exited with code {}: {}",
                args.program,
                exit_code,
                stderr.trim()
            );
            return Err(BackendError::Failed(format!(
                "'{}' exited with code {}: {}",
                args.program,
                exit_code,
                stderr.trim()
            )));
        }

        let outputs: StepOutputs = serde_json::from_slice(&output.stdout).map_err(|e| {
            BackendError::Failed(format!(
                "'{}' did not print a JSON object of outputs: {}",
                args.program, e
            ))
        })?;

        debug!("'{}' returned {} outputs", args.program, outputs.len());

        Ok(outputs)
    }
}

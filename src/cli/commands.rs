//! CLI command definitions

use crate::execution::SchedulingStrategy;
use crate::repository::{ComponentType, StackComponent, StackDefinition};
use clap::{Args, Subcommand};
use serde_json::{json, Map, Value};
use std::path::PathBuf;

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    /// Recompute every step instead of reusing cached artifacts
    #[arg(long)]
    pub no_cache: bool,

    /// Scheduling strategy (overrides the orchestration backend)
    #[arg(long, value_enum)]
    pub strategy: Option<SchedulingStrategyArg>,

    /// Concurrency limit for `parallel-limited`
    #[arg(long, default_value_t = 4)]
    pub max_concurrency: usize,
}

impl RunCommand {
    pub fn scheduling_strategy(&self) -> Option<SchedulingStrategy> {
        self.strategy.map(|arg| match arg {
            SchedulingStrategyArg::Sequential => SchedulingStrategy::Sequential,
            SchedulingStrategyArg::Parallel => SchedulingStrategy::Parallel,
            SchedulingStrategyArg::ParallelLimited => SchedulingStrategy::LimitedParallel(self.max_concurrency.max(1)),
        })
    }
}

/// Validate a pipeline configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Subcommand, Clone)]
pub enum PipelineCommand {
    /// List registered pipelines
    List,

    /// Show a registered pipeline
    Describe {
        name: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Copy a pipeline to a new name so it can diverge
    Copy { source: String, target: String },
}

#[derive(Debug, Subcommand, Clone)]
pub enum DatasourceCommand {
    /// List registered datasources
    List,

    /// Show the versions of a datasource
    Versions { name: String },
}

#[derive(Debug, Subcommand, Clone)]
pub enum StackCommand {
    /// List stacks
    List,

    /// Show a stack
    Describe { name: String },

    /// Register a new stack from registered components
    Register(RegisterStackArgs),

    /// Make a stack the active one
    Activate { name: String },

    /// Remove a stack
    Deregister { name: String },
}

#[derive(Debug, Args, Clone)]
pub struct RegisterStackArgs {
    pub name: String,

    /// Name of a registered artifact store
    #[arg(short, long)]
    pub artifact_store: String,

    /// Name of a registered metadata store
    #[arg(short, long)]
    pub metadata_store: String,

    /// Name of a registered orchestrator
    #[arg(short, long)]
    pub orchestrator: String,

    /// Name of a registered secrets manager
    #[arg(short = 'x', long)]
    pub secrets_manager: Option<String>,
}

impl RegisterStackArgs {
    pub fn definition(&self) -> StackDefinition {
        StackDefinition {
            artifact_store: self.artifact_store.clone(),
            metadata_store: self.metadata_store.clone(),
            orchestrator: self.orchestrator.clone(),
            secrets_manager: self.secrets_manager.clone(),
        }
    }
}

#[derive(Debug, Subcommand, Clone)]
pub enum ComponentCommand {
    /// Register a stack component
    Register(RegisterComponentArgs),

    /// List components of one type
    List {
        #[arg(value_enum)]
        kind: ComponentTypeArg,
    },

    /// Show a component
    Describe {
        #[arg(value_enum)]
        kind: ComponentTypeArg,
        name: String,
    },

    /// Remove a component no stack uses
    Deregister {
        #[arg(value_enum)]
        kind: ComponentTypeArg,
        name: String,
    },
}

#[derive(Debug, Args, Clone)]
pub struct RegisterComponentArgs {
    #[arg(value_enum)]
    pub kind: ComponentTypeArg,

    pub name: String,

    /// Component flavor, e.g. `local`, `sqlite` or `local_parallel`
    #[arg(short, long)]
    pub flavor: String,

    /// Directory or file of a local store
    #[arg(long)]
    pub path: Option<PathBuf>,

    /// Metadata store uri
    #[arg(long)]
    pub uri: Option<String>,

    /// Concurrency limit of a `local_parallel` orchestrator
    #[arg(long)]
    pub max_concurrency: Option<u64>,
}

impl RegisterComponentArgs {
    pub fn component(&self) -> StackComponent {
        let mut args = Map::new();
        if let Some(path) = &self.path {
            args.insert("path".to_string(), json!(path.to_string_lossy()));
        }
        if let Some(uri) = &self.uri {
            args.insert("uri".to_string(), json!(uri));
        }
        if let Some(max) = self.max_concurrency {
            args.insert("max_concurrency".to_string(), json!(max));
        }
        StackComponent::new(self.flavor.clone(), Value::Object(args))
    }
}

/// Stack component type argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ComponentTypeArg {
    ArtifactStore,
    MetadataStore,
    Orchestrator,
    SecretsManager,
}

impl From<ComponentTypeArg> for ComponentType {
    fn from(arg: ComponentTypeArg) -> Self {
        match arg {
            ComponentTypeArg::ArtifactStore => ComponentType::ArtifactStore,
            ComponentTypeArg::MetadataStore => ComponentType::MetadataStore,
            ComponentTypeArg::Orchestrator => ComponentType::Orchestrator,
            ComponentTypeArg::SecretsManager => ComponentType::SecretsManager,
        }
    }
}

/// Secrets in the secrets manager of the active stack
#[derive(Debug, Subcommand, Clone)]
pub enum SecretCommand {
    /// Create a secret
    Create {
        name: String,

        /// `KEY=VALUE`, repeatable
        #[arg(long = "value", value_name = "KEY=VALUE", required = true)]
        values: Vec<String>,
    },

    /// Show a secret's keys; `--show-values` prints the values too
    Get {
        name: String,

        #[arg(long)]
        show_values: bool,
    },

    /// Replace the values of a secret
    Update {
        name: String,

        /// `KEY=VALUE`, repeatable
        #[arg(long = "value", value_name = "KEY=VALUE", required = true)]
        values: Vec<String>,
    },

    /// Delete a secret
    Delete { name: String },

    /// List secret names
    List,
}

#[derive(Debug, Subcommand, Clone)]
pub enum ProfileCommand {
    /// Create a profile with its own repository
    Create {
        name: String,

        /// Repository directory (defaults to one under the user data directory)
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// List profiles
    List,

    /// Show a profile (the active one by default)
    Describe { name: Option<String> },

    /// Make a profile the active one
    Activate { name: String },

    /// Remove a profile; its repository is left on disk
    Delete { name: String },
}

#[derive(Debug, Subcommand, Clone)]
pub enum StepCommand {
    /// List step sources seen in registered pipelines
    List,

    /// Show the versions recorded for a step source
    Versions { source: String },
}

/// Show run history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline name to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Show a single run with its step executions
    #[arg(long)]
    pub run_id: Option<String>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Trace an artifact back to its datasource
#[derive(Debug, Args, Clone)]
pub struct LineageCommand {
    pub artifact_id: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Scheduling strategy argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SchedulingStrategyArg {
    Sequential,
    Parallel,
    #[clap(name = "parallel-limited")]
    ParallelLimited,
}

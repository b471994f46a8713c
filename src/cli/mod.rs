//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{
    ComponentCommand, DatasourceCommand, HistoryCommand, LineageCommand, PipelineCommand, ProfileCommand, RunCommand,
    SecretCommand, StackCommand, StepCommand, ValidateCommand,
};
use std::ffi::OsString;
use std::path::PathBuf;

/// Machine-learning pipelines with artifact caching and lineage
#[derive(Debug, Parser, Clone)]
#[command(name = "mlpipe")]
#[command(version)]
#[command(about = "Run machine-learning pipelines with artifact caching and lineage", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Repository directory (defaults to the one in the global settings)
    #[arg(short, long, global = true)]
    pub repository: Option<PathBuf>,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Create a repository with a default local stack
    Init,

    /// Run a pipeline
    Run(RunCommand),

    /// Validate a pipeline configuration
    Validate(ValidateCommand),

    /// Inspect and copy registered pipelines
    #[command(subcommand)]
    Pipeline(PipelineCommand),

    /// Inspect registered datasources
    #[command(subcommand)]
    Datasource(DatasourceCommand),

    /// Manage stacks
    #[command(subcommand)]
    Stack(StackCommand),

    /// Manage stack components
    #[command(subcommand)]
    Component(ComponentCommand),

    /// Manage secrets of the active stack
    #[command(subcommand)]
    Secret(SecretCommand),

    /// Manage settings profiles
    #[command(subcommand)]
    Profile(ProfileCommand),

    /// Inspect step versions
    #[command(subcommand)]
    Step(StepCommand),

    /// Show run history
    History(HistoryCommand),

    /// Trace where an artifact came from
    Lineage(LineageCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}

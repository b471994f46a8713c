use anyhow::{Context, Result};
use mlpipeline::backend::{BackendRegistry, StepRegistry};
use mlpipeline::cli::commands::{
    ComponentCommand, DatasourceCommand, HistoryCommand, LineageCommand, PipelineCommand, ProfileCommand, RunCommand,
    SecretCommand, StackCommand, StepCommand, ValidateCommand,
};
use mlpipeline::cli::output::*;
use mlpipeline::cli::{Cli, Command};
use mlpipeline::core::config::PipelineConfig;
use mlpipeline::core::ExecutionStatus;
use mlpipeline::execution::{ExecutionEvent, RunSummary};
use mlpipeline::persistence::{open_metadata_store, trace_lineage, MetadataStore, PipelineRunRecord};
use mlpipeline::repository::{ComponentType, Repository, RepositoryError, StackConfig};
use mlpipeline::secrets::parse_values;
use mlpipeline::settings::{Settings, DEFAULT_PROFILE};
use std::sync::Arc;
use tracing::{error, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();
    let settings = Settings::load().context("Failed to load settings")?;

    // RUST_LOG wins, then --verbose, then the settings file
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let level = if cli.verbose {
                "debug".to_string()
            } else {
                settings.log_level.clone().unwrap_or_else(|| "info".to_string())
            };
            EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"))
        }
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set logging subscriber")?;

    if let Command::Init = cli.command {
        let root = cli.repository.clone().unwrap_or_else(|| settings.repository_root());
        let repository = Repository::init(&root)?;
        println!("{} Repository ready at {}", CHECK, style(repository.root().display()).bold());
        return Ok(());
    }

    if let Command::Validate(cmd) = &cli.command {
        return validate_pipeline(cmd);
    }

    if let Command::Profile(cmd) = &cli.command {
        return profile_command(cmd);
    }

    let repository = match &cli.repository {
        Some(root) => Repository::open(root)?,
        None => Repository::global()?.clone(),
    };

    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd, &repository).await?,
        Command::Pipeline(cmd) => pipeline_command(cmd, &repository).await?,
        Command::Datasource(cmd) => datasource_command(cmd, &repository)?,
        Command::Stack(cmd) => stack_command(cmd, &repository)?,
        Command::Component(cmd) => component_command(cmd, &repository)?,
        Command::Secret(cmd) => secret_command(cmd, &repository).await?,
        Command::Step(cmd) => step_command(cmd, &repository)?,
        Command::History(cmd) => show_history(cmd, &repository).await?,
        Command::Lineage(cmd) => show_lineage(cmd, &repository).await?,
        Command::Init | Command::Validate(_) | Command::Profile(_) => {}
    }

    Ok(())
}

async fn run_pipeline(cmd: &RunCommand, repository: &Repository) -> Result<()> {
    let config = PipelineConfig::from_file(&cmd.file).context("Failed to load pipeline config")?;
    println!("{} Loaded pipeline: {}", INFO, style(config.name()).bold());

    let registered = repository.prepare_run(&config)?;
    let (stack_name, active) = repository.active_stack()?;
    let stack = StackConfig::resolve(&config.stack_overrides(), &active);
    println!("{} Stack: {}", INFO, style(&stack_name).cyan());

    let backends = Arc::new(BackendRegistry::with_defaults(Arc::new(StepRegistry::with_builtins())));
    let mut engine = stack.engine(backends).await?.with_cache(!cmd.no_cache);
    if let Some(strategy) = cmd.scheduling_strategy() {
        engine = engine.with_strategy(strategy);
    }

    let mut pipeline = registered.config.to_pipeline()?;
    let progress = create_progress_bar(pipeline.len());
    let bar = progress.clone();
    engine.add_event_handler(move |event| {
        bar.println(format_execution_event(&event));
        match event {
            ExecutionEvent::StepCached { .. }
            | ExecutionEvent::StepCompleted { .. }
            | ExecutionEvent::StepFailed { .. }
            | ExecutionEvent::StepSkipped { .. } => bar.inc(1),
            ExecutionEvent::StepStarted { step, .. } => bar.set_message(step),
            _ => {}
        }
    });

    println!();
    let result = engine.execute(&mut pipeline).await;
    progress.finish_and_clear();

    // The run is recorded even when the datasource failed to load
    repository.mark_executed(pipeline.name.as_str())?;

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            println!("\n{} {} {}", CROSS, style(&pipeline.name).bold(), style("failed").red());
            error!("{}", e);
            std::process::exit(1);
        }
    };

    register_datasource(repository, &summary);

    println!();
    for step in pipeline.steps() {
        println!("  {} {}", format_step_state(&step.state), style(&step.name).bold());
    }
    println!("\n{}", format_run_summary(&summary));

    if !summary.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn register_datasource(repository: &Repository, summary: &RunSummary) {
    let Some(record) = &summary.datasource else {
        return;
    };
    match repository.register_datasource(record) {
        Ok(()) => {}
        Err(e @ RepositoryError::DatasourceConflict { .. }) => {
            println!("{} {}", WARN, style(&e).yellow());
        }
        Err(e) => warn!("Failed to register datasource {}: {}", record.name, e),
    }
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating pipeline...", INFO);

    match PipelineConfig::from_file(&cmd.file) {
        Ok(config) => {
            println!("{} Pipeline configuration is valid!", CHECK);
            println!("  Name: {}", style(config.name()).bold());
            println!("  Steps: {}", style(config.pipeline.steps.len()).cyan());
            if let Some(datasource) = &config.pipeline.datasource {
                println!("  Datasource: {}", style(&datasource.name).cyan());
            }

            if cmd.json {
                println!("\n{}", serde_json::to_string_pretty(&config)?);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    }
}

async fn active_metadata_store(repository: &Repository) -> Result<Arc<dyn MetadataStore>> {
    let (_, stack) = repository.active_stack()?;
    open_metadata_store(&stack.metadata).await
}

async fn pipeline_command(cmd: &PipelineCommand, repository: &Repository) -> Result<()> {
    match cmd {
        PipelineCommand::List => {
            let names = repository.list_pipelines()?;
            if names.is_empty() {
                println!("{} No pipelines registered", INFO);
                return Ok(());
            }
            println!("{} Registered pipelines:", INFO);
            for name in &names {
                let registered = repository.get_pipeline(name)?;
                let marker = if registered.executed {
                    style("executed").green()
                } else {
                    style("not run").dim()
                };
                println!("  {} ({})", style(name).bold(), marker);
            }
        }
        PipelineCommand::Describe { name, json } => {
            let registered = repository.get_pipeline(name)?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&registered)?);
                return Ok(());
            }

            let config = &registered.config;
            println!("{} Pipeline {}", INFO, style(name).bold());
            if let Some(kind) = &config.pipeline.kind {
                println!("  Type: {}", kind);
            }
            println!("  Registered: {}", style(registered.registered_at.to_rfc3339()).dim());
            println!("  Executed: {}", registered.executed);
            println!("  Cache: {}", config.pipeline.enable_cache);
            if let Some(datasource) = &config.pipeline.datasource {
                println!(
                    "  Datasource: {} [{}]",
                    style(&datasource.name).cyan(),
                    style(&datasource.source).dim()
                );
            }
            println!("  Steps:");
            for (step_name, step) in &config.pipeline.steps {
                println!(
                    "    {} [{}] <- {}",
                    style(step_name).bold(),
                    style(&step.source).dim(),
                    config.resolved_inputs(step_name).join(", ")
                );
            }

            let store = active_metadata_store(repository).await?;
            let runs = store.list_runs(name).await?;
            if !runs.is_empty() {
                println!("  Recent runs:");
                for run in runs.iter().take(5) {
                    println!("    {}", format_run_record(run));
                }
            }
        }
        PipelineCommand::Copy { source, target } => {
            let copied = repository.copy_pipeline(source, target)?;
            println!(
                "{} Copied {} to {}",
                CHECK,
                style(source).bold(),
                style(copied.name()).bold()
            );
        }
    }
    Ok(())
}

fn datasource_command(cmd: &DatasourceCommand, repository: &Repository) -> Result<()> {
    match cmd {
        DatasourceCommand::List => {
            let names = repository.list_datasources()?;
            if names.is_empty() {
                println!("{} No datasources registered", INFO);
                return Ok(());
            }
            println!("{} Registered datasources:", INFO);
            for name in &names {
                let latest = repository.get_datasource(name, None)?;
                println!("  {}", format_datasource(&latest));
            }
        }
        DatasourceCommand::Versions { name } => {
            let versions = repository.datasource_versions(name)?;
            if versions.is_empty() {
                return Err(RepositoryError::DatasourceNotFound(name.clone()).into());
            }
            println!("{} Versions of {}:", INFO, style(name).bold());
            for record in &versions {
                println!("  {} [{}]", format_datasource(record), style(&record.source).dim());
            }
        }
    }
    Ok(())
}

fn stack_command(cmd: &StackCommand, repository: &Repository) -> Result<()> {
    match cmd {
        StackCommand::List => {
            let config = repository.config()?;
            println!("{} Stacks:", INFO);
            for name in config.stacks.keys() {
                if *name == config.active_stack {
                    println!("  {} {}", style(name).bold(), style("(active)").green());
                } else {
                    println!("  {}", name);
                }
            }
        }
        StackCommand::Describe { name } => {
            let definition = repository.stack_definition(name)?;
            let stack = repository.get_stack(name)?;
            println!("{} Stack {}", INFO, style(name).bold());
            for (kind, component) in definition.components() {
                println!("  {}: {}", kind, style(component).cyan());
            }
            print!("{}", serde_yaml::to_string(&stack)?);
        }
        StackCommand::Register(args) => {
            repository.register_stack(&args.name, args.definition())?;
            println!("{} Registered stack {}", CHECK, style(&args.name).bold());
        }
        StackCommand::Activate { name } => {
            repository.activate_stack(name)?;
            println!("{} Active stack is now {}", CHECK, style(name).bold());
        }
        StackCommand::Deregister { name } => {
            repository.deregister_stack(name)?;
            println!("{} Removed stack {}", CHECK, style(name).bold());
        }
    }
    Ok(())
}

fn component_command(cmd: &ComponentCommand, repository: &Repository) -> Result<()> {
    match cmd {
        ComponentCommand::Register(args) => {
            let kind = ComponentType::from(args.kind);
            repository.register_stack_component(kind, &args.name, args.component())?;
            println!("{} Registered {} {}", CHECK, kind, style(&args.name).bold());
        }
        ComponentCommand::List { kind } => {
            let kind = ComponentType::from(*kind);
            let components = repository.list_stack_components(kind)?;
            if components.is_empty() {
                println!("{} No {} registered", INFO, kind);
                return Ok(());
            }
            println!("{} {} components:", INFO, kind);
            for (name, component) in &components {
                println!("  {} [{}]", style(name).bold(), style(&component.flavor).dim());
            }
        }
        ComponentCommand::Describe { kind, name } => {
            let kind = ComponentType::from(*kind);
            let component = repository.get_stack_component(kind, name)?;
            println!("{} {} {}", INFO, kind, style(name).bold());
            print!("{}", serde_yaml::to_string(&component)?);
        }
        ComponentCommand::Deregister { kind, name } => {
            let kind = ComponentType::from(*kind);
            repository.deregister_stack_component(kind, name)?;
            println!("{} Removed {} {}", CHECK, kind, style(name).bold());
        }
    }
    Ok(())
}

async fn secret_command(cmd: &SecretCommand, repository: &Repository) -> Result<()> {
    let (stack_name, stack) = repository.active_stack()?;
    let secrets = stack
        .secrets()
        .with_context(|| format!("Stack '{}' cannot hold secrets", stack_name))?;

    match cmd {
        SecretCommand::Create { name, values } => {
            secrets.create_secret(name, parse_values(values)?).await?;
            println!("{} Created secret {}", CHECK, style(name).bold());
        }
        SecretCommand::Get { name, show_values } => {
            let values = secrets.get_secret(name).await?;
            println!("{} Secret {}", INFO, style(name).bold());
            for (key, value) in &values {
                if *show_values {
                    println!("  {}: {}", key, value);
                } else {
                    println!("  {}: {}", key, style("********").dim());
                }
            }
        }
        SecretCommand::Update { name, values } => {
            secrets.update_secret(name, parse_values(values)?).await?;
            println!("{} Updated secret {}", CHECK, style(name).bold());
        }
        SecretCommand::Delete { name } => {
            secrets.delete_secret(name).await?;
            println!("{} Deleted secret {}", CHECK, style(name).bold());
        }
        SecretCommand::List => {
            let names = secrets.list_secrets().await?;
            if names.is_empty() {
                println!("{} No secrets in {}", INFO, style(secrets.location()).dim());
                return Ok(());
            }
            println!("{} Secrets:", INFO);
            for name in &names {
                println!("  {}", name);
            }
        }
    }
    Ok(())
}

/// Profiles change the settings file itself, so environment overrides are not applied
fn profile_command(cmd: &ProfileCommand) -> Result<()> {
    let dir = Settings::default_dir();
    let mut settings = Settings::read_or_create(&dir)?;

    match cmd {
        ProfileCommand::Create { name, path } => {
            settings.create_profile(name, path.clone())?;
            let repository = Repository::init(settings.profile_root(name))?;
            settings.save(&dir)?;
            println!(
                "{} Created profile {} with repository at {}",
                CHECK,
                style(name).bold(),
                style(repository.root().display()).dim()
            );
        }
        ProfileCommand::List => {
            println!("{} Profiles:", INFO);
            for name in settings.profiles.keys() {
                if *name == settings.active_profile {
                    println!("  {} {}", style(name).bold(), style("(active)").green());
                } else {
                    println!("  {}", name);
                }
            }
        }
        ProfileCommand::Describe { name } => {
            let name = name.as_deref().unwrap_or(&settings.active_profile);
            if settings.profile(name).is_none() {
                anyhow::bail!("Profile '{}' not found", name);
            }
            println!("{} Profile {}", INFO, style(name).bold());
            println!("  Repository: {}", settings.profile_root(name).display());
            println!("  Active: {}", name == settings.active_profile);
        }
        ProfileCommand::Activate { name } => {
            settings.activate_profile(name)?;
            settings.save(&dir)?;
            println!("{} Active profile is now {}", CHECK, style(name).bold());
        }
        ProfileCommand::Delete { name } => {
            let root = settings.profile_root(name);
            settings.delete_profile(name)?;
            settings.save(&dir)?;
            println!(
                "{} Deleted profile {}; its repository was left at {}",
                CHECK,
                style(name).bold(),
                root.display()
            );
        }
    }

    if settings.active_profile != DEFAULT_PROFILE {
        println!("{} Using profile {}", INFO, style(&settings.active_profile).cyan());
    }
    Ok(())
}

fn step_command(cmd: &StepCommand, repository: &Repository) -> Result<()> {
    match cmd {
        StepCommand::List => {
            let sources = repository.step_sources()?;
            if sources.is_empty() {
                println!("{} No steps recorded", INFO);
            }
            for (path, versions) in &sources {
                let versions: Vec<&str> = versions.iter().map(String::as_str).collect();
                println!("  {} ({})", style(path).bold(), versions.join(", "));
            }
        }
        StepCommand::Versions { source } => {
            let versions = repository.step_versions(source)?;
            if versions.is_empty() {
                println!("{} No versions recorded for {}", WARN, style(source).bold());
                return Ok(());
            }
            println!("{} Versions of {}:", INFO, style(source).bold());
            for version in &versions {
                println!("  {}", version);
            }
        }
    }
    Ok(())
}

async fn show_history(cmd: &HistoryCommand, repository: &Repository) -> Result<()> {
    let store = active_metadata_store(repository).await?;

    if let Some(run_id) = &cmd.run_id {
        let run_id = uuid::Uuid::parse_str(run_id).context("Invalid run ID format")?;
        let Some(run) = store.load_run(run_id).await? else {
            println!("{} Run not found", WARN);
            return Ok(());
        };
        let steps = store.list_steps(run_id).await?;

        if cmd.json {
            let data = serde_json::json!({ "run": run, "steps": steps });
            println!("{}", serde_json::to_string_pretty(&data)?);
        } else {
            print_run_details(&run);
            println!("\n  {}", style("Steps:").bold());
            for step in &steps {
                println!("    {}", format_step_execution(step));
            }
        }
        return Ok(());
    }

    let mut runs: Vec<PipelineRunRecord> = match &cmd.pipeline {
        Some(name) => store.list_runs(name).await?,
        None => {
            let mut all = Vec::new();
            for name in store.list_pipelines().await? {
                all.extend(store.list_runs(&name).await?);
            }
            all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            all
        }
    };
    runs.truncate(cmd.limit);

    if cmd.json {
        let data = serde_json::json!({ "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(());
    }

    println!("{} Run history (showing latest {}):", INFO, cmd.limit);
    for run in &runs {
        println!("  {}", format_run_record(run));
    }
    Ok(())
}

fn print_run_details(run: &PipelineRunRecord) {
    println!("{} Run Details", INFO);
    println!("  ID: {}", style(run.run_id).cyan());
    println!("  Pipeline: {}", style(&run.pipeline_name).bold());
    println!("  Status: {}", format_status(run.status));
    println!("  Started: {}", style(run.started_at.to_rfc3339()).dim());
    if let Some(completed) = run.completed_at {
        println!("  Completed: {}", style(completed.to_rfc3339()).dim());
        if let Ok(duration) = completed.signed_duration_since(run.started_at).to_std() {
            println!("  Duration: {}", style(format_duration(duration)).dim());
        }
    }
    if let Some(datasource) = &run.datasource {
        println!("  Datasource: {}", style(datasource).cyan());
    }
    println!(
        "  Progress: {} ({}/{}, {} cached)",
        style(format!("{:.0}%", run.progress * 100.0)).cyan(),
        run.completed_steps,
        run.total_steps,
        run.cached_steps
    );
    if run.status == ExecutionStatus::Failed {
        println!("  {}", style("Run failed; see step errors below").red());
    }
}

async fn show_lineage(cmd: &LineageCommand, repository: &Repository) -> Result<()> {
    let artifact_id = uuid::Uuid::parse_str(&cmd.artifact_id).context("Invalid artifact ID format")?;
    let store = active_metadata_store(repository).await?;
    let lineage = trace_lineage(store.as_ref(), artifact_id).await?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&lineage)?);
        return Ok(());
    }

    println!("{} Lineage of {}", INFO, style(artifact_id).bold());
    for node in &lineage.nodes {
        println!("  {}", format_lineage_node(node));
    }
    let datasources = lineage.datasources();
    if !datasources.is_empty() {
        println!("\n  {}", style("Derived from:").bold());
        for artifact in datasources {
            println!("    {} ({})", style(&artifact.producer).cyan(), style(&artifact.content_hash).dim());
        }
    }
    Ok(())
}

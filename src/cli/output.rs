//! CLI output formatting

use crate::{
    core::{DatasourceRecord, ExecutionStatus, StepState},
    execution::{ExecutionEvent, RunSummary},
    persistence::{LineageNode, PipelineRunRecord, StepExecutionRecord},
};
use chrono::{DateTime, Utc};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static CACHED: Emoji<'_, '_> = Emoji("♻️  ", "= ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");

const PROGRESS_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}";

/// Create a progress bar
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template(PROGRESS_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    progress.set_style(style);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

fn short_id(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Format a step state for display
pub fn format_step_state(state: &StepState) -> String {
    match state {
        StepState::Pending => style("PENDING").dim().to_string(),
        StepState::Running { attempt, .. } => style(format!("RUNNING (attempt {})", attempt)).yellow().to_string(),
        StepState::Completed { cached: true, .. } => style("CACHED").cyan().to_string(),
        StepState::Completed { .. } => style("COMPLETED").green().to_string(),
        StepState::Failed { .. } => style("FAILED").red().to_string(),
        StepState::Skipped { .. } => style("SKIPPED").dim().to_string(),
    }
}

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Pending => style("PENDING").dim().to_string(),
        ExecutionStatus::Running => style("RUNNING").yellow().to_string(),
        ExecutionStatus::Completed => style("COMPLETED").green().to_string(),
        ExecutionStatus::Failed => style("FAILED").red().to_string(),
    }
}

fn status_icon(status: ExecutionStatus) -> Emoji<'static, 'static> {
    match status {
        ExecutionStatus::Completed => CHECK,
        ExecutionStatus::Failed => CROSS,
        ExecutionStatus::Running => SPINNER,
        ExecutionStatus::Pending => INFO,
    }
}

/// One-line summary of a recorded run
pub fn format_run_record(run: &PipelineRunRecord) -> String {
    let mut line = format!(
        "{} {} - {} - {} ({}/{}, {} cached) - {}",
        status_icon(run.status),
        style(short_id(&run.run_id)).dim(),
        style(&run.pipeline_name).bold(),
        format_status(run.status),
        run.completed_steps,
        run.total_steps,
        run.cached_steps,
        style(format!("{:.0}%", run.progress * 100.0)).cyan()
    );
    if let Some(datasource) = &run.datasource {
        line.push_str(&format!(" - {}", style(datasource).dim()));
    }
    line
}

/// Summary printed after a run
pub fn format_run_summary(summary: &RunSummary) -> String {
    let verdict = if summary.is_success() {
        format!("completed {}", style("successfully").green())
    } else {
        style("failed").red().to_string()
    };

    let mut out = format!(
        "{} {} {} ({})\n  {} executed, {} cached, {} failed, {} skipped",
        status_icon(summary.status),
        style(&summary.pipeline_name).bold(),
        verdict,
        style(short_id(&summary.run_id)).dim(),
        style(summary.executed).cyan(),
        style(summary.cached).cyan(),
        style(summary.failed).red(),
        style(summary.skipped).dim()
    );
    if let Some(datasource) = &summary.datasource {
        out.push_str(&format!("\n  datasource: {}", format_datasource(datasource)));
    }
    out
}

pub fn format_datasource(record: &DatasourceRecord) -> String {
    format!(
        "{}@{} ({}, {})",
        style(&record.name).bold(),
        style(&record.version).cyan(),
        style(&record.content_hash[..record.content_hash.len().min(12)]).dim(),
        record.registered_at.format("%Y-%m-%d %H:%M:%S")
    )
}

/// One step execution in run details
pub fn format_step_execution(record: &StepExecutionRecord) -> String {
    let state = match (record.status, record.cached) {
        (ExecutionStatus::Completed, true) => format!("{}{}", CACHED, style("cached").cyan()),
        (status, _) => format!("{}{}", status_icon(status), format_status(status)),
    };
    let mut line = format!(
        "{} {} [{}] {} in, {} out, {}",
        state,
        style(&record.step_name).bold(),
        style(&record.source).dim(),
        record.inputs.len(),
        record.outputs.len(),
        style(format_elapsed(record.started_at, record.completed_at)).dim()
    );
    if let Some(error) = &record.error {
        line.push_str(&format!("\n      {}", style(error).red()));
    }
    line
}

/// One artifact in a lineage listing
pub fn format_lineage_node(node: &LineageNode) -> String {
    let origin = match (&node.step, &node.source) {
        (Some(step), Some(source)) => format!("{} [{}]", style(step).cyan(), style(source).dim()),
        (Some(step), None) => style(step).cyan().to_string(),
        _ => style(&node.artifact.producer).yellow().to_string(),
    };
    let mut line = format!(
        "{} {} <- {}",
        style(&node.artifact.id).dim(),
        style(&node.artifact.name).bold(),
        origin
    );
    if let Some(run_id) = &node.run_id {
        line.push_str(&format!(" run {}", style(short_id(run_id)).dim()));
    }
    line
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::PipelineStarted {
            run_id,
            pipeline_name,
            total_steps,
        } => format!(
            "{} Starting pipeline {} with {} steps ({})",
            ROCKET,
            style(pipeline_name).bold(),
            total_steps,
            style(short_id(run_id)).dim()
        ),
        ExecutionEvent::DatasourceLoaded {
            name,
            version,
            artifact_id,
        } => format!(
            "{} Datasource {}@{} ({})",
            INFO,
            style(name).bold(),
            style(version).cyan(),
            style(short_id(artifact_id)).dim()
        ),
        ExecutionEvent::StepStarted { step, attempt } => {
            if *attempt > 1 {
                format!("{} {} (attempt {})", SPINNER, style(step).cyan(), style(attempt).dim())
            } else {
                format!("{} {}", SPINNER, style(step).cyan())
            }
        }
        ExecutionEvent::StepRetrying {
            step,
            attempt,
            max_retries,
        } => format!("{} {} (retry {}/{})", WARN, style(step).yellow(), attempt, max_retries),
        ExecutionEvent::StepCached { step, fingerprint } => format!(
            "{} {} (cached {})",
            CACHED,
            style(step).green(),
            style(&fingerprint[..fingerprint.len().min(12)]).dim()
        ),
        ExecutionEvent::StepCompleted { step, outputs } => {
            format!("{} {} → {}", CHECK, style(step).green(), style(outputs.join(", ")).dim())
        }
        ExecutionEvent::StepFailed { step, error } => {
            format!("{} {}: {}", CROSS, style(step).red(), style(error).dim())
        }
        ExecutionEvent::StepSkipped { step, reason } => {
            format!("{} {} ({})", SKIP, style(step).dim(), reason)
        }
        ExecutionEvent::PipelineCompleted { run_id, status } => {
            let status_str = match status {
                ExecutionStatus::Completed => format!("{} completed", style("successfully").green()),
                ExecutionStatus::Failed => style("failed").red().to_string(),
                other => other.to_string(),
            };
            format!("{} Pipeline ({}) {}", INFO, style(short_id(run_id)).dim(), status_str)
        }
    }
}

fn format_elapsed(started_at: DateTime<Utc>, completed_at: DateTime<Utc>) -> String {
    match completed_at.signed_duration_since(started_at).to_std() {
        Ok(duration) if duration.as_secs() == 0 => format!("{}ms", duration.as_millis()),
        Ok(duration) => format_duration(duration),
        Err(_) => "0ms".to_string(),
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn test_format_run_summary_counts() {
        console::set_colors_enabled(false);
        let summary = RunSummary {
            run_id: Uuid::new_v4(),
            pipeline_name: "training".to_string(),
            status: ExecutionStatus::Failed,
            executed: 2,
            cached: 1,
            failed: 1,
            skipped: 3,
            datasource: None,
        };
        let text = format_run_summary(&summary);
        assert!(text.contains("training failed"));
        assert!(text.contains("2 executed, 1 cached, 1 failed, 3 skipped"));
    }

    #[test]
    fn test_format_cached_event() {
        console::set_colors_enabled(false);
        let text = format_execution_event(&ExecutionEvent::StepCached {
            step: "train".to_string(),
            fingerprint: "abcdef0123456789".to_string(),
        });
        assert!(text.contains("train (cached abcdef012345)"));
    }
}

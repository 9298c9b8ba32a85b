//! Job listing command.

use anyhow::Context;
use colored::Colorize;
use mixtune_training::{discover_jobs, JobEntry};
use serde_json::json;
use std::path::Path;
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct JobRow {
    #[tabled(rename = "Job")]
    job_id: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Step")]
    step: String,
    #[tabled(rename = "Phase")]
    phase: String,
    #[tabled(rename = "Saved")]
    saved: String,
}

impl From<&JobEntry> for JobRow {
    fn from(entry: &JobEntry) -> Self {
        let state = super::state_label(entry);
        let (step, phase, saved) = entry.latest.as_ref().map_or_else(
            || ("-".to_string(), "-".to_string(), "-".to_string()),
            |c| {
                (
                    c.step.to_string(),
                    c.phase_index.to_string(),
                    c.timestamp.format("%Y-%m-%d %H:%M").to_string(),
                )
            },
        );
        Self { job_id: entry.job_id.to_string(), state: state.to_string(), step, phase, saved }
    }
}

/// Execute the jobs command.
pub fn execute(checkpoint_dir: &Path, json_output: bool) -> anyhow::Result<()> {
    let entries = discover_jobs(checkpoint_dir)
        .with_context(|| format!("Failed to scan {}", checkpoint_dir.display()))?;

    if json_output {
        let jobs: Vec<_> = entries
            .iter()
            .map(|entry| {
                json!({
                    "job_id": entry.job_id,
                    "complete": entry.is_complete(),
                    "status": entry.status(),
                    "step": entry.latest.as_ref().map(|c| c.step),
                    "phase_index": entry.latest.as_ref().map(|c| c.phase_index),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&json!({ "jobs": jobs }))?);
        return Ok(());
    }

    println!("{}", "mixtune jobs".bold().cyan());
    println!();
    if entries.is_empty() {
        println!("  {}", format!("No jobs under {}", checkpoint_dir.display()).dimmed());
        return Ok(());
    }

    let rows: Vec<JobRow> = entries.iter().map(JobRow::from).collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
    println!();
    println!("  {} job(s)", entries.len());
    Ok(())
}

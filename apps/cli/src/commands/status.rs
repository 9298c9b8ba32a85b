//! Job status command.

use anyhow::Context;
use colored::Colorize;
use mixtune_training::{load_job, JobEntry};
use serde_json::json;
use std::path::Path;

/// Execute the status command.
///
/// Reads only what the job left on disk; a running orchestrator is not contacted.
pub fn execute(path: &Path, json_output: bool) -> anyhow::Result<()> {
    let (_, spec) = super::load_job_file(path)?;
    let entry = load_job(&spec.paths, &spec.job_id)
        .with_context(|| format!("Failed to read state of job {}", spec.job_id))?;

    if json_output {
        let out = json!({
            "job_id": entry.job_id,
            "total_steps": spec.total_steps,
            "complete": entry.is_complete(),
            "status": entry.status(),
            "failure": entry.record.as_ref().and_then(|job| job.failure.as_ref()),
            "checkpoint": entry.latest,
            "manifest": entry.manifest,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    print_human(&entry, spec.total_steps);
    Ok(())
}

fn print_human(entry: &JobEntry, total_steps: u64) {
    println!("{}", "mixtune status".bold().cyan());
    println!();
    println!("  Job: {}", entry.job_id.as_str().cyan());

    if let Some(manifest) = &entry.manifest {
        println!("  State: {}", "completed".green());
        println!("  Completed: {}", manifest.completed_at.format("%Y-%m-%d %H:%M:%S UTC"));
        println!("  Launches: {}", manifest.launches);
        println!("  Artifacts: {}", manifest.artifacts.len());
        for artifact in &manifest.artifacts {
            println!("    {}", artifact.path.display().to_string().dimmed());
        }
    } else {
        let label = super::state_label(entry);
        let state = match label {
            "failed" => label.red(),
            "not started" => label.dimmed(),
            _ => label.yellow(),
        };
        println!("  State: {state}");
        if let Some(failure) = entry.record.as_ref().and_then(|job| job.failure.as_ref()) {
            println!("  Reason: {}", failure.message);
            if let Some(code) = failure.exit_code {
                println!("  Exit code: {code}");
            }
            for line in &failure.stderr_tail {
                println!("    {}", line.dimmed());
            }
        }
    }

    if let Some(checkpoint) = &entry.latest {
        #[allow(clippy::cast_precision_loss)]
        let percent = checkpoint.step as f64 / total_steps.max(1) as f64 * 100.0;
        println!();
        println!("{}", "Latest checkpoint:".bold());
        println!("  Step: {}/{} ({percent:.1}%)", checkpoint.step, total_steps);
        println!("  Phase: {}", checkpoint.phase_index);
        println!("  Saved: {}", checkpoint.timestamp.format("%Y-%m-%d %H:%M:%S UTC"));
        let weights: Vec<String> =
            checkpoint.weights.iter().map(|(name, value)| format!("{name}={value}")).collect();
        println!("  Weights: {}", weights.join(" ").dimmed());
        if let Some(best) = checkpoint.best_val_loss {
            println!("  Best val loss: {best}");
        }
        for (name, value) in &checkpoint.latest_metrics {
            println!("  {name}: {value}");
        }
    }
    println!();
}

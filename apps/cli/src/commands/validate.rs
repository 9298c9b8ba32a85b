//! Job file validation command.

use anyhow::Context;
use colored::Colorize;
use mixtune_training::{CliTrainer, PhasePlan, ProcessSupervisor, RewardWeights, TrainingJobSpec};
use serde_json::json;
use std::path::Path;

/// Execute the validate command.
///
/// Fails (exit 1) on any configuration error, or on missing inputs with `check_paths`.
pub fn execute(path: &Path, check_paths: bool, json_output: bool) -> anyhow::Result<()> {
    let (config, spec) = super::load_job_file(path)?;
    let plan = spec.phase_plan()?;
    let weights = spec.effective_weights(&plan)?;

    if check_paths {
        ProcessSupervisor::new(spec.clone(), Box::new(CliTrainer::from_spec(&spec)))?
            .check_dependencies()
            .context("Job inputs are not available")?;
    }

    if json_output {
        let phases: Vec<_> = plan
            .phases()
            .iter()
            .zip(&weights)
            .map(|(phase, weights)| {
                json!({
                    "index": phase.index,
                    "label": phase.label,
                    "start": phase.start,
                    "end": phase.end,
                    "weights": weights,
                })
            })
            .collect();
        let out = json!({
            "valid": true,
            "job_id": spec.job_id,
            "total_steps": spec.total_steps,
            "trainer": spec.trainer.program,
            "reconfigure": spec.trainer.reconfigure,
            "checkpoint_every": config.orchestration.checkpoint_every,
            "phases": phases,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    print_human(&spec, &plan, &weights);
    Ok(())
}

fn print_human(spec: &TrainingJobSpec, plan: &PhasePlan, weights: &[RewardWeights]) {
    println!("{}", "mixtune validate".bold().cyan());
    println!();
    println!("  Job: {}", spec.job_id.as_str().cyan());
    println!("  Base model: {}", spec.base_model.path.display().to_string().dimmed());
    println!("  Data: {}", spec.train_data_path().display().to_string().dimmed());
    println!("  Steps: {}", spec.total_steps);
    println!("  Trainer: {}", spec.trainer.program);
    println!();

    println!("{}", "Phases:".bold());
    for (phase, weights) in plan.phases().iter().zip(weights) {
        let label = phase.label.as_deref().unwrap_or("");
        let mixed: Vec<String> =
            weights.iter().map(|(name, value)| format!("{name}={value}")).collect();
        println!(
            "  [{:>6}, {:>6})  {:<20} {}",
            phase.start,
            phase.end,
            label,
            mixed.join(" ").dimmed()
        );
    }
    println!();
    println!("  {}", "Valid ✓".green());
}

//! `run` and `resume` commands.

use anyhow::Context;
use colored::Colorize;
use mixtune_training::{CliTrainer, JobCoordinator, JobStatus, StdoutProgressSink, TrainingJob};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Fresh,
    Resume,
}

/// Process exit code for a finished job.
pub fn exit_code(status: JobStatus) -> i32 {
    match status {
        JobStatus::Completed => 0,
        JobStatus::Cancelled => 130,
        JobStatus::Pending | JobStatus::Running | JobStatus::Failed => 1,
    }
}

pub async fn execute(path: &Path, mode: Mode, json_output: bool) -> anyhow::Result<()> {
    let (config, spec) = super::load_job_file(path)?;
    let trainer = Box::new(CliTrainer::from_spec(&spec));
    let mut coordinator =
        JobCoordinator::new(spec, trainer, config.orchestration.coordinator_options())?;
    if !json_output {
        coordinator = coordinator.with_sink(Arc::new(StdoutProgressSink));
    }

    let token = coordinator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "Cancelling training job...".yellow());
            token.cancel();
        }
    });

    let job = match mode {
        Mode::Fresh => coordinator.run().await,
        Mode::Resume => coordinator.resume().await,
    }
    .with_context(|| format!("Training job {} did not finish", coordinator.job().id))?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&job)?);
    } else {
        print_summary(&job);
    }

    let code = exit_code(job.status);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn print_summary(job: &TrainingJob) {
    println!();
    match job.status {
        JobStatus::Completed => println!("{}", "Training complete".bold().green()),
        JobStatus::Cancelled => println!("{}", "Training cancelled".bold().yellow()),
        _ => println!("{}", format!("Training {}", job.status).bold().red()),
    }
    println!("  Job: {}", job.id.as_str().cyan());
    println!("  Step: {}/{}", job.current_step, job.total_steps);
    println!("  Launches: {}", job.launches);

    if let Some(failure) = &job.failure {
        println!("  Reason: {}", failure.message.red());
        if let Some(code) = failure.exit_code {
            println!("  Exit code: {code}");
        }
        if !failure.stderr_tail.is_empty() {
            println!("  {}", "Trainer stderr (tail):".dimmed());
            for line in &failure.stderr_tail {
                println!("    {line}");
            }
        }
    }
    println!();
}

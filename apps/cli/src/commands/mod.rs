//! Command implementations for the Mixtune CLI.

pub mod jobs;
pub mod status;
pub mod train;
pub mod validate;

use anyhow::Context;
use mixtune_training::{JobConfig, JobEntry, JobStatus, TrainingJobSpec};
use std::path::Path;

/// Short state of a job as left on disk. A checkpoint without a job record predates
/// recorded outcomes and is reported as resumable.
pub fn state_label(entry: &JobEntry) -> &'static str {
    match entry.status() {
        Some(JobStatus::Completed) => "completed",
        Some(JobStatus::Failed) => "failed",
        Some(JobStatus::Cancelled) => "cancelled",
        Some(JobStatus::Running) => "running",
        Some(JobStatus::Pending) | None if entry.latest.is_some() => "resumable",
        Some(JobStatus::Pending) | None => "not started",
    }
}

/// Load a job file and build its validated definition.
pub fn load_job_file(path: &Path) -> anyhow::Result<(JobConfig, TrainingJobSpec)> {
    let config = JobConfig::load_from_file(path)
        .with_context(|| format!("Failed to load job file: {}", path.display()))?;
    let spec = config
        .to_spec()
        .with_context(|| format!("Invalid job definition in {}", path.display()))?;
    Ok((config, spec))
}

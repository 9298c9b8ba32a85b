use crate::artifacts::{read_json, TrainingManifest};
use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::error::{TrainingError, TrainingResult};
use crate::job::{JobStatus, TrainingJob, TrainingJobId, TrainingPaths};
use crate::layout::TrainingLayout;
use std::path::Path;
use tracing::warn;

/// A job found under a checkpoint directory.
#[derive(Debug, Clone)]
pub struct JobEntry {
    pub job_id: TrainingJobId,
    /// Most recent checkpoint, if one could be read.
    pub latest: Option<Checkpoint>,
    /// Present once the job completed.
    pub manifest: Option<TrainingManifest>,
    /// Job record as of the last launch or terminal transition.
    pub record: Option<TrainingJob>,
}

impl JobEntry {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.manifest.is_some()
    }

    /// Best known status: Completed once a manifest exists, otherwise the recorded one.
    #[must_use]
    pub fn status(&self) -> Option<JobStatus> {
        if self.is_complete() {
            return Some(JobStatus::Completed);
        }
        self.record.as_ref().map(|job| job.status)
    }
}

/// Load what is known about one job.
pub fn load_job(paths: &TrainingPaths, job_id: &TrainingJobId) -> TrainingResult<JobEntry> {
    let layout = TrainingLayout::new(paths);
    if !layout.job_dir(job_id).is_dir() {
        return Err(TrainingError::Checkpoint(format!(
            "no state for job {job_id} under {}",
            layout.checkpoint_root().display()
        )));
    }

    let manifest_path = layout.job_manifest_path(job_id);
    let manifest = if manifest_path.is_file() { Some(read_json(&manifest_path)?) } else { None };
    let record_path = layout.job_record_path(job_id);
    let record = if record_path.is_file() { Some(read_json(&record_path)?) } else { None };
    let latest = CheckpointManager::new(layout).load(job_id)?;
    Ok(JobEntry { job_id: job_id.clone(), latest, manifest, record })
}

/// Scan `checkpoint_root/*` for job directories, sorted by id.
///
/// Unreadable jobs are skipped with a warning so one corrupt directory does not hide the rest.
pub fn discover_jobs(checkpoint_root: &Path) -> TrainingResult<Vec<JobEntry>> {
    let dir = match std::fs::read_dir(checkpoint_root) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let paths = TrainingPaths {
        adapter_dir: checkpoint_root.to_path_buf(),
        checkpoint_dir: checkpoint_root.to_path_buf(),
        log_dir: checkpoint_root.to_path_buf(),
    };

    let mut out = Vec::new();
    for entry in dir {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let job_id = TrainingJobId::new(name);
        if job_id.validate().is_err() {
            continue;
        }
        match load_job(&paths, &job_id) {
            Ok(job) if job.latest.is_some() || job.manifest.is_some() || job.record.is_some() => {
                out.push(job);
            }
            Ok(_) => {}
            Err(e) => warn!(job_id = %job_id, error = %e, "skipping unreadable job"),
        }
    }
    out.sort_by(|a, b| a.job_id.as_str().cmp(b.job_id.as_str()));
    Ok(out)
}

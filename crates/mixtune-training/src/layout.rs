use crate::error::TrainingResult;
use crate::job::{TrainingJobId, TrainingPaths};
use std::path::{Path, PathBuf};

/// Filesystem layout for one job's orchestration state.
///
/// ```text
/// <checkpoint_dir>/<job_id>/training_config.json
/// <checkpoint_dir>/<job_id>/metrics_history.json
/// <checkpoint_dir>/<job_id>/training_manifest.json
/// <checkpoint_dir>/<job_id>/reward_weights.json
/// <checkpoint_dir>/<job_id>/step_<n>/state.json
/// <log_dir>/<job_id>-run<NNN>.log
/// ```
#[derive(Debug, Clone)]
pub struct TrainingLayout {
    checkpoint_root: PathBuf,
    log_dir: PathBuf,
    adapter_dir: PathBuf,
}

impl TrainingLayout {
    #[must_use]
    pub fn new(paths: &TrainingPaths) -> Self {
        Self {
            checkpoint_root: paths.checkpoint_dir.clone(),
            log_dir: paths.log_dir.clone(),
            adapter_dir: paths.adapter_dir.clone(),
        }
    }

    #[must_use]
    pub fn checkpoint_root(&self) -> &Path {
        &self.checkpoint_root
    }

    #[must_use]
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    #[must_use]
    pub fn adapter_dir(&self) -> &Path {
        &self.adapter_dir
    }

    #[must_use]
    pub fn job_dir(&self, job_id: &TrainingJobId) -> PathBuf {
        self.checkpoint_root.join(job_id.as_str())
    }

    #[must_use]
    pub fn step_dir(&self, job_id: &TrainingJobId, step: u64) -> PathBuf {
        self.job_dir(job_id).join(format!("step_{step}"))
    }

    #[must_use]
    pub fn checkpoint_state_path(&self, job_id: &TrainingJobId, step: u64) -> PathBuf {
        self.step_dir(job_id, step).join("state.json")
    }

    #[must_use]
    pub fn training_config_path(&self, job_id: &TrainingJobId) -> PathBuf {
        self.job_dir(job_id).join("training_config.json")
    }

    #[must_use]
    pub fn metrics_history_path(&self, job_id: &TrainingJobId) -> PathBuf {
        self.job_dir(job_id).join("metrics_history.json")
    }

    #[must_use]
    pub fn job_manifest_path(&self, job_id: &TrainingJobId) -> PathBuf {
        self.job_dir(job_id).join("training_manifest.json")
    }

    /// Last persisted [`crate::job::TrainingJob`] record.
    #[must_use]
    pub fn job_record_path(&self, job_id: &TrainingJobId) -> PathBuf {
        self.job_dir(job_id).join("job.json")
    }

    #[must_use]
    pub fn weights_file_path(&self, job_id: &TrainingJobId) -> PathBuf {
        self.job_dir(job_id).join("reward_weights.json")
    }

    /// Adapter file a resumed trainer continues from, if the trainer wrote one.
    #[must_use]
    pub fn resume_adapter_path(&self) -> PathBuf {
        self.adapter_dir.join("adapters.safetensors")
    }

    #[must_use]
    pub fn log_path(&self, job_id: &TrainingJobId, run: u32) -> PathBuf {
        self.log_dir.join(format!("{job_id}-run{run:03}.log"))
    }

    /// One more than the highest existing run log for `job_id`.
    pub fn next_run_index(&self, job_id: &TrainingJobId) -> TrainingResult<u32> {
        let prefix = format!("{job_id}-run");
        let dir = match std::fs::read_dir(&self.log_dir) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(1),
            Err(e) => return Err(e.into()),
        };

        let mut highest = 0;
        for entry in dir {
            let name = entry?.file_name();
            let Some(run) = name
                .to_str()
                .and_then(|n| n.strip_prefix(&prefix))
                .and_then(|n| n.strip_suffix(".log"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            highest = highest.max(run);
        }
        Ok(highest + 1)
    }

    pub fn ensure_job_dirs(&self, job_id: &TrainingJobId) -> TrainingResult<()> {
        std::fs::create_dir_all(self.job_dir(job_id))?;
        std::fs::create_dir_all(&self.log_dir)?;
        std::fs::create_dir_all(&self.adapter_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let temp = TempDir::new().unwrap();
        let layout = TrainingLayout::new(&TrainingPaths::under(temp.path()));
        let id = TrainingJobId::new("job-1");

        assert!(layout.job_dir(&id).ends_with("checkpoints/job-1"));
        assert!(layout.checkpoint_state_path(&id, 4000).ends_with("job-1/step_4000/state.json"));
        assert!(layout.log_path(&id, 7).ends_with("logs/job-1-run007.log"));
        assert!(layout.job_record_path(&id).ends_with("checkpoints/job-1/job.json"));
    }

    #[test]
    fn test_next_run_index_counts_existing_logs() {
        let temp = TempDir::new().unwrap();
        let layout = TrainingLayout::new(&TrainingPaths::under(temp.path()));
        let id = TrainingJobId::new("job-1");
        assert_eq!(layout.next_run_index(&id).unwrap(), 1);

        layout.ensure_job_dirs(&id).unwrap();
        std::fs::write(layout.log_path(&id, 1), "").unwrap();
        std::fs::write(layout.log_path(&id, 2), "").unwrap();
        std::fs::write(layout.log_dir().join("job-10-run009.log"), "").unwrap();
        std::fs::write(layout.log_dir().join("job-1-notes.txt"), "").unwrap();
        assert_eq!(layout.next_run_index(&id).unwrap(), 3);
    }
}

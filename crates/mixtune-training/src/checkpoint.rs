//! Persisted job progress.
//!
//! Each save lands in its own `step_<n>/state.json`, so the most recent checkpoint is the
//! one with the highest step and re-saving a step simply overwrites it.

use crate::artifacts::{read_json, upsert_metrics_history, write_json_atomic, MetricsRecord};
use crate::error::{TrainingError, TrainingResult};
use crate::job::TrainingJobId;
use crate::layout::TrainingLayout;
use crate::weights::RewardWeights;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: TrainingJobId,
    pub step: u64,
    pub phase_index: usize,
    pub weights: RewardWeights,
    #[serde(default)]
    pub latest_metrics: BTreeMap<String, f64>,
    /// Lowest validation loss reported so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_val_loss: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    layout: TrainingLayout,
}

impl CheckpointManager {
    #[must_use]
    pub fn new(layout: TrainingLayout) -> Self {
        Self { layout }
    }

    #[must_use]
    pub fn layout(&self) -> &TrainingLayout {
        &self.layout
    }

    /// Persist `checkpoint` and record its metrics in `metrics_history.json`.
    pub fn save(&self, checkpoint: &Checkpoint) -> TrainingResult<PathBuf> {
        let path = self.layout.checkpoint_state_path(&checkpoint.job_id, checkpoint.step);
        write_json_atomic(&path, checkpoint)?;

        upsert_metrics_history(
            &self.layout.metrics_history_path(&checkpoint.job_id),
            MetricsRecord {
                step: checkpoint.step,
                phase_index: checkpoint.phase_index,
                timestamp: checkpoint.timestamp,
                metrics: checkpoint.latest_metrics.clone(),
                best_val_loss: checkpoint.best_val_loss,
            },
        )?;

        debug!(job_id = %checkpoint.job_id, step = checkpoint.step, path = %path.display(), "checkpoint saved");
        Ok(path)
    }

    /// Steps with a saved checkpoint, ascending.
    pub fn list_steps(&self, job_id: &TrainingJobId) -> TrainingResult<Vec<u64>> {
        let dir = match std::fs::read_dir(self.layout.job_dir(job_id)) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut steps = Vec::new();
        for entry in dir {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(step) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_prefix("step_"))
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };
            if self.layout.checkpoint_state_path(job_id, step).is_file() {
                steps.push(step);
            }
        }
        steps.sort_unstable();
        Ok(steps)
    }

    /// The most recent checkpoint, or `None` if the job never checkpointed.
    pub fn load(&self, job_id: &TrainingJobId) -> TrainingResult<Option<Checkpoint>> {
        let Some(&step) = self.list_steps(job_id)?.last() else {
            return Ok(None);
        };

        let path = self.layout.checkpoint_state_path(job_id, step);
        let checkpoint: Checkpoint = read_json(&path).map_err(|e| {
            TrainingError::Checkpoint(format!("failed to read {}: {e}", path.display()))
        })?;

        if checkpoint.job_id != *job_id || checkpoint.step != step {
            warn!(path = %path.display(), "checkpoint contents do not match its location");
            return Err(TrainingError::Checkpoint(format!(
                "{} holds job {} step {}",
                path.display(),
                checkpoint.job_id,
                checkpoint.step
            )));
        }
        Ok(Some(checkpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::read_metrics_history;
    use crate::job::TrainingPaths;
    use tempfile::TempDir;

    fn checkpoint(step: u64, phase_index: usize, loss: f64) -> Checkpoint {
        Checkpoint {
            job_id: TrainingJobId::new("job-1"),
            step,
            phase_index,
            weights: RewardWeights::from([("precision", 2.6)]),
            latest_metrics: BTreeMap::from([("loss".to_string(), loss)]),
            best_val_loss: None,
            timestamp: Utc::now(),
        }
    }

    fn manager(temp: &TempDir) -> CheckpointManager {
        CheckpointManager::new(TrainingLayout::new(&TrainingPaths::under(temp.path())))
    }

    #[test]
    fn test_load_without_checkpoints_is_none() {
        let temp = TempDir::new().unwrap();
        assert!(manager(&temp).load(&TrainingJobId::new("job-1")).unwrap().is_none());
    }

    #[test]
    fn test_load_returns_highest_step() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp);
        manager.save(&checkpoint(500, 0, 0.9)).unwrap();
        manager.save(&checkpoint(4000, 2, 0.4)).unwrap();
        manager.save(&checkpoint(2000, 1, 0.6)).unwrap();

        let latest = manager.load(&TrainingJobId::new("job-1")).unwrap().unwrap();
        assert_eq!(latest.step, 4000);
        assert_eq!(latest.phase_index, 2);
        assert_eq!(manager.list_steps(&TrainingJobId::new("job-1")).unwrap(), vec![500, 2000, 4000]);
    }

    #[test]
    fn test_save_same_step_is_last_write_wins() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp);
        manager.save(&checkpoint(1000, 0, 0.9)).unwrap();
        manager.save(&checkpoint(1000, 0, 0.5)).unwrap();

        let latest = manager.load(&TrainingJobId::new("job-1")).unwrap().unwrap();
        assert_eq!(latest.latest_metrics["loss"], 0.5);

        let history =
            read_metrics_history(&manager.layout().metrics_history_path(&TrainingJobId::new("job-1")))
                .unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_best_val_loss_is_kept_in_state_and_history() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp);
        let id = TrainingJobId::new("job-1");
        manager.save(&checkpoint(500, 0, 0.9)).unwrap();
        manager.save(&Checkpoint { best_val_loss: Some(1.02), ..checkpoint(1000, 0, 0.7) }).unwrap();

        assert_eq!(manager.load(&id).unwrap().unwrap().best_val_loss, Some(1.02));
        let history = read_metrics_history(&manager.layout().metrics_history_path(&id)).unwrap();
        assert_eq!(history[0].best_val_loss, None);
        assert_eq!(history[1].best_val_loss, Some(1.02));
    }

    #[test]
    fn test_incomplete_step_dir_is_skipped() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp);
        let id = TrainingJobId::new("job-1");
        manager.save(&checkpoint(500, 0, 0.9)).unwrap();
        std::fs::create_dir_all(manager.layout().step_dir(&id, 900)).unwrap();

        assert_eq!(manager.load(&id).unwrap().unwrap().step, 500);
    }

    #[test]
    fn test_corrupt_checkpoint_is_an_error() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp);
        let id = TrainingJobId::new("job-1");
        let path = manager.layout().checkpoint_state_path(&id, 700);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(manager.load(&id), Err(TrainingError::Checkpoint(_))));
    }
}

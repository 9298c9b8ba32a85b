use crate::error::{TrainingError, TrainingResult};
use crate::phase::{Phase, PhasePlan};
use crate::trainer::TrainerSettings;
use crate::weights::{mix, RewardWeights};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Identifier for a training job. Keys checkpoints and log files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrainingJobId(pub String);

impl TrainingJobId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ids become directory and file names.
    pub fn validate(&self) -> TrainingResult<()> {
        let id = self.0.as_str();
        if id.trim().is_empty() {
            return Err(TrainingError::config("job.id is required"));
        }
        if !id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            || id.starts_with('.')
        {
            return Err(TrainingError::config(format!(
                "job.id {id:?} may only contain ascii letters, digits, '-', '_' and '.'"
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for TrainingJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Reference to the base model artifact on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub path: PathBuf,
}

impl ModelSpec {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Last path component, used in status output.
    #[must_use]
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map_or_else(|| self.path.display().to_string(), |n| n.to_string_lossy().to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingHyperParams {
    pub seed: u64,
    pub learning_rate: f64,
    pub batch_size: u32,
    pub lora_rank: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_seq_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora_alpha: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora_dropout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warmup_steps: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gradient_accumulation_steps: Option<u32>,
}

impl Default for TrainingHyperParams {
    fn default() -> Self {
        Self {
            seed: 42,
            learning_rate: 3e-6,
            batch_size: 2,
            lora_rank: 128,
            max_seq_length: None,
            lora_alpha: None,
            lora_dropout: None,
            warmup_steps: None,
            gradient_accumulation_steps: None,
        }
    }
}

impl TrainingHyperParams {
    pub fn validate(&self) -> TrainingResult<()> {
        if !(self.learning_rate.is_finite()) || self.learning_rate <= 0.0 {
            return Err(TrainingError::config("learning_rate must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(TrainingError::config("batch_size must be >= 1"));
        }
        if self.lora_rank == 0 {
            return Err(TrainingError::config("lora_rank must be >= 1"));
        }
        if self.max_seq_length == Some(0) {
            return Err(TrainingError::config("max_seq_length must be >= 1"));
        }
        if self.lora_alpha.is_some_and(|a| !a.is_finite() || a <= 0.0) {
            return Err(TrainingError::config("lora_alpha must be > 0"));
        }
        if self.lora_dropout.is_some_and(|d| !(0.0..1.0).contains(&d)) {
            return Err(TrainingError::config("lora_dropout must be in [0, 1)"));
        }
        if self.gradient_accumulation_steps == Some(0) {
            return Err(TrainingError::config("gradient_accumulation_steps must be >= 1"));
        }
        Ok(())
    }
}

/// Where a job keeps its outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingPaths {
    pub adapter_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl TrainingPaths {
    /// Conventional layout under a single root directory.
    #[must_use]
    pub fn under(root: &Path) -> Self {
        Self {
            adapter_dir: root.join("adapters"),
            checkpoint_dir: root.join("checkpoints"),
            log_dir: root.join("logs"),
        }
    }
}

/// Full, resolved definition of a multi-phase fine-tuning job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJobSpec {
    pub job_id: TrainingJobId,
    pub created_at: DateTime<Utc>,
    pub base_model: ModelSpec,
    /// Directory holding `train.jsonl` (and usually `valid.jsonl`).
    pub data_dir: PathBuf,
    pub total_steps: u64,
    pub hyperparams: TrainingHyperParams,
    pub base_weights: RewardWeights,
    pub phases: Vec<Phase>,
    pub paths: TrainingPaths,
    #[serde(default)]
    pub trainer: TrainerSettings,
}

impl TrainingJobSpec {
    /// A single-phase job with default hyperparameters.
    #[must_use]
    pub fn new(
        job_id: TrainingJobId,
        base_model: ModelSpec,
        data_dir: PathBuf,
        total_steps: u64,
        paths: TrainingPaths,
    ) -> Self {
        Self {
            job_id,
            created_at: Utc::now(),
            base_model,
            data_dir,
            total_steps,
            hyperparams: TrainingHyperParams::default(),
            base_weights: RewardWeights::new(),
            phases: vec![Phase::new(0, total_steps)],
            paths,
            trainer: TrainerSettings::default(),
        }
    }

    #[must_use]
    pub fn train_data_path(&self) -> PathBuf {
        self.data_dir.join("train.jsonl")
    }

    pub fn phase_plan(&self) -> TrainingResult<PhasePlan> {
        PhasePlan::new(self.phases.clone(), self.total_steps)
    }

    /// Effective weights for every phase, in plan order.
    pub fn effective_weights(&self, plan: &PhasePlan) -> TrainingResult<Vec<RewardWeights>> {
        plan.phases().iter().map(|phase| mix(&self.base_weights, phase)).collect()
    }

    /// Validate everything that can be checked without touching the filesystem.
    pub fn validate(&self) -> TrainingResult<()> {
        self.job_id.validate()?;
        if self.base_model.path.as_os_str().is_empty() {
            return Err(TrainingError::config("job.base_model is required"));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(TrainingError::config("job.data_dir is required"));
        }
        if self.total_steps == 0 {
            return Err(TrainingError::config("total_steps must be >= 1"));
        }
        self.hyperparams.validate()?;
        self.trainer.validate()?;
        self.base_weights.validate()?;
        let plan = self.phase_plan()?;
        self.effective_weights(&plan)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Diagnostics retained when a job fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stderr_tail: Vec<String>,
}

impl FailureInfo {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self { message: message.into(), exit_code: None, stderr_tail: Vec::new() }
    }
}

impl From<&TrainingError> for FailureInfo {
    fn from(err: &TrainingError) -> Self {
        match err {
            TrainingError::ChildProcess { code, stderr_tail } => Self {
                message: err.to_string(),
                exit_code: *code,
                stderr_tail: stderr_tail.clone(),
            },
            other => Self::message(other.to_string()),
        }
    }
}

/// The job record. Written only by the scheduler; everyone else sees clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingJob {
    pub id: TrainingJobId,
    pub base_model: ModelSpec,
    pub total_steps: u64,
    pub current_step: u64,
    pub status: JobStatus,
    pub active_phase: usize,
    /// Number of trainer processes started for this record.
    pub launches: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
    pub updated_at: DateTime<Utc>,
}

impl TrainingJob {
    #[must_use]
    pub fn new(spec: &TrainingJobSpec) -> Self {
        Self {
            id: spec.job_id.clone(),
            base_model: spec.base_model.clone(),
            total_steps: spec.total_steps,
            current_step: 0,
            status: JobStatus::Pending,
            active_phase: 0,
            launches: 0,
            failure: None,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> TrainingJobSpec {
        let mut spec = TrainingJobSpec::new(
            TrainingJobId::new("job-1"),
            ModelSpec::new("/models/base"),
            PathBuf::from("data"),
            6000,
            TrainingPaths::under(Path::new("/tmp/out")),
        );
        spec.base_weights = RewardWeights::from([("precision", 2.0)]);
        spec
    }

    #[test]
    fn test_job_spec_validate_accepts_single_phase_default() {
        assert!(spec().validate().is_ok());
    }

    #[test]
    fn test_job_spec_validate_requires_id_and_model() {
        let mut bad = spec();
        bad.job_id = TrainingJobId::new("");
        assert!(bad.validate().is_err());

        let mut bad = spec();
        bad.job_id = TrainingJobId::new("../escape");
        assert!(bad.validate().is_err());

        let mut bad = spec();
        bad.base_model = ModelSpec::new("");
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_hyperparams_reject_malformed_values() {
        let mut bad = spec();
        bad.hyperparams.batch_size = 0;
        assert!(matches!(bad.validate(), Err(TrainingError::Configuration(_))));

        let mut bad = spec();
        bad.hyperparams.learning_rate = f64::NAN;
        assert!(bad.validate().is_err());

        let mut bad = spec();
        bad.total_steps = 0;
        bad.phases = vec![Phase::new(0, 0)];
        assert!(bad.validate().is_err());

        let mut bad = spec();
        bad.hyperparams.lora_dropout = Some(1.0);
        assert!(bad.validate().is_err());

        let mut bad = spec();
        bad.hyperparams.gradient_accumulation_steps = Some(0);
        assert!(bad.validate().is_err());

        let mut ok = spec();
        ok.hyperparams.lora_alpha = Some(256.0);
        ok.hyperparams.lora_dropout = Some(0.05);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_validate_catches_negative_effective_weight() {
        let mut bad = spec();
        bad.phases = vec![Phase::new(0, 6000).with_multiplier("precision", -1.0)];
        assert!(matches!(bad.validate(), Err(TrainingError::Configuration(_))));
    }

    #[test]
    fn test_failure_info_from_child_process_error() {
        let err = TrainingError::ChildProcess { code: Some(3), stderr_tail: vec!["boom".to_string()] };
        let info = FailureInfo::from(&err);
        assert_eq!(info.exit_code, Some(3));
        assert_eq!(info.stderr_tail, vec!["boom".to_string()]);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }
}

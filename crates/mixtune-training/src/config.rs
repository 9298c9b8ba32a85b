//! TOML job files.
//!
//! ```toml
//! [job]
//! id = "xundoc-v3"
//! base_model = "/models/qwen3-vl-30b"
//! data_dir = "data_mlx"
//! total_steps = 6000
//!
//! [weights]
//! precision = 2.0
//!
//! [[phases]]
//! start = 0
//! end = 6000
//! multipliers = { precision = 1.5 }
//! ```
//!
//! Relative paths are resolved against the directory holding the file.

use crate::coordinator::CoordinatorOptions;
use crate::error::{TrainingError, TrainingResult};
use crate::job::{ModelSpec, TrainingHyperParams, TrainingJobId, TrainingJobSpec, TrainingPaths};
use crate::phase::Phase;
use crate::trainer::TrainerSettings;
use crate::weights::RewardWeights;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub job: JobSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
    /// Empty means one phase spanning the whole job.
    #[serde(default)]
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub trainer: TrainerSettings,
    #[serde(default)]
    pub orchestration: OrchestrationSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSection {
    pub id: String,
    pub base_model: PathBuf,
    pub data_dir: PathBuf,
    pub total_steps: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_lora_rank")]
    pub lora_rank: u32,
    #[serde(default)]
    pub max_seq_length: Option<u32>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub lora_alpha: Option<f64>,
    #[serde(default)]
    pub lora_dropout: Option<f64>,
    #[serde(default)]
    pub warmup_steps: Option<u64>,
    #[serde(default)]
    pub gradient_accumulation_steps: Option<u32>,
}

fn default_batch_size() -> u32 {
    TrainingHyperParams::default().batch_size
}

fn default_learning_rate() -> f64 {
    TrainingHyperParams::default().learning_rate
}

fn default_lora_rank() -> u32 {
    TrainingHyperParams::default().lora_rank
}

fn default_seed() -> u64 {
    TrainingHyperParams::default().seed
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsSection {
    pub adapter_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    /// Per-run logs: `<log_dir>/<job_id>-run<NNN>.log`.
    pub log_dir: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        let paths = TrainingPaths::under(Path::new(""));
        Self {
            adapter_dir: paths.adapter_dir,
            checkpoint_dir: paths.checkpoint_dir,
            log_dir: paths.log_dir,
        }
    }
}

/// Coordinator timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestrationSettings {
    pub tick_ms: u64,
    pub checkpoint_every: u64,
    pub grace_period_secs: u64,
    pub stall_timeout_secs: u64,
}

impl Default for OrchestrationSettings {
    fn default() -> Self {
        Self { tick_ms: 1000, checkpoint_every: 500, grace_period_secs: 30, stall_timeout_secs: 900 }
    }
}

impl OrchestrationSettings {
    pub fn validate(&self) -> TrainingResult<()> {
        if self.tick_ms == 0 {
            return Err(TrainingError::config("orchestration.tick_ms must be >= 1"));
        }
        if self.checkpoint_every == 0 {
            return Err(TrainingError::config("orchestration.checkpoint_every must be >= 1"));
        }
        Ok(())
    }

    #[must_use]
    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            tick: Duration::from_millis(self.tick_ms),
            checkpoint_every: self.checkpoint_every,
            grace_period: Duration::from_secs(self.grace_period_secs),
            stall_timeout: Duration::from_secs(self.stall_timeout_secs),
        }
    }
}

impl JobConfig {
    pub fn from_toml_str(s: &str) -> TrainingResult<Self> {
        toml::from_str(s).map_err(|e| TrainingError::config(format!("invalid job file: {e}")))
    }

    /// Read `path` and resolve relative paths against its directory.
    pub fn load_from_file(path: &Path) -> TrainingResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = toml::from_str::<Self>(&content).map_err(|e| {
            TrainingError::config(format!("invalid job file {}: {e}", path.display()))
        })?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        for p in [
            &mut self.job.base_model,
            &mut self.job.data_dir,
            &mut self.paths.adapter_dir,
            &mut self.paths.checkpoint_dir,
            &mut self.paths.log_dir,
        ] {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        }
    }

    /// Build and validate the job definition.
    pub fn to_spec(&self) -> TrainingResult<TrainingJobSpec> {
        self.orchestration.validate()?;

        let job = &self.job;
        let phases = if self.phases.is_empty() {
            vec![Phase::new(0, job.total_steps)]
        } else {
            self.phases.clone()
        };

        let spec = TrainingJobSpec {
            job_id: TrainingJobId::new(job.id.clone()),
            created_at: Utc::now(),
            base_model: ModelSpec::new(job.base_model.clone()),
            data_dir: job.data_dir.clone(),
            total_steps: job.total_steps,
            hyperparams: TrainingHyperParams {
                seed: job.seed,
                learning_rate: job.learning_rate,
                batch_size: job.batch_size,
                lora_rank: job.lora_rank,
                max_seq_length: job.max_seq_length,
                lora_alpha: job.lora_alpha,
                lora_dropout: job.lora_dropout,
                warmup_steps: job.warmup_steps,
                gradient_accumulation_steps: job.gradient_accumulation_steps,
            },
            base_weights: RewardWeights::from(self.weights.clone()),
            phases,
            paths: TrainingPaths {
                adapter_dir: self.paths.adapter_dir.clone(),
                checkpoint_dir: self.paths.checkpoint_dir.clone(),
                log_dir: self.paths.log_dir.clone(),
            },
            trainer: self.trainer.clone(),
        };
        spec.validate()?;
        Ok(spec)
    }
}

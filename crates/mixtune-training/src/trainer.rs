//! The external trainer contract.
//!
//! A trainer is an opaque subprocess. The orchestrator only builds its command line,
//! reads its log output and observes its exit code.

use crate::error::{TrainingError, TrainingResult};
use crate::job::TrainingJobSpec;
use crate::weights::RewardWeights;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::process::Command;

/// How a trainer takes new reward weights at a phase boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconfigureMode {
    /// The trainer re-reads its weights file while running.
    Live,
    /// The trainer stops at the phase boundary and is launched again.
    #[default]
    Relaunch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainerCapabilities {
    pub live_reconfigure: bool,
}

/// Trainer section of a job file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerSettings {
    pub program: String,
    /// Arguments placed before the generated flags.
    pub args: Vec<String>,
    pub reconfigure: ReconfigureMode,
    pub save_every: u64,
    pub steps_per_report: u64,
    pub steps_per_eval: u64,
    /// Validation batches per evaluation; `-1` evaluates the whole validation set.
    pub val_batches: i32,
    /// Evaluate on `test.jsonl` once training finishes.
    pub test: bool,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            program: "mlx_lm.lora".to_string(),
            args: Vec::new(),
            reconfigure: ReconfigureMode::Relaunch,
            save_every: 200,
            steps_per_report: 20,
            steps_per_eval: 100,
            val_batches: 25,
            test: false,
        }
    }
}

impl TrainerSettings {
    pub fn validate(&self) -> TrainingResult<()> {
        if self.program.trim().is_empty() {
            return Err(TrainingError::config("trainer.program is required"));
        }
        if self.save_every == 0 || self.steps_per_report == 0 || self.steps_per_eval == 0 {
            return Err(TrainingError::config(
                "trainer.save_every, steps_per_report and steps_per_eval must be >= 1",
            ));
        }
        if self.val_batches == 0 || self.val_batches < -1 {
            return Err(TrainingError::config("trainer.val_batches must be >= 1 or -1"));
        }
        Ok(())
    }
}

/// Everything needed to start one trainer process.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub spec: &'a TrainingJobSpec,
    pub weights: &'a RewardWeights,
    pub weights_file: &'a Path,
    /// Absolute step to continue from, `None` for a fresh start.
    pub resume_from: Option<u64>,
    /// Step at which the trainer should exit early (relaunch boundary).
    pub stop_at: Option<u64>,
    pub resume_adapter: Option<&'a Path>,
}

pub trait Trainer: Send + Sync {
    fn id(&self) -> &str;

    fn capabilities(&self) -> TrainerCapabilities;

    /// Build the process command. Stdio is wired up by the supervisor.
    fn command(&self, invocation: &Invocation<'_>) -> Command;
}

/// A command-line trainer taking mlx-lm style flags.
#[derive(Debug, Clone)]
pub struct CliTrainer {
    settings: TrainerSettings,
}

impl CliTrainer {
    #[must_use]
    pub fn new(settings: TrainerSettings) -> Self {
        Self { settings }
    }

    #[must_use]
    pub fn from_spec(spec: &TrainingJobSpec) -> Self {
        Self::new(spec.trainer.clone())
    }

    #[must_use]
    pub fn settings(&self) -> &TrainerSettings {
        &self.settings
    }

    /// The full argument list after the program name.
    #[must_use]
    pub fn arguments(&self, invocation: &Invocation<'_>) -> Vec<String> {
        let spec = invocation.spec;
        let hp = &spec.hyperparams;
        let s = &self.settings;

        let mut args = s.args.clone();
        push_flag(&mut args, "model", spec.base_model.path.display());
        push_flag(&mut args, "data", spec.data_dir.display());
        args.push("--train".to_string());
        push_flag(&mut args, "iters", spec.total_steps);
        push_flag(&mut args, "batch-size", hp.batch_size);
        push_flag(&mut args, "learning-rate", hp.learning_rate);
        push_flag(&mut args, "lora-rank", hp.lora_rank);
        push_flag(&mut args, "adapter-path", spec.paths.adapter_dir.display());
        push_flag(&mut args, "save-every", s.save_every);
        push_flag(&mut args, "steps-per-report", s.steps_per_report);
        push_flag(&mut args, "steps-per-eval", s.steps_per_eval);
        push_flag(&mut args, "val-batches", s.val_batches);
        if s.test {
            args.push("--test".to_string());
        }
        push_flag(&mut args, "seed", hp.seed);
        if let Some(len) = hp.max_seq_length {
            push_flag(&mut args, "max-seq-length", len);
        }
        if let Some(alpha) = hp.lora_alpha {
            push_flag(&mut args, "lora-alpha", alpha);
        }
        if let Some(dropout) = hp.lora_dropout {
            push_flag(&mut args, "lora-dropout", dropout);
        }
        if let Some(warmup) = hp.warmup_steps {
            push_flag(&mut args, "warmup-steps", warmup);
        }
        if let Some(accum) = hp.gradient_accumulation_steps {
            push_flag(&mut args, "grad-accumulation-steps", accum);
        }
        push_flag(&mut args, "reward-weights", invocation.weights_file.display());
        for (name, value) in invocation.weights.iter() {
            push_flag(&mut args, &format!("{}-weight", name.replace('_', "-")), value);
        }
        if let Some(step) = invocation.resume_from {
            push_flag(&mut args, "resume-from-step", step);
        }
        if let Some(adapter) = invocation.resume_adapter {
            push_flag(&mut args, "resume-adapter-file", adapter.display());
        }
        if let Some(step) = invocation.stop_at {
            push_flag(&mut args, "stop-at-step", step);
        }
        args
    }
}

fn push_flag(args: &mut Vec<String>, name: &str, value: impl std::fmt::Display) {
    args.push(format!("--{name}"));
    args.push(value.to_string());
}

impl Trainer for CliTrainer {
    fn id(&self) -> &str {
        &self.settings.program
    }

    fn capabilities(&self) -> TrainerCapabilities {
        TrainerCapabilities { live_reconfigure: self.settings.reconfigure == ReconfigureMode::Live }
    }

    fn command(&self, invocation: &Invocation<'_>) -> Command {
        let mut cmd = Command::new(&self.settings.program);
        cmd.args(self.arguments(invocation));
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ModelSpec, TrainingJobId, TrainingPaths};
    use std::path::PathBuf;

    fn spec() -> TrainingJobSpec {
        let mut spec = TrainingJobSpec::new(
            TrainingJobId::new("job-1"),
            ModelSpec::new("/models/base"),
            PathBuf::from("/data"),
            1000,
            TrainingPaths::under(Path::new("/out")),
        );
        spec.base_weights = RewardWeights::from([("precision", 2.0), ("vision_acc", 1.5)]);
        spec
    }

    fn value_of(args: &[String], flag: &str) -> Option<String> {
        args.iter().position(|a| a == flag).map(|i| args[i + 1].clone())
    }

    #[test]
    fn test_arguments_carry_job_parameters_and_weights() {
        let spec = spec();
        let trainer = CliTrainer::from_spec(&spec);
        let weights = RewardWeights::from([("precision", 3.0), ("vision_acc", 1.5)]);
        let inv = Invocation {
            spec: &spec,
            weights: &weights,
            weights_file: Path::new("/out/w.json"),
            resume_from: None,
            stop_at: None,
            resume_adapter: None,
        };
        let args = trainer.arguments(&inv);

        assert_eq!(value_of(&args, "--model").as_deref(), Some("/models/base"));
        assert_eq!(value_of(&args, "--iters").as_deref(), Some("1000"));
        assert_eq!(value_of(&args, "--lora-rank").as_deref(), Some("128"));
        assert_eq!(value_of(&args, "--precision-weight").as_deref(), Some("3"));
        assert_eq!(value_of(&args, "--vision-acc-weight").as_deref(), Some("1.5"));
        assert_eq!(value_of(&args, "--reward-weights").as_deref(), Some("/out/w.json"));
        assert!(args.contains(&"--train".to_string()));
        assert!(!args.contains(&"--resume-from-step".to_string()));
        assert!(!args.contains(&"--stop-at-step".to_string()));
        assert_eq!(value_of(&args, "--val-batches").as_deref(), Some("25"));
        assert!(!args.contains(&"--test".to_string()));
        assert!(!args.contains(&"--lora-alpha".to_string()));
    }

    #[test]
    fn test_optional_lora_and_schedule_flags() {
        let mut spec = spec();
        spec.hyperparams.lora_alpha = Some(256.0);
        spec.hyperparams.lora_dropout = Some(0.05);
        spec.hyperparams.warmup_steps = Some(100);
        spec.hyperparams.gradient_accumulation_steps = Some(4);
        spec.trainer.test = true;
        spec.trainer.val_batches = -1;
        let trainer = CliTrainer::from_spec(&spec);
        let weights = RewardWeights::from([("precision", 2.0)]);
        let inv = Invocation {
            spec: &spec,
            weights: &weights,
            weights_file: Path::new("/out/w.json"),
            resume_from: None,
            stop_at: None,
            resume_adapter: None,
        };
        let args = trainer.arguments(&inv);

        assert_eq!(value_of(&args, "--lora-alpha").as_deref(), Some("256"));
        assert_eq!(value_of(&args, "--lora-dropout").as_deref(), Some("0.05"));
        assert_eq!(value_of(&args, "--warmup-steps").as_deref(), Some("100"));
        assert_eq!(value_of(&args, "--grad-accumulation-steps").as_deref(), Some("4"));
        assert_eq!(value_of(&args, "--val-batches").as_deref(), Some("-1"));
        assert!(args.contains(&"--test".to_string()));
    }

    #[test]
    fn test_arguments_for_resume_and_relaunch_boundary() {
        let mut spec = spec();
        spec.trainer.args = vec!["-m".to_string(), "trainer".to_string()];
        let trainer = CliTrainer::from_spec(&spec);
        let weights = RewardWeights::from([("precision", 2.0)]);
        let inv = Invocation {
            spec: &spec,
            weights: &weights,
            weights_file: Path::new("/out/w.json"),
            resume_from: Some(400),
            stop_at: Some(600),
            resume_adapter: Some(Path::new("/out/adapters/adapters.safetensors")),
        };
        let args = trainer.arguments(&inv);

        assert_eq!(&args[..2], &["-m".to_string(), "trainer".to_string()]);
        assert_eq!(value_of(&args, "--resume-from-step").as_deref(), Some("400"));
        assert_eq!(value_of(&args, "--stop-at-step").as_deref(), Some("600"));
        assert_eq!(
            value_of(&args, "--resume-adapter-file").as_deref(),
            Some("/out/adapters/adapters.safetensors")
        );
    }

    #[test]
    fn test_capabilities_follow_reconfigure_mode() {
        let mut settings = TrainerSettings::default();
        assert!(!CliTrainer::new(settings.clone()).capabilities().live_reconfigure);
        settings.reconfigure = ReconfigureMode::Live;
        assert!(CliTrainer::new(settings).capabilities().live_reconfigure);
    }

    #[test]
    fn test_settings_validate() {
        assert!(TrainerSettings::default().validate().is_ok());
        let bad = TrainerSettings { program: " ".to_string(), ..Default::default() };
        assert!(bad.validate().is_err());
        let bad = TrainerSettings { steps_per_report: 0, ..Default::default() };
        assert!(bad.validate().is_err());
        let bad = TrainerSettings { val_batches: 0, ..Default::default() };
        assert!(bad.validate().is_err());
    }
}

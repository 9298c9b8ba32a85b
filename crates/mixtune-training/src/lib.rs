//! Mixtune Training
//!
//! Orchestration for long-running, multi-phase fine-tuning jobs driven by an external
//! trainer process:
//! - Phase plans and reward-weight mixing (`PhasePlan`, `mix`)
//! - The job state machine (`PhaseScheduler`)
//! - Launching, polling and cancelling the trainer (`ProcessSupervisor`)
//! - Log-driven progress and ETA (`ProgressMonitor`)
//! - Checkpoints, resume and job artifacts (`CheckpointManager`, `TrainingManifest`)
//! - The control loop tying them together (`JobCoordinator`)

pub mod artifacts;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod job;
pub mod layout;
pub mod monitor;
pub mod phase;
pub mod progress;
pub mod registry;
pub mod scheduler;
pub mod supervisor;
pub mod trainer;
pub mod weights;

pub use artifacts::{ArtifactKind, MetricsRecord, TrainingArtifact, TrainingConfigRecord, TrainingManifest};
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use config::{JobConfig, OrchestrationSettings};
pub use coordinator::{CoordinatorOptions, JobCoordinator, JobSnapshot};
pub use error::{TrainingError, TrainingResult};
pub use job::{
    FailureInfo, JobStatus, ModelSpec, TrainingHyperParams, TrainingJob, TrainingJobId, TrainingJobSpec,
    TrainingPaths,
};
pub use layout::TrainingLayout;
pub use monitor::{parse_line, LogEvent, LogTail, Observation, ProgressMonitor, ProgressSnapshot};
pub use phase::{Phase, PhasePlan};
pub use progress::{format_eta, ProgressEvent, ProgressSink, StdoutProgressSink};
pub use registry::{discover_jobs, load_job, JobEntry};
pub use scheduler::{PhaseScheduler, Reconfiguration};
pub use supervisor::{PollStatus, ProcessHandle, ProcessSupervisor};
pub use trainer::{CliTrainer, Invocation, ReconfigureMode, Trainer, TrainerCapabilities, TrainerSettings};
pub use weights::{mix, RewardWeights};

//! Phase scheduling and the job state machine.
//!
//! The scheduler is the only writer of the [`TrainingJob`] record. Progress reports move
//! `current_step` forward, phase changes come back as [`Reconfiguration`] requests, and the
//! terminal transitions are guarded so nothing changes after the job has finished.

use crate::checkpoint::Checkpoint;
use crate::error::{TrainingError, TrainingResult};
use crate::job::{FailureInfo, JobStatus, TrainingJob, TrainingJobSpec};
use crate::phase::{Phase, PhasePlan};
use crate::weights::RewardWeights;
use chrono::Utc;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Request to apply new effective weights because the active phase changed.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconfiguration {
    /// Reported step that crossed the boundary.
    pub step: u64,
    pub from_phase: usize,
    pub to_phase: usize,
    pub weights: RewardWeights,
}

#[derive(Debug, Clone)]
pub struct PhaseScheduler {
    job: TrainingJob,
    plan: PhasePlan,
    /// Effective weights per phase, mixed once at creation.
    effective: Vec<RewardWeights>,
}

impl PhaseScheduler {
    /// Validate `spec` and create a Pending job. Nothing is created on error.
    pub fn new(spec: &TrainingJobSpec) -> TrainingResult<Self> {
        spec.validate()?;
        let plan = spec.phase_plan()?;
        let effective = spec.effective_weights(&plan)?;
        Ok(Self { job: TrainingJob::new(spec), plan, effective })
    }

    #[must_use]
    pub fn job(&self) -> &TrainingJob {
        &self.job
    }

    /// Read-only copy for other components.
    #[must_use]
    pub fn snapshot(&self) -> TrainingJob {
        self.job.clone()
    }

    #[must_use]
    pub fn into_job(self) -> TrainingJob {
        self.job
    }

    #[must_use]
    pub fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    #[must_use]
    pub fn phase_for(&self, step: u64) -> &Phase {
        self.plan.phase_for(step)
    }

    #[must_use]
    pub fn weights_for(&self, step: u64) -> &RewardWeights {
        &self.effective[self.plan.index_for(step)]
    }

    #[must_use]
    pub fn active_phase(&self) -> &Phase {
        &self.plan.phases()[self.job.active_phase]
    }

    #[must_use]
    pub fn current_weights(&self) -> &RewardWeights {
        &self.effective[self.job.active_phase]
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.job.status.is_terminal()
    }

    /// Record a reported step.
    ///
    /// Steps that do not move past `current_step` are ignored since reports may be
    /// re-delivered. Returns a reconfiguration when the step lands in a different phase.
    pub fn advance(&mut self, reported_step: u64) -> Option<Reconfiguration> {
        if self.is_terminal() || reported_step <= self.job.current_step {
            return None;
        }

        let total = self.job.total_steps;
        let step = if reported_step > total {
            warn!(job_id = %self.job.id, reported_step, total, "reported step beyond total_steps, clamping");
            total
        } else {
            reported_step
        };
        if step <= self.job.current_step {
            return None;
        }

        self.job.current_step = step;
        self.job.updated_at = Utc::now();

        let from_phase = self.job.active_phase;
        let to_phase = self.plan.index_for(step);
        if to_phase == from_phase {
            return None;
        }

        self.job.active_phase = to_phase;
        info!(
            job_id = %self.job.id,
            step,
            from = from_phase,
            to = to_phase,
            phase = %self.plan.phases()[to_phase].display_name(),
            "phase boundary crossed"
        );

        Some(Reconfiguration {
            step,
            from_phase,
            to_phase,
            weights: self.effective[to_phase].clone(),
        })
    }

    /// Rebuild progress from a checkpoint before the first launch.
    ///
    /// The active phase is recomputed from the job definition; the recorded
    /// `phase_index` only serves as a consistency check.
    pub fn restore(&mut self, checkpoint: &Checkpoint) -> TrainingResult<()> {
        if checkpoint.job_id != self.job.id {
            return Err(TrainingError::Checkpoint(format!(
                "checkpoint belongs to job {}, not {}",
                checkpoint.job_id, self.job.id
            )));
        }
        if self.job.status != JobStatus::Pending {
            return Err(TrainingError::Checkpoint(format!(
                "cannot restore a {} job",
                self.job.status
            )));
        }
        if checkpoint.step > self.job.total_steps {
            return Err(TrainingError::config(format!(
                "checkpoint step {} is beyond total_steps {}",
                checkpoint.step, self.job.total_steps
            )));
        }

        let phase = self.plan.index_for(checkpoint.step);
        if phase != checkpoint.phase_index {
            warn!(
                job_id = %self.job.id,
                recorded = checkpoint.phase_index,
                computed = phase,
                "checkpoint phase differs from job definition, using job definition"
            );
        }

        self.job.current_step = checkpoint.step;
        self.job.active_phase = phase;
        self.job.updated_at = Utc::now();
        debug!(job_id = %self.job.id, step = checkpoint.step, phase, "restored from checkpoint");
        Ok(())
    }

    /// Checkpoint record for the current state.
    #[must_use]
    pub fn checkpoint(&self, latest_metrics: BTreeMap<String, f64>) -> Checkpoint {
        Checkpoint {
            job_id: self.job.id.clone(),
            step: self.job.current_step,
            phase_index: self.job.active_phase,
            weights: self.current_weights().clone(),
            latest_metrics,
            best_val_loss: None,
            timestamp: Utc::now(),
        }
    }

    /// Count a successful trainer launch. The first one moves the job to Running.
    pub fn record_launch(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.job.launches += 1;
        if self.job.status == JobStatus::Pending {
            self.job.status = JobStatus::Running;
        }
        self.job.updated_at = Utc::now();
    }

    /// Completed requires every step to have been reported.
    pub fn complete(&mut self) -> bool {
        if self.is_terminal() || self.job.current_step != self.job.total_steps {
            return false;
        }
        self.finish(JobStatus::Completed);
        true
    }

    pub fn fail(&mut self, failure: FailureInfo) -> bool {
        if self.is_terminal() {
            return false;
        }
        warn!(job_id = %self.job.id, reason = %failure.message, "job failed");
        self.job.failure = Some(failure);
        self.finish(JobStatus::Failed);
        true
    }

    pub fn cancel(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.finish(JobStatus::Cancelled);
        true
    }

    fn finish(&mut self, status: JobStatus) {
        self.job.status = status;
        self.job.updated_at = Utc::now();
        info!(job_id = %self.job.id, step = self.job.current_step, %status, "job finished");
    }
}

//! The control loop.
//!
//! One task owns the scheduler, the monitor and the trainer handle. Each tick it waits for
//! the tick interval or cancellation, polls the trainer, drains new log lines into the
//! monitor, advances the scheduler, checkpoints when due and then acts on the poll result.
//! Readers follow along through a `watch` channel of [`JobSnapshot`] values.

use crate::artifacts::{build_manifest, read_json, write_json_atomic, TrainingConfigRecord};
use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::error::{TrainingError, TrainingResult};
use crate::job::{FailureInfo, JobStatus, TrainingJob, TrainingJobSpec};
use crate::layout::TrainingLayout;
use crate::monitor::{LogTail, ProgressMonitor, ProgressSnapshot};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::scheduler::{PhaseScheduler, Reconfiguration};
use crate::supervisor::{PollStatus, ProcessHandle, ProcessSupervisor};
use crate::trainer::Trainer;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorOptions {
    pub tick: Duration,
    /// Save a checkpoint each time progress crosses a multiple of this many steps.
    pub checkpoint_every: u64,
    pub grace_period: Duration,
    pub stall_timeout: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            checkpoint_every: 500,
            grace_period: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(900),
        }
    }
}

/// What readers of a running job see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job: TrainingJob,
    pub progress: ProgressSnapshot,
    pub stalled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TickAction {
    Continue,
    Cancel,
    ExitedOk,
    Fail(FailureInfo),
}

/// Cancellation wins over whatever the trainer did in the same tick.
pub(crate) fn resolve_tick(status: PollStatus, cancelled: bool) -> TickAction {
    if cancelled {
        return TickAction::Cancel;
    }
    match status {
        PollStatus::Running => TickAction::Continue,
        PollStatus::ExitedOk => TickAction::ExitedOk,
        PollStatus::ExitedError { code, stderr_tail } => {
            TickAction::Fail(FailureInfo::from(&TrainingError::ChildProcess { code, stderr_tail }))
        }
    }
}

pub struct JobCoordinator {
    spec: TrainingJobSpec,
    options: CoordinatorOptions,
    scheduler: PhaseScheduler,
    supervisor: ProcessSupervisor,
    checkpoints: CheckpointManager,
    monitor: ProgressMonitor,
    cancel: CancellationToken,
    status_tx: watch::Sender<JobSnapshot>,
    sink: Option<Arc<dyn ProgressSink>>,
    last_checkpoint_step: Option<u64>,
    stalled: bool,
}

impl std::fmt::Debug for JobCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCoordinator")
            .field("job", self.scheduler.job())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl JobCoordinator {
    /// Validates `spec`; nothing is written or launched on error.
    pub fn new(
        spec: TrainingJobSpec,
        trainer: Box<dyn Trainer>,
        options: CoordinatorOptions,
    ) -> TrainingResult<Self> {
        let scheduler = PhaseScheduler::new(&spec)?;
        let supervisor = ProcessSupervisor::new(spec.clone(), trainer)?;
        let checkpoints = CheckpointManager::new(TrainingLayout::new(&spec.paths));
        let monitor = ProgressMonitor::new(spec.total_steps);
        let (status_tx, _) = watch::channel(JobSnapshot {
            job: scheduler.snapshot(),
            progress: monitor.snapshot(),
            stalled: false,
        });

        Ok(Self {
            spec,
            options,
            scheduler,
            supervisor,
            checkpoints,
            monitor,
            cancel: CancellationToken::new(),
            status_tx,
            sink: None,
            last_checkpoint_step: None,
            stalled: false,
        })
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Cancelling this token stops the job with status Cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<JobSnapshot> {
        self.status_tx.subscribe()
    }

    #[must_use]
    pub fn job(&self) -> &TrainingJob {
        self.scheduler.job()
    }

    #[must_use]
    pub fn layout(&self) -> &TrainingLayout {
        self.checkpoints.layout()
    }

    /// Run the job from step 0.
    ///
    /// A launch failure (missing model, data or trainer program) is returned as an error
    /// and leaves the job Pending.
    pub async fn run(&mut self) -> TrainingResult<TrainingJob> {
        if self.scheduler.is_terminal() {
            return Ok(self.scheduler.snapshot());
        }
        self.write_training_config()?;
        if self.cancel.is_cancelled() {
            return self.cancel_before_launch();
        }

        let weights = self.scheduler.current_weights().clone();
        let handle = self.supervisor.launch(self.scheduler.job(), &weights)?;
        self.supervise(handle).await
    }

    /// Continue from the most recent checkpoint, or start fresh if there is none.
    pub async fn resume(&mut self) -> TrainingResult<TrainingJob> {
        let Some(checkpoint) = self.checkpoints.load(&self.spec.job_id)? else {
            info!(job_id = %self.spec.job_id, "no checkpoint found, starting from step 0");
            return self.run().await;
        };

        self.scheduler.restore(&checkpoint)?;
        self.monitor.resume_from(checkpoint.step);
        self.monitor.seed_best_val_loss(checkpoint.best_val_loss);
        self.last_checkpoint_step = Some(checkpoint.step);
        self.write_training_config()?;
        info!(job_id = %self.spec.job_id, step = checkpoint.step, "resuming from checkpoint");

        if checkpoint.step >= self.spec.total_steps {
            self.settle_at_total(&checkpoint);
            self.finish();
            return Ok(self.scheduler.snapshot());
        }
        if self.cancel.is_cancelled() {
            return self.cancel_before_launch();
        }

        let handle = self.supervisor.resume(self.scheduler.job(), &checkpoint)?;
        self.supervise(handle).await
    }

    /// Every step was reported before the last run ended. Only a recorded clean exit
    /// counts as completion; otherwise the earlier outcome stands and nothing is relaunched.
    fn settle_at_total(&mut self, checkpoint: &Checkpoint) {
        let layout = self.layout();
        let record = match read_json::<TrainingJob>(&layout.job_record_path(&self.spec.job_id)) {
            Ok(job) => Some(job),
            Err(err) => {
                debug!(job_id = %self.spec.job_id, error = %err, "no readable job record");
                None
            }
        };
        let completed = record.as_ref().map(|job| job.status) == Some(JobStatus::Completed)
            || layout.job_manifest_path(&self.spec.job_id).is_file();

        if completed {
            self.scheduler.complete();
            self.write_manifest(checkpoint.latest_metrics.clone());
            return;
        }

        let failure = record.and_then(|job| job.failure).unwrap_or_else(|| {
            FailureInfo::message(format!(
                "trainer reported step {} but no clean exit was recorded",
                checkpoint.step
            ))
        });
        self.scheduler.fail(failure);
    }

    fn cancel_before_launch(&mut self) -> TrainingResult<TrainingJob> {
        self.scheduler.cancel();
        self.save_checkpoint()?;
        self.finish();
        Ok(self.scheduler.snapshot())
    }

    async fn supervise(&mut self, handle: ProcessHandle) -> TrainingResult<TrainingJob> {
        if let Err(err) = self.drive(handle).await {
            self.scheduler.fail(FailureInfo::from(&err));
            if let Err(save_err) = self.save_checkpoint() {
                warn!(error = %save_err, "could not checkpoint failed job");
            }
            self.finish();
            return Err(err);
        }
        self.finish();
        Ok(self.scheduler.snapshot())
    }

    async fn drive(&mut self, mut handle: ProcessHandle) -> TrainingResult<()> {
        let mut tail = self.launched(&handle);
        let mut queued: Option<Reconfiguration> = None;

        loop {
            let mut cancelled = tokio::select! {
                () = self.cancel.cancelled() => true,
                () = tokio::time::sleep(self.options.tick) => false,
            };

            let status = self.supervisor.poll(&mut handle).await?;
            self.drain_log(&mut tail, &handle, status != PollStatus::Running, &mut queued).await?;
            self.checkpoint_if_due()?;
            self.check_stall(&status);
            self.publish();
            cancelled |= self.cancel.is_cancelled();

            match resolve_tick(status, cancelled) {
                TickAction::Continue => {}
                TickAction::Cancel => {
                    info!(job_id = %self.spec.job_id, "cancellation requested");
                    if let Err(err) = self.supervisor.cancel(&mut handle, self.options.grace_period).await {
                        warn!(job_id = %self.spec.job_id, error = %err, "failed to stop trainer");
                    }
                    self.scheduler.cancel();
                    self.save_checkpoint()?;
                    return Ok(());
                }
                TickAction::Fail(failure) => {
                    self.scheduler.fail(failure);
                    self.save_checkpoint()?;
                    return Ok(());
                }
                TickAction::ExitedOk => {
                    let job = self.scheduler.job();
                    let (step, total) = (job.current_step, job.total_steps);
                    if step >= total {
                        self.scheduler.complete();
                        self.save_checkpoint()?;
                        self.write_manifest(self.monitor.latest_metrics().clone());
                        return Ok(());
                    }

                    match handle.stop_at() {
                        Some(boundary) if step >= boundary => {
                            let weights = match queued.take() {
                                Some(reconf) => {
                                    debug!(to_phase = reconf.to_phase, "applying queued reconfiguration");
                                    reconf.weights
                                }
                                None => self.scheduler.current_weights().clone(),
                            };
                            self.emit(ProgressEvent::Message {
                                job_id: self.spec.job_id.clone(),
                                message: format!(
                                    "relaunching at step {step} for {}",
                                    self.scheduler.active_phase().display_name()
                                ),
                            });
                            match self.supervisor.launch(self.scheduler.job(), &weights) {
                                Ok(next) => {
                                    handle = next;
                                    tail = self.launched(&handle);
                                }
                                Err(err) => {
                                    warn!(job_id = %self.spec.job_id, error = %err, "relaunch failed");
                                    self.scheduler.fail(FailureInfo::from(&err));
                                    self.save_checkpoint()?;
                                    return Ok(());
                                }
                            }
                        }
                        boundary => {
                            let expected = boundary.unwrap_or(total);
                            self.scheduler.fail(FailureInfo::message(format!(
                                "trainer exited cleanly at step {step}, expected to reach {expected}"
                            )));
                            self.save_checkpoint()?;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Bookkeeping for a freshly started trainer. Returns the tail for its log.
    fn launched(&mut self, handle: &ProcessHandle) -> LogTail {
        self.scheduler.record_launch();
        self.persist_job_record();
        self.monitor.touch();
        self.stalled = false;
        self.emit(ProgressEvent::Started {
            job_id: self.spec.job_id.clone(),
            run: handle.run(),
            from_step: handle.start_step(),
        });
        self.publish();
        LogTail::new(handle.log_path())
    }

    async fn drain_log(
        &mut self,
        tail: &mut LogTail,
        handle: &ProcessHandle,
        exited: bool,
        queued: &mut Option<Reconfiguration>,
    ) -> TrainingResult<()> {
        let mut lines = tail.read_new_lines().await?;
        if exited {
            lines.extend(tail.take_partial());
        }

        let before = self.monitor.high_water();
        for event in self.monitor.on_lines(lines.as_slice(), Utc::now()) {
            if let Some(reconf) = self.scheduler.advance(event.iteration) {
                self.phase_changed(reconf, handle, queued)?;
            }
        }

        if self.monitor.high_water() > before {
            self.emit(ProgressEvent::Step {
                job_id: self.spec.job_id.clone(),
                snapshot: self.monitor.snapshot(),
            });
        }
        Ok(())
    }

    fn phase_changed(
        &mut self,
        reconf: Reconfiguration,
        handle: &ProcessHandle,
        queued: &mut Option<Reconfiguration>,
    ) -> TrainingResult<()> {
        self.emit(ProgressEvent::PhaseChanged {
            job_id: self.spec.job_id.clone(),
            step: reconf.step,
            from_phase: reconf.from_phase,
            to_phase: reconf.to_phase,
            label: self.scheduler.active_phase().display_name(),
        });

        if self.supervisor.live_reconfigure() {
            self.supervisor.reconfigure(handle, &reconf.weights)?;
        } else {
            debug!(step = reconf.step, to_phase = reconf.to_phase, "reconfiguration queued for relaunch");
            *queued = Some(reconf);
        }
        self.save_checkpoint()
    }

    fn checkpoint_if_due(&mut self) -> TrainingResult<()> {
        let step = self.scheduler.job().current_step;
        let every = self.options.checkpoint_every.max(1);
        let last = self.last_checkpoint_step.unwrap_or(0);
        if step > last && step / every > last / every {
            self.save_checkpoint()?;
        }
        Ok(())
    }

    fn save_checkpoint(&mut self) -> TrainingResult<()> {
        let mut checkpoint = self.scheduler.checkpoint(self.monitor.latest_metrics().clone());
        checkpoint.best_val_loss = self.monitor.best_val_loss();
        self.checkpoints.save(&checkpoint)?;
        self.last_checkpoint_step = Some(checkpoint.step);
        self.emit(ProgressEvent::Checkpointed {
            job_id: self.spec.job_id.clone(),
            step: checkpoint.step,
        });
        Ok(())
    }

    fn check_stall(&mut self, status: &PollStatus) {
        let stalled = *status == PollStatus::Running
            && self.monitor.is_stalled(Instant::now(), self.options.stall_timeout);
        if stalled && !self.stalled {
            warn!(
                job_id = %self.spec.job_id,
                step = self.monitor.high_water(),
                timeout_secs = self.options.stall_timeout.as_secs(),
                "no training progress within stall timeout"
            );
            self.emit(ProgressEvent::Message {
                job_id: self.spec.job_id.clone(),
                message: format!("stalled at step {}", self.monitor.high_water()),
            });
        }
        self.stalled = stalled;
    }

    fn write_training_config(&self) -> TrainingResult<()> {
        let record = TrainingConfigRecord::new(&self.spec, self.scheduler.plan())?;
        write_json_atomic(&self.layout().training_config_path(&self.spec.job_id), &record)
    }

    /// The job is already Completed at this point; a manifest failure does not undo that.
    fn write_manifest(&self, final_metrics: BTreeMap<String, f64>) {
        let layout = self.layout();
        let best_val_loss = self.monitor.best_val_loss();
        let result = build_manifest(layout, self.scheduler.job(), final_metrics, best_val_loss)
            .and_then(|manifest| write_json_atomic(&layout.job_manifest_path(&self.spec.job_id), &manifest));
        if let Err(err) = result {
            warn!(job_id = %self.spec.job_id, error = %err, "failed to write training manifest");
        }
    }

    /// Write failures are logged and otherwise ignored.
    fn persist_job_record(&self) {
        let path = self.layout().job_record_path(&self.spec.job_id);
        if let Err(err) = write_json_atomic(&path, self.scheduler.job()) {
            warn!(job_id = %self.spec.job_id, error = %err, "failed to write job record");
        }
    }

    fn finish(&mut self) {
        self.persist_job_record();
        let status = self.scheduler.job().status;
        self.emit(ProgressEvent::Finished { job_id: self.spec.job_id.clone(), status });
        self.publish();
    }

    fn publish(&self) {
        self.status_tx.send_replace(JobSnapshot {
            job: self.scheduler.snapshot(),
            progress: self.monitor.snapshot(),
            stalled: self.stalled,
        });
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(sink) = &self.sink {
            sink.on_event(event);
        }
    }
}

//! Launching and watching the external trainer process.

use crate::artifacts::write_json_atomic;
use crate::checkpoint::Checkpoint;
use crate::error::{TrainingError, TrainingResult};
use crate::job::{TrainingJob, TrainingJobSpec};
use crate::layout::TrainingLayout;
use crate::phase::PhasePlan;
use crate::trainer::{Invocation, Trainer};
use crate::weights::{mix, RewardWeights};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lines of trainer stderr kept for failure diagnostics.
pub const STDERR_TAIL_LINES: usize = 20;

/// Upper bound on waiting for the stderr pump after the trainer exited. A grandchild can
/// keep the pipe open.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Running,
    ExitedOk,
    /// `code` is `None` when the process died from a signal.
    ExitedError { code: Option<i32>, stderr_tail: Vec<String> },
}

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// A running (or exited) trainer process.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    run: u32,
    log_path: PathBuf,
    start_step: u64,
    stop_at: Option<u64>,
    stderr_tail: StderrTail,
    pump: Option<JoinHandle<()>>,
    exit: Option<PollStatus>,
}

impl ProcessHandle {
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Run number, also used in the log file name.
    #[must_use]
    pub fn run(&self) -> u32 {
        self.run
    }

    #[must_use]
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    #[must_use]
    pub fn start_step(&self) -> u64 {
        self.start_step
    }

    /// Relaunch boundary passed as `--stop-at-step`, if any.
    #[must_use]
    pub fn stop_at(&self) -> Option<u64> {
        self.stop_at
    }

    #[must_use]
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.lock().unwrap_or_else(PoisonError::into_inner).iter().cloned().collect()
    }

    async fn drain_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, pump).await.is_err() {
                warn!(pid = ?self.pid, "stderr pump still busy after trainer exit");
            }
        }
    }
}

pub struct ProcessSupervisor {
    spec: TrainingJobSpec,
    plan: PhasePlan,
    layout: TrainingLayout,
    trainer: Box<dyn Trainer>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("job_id", &self.spec.job_id)
            .field("trainer", &self.trainer.id())
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    pub fn new(spec: TrainingJobSpec, trainer: Box<dyn Trainer>) -> TrainingResult<Self> {
        let plan = spec.phase_plan()?;
        let layout = TrainingLayout::new(&spec.paths);
        Ok(Self { spec, plan, layout, trainer })
    }

    #[must_use]
    pub fn layout(&self) -> &TrainingLayout {
        &self.layout
    }

    #[must_use]
    pub fn live_reconfigure(&self) -> bool {
        self.trainer.capabilities().live_reconfigure
    }

    /// Base model and training data must exist before anything is spawned.
    pub fn check_dependencies(&self) -> TrainingResult<()> {
        if !self.spec.base_model.path.exists() {
            return Err(TrainingError::missing("base model", &self.spec.base_model.path));
        }
        let train = self.spec.train_data_path();
        if !train.is_file() {
            return Err(TrainingError::missing("training data", train));
        }
        Ok(())
    }

    /// Start the trainer at `job.current_step` with `weights`.
    pub fn launch(&self, job: &TrainingJob, weights: &RewardWeights) -> TrainingResult<ProcessHandle> {
        self.start(job.current_step, weights)
    }

    /// Start the trainer from `checkpoint`. Weights are recomputed for the checkpoint's
    /// step, never taken from the checkpoint itself.
    pub fn resume(&self, job: &TrainingJob, checkpoint: &Checkpoint) -> TrainingResult<ProcessHandle> {
        if checkpoint.job_id != job.id {
            return Err(TrainingError::Checkpoint(format!(
                "checkpoint belongs to job {}, not {}",
                checkpoint.job_id, job.id
            )));
        }
        if checkpoint.step >= job.total_steps {
            return Err(TrainingError::config(format!(
                "cannot resume at step {}: nothing left of {} total steps",
                checkpoint.step, job.total_steps
            )));
        }
        let weights = mix(&self.spec.base_weights, self.plan.phase_for(checkpoint.step))?;
        self.start(checkpoint.step, &weights)
    }

    fn start(&self, step: u64, weights: &RewardWeights) -> TrainingResult<ProcessHandle> {
        self.check_dependencies()?;

        let job_id = &self.spec.job_id;
        self.layout.ensure_job_dirs(job_id)?;
        let weights_file = self.layout.weights_file_path(job_id);
        write_json_atomic(&weights_file, weights)?;

        let resume_from = (step > 0).then_some(step);
        let adapter = self.layout.resume_adapter_path();
        let resume_adapter = (resume_from.is_some() && adapter.is_file()).then_some(adapter.as_path());
        let stop_at = if self.live_reconfigure() {
            None
        } else {
            let end = self.plan.phase_for(step).end;
            (end < self.spec.total_steps).then_some(end)
        };

        let invocation = Invocation {
            spec: &self.spec,
            weights,
            weights_file: &weights_file,
            resume_from,
            stop_at,
            resume_adapter,
        };

        let run = self.layout.next_run_index(job_id)?;
        let log_path = self.layout.log_path(job_id, run);
        let stdout = std::fs::OpenOptions::new().create(true).append(true).open(&log_path)?;

        let mut cmd = self.trainer.command(&invocation);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TrainingError::missing("trainer program", self.trainer.id())
            } else {
                TrainingError::Io(e)
            }
        })?;

        let pid = child.id();
        let stderr_tail: StderrTail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let pump = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(pump_stderr(stderr, log_path.clone(), Arc::clone(&stderr_tail))));

        info!(
            job_id = %job_id,
            trainer = self.trainer.id(),
            pid = ?pid,
            run,
            from_step = step,
            stop_at = ?stop_at,
            log = %log_path.display(),
            "trainer launched"
        );

        Ok(ProcessHandle {
            child,
            pid,
            run,
            log_path,
            start_step: step,
            stop_at,
            stderr_tail,
            pump,
            exit: None,
        })
    }

    /// Non-blocking liveness check. Does not decide job status.
    pub async fn poll(&self, handle: &mut ProcessHandle) -> TrainingResult<PollStatus> {
        if let Some(status) = &handle.exit {
            return Ok(status.clone());
        }
        let Some(status) = handle.child.try_wait()? else {
            return Ok(PollStatus::Running);
        };

        handle.drain_pump().await;
        let result = if status.success() {
            PollStatus::ExitedOk
        } else {
            PollStatus::ExitedError { code: status.code(), stderr_tail: handle.stderr_tail() }
        };
        debug!(pid = ?handle.pid, ?result, "trainer exited");
        handle.exit = Some(result.clone());
        Ok(result)
    }

    /// Ask the trainer to stop, then force it after `grace`.
    pub async fn cancel(&self, handle: &mut ProcessHandle, grace: Duration) -> TrainingResult<()> {
        if handle.exit.is_some() || handle.child.try_wait()?.is_some() {
            handle.drain_pump().await;
            return Ok(());
        }

        if terminate(handle.pid).await {
            match tokio::time::timeout(grace, handle.child.wait()).await {
                Ok(status) => {
                    let status = status?;
                    debug!(pid = ?handle.pid, %status, "trainer stopped");
                }
                Err(_) => {
                    warn!(pid = ?handle.pid, grace_secs = grace.as_secs(), "trainer ignored stop request, killing");
                    handle.child.kill().await?;
                }
            }
        } else {
            handle.child.kill().await?;
        }

        handle.drain_pump().await;
        handle.exit = Some(PollStatus::ExitedError { code: None, stderr_tail: handle.stderr_tail() });
        Ok(())
    }

    /// Hand new weights to a running trainer that re-reads its weights file.
    pub fn reconfigure(&self, handle: &ProcessHandle, weights: &RewardWeights) -> TrainingResult<()> {
        if !self.live_reconfigure() {
            return Err(TrainingError::config(format!(
                "trainer {} does not support live reconfiguration",
                self.trainer.id()
            )));
        }
        let path = self.layout.weights_file_path(&self.spec.job_id);
        write_json_atomic(&path, weights)?;
        info!(pid = ?handle.pid, weights = ?weights.as_map(), "reward weights updated in place");
        Ok(())
    }
}

/// Ask the trainer to shut down. `false` when the request could not be delivered and the
/// caller should kill outright.
async fn terminate(pid: Option<u32>) -> bool {
    let Some(pid) = pid else {
        return false;
    };
    let mut command = stop_command(pid);
    match command.output().await {
        Ok(out) if out.status.success() => {
            debug!(pid, "sent stop request");
            true
        }
        Ok(out) => {
            warn!(pid, stderr = %String::from_utf8_lossy(&out.stderr).trim(), "stop request failed");
            false
        }
        Err(e) => {
            warn!(pid, error = %e, "failed to send stop request");
            false
        }
    }
}

#[cfg(unix)]
fn stop_command(pid: u32) -> tokio::process::Command {
    let mut command = tokio::process::Command::new("kill");
    command.arg("-TERM").arg(pid.to_string());
    command
}

/// `taskkill` without `/F` posts a close request, the nearest thing to SIGTERM.
#[cfg(not(unix))]
fn stop_command(pid: u32) -> tokio::process::Command {
    let mut command = tokio::process::Command::new("taskkill");
    command.arg("/PID").arg(pid.to_string());
    command
}

/// Copy trainer stderr into the run log and the diagnostic tail.
async fn pump_stderr(stderr: ChildStderr, log_path: PathBuf, tail: StderrTail) {
    let mut log = match tokio::fs::OpenOptions::new().create(true).append(true).open(&log_path).await {
        Ok(f) => Some(f),
        Err(e) => {
            warn!(log = %log_path.display(), error = %e, "cannot open log for stderr");
            None
        }
    };

    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "stderr read failed");
                break;
            }
        }

        if let Some(file) = log.as_mut() {
            if !buf.ends_with(b"\n") {
                buf.push(b'\n');
            }
            let written = match file.write_all(&buf).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                warn!(error = %e, "stderr copy to log failed");
                log = None;
            }
        }

        let line = String::from_utf8_lossy(&buf).trim_end().to_string();
        let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::job::{ModelSpec, TrainingJobId, TrainingPaths};
    use crate::phase::Phase;
    use crate::trainer::{CliTrainer, ReconfigureMode, TrainerSettings};
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        spec: TrainingJobSpec,
    }

    fn fixture(script: &str, reconfigure: ReconfigureMode) -> Fixture {
        let temp = TempDir::new().unwrap();
        let model = temp.path().join("model");
        let data = temp.path().join("data");
        std::fs::create_dir_all(&model).unwrap();
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("train.jsonl"), "{}\n").unwrap();

        let mut spec = TrainingJobSpec::new(
            TrainingJobId::new("sup"),
            ModelSpec::new(model),
            data,
            400,
            TrainingPaths::under(&temp.path().join("out")),
        );
        spec.base_weights = RewardWeights::from([("precision", 2.0)]);
        spec.phases = vec![
            Phase::new(0, 200).with_multiplier("precision", 1.5),
            Phase::new(200, 400),
        ];
        spec.trainer = TrainerSettings {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "trainer".to_string()],
            reconfigure,
            ..TrainerSettings::default()
        };
        Fixture { _temp: temp, spec }
    }

    fn supervisor(spec: &TrainingJobSpec) -> ProcessSupervisor {
        ProcessSupervisor::new(spec.clone(), Box::new(CliTrainer::from_spec(spec))).unwrap()
    }

    async fn wait_exit(sup: &ProcessSupervisor, handle: &mut ProcessHandle) -> PollStatus {
        for _ in 0..500 {
            let status = sup.poll(handle).await.unwrap();
            if status != PollStatus::Running {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("trainer did not exit");
    }

    #[tokio::test]
    async fn test_launch_refuses_missing_training_data() {
        let fx = fixture("exit 0", ReconfigureMode::Relaunch);
        std::fs::remove_file(fx.spec.train_data_path()).unwrap();
        let sup = supervisor(&fx.spec);
        let err = sup.launch(&TrainingJob::new(&fx.spec), &fx.spec.base_weights).unwrap_err();
        assert!(matches!(err, TrainingError::MissingDependency { ref what, .. } if what == "training data"));
        assert!(!sup.layout().log_path(&fx.spec.job_id, 1).exists(), "nothing was spawned");
    }

    #[tokio::test]
    async fn test_launch_refuses_missing_base_model() {
        let mut fx = fixture("exit 0", ReconfigureMode::Relaunch);
        fx.spec.base_model = ModelSpec::new(fx.spec.data_dir.join("no-such-model"));
        let sup = supervisor(&fx.spec);
        let err = sup.launch(&TrainingJob::new(&fx.spec), &fx.spec.base_weights).unwrap_err();
        assert!(matches!(err, TrainingError::MissingDependency { ref what, .. } if what == "base model"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_reports_stderr_tail() {
        let script = r#"i=0; while [ $i -lt 25 ]; do echo "warn $i" >&2; i=$((i+1)); done; echo "Traceback: boom" >&2; exit 3"#;
        let fx = fixture(script, ReconfigureMode::Relaunch);
        let sup = supervisor(&fx.spec);
        let mut handle = sup.launch(&TrainingJob::new(&fx.spec), &fx.spec.base_weights).unwrap();

        let PollStatus::ExitedError { code, stderr_tail } = wait_exit(&sup, &mut handle).await else {
            panic!("expected an error exit");
        };
        assert_eq!(code, Some(3));
        assert_eq!(stderr_tail.len(), STDERR_TAIL_LINES);
        assert_eq!(stderr_tail.last().map(String::as_str), Some("Traceback: boom"));

        let log = std::fs::read_to_string(handle.log_path()).unwrap();
        assert!(log.contains("warn 0"));
        assert!(log.contains("Traceback: boom"));
    }

    #[tokio::test]
    async fn test_stdout_lands_in_run_log_and_weights_file_is_written() {
        let script = r#"echo "Iter 10: Train loss 1.0"; exit 0"#;
        let fx = fixture(script, ReconfigureMode::Relaunch);
        let sup = supervisor(&fx.spec);
        let mut handle = sup.launch(&TrainingJob::new(&fx.spec), &sup.spec.base_weights).unwrap();
        assert_eq!(handle.stop_at(), Some(200));
        assert_eq!(wait_exit(&sup, &mut handle).await, PollStatus::ExitedOk);

        assert!(handle.log_path().ends_with("sup-run001.log"));
        let log = std::fs::read_to_string(handle.log_path()).unwrap();
        assert!(log.contains("Iter 10: Train loss 1.0"));
        let weights: RewardWeights = crate::artifacts::read_json(
            &sup.layout().weights_file_path(&fx.spec.job_id),
        )
        .unwrap();
        assert_eq!(weights.get("precision"), Some(2.0));
    }

    #[tokio::test]
    async fn test_cancel_terminates_sleeping_trainer() {
        let fx = fixture("sleep 30", ReconfigureMode::Relaunch);
        let sup = supervisor(&fx.spec);
        let mut handle = sup.launch(&TrainingJob::new(&fx.spec), &fx.spec.base_weights).unwrap();
        assert_eq!(sup.poll(&mut handle).await.unwrap(), PollStatus::Running);

        let started = std::time::Instant::now();
        sup.cancel(&mut handle, Duration::from_secs(5)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(sup.poll(&mut handle).await.unwrap(), PollStatus::ExitedError { code: None, .. }));
    }

    #[tokio::test]
    async fn test_cancel_kills_trainer_that_ignores_stop_request() {
        let fx = fixture("trap '' TERM; exec sleep 30", ReconfigureMode::Relaunch);
        let sup = supervisor(&fx.spec);
        let mut handle = sup.launch(&TrainingJob::new(&fx.spec), &fx.spec.base_weights).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        sup.cancel(&mut handle, Duration::from_millis(200)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(sup.poll(&mut handle).await.unwrap(), PollStatus::ExitedError { .. }));
    }

    #[test]
    fn test_stop_command_targets_pid() {
        let command = stop_command(4242);
        let args: Vec<_> = command.as_std().get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(command.as_std().get_program(), "kill");
        assert_eq!(args, vec!["-TERM", "4242"]);
    }

    #[tokio::test]
    async fn test_resume_recomputes_weights_and_passes_step() {
        let script = r#"echo "$@"; exit 0"#;
        let fx = fixture(script, ReconfigureMode::Live);
        let sup = supervisor(&fx.spec);
        let job = TrainingJob::new(&fx.spec);
        let checkpoint = Checkpoint {
            job_id: fx.spec.job_id.clone(),
            step: 100,
            phase_index: 0,
            weights: RewardWeights::from([("precision", 99.0)]),
            latest_metrics: Default::default(),
            best_val_loss: None,
            timestamp: chrono::Utc::now(),
        };

        let mut handle = sup.resume(&job, &checkpoint).unwrap();
        assert_eq!(handle.stop_at(), None);
        assert_eq!(wait_exit(&sup, &mut handle).await, PollStatus::ExitedOk);
        let log = std::fs::read_to_string(handle.log_path()).unwrap();
        assert!(log.contains("--resume-from-step 100"));
        assert!(log.contains("--precision-weight 3"));

        let done = Checkpoint { step: 400, ..checkpoint };
        assert!(matches!(sup.resume(&job, &done), Err(TrainingError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_reconfigure_requires_live_trainer() {
        let fx = fixture("sleep 1", ReconfigureMode::Relaunch);
        let sup = supervisor(&fx.spec);
        let mut handle = sup.launch(&TrainingJob::new(&fx.spec), &fx.spec.base_weights).unwrap();
        assert!(sup.reconfigure(&handle, &fx.spec.base_weights).is_err());
        sup.cancel(&mut handle, Duration::from_secs(2)).await.unwrap();
    }
}

use crate::job::{JobStatus, TrainingJobId};
use crate::monitor::ProgressSnapshot;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { job_id: TrainingJobId, run: u32, from_step: u64 },
    Message { job_id: TrainingJobId, message: String },
    Step { job_id: TrainingJobId, snapshot: ProgressSnapshot },
    PhaseChanged { job_id: TrainingJobId, step: u64, from_phase: usize, to_phase: usize, label: String },
    Checkpointed { job_id: TrainingJobId, step: u64 },
    Finished { job_id: TrainingJobId, status: JobStatus },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

#[derive(Debug, Default)]
pub struct StdoutProgressSink;

impl ProgressSink for StdoutProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { job_id, run, from_step } => {
                println!("[train:{job_id}] run {run} started at step {from_step}");
            }
            ProgressEvent::Message { job_id, message } => println!("[train:{job_id}] {message}"),
            ProgressEvent::Step { job_id, snapshot } => {
                let mut line = format!(
                    "[train:{job_id}] step {}/{} ({:.1}%)",
                    snapshot.current_iter, snapshot.total_iters, snapshot.percent_complete
                );
                if let Some(loss) = snapshot.last_loss {
                    line.push_str(&format!(" loss {loss:.4}"));
                }
                if let Some(eta) = snapshot.estimated_seconds_remaining {
                    line.push_str(&format!(" eta {}", format_eta(eta)));
                }
                println!("{line}");
            }
            ProgressEvent::PhaseChanged { job_id, step, from_phase, to_phase, label } => {
                println!("[train:{job_id}] step {step}: phase {from_phase} -> {to_phase} ({label})");
            }
            ProgressEvent::Checkpointed { job_id, step } => {
                println!("[train:{job_id}] checkpoint saved at step {step}");
            }
            ProgressEvent::Finished { job_id, status } => println!("[train:{job_id}] {status}"),
        }
    }
}

/// `3725.0` -> `1h02m05s`.
#[must_use]
pub fn format_eta(secs: f64) -> String {
    let secs = secs.max(0.0).round() as u64;
    let (h, m, s) = (secs / 3600, secs % 3600 / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m:02}m{s:02}s")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(3725.0), "1h02m05s");
        assert_eq!(format_eta(61.4), "1m01s");
        assert_eq!(format_eta(6.0), "6s");
        assert_eq!(format_eta(-3.0), "0s");
    }
}

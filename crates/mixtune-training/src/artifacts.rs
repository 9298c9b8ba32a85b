use crate::error::{TrainingError, TrainingResult};
use crate::job::{JobStatus, ModelSpec, TrainingJob, TrainingJobId, TrainingJobSpec};
use crate::layout::TrainingLayout;
use crate::phase::PhasePlan;
use crate::weights::RewardWeights;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Adapter,
    Config,
    Metrics,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub sha256: String,
}

/// One phase of `training_config.json`, with the weights the trainer actually receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub start: u64,
    pub end: u64,
    pub weights: RewardWeights,
}

/// Resolved configuration for a run, written to `training_config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfigRecord {
    pub written_at: DateTime<Utc>,
    pub spec: TrainingJobSpec,
    pub phases: Vec<PhaseSummary>,
}

impl TrainingConfigRecord {
    pub fn new(spec: &TrainingJobSpec, plan: &PhasePlan) -> TrainingResult<Self> {
        let weights = spec.effective_weights(plan)?;
        let phases = plan
            .phases()
            .iter()
            .zip(weights)
            .map(|(phase, weights)| PhaseSummary {
                index: phase.index,
                label: phase.label.clone(),
                start: phase.start,
                end: phase.end,
                weights,
            })
            .collect();
        Ok(Self { written_at: Utc::now(), spec: spec.clone(), phases })
    }
}

/// One entry of `metrics_history.json`, appended per checkpoint save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub step: u64,
    pub phase_index: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_val_loss: Option<f64>,
}

/// Written on completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingManifest {
    pub job_id: TrainingJobId,
    pub completed_at: DateTime<Utc>,
    pub base_model: ModelSpec,
    pub total_steps: u64,
    pub launches: u32,
    #[serde(default)]
    pub final_metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_val_loss: Option<f64>,
    pub artifacts: Vec<TrainingArtifact>,
}

pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

pub fn make_artifact(kind: ArtifactKind, path: PathBuf) -> TrainingResult<TrainingArtifact> {
    if !path.exists() {
        return Err(TrainingError::Checkpoint(format!(
            "artifact path does not exist: {}",
            path.display()
        )));
    }

    let hash = sha256_file(&path)?;
    Ok(TrainingArtifact { kind, path, sha256: hash })
}

/// Write pretty JSON through a temp file and rename, so readers never see half a file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> TrainingResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> TrainingResult<T> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn read_metrics_history(path: &Path) -> TrainingResult<Vec<MetricsRecord>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Insert `record`, replacing any record for the same step. Keeps step order.
pub fn upsert_metrics_history(path: &Path, record: MetricsRecord) -> TrainingResult<()> {
    let mut history = read_metrics_history(path)?;
    history.retain(|r| r.step != record.step);
    let at = history.partition_point(|r| r.step < record.step);
    history.insert(at, record);
    write_json_atomic(path, &history)
}

/// Every file the trainer left in the adapter directory.
pub fn collect_adapter_artifacts(adapter_dir: &Path) -> TrainingResult<Vec<TrainingArtifact>> {
    if !adapter_dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in WalkDir::new(adapter_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| TrainingError::Other(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        out.push(make_artifact(ArtifactKind::Adapter, entry.into_path())?);
    }
    Ok(out)
}

pub fn build_manifest(
    layout: &TrainingLayout,
    job: &TrainingJob,
    final_metrics: BTreeMap<String, f64>,
    best_val_loss: Option<f64>,
) -> TrainingResult<TrainingManifest> {
    if job.status != JobStatus::Completed {
        return Err(TrainingError::Checkpoint(format!(
            "manifest requested for a {} job",
            job.status
        )));
    }

    let mut artifacts = collect_adapter_artifacts(layout.adapter_dir())?;
    for (kind, path) in [
        (ArtifactKind::Config, layout.training_config_path(&job.id)),
        (ArtifactKind::Metrics, layout.metrics_history_path(&job.id)),
    ] {
        if path.exists() {
            artifacts.push(make_artifact(kind, path)?);
        }
    }

    Ok(TrainingManifest {
        job_id: job.id.clone(),
        completed_at: Utc::now(),
        base_model: job.base_model.clone(),
        total_steps: job.total_steps,
        launches: job.launches,
        final_metrics,
        best_val_loss,
        artifacts,
    })
}

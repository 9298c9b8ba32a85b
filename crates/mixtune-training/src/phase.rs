//! Training phases and the validated phase plan.

use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A half-open step range `[start, end)` with its own reward-weight emphasis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    /// Position in the plan; assigned by [`PhasePlan::new`].
    #[serde(default)]
    pub index: usize,
    pub start: u64,
    pub end: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Values that replace the base weight outright.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<String, f64>,
    /// Factors applied to the base weight.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub multipliers: BTreeMap<String, f64>,
}

impl Phase {
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            index: 0,
            start,
            end,
            label: None,
            overrides: BTreeMap::new(),
            multipliers: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[must_use]
    pub fn with_multiplier(mut self, name: impl Into<String>, factor: f64) -> Self {
        self.multipliers.insert(name.into(), factor);
        self
    }

    #[must_use]
    pub fn with_override(mut self, name: impl Into<String>, value: f64) -> Self {
        self.overrides.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn contains(&self, step: u64) -> bool {
        self.start <= step && step < self.end
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `phase 2 (precision core)` style name for logs and errors.
    #[must_use]
    pub fn display_name(&self) -> String {
        match &self.label {
            Some(label) => format!("phase {} ({label})", self.index),
            None => format!("phase {}", self.index),
        }
    }
}

/// Ordered phases covering `[0, total_steps)` exactly once per step.
#[derive(Debug, Clone, PartialEq)]
pub struct PhasePlan {
    phases: Vec<Phase>,
    total_steps: u64,
}

impl PhasePlan {
    /// Validate and index `phases`.
    ///
    /// Phases must be sorted by `start`, begin at step 0, be non-empty and contiguous, and
    /// the last one must end at `total_steps`.
    pub fn new(mut phases: Vec<Phase>, total_steps: u64) -> TrainingResult<Self> {
        if total_steps == 0 {
            return Err(TrainingError::config("total_steps must be >= 1"));
        }
        if phases.is_empty() {
            return Err(TrainingError::config("at least one phase is required"));
        }

        for (i, phase) in phases.iter_mut().enumerate() {
            phase.index = i;
        }

        for pair in phases.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if next.start < prev.start {
                return Err(TrainingError::config(format!(
                    "phases must be sorted by start: {} starts at {} after {} starting at {}",
                    next.display_name(),
                    next.start,
                    prev.display_name(),
                    prev.start
                )));
            }
        }

        let first = &phases[0];
        if first.start != 0 {
            return Err(TrainingError::config(format!(
                "{} starts at {}, the first phase must start at step 0",
                first.display_name(),
                first.start
            )));
        }

        for phase in &phases {
            if phase.is_empty() {
                return Err(TrainingError::config(format!(
                    "{} has an empty range [{}, {})",
                    phase.display_name(),
                    phase.start,
                    phase.end
                )));
            }
        }

        for pair in phases.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if next.start > prev.end {
                return Err(TrainingError::config(format!(
                    "gap between {} ending at {} and {} starting at {}",
                    prev.display_name(),
                    prev.end,
                    next.display_name(),
                    next.start
                )));
            }
            if next.start < prev.end {
                return Err(TrainingError::config(format!(
                    "{} overlaps {}: starts at {} before {}",
                    next.display_name(),
                    prev.display_name(),
                    next.start,
                    prev.end
                )));
            }
        }

        let last = &phases[phases.len() - 1];
        if last.end != total_steps {
            return Err(TrainingError::config(format!(
                "{} ends at {}, but total_steps is {total_steps}",
                last.display_name(),
                last.end
            )));
        }

        Ok(Self { phases, total_steps })
    }

    #[must_use]
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    #[must_use]
    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Phase> {
        self.phases.get(index)
    }

    /// Index of the phase owning `step`. Steps at or past `total_steps` belong to the last
    /// phase.
    #[must_use]
    pub fn index_for(&self, step: u64) -> usize {
        self.phases.partition_point(|p| p.end <= step).min(self.phases.len() - 1)
    }

    #[must_use]
    pub fn phase_for(&self, step: u64) -> &Phase {
        &self.phases[self.index_for(step)]
    }
}

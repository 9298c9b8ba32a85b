//! Reward weights and the per-phase weight mixer.

use crate::error::{TrainingError, TrainingResult};
use crate::phase::Phase;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named scalar weights (precision, vision, empathy, ...), ordered by name.
///
/// Every value is finite and non-negative once [`RewardWeights::validate`] has passed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RewardWeights(BTreeMap<String, f64>);

impl RewardWeights {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn as_map(&self) -> &BTreeMap<String, f64> {
        &self.0
    }

    pub fn validate(&self) -> TrainingResult<()> {
        for (name, value) in &self.0 {
            validate_name(name)?;
            validate_value(name, *value, "weight")?;
        }
        Ok(())
    }
}

impl FromIterator<(String, f64)> for RewardWeights {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<BTreeMap<String, f64>> for RewardWeights {
    fn from(map: BTreeMap<String, f64>) -> Self {
        Self(map)
    }
}

impl<const N: usize> From<[(&str, f64); N]> for RewardWeights {
    fn from(pairs: [(&str, f64); N]) -> Self {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }
}

/// Weight names end up in trainer flags (`--<name>-weight`), so keep them flag-safe.
fn validate_name(name: &str) -> TrainingResult<()> {
    let ok = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !ok {
        return Err(TrainingError::config(format!(
            "invalid weight name {name:?}: use ascii letters, digits, '_' or '-'"
        )));
    }
    Ok(())
}

fn validate_value(name: &str, value: f64, what: &str) -> TrainingResult<()> {
    if !value.is_finite() {
        return Err(TrainingError::config(format!("{what} {name:?} must be finite, got {value}")));
    }
    if value < 0.0 {
        return Err(TrainingError::config(format!("{what} {name:?} must be >= 0, got {value}")));
    }
    Ok(())
}

/// Compute the effective weights for `phase`.
///
/// Multipliers scale the base value, overrides replace it; when a phase names the same
/// weight in both, the override wins. A multiplier for a weight missing from `base` is
/// rejected, an override may introduce a new weight.
pub fn mix(base: &RewardWeights, phase: &Phase) -> TrainingResult<RewardWeights> {
    let mut out = base.0.clone();

    for (name, multiplier) in &phase.multipliers {
        if phase.overrides.contains_key(name) {
            continue;
        }
        let value = base.get(name).ok_or_else(|| {
            TrainingError::config(format!(
                "{} multiplies weight {name:?}, which has no base value",
                phase.display_name()
            ))
        })?;
        out.insert(name.clone(), value * multiplier);
    }

    for (name, value) in &phase.overrides {
        out.insert(name.clone(), *value);
    }

    for (name, value) in &mut out {
        validate_name(name)?;
        validate_value(name, *value, &format!("{} effective weight", phase.display_name()))?;
        // -0.0 from a zero base times a negative multiplier
        if value.is_sign_negative() {
            *value = 0.0;
        }
    }

    Ok(RewardWeights(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> RewardWeights {
        RewardWeights::from([("precision", 2.0), ("vision", 1.5), ("empathy", 1.0)])
    }

    #[test]
    fn test_multiplier_scales_base() {
        let phase = Phase::new(0, 10).with_multiplier("precision", 1.5);
        let mixed = mix(&base(), &phase).unwrap();
        assert_eq!(mixed.get("precision"), Some(3.0));
        assert_eq!(mixed.get("vision"), Some(1.5));
    }

    #[test]
    fn test_override_wins_over_multiplier() {
        let phase = Phase::new(0, 10).with_multiplier("empathy", 3.0).with_override("empathy", 0.25);
        let mixed = mix(&base(), &phase).unwrap();
        assert_eq!(mixed.get("empathy"), Some(0.25));
    }

    #[test]
    fn test_override_may_add_new_weight() {
        let phase = Phase::new(0, 10).with_override("safety", 0.5);
        let mixed = mix(&base(), &phase).unwrap();
        assert_eq!(mixed.get("safety"), Some(0.5));
        assert_eq!(mixed.len(), 4);
    }

    #[test]
    fn test_multiplier_for_unknown_weight_is_rejected() {
        let phase = Phase::new(0, 10).with_multiplier("safety", 2.0);
        let err = mix(&base(), &phase).unwrap_err();
        assert!(matches!(err, TrainingError::Configuration(_)));
    }

    #[test]
    fn test_negative_result_is_configuration_error() {
        let phase = Phase::new(0, 10).with_multiplier("vision", -1.0);
        assert!(matches!(mix(&base(), &phase), Err(TrainingError::Configuration(_))));

        let phase = Phase::new(0, 10).with_override("vision", -0.1);
        assert!(matches!(mix(&base(), &phase), Err(TrainingError::Configuration(_))));
    }

    #[test]
    fn test_zero_base_with_negative_multiplier_is_plain_zero() {
        let base = RewardWeights::from([("vision", 0.0)]);
        let phase = Phase::new(0, 10).with_multiplier("vision", -2.0);
        let mixed = mix(&base, &phase).unwrap();
        assert!(mixed.get("vision").unwrap().is_sign_positive());
    }

    #[test]
    fn test_mix_is_idempotent() {
        let phase = Phase::new(0, 10)
            .with_multiplier("precision", 1.3)
            .with_override("empathy", 0.7);
        let first = mix(&base(), &phase).unwrap();
        let second = mix(&base(), &phase).unwrap();
        assert_eq!(first, second);
        // mixing never touches the inputs
        assert_eq!(base().get("precision"), Some(2.0));
    }

    #[test]
    fn test_validate_rejects_bad_names_and_values() {
        assert!(RewardWeights::from([("has space", 1.0)]).validate().is_err());
        assert!(RewardWeights::from([("nan", f64::NAN)]).validate().is_err());
        assert!(RewardWeights::from([("neg", -1.0)]).validate().is_err());
        assert!(base().validate().is_ok());
    }
}

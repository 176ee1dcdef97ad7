//! Performance-driven ensemble weights.
//!
//! Each trained match scores every model's pre-match distribution with the
//! Brier score.  Once a model has enough samples its weight drifts toward its
//! base weight scaled by skill relative to a uniform forecaster, moving at
//! most `max_shift` per update and staying inside `[min_weight, max_weight]`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use super::EnsembleWeights;

/// Brier score of the uniform three-way forecast.
const UNIFORM_BRIER: f64 = 2.0 / 3.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightPolicy {
    pub min_weight: f64,
    pub max_weight: f64,
    pub max_shift: f64,
    pub min_samples: u64,
}

impl Default for WeightPolicy {
    fn default() -> Self {
        WeightPolicy {
            min_weight: 0.02,
            max_weight: 0.6,
            max_shift: 0.05,
            min_samples: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelTrack {
    pub samples: u64,
    pub brier_sum: f64,
}

impl ModelTrack {
    pub fn mean_brier(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.brier_sum / self.samples as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightState {
    pub base: EnsembleWeights,
    pub current: EnsembleWeights,
    pub tracks: BTreeMap<String, ModelTrack>,
}

#[derive(Debug, Clone)]
pub struct AdaptiveWeights {
    policy: WeightPolicy,
    enabled: bool,
    state: WeightState,
}

impl AdaptiveWeights {
    pub fn new(base: EnsembleWeights, policy: WeightPolicy, enabled: bool) -> Self {
        AdaptiveWeights {
            policy,
            enabled,
            state: WeightState {
                current: base.clone(),
                base,
                tracks: BTreeMap::new(),
            },
        }
    }

    pub fn current(&self) -> &EnsembleWeights {
        &self.state.current
    }

    pub fn tracks(&self) -> &BTreeMap<String, ModelTrack> {
        &self.state.tracks
    }

    /// Record one scored forecast and, if enabled, adjust that model's weight.
    pub fn record(&mut self, model: &str, brier: f64) {
        if !brier.is_finite() {
            return;
        }
        let track = self.state.tracks.entry(model.to_string()).or_default();
        track.samples += 1;
        track.brier_sum += brier;

        if !self.enabled || track.samples < self.policy.min_samples {
            return;
        }
        let Some(mean) = track.mean_brier() else {
            return;
        };

        let base = self.state.base.get(model).unwrap_or(self.policy.min_weight);
        let skill = (1.0 - mean / 2.0) / (1.0 - UNIFORM_BRIER / 2.0);
        let target = (base * skill).clamp(self.policy.min_weight, self.policy.max_weight);

        let current = self.state.current.get(model).unwrap_or(base);
        let shift = (target - current).clamp(-self.policy.max_shift, self.policy.max_shift);
        let next = (current + shift).clamp(self.policy.min_weight, self.policy.max_weight);

        debug!(
            "Weight {}: {:.3} → {:.3} (mean Brier {:.3}, target {:.3})",
            model, current, next, mean, target
        );
        self.state.current.0.insert(model.to_string(), next);
    }

    pub fn snapshot(&self) -> WeightState {
        self.state.clone()
    }

    /// Adopt persisted tracking data.  Base weights stay as configured.
    pub fn restore(&mut self, state: WeightState) {
        let mut current = state.current;
        current.0.retain(|_, w| w.is_finite() && *w >= 0.0);
        self.state.current = current;
        self.state.tracks = state.tracks;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn weights(enabled: bool) -> AdaptiveWeights {
        AdaptiveWeights::new(EnsembleWeights::default(), WeightPolicy::default(), enabled)
    }

    #[test]
    fn test_no_change_before_min_samples() {
        let mut w = weights(true);
        for _ in 0..9 {
            w.record("elo", 0.1);
        }
        assert_eq!(w.current().get("elo"), Some(0.20));
        assert_eq!(w.tracks()["elo"].samples, 9);
    }

    #[test]
    fn test_good_model_gains_weight_with_bounded_shift() {
        let mut w = weights(true);
        for _ in 0..10 {
            w.record("elo", 0.1);
        }
        let after = w.current().get("elo").unwrap();
        assert_relative_eq!(after, 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_bad_model_loses_weight_but_stays_above_floor() {
        let mut w = weights(true);
        for _ in 0..200 {
            w.record("neural_net", 1.9);
        }
        let after = w.current().get("neural_net").unwrap();
        assert!(after < 0.05);
        assert!(after >= WeightPolicy::default().min_weight);
    }

    #[test]
    fn test_disabled_only_tracks() {
        let mut w = weights(false);
        for _ in 0..50 {
            w.record("elo", 0.0);
        }
        assert_eq!(w.current().get("elo"), Some(0.20));
        assert_relative_eq!(w.tracks()["elo"].mean_brier().unwrap(), 0.0);
    }

    #[test]
    fn test_restore_keeps_tracks() {
        let mut w = weights(true);
        for _ in 0..12 {
            w.record("poisson", 0.3);
        }
        let mut other = weights(true);
        other.restore(w.snapshot());
        assert_eq!(other.current(), w.current());
        assert_eq!(other.tracks()["poisson"].samples, 12);
    }
}

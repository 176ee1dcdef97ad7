//! Confidence calibration and hit-rate tracking.
//!
//! Raw ensemble confidence is binned; once enough matches have been scored,
//! a prediction's confidence is pulled toward the observed hit rate of its
//! bin.  Until then it is shaded down by a constant factor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::features::{safe_div, Side};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPolicy {
    pub bins: usize,
    /// Scored matches needed before the curve is used at all.
    pub min_total_samples: u64,
    /// Scored matches a bin needs before it adjusts anything.
    pub min_bin_samples: u64,
    /// Multiplier applied while the curve is still cold.
    pub cold_start_factor: f64,
    /// Share of the calibrated value taken from the bin's hit rate.
    pub smoothing: f64,
    pub max_confidence: f64,
}

impl Default for CalibrationPolicy {
    fn default() -> Self {
        CalibrationPolicy {
            bins: 10,
            min_total_samples: 30,
            min_bin_samples: 5,
            cold_start_factor: 0.95,
            smoothing: 0.7,
            max_confidence: 0.95,
        }
    }
}

/// Correct-winner counts for one forecaster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HitRate {
    pub samples: u64,
    pub correct: u64,
}

impl HitRate {
    fn record(&mut self, correct: bool) {
        self.samples += 1;
        if correct {
            self.correct += 1;
        }
    }

    pub fn accuracy(&self) -> Option<f64> {
        (self.samples > 0).then(|| safe_div(self.correct as f64, self.samples as f64, 0.0))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBin {
    pub samples: u64,
    pub confidence_sum: f64,
    pub correct: u64,
}

impl CalibrationBin {
    pub fn hit_rate(&self) -> f64 {
        safe_div(self.correct as f64, self.samples as f64, 0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationState {
    pub bins: Vec<CalibrationBin>,
    pub ensemble: HitRate,
    pub models: BTreeMap<String, HitRate>,
}

/// Per-model and ensemble hit rates as reported by health.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccuracyReport {
    pub ensemble: HitRate,
    pub ensemble_accuracy: Option<f64>,
    pub models: BTreeMap<String, HitRate>,
    pub calibrated: bool,
}

#[derive(Debug, Clone)]
pub struct ConfidenceCalibrator {
    policy: CalibrationPolicy,
    state: CalibrationState,
}

impl ConfidenceCalibrator {
    pub fn new(policy: CalibrationPolicy) -> Self {
        let bins = vec![CalibrationBin::default(); policy.bins.max(1)];
        ConfidenceCalibrator {
            policy,
            state: CalibrationState {
                bins,
                ensemble: HitRate::default(),
                models: BTreeMap::new(),
            },
        }
    }

    fn bin_index(&self, confidence: f64) -> usize {
        let n = self.state.bins.len();
        let c = if confidence.is_finite() { confidence.clamp(0.0, 1.0) } else { 0.0 };
        ((c * n as f64) as usize).min(n - 1)
    }

    fn warm(&self) -> bool {
        self.state.ensemble.samples >= self.policy.min_total_samples
    }

    /// Map a raw ensemble confidence to a calibrated one in [0, 1].
    pub fn calibrate(&self, raw: f64) -> f64 {
        let raw = if raw.is_finite() { raw.clamp(0.0, 1.0) } else { 0.0 };
        if !self.warm() {
            return raw * self.policy.cold_start_factor;
        }
        let bin = &self.state.bins[self.bin_index(raw)];
        if bin.samples < self.policy.min_bin_samples {
            return raw;
        }
        let s = self.policy.smoothing.clamp(0.0, 1.0);
        (s * bin.hit_rate() + (1.0 - s) * raw).clamp(0.0, self.policy.max_confidence)
    }

    /// Record whether the ensemble called the winner, at the raw confidence
    /// it did so with.
    pub fn record_ensemble(&mut self, raw_confidence: f64, predicted: Side, actual: Side) {
        if !raw_confidence.is_finite() {
            return;
        }
        let correct = predicted == actual;
        let idx = self.bin_index(raw_confidence);
        let bin = &mut self.state.bins[idx];
        bin.samples += 1;
        bin.confidence_sum += raw_confidence.clamp(0.0, 1.0);
        if correct {
            bin.correct += 1;
        }
        self.state.ensemble.record(correct);
        debug!(
            "Calibration bin {} now {}/{} correct",
            idx, self.state.bins[idx].correct, self.state.bins[idx].samples
        );
    }

    pub fn record_model(&mut self, model: &str, predicted: Side, actual: Side) {
        self.state
            .models
            .entry(model.to_string())
            .or_default()
            .record(predicted == actual);
    }

    pub fn report(&self) -> AccuracyReport {
        AccuracyReport {
            ensemble: self.state.ensemble,
            ensemble_accuracy: self.state.ensemble.accuracy(),
            models: self.state.models.clone(),
            calibrated: self.warm(),
        }
    }

    pub fn snapshot(&self) -> CalibrationState {
        self.state.clone()
    }

    /// Adopt a persisted curve.  A curve with a different bin count is
    /// ignored, hit rates are kept either way.
    pub fn restore(&mut self, state: CalibrationState) {
        if state.bins.len() == self.state.bins.len()
            && state.bins.iter().all(|b| b.correct <= b.samples && b.confidence_sum.is_finite())
        {
            self.state.bins = state.bins;
        }
        self.state.ensemble = state.ensemble;
        self.state.models = state.models;
    }
}

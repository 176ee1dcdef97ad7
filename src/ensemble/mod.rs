//! Blending of per-model outputs into one prediction.

pub mod calibration;
pub mod weights;

pub use calibration::{AccuracyReport, CalibrationPolicy, ConfidenceCalibrator};
pub use weights::{AdaptiveWeights, WeightPolicy};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::features::{FeatureVector, Side};
use crate::models::OutcomeDistribution;

/// Model name → raw weight.  Normalised over the active models at blend time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleWeights(pub BTreeMap<String, f64>);

impl Default for EnsembleWeights {
    fn default() -> Self {
        EnsembleWeights(BTreeMap::from([
            ("statistical".to_string(), 0.35),
            ("elo".to_string(), 0.20),
            ("poisson".to_string(), 0.15),
            ("bayesian".to_string(), 0.15),
            ("monte_carlo".to_string(), 0.10),
            ("neural_net".to_string(), 0.05),
        ]))
    }
}

impl EnsembleWeights {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied().filter(|w| w.is_finite() && *w >= 0.0)
    }

    /// Weights for `names`, summing to 1.  A model without a configured
    /// weight gets the mean of the others; all-zero falls back to equal.
    pub fn normalized_for(&self, names: &[&str]) -> Vec<f64> {
        if names.is_empty() {
            return Vec::new();
        }
        let known: Vec<f64> = names.iter().filter_map(|n| self.get(n)).collect();
        let fill = if known.is_empty() {
            1.0
        } else {
            known.iter().sum::<f64>() / known.len() as f64
        };
        let raw: Vec<f64> = names.iter().map(|n| self.get(n).unwrap_or(fill)).collect();
        let total: f64 = raw.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            return vec![1.0 / names.len() as f64; names.len()];
        }
        raw.iter().map(|w| w / total).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlendPolicy {
    /// Home and away win probabilities closer than this count as a tie,
    /// which goes to the home side.
    pub tie_epsilon: f64,
}

impl Default for BlendPolicy {
    fn default() -> Self {
        BlendPolicy { tie_epsilon: 1e-9 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOutput {
    pub name: String,
    pub distribution: OutcomeDistribution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelContribution {
    pub name: String,
    /// Normalised weight used in the blend.
    pub weight: f64,
    #[serde(flatten)]
    pub distribution: OutcomeDistribution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictedScore {
    pub home: u32,
    pub away: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Blend {
    pub p_home_win: f64,
    pub p_away_win: f64,
    pub p_other: f64,
    pub confidence: f64,
    pub expected_home_goals: f64,
    pub expected_away_goals: f64,
    pub winner: Side,
    pub score: PredictedScore,
    pub contributions: Vec<ModelContribution>,
}

/// Blend active model outputs.  Returns `None` when no model is active.
pub fn blend(
    outputs: &[ModelOutput],
    weights: &EnsembleWeights,
    data_quality: f64,
    policy: &BlendPolicy,
) -> Option<Blend> {
    if outputs.is_empty() {
        return None;
    }
    let names: Vec<&str> = outputs.iter().map(|o| o.name.as_str()).collect();
    let w = weights.normalized_for(&names);

    let weighted = |f: fn(&OutcomeDistribution) -> f64| -> f64 {
        outputs.iter().zip(&w).map(|(o, w)| w * f(&o.distribution)).sum()
    };
    let mut probs = [
        weighted(|d| d.p_home_win),
        weighted(|d| d.p_away_win),
        weighted(|d| d.p_other),
    ];
    let expected_home_goals = weighted(|d| d.expected_home_goals).max(0.0);
    let expected_away_goals = weighted(|d| d.expected_away_goals).max(0.0);
    let raw_confidence = weighted(|d| d.confidence);

    for (label, p) in ["home", "away", "other"].iter().zip(probs.iter_mut()) {
        if !(0.0..=1.0).contains(p) {
            warn!("Blend anomaly: p_{} = {} clamped to [0, 1]", label, p);
            *p = p.clamp(0.0, 1.0);
        }
    }
    let total: f64 = probs.iter().sum();
    let probs = if total > 0.0 {
        probs.map(|p| p / total)
    } else {
        warn!("Blend anomaly: probabilities sum to zero, using uniform");
        [1.0 / 3.0; 3]
    };

    // Weighted spread of home-win probability across models.
    let spread = outputs
        .iter()
        .zip(&w)
        .map(|(o, w)| w * (o.distribution.p_home_win - probs[0]).powi(2))
        .sum::<f64>()
        .sqrt();
    let agreement = 1.0 - (spread / 0.25).min(1.0);
    let quality = data_quality.clamp(0.0, 1.0);
    let confidence =
        (raw_confidence.clamp(0.0, 1.0) * (0.5 + 0.5 * agreement) * (0.5 + 0.5 * quality)).clamp(0.0, 1.0);

    let winner = favoured_side(probs[0], probs[1], policy.tie_epsilon);

    let contributions = outputs
        .iter()
        .zip(&w)
        .map(|(o, w)| ModelContribution {
            name: o.name.clone(),
            weight: *w,
            distribution: o.distribution,
        })
        .collect();

    Some(Blend {
        p_home_win: probs[0],
        p_away_win: probs[1],
        p_other: probs[2],
        confidence,
        expected_home_goals,
        expected_away_goals,
        winner,
        score: predicted_score(expected_home_goals, expected_away_goals, winner),
        contributions,
    })
}

/// The side a forecast picks; within `tie_epsilon` the home side.
pub fn favoured_side(p_home: f64, p_away: f64, tie_epsilon: f64) -> Side {
    if p_away > p_home + tie_epsilon {
        Side::Away
    } else {
        Side::Home
    }
}

/// Rounded expected goals, nudged so the predicted winner is ahead.
pub fn predicted_score(home_goals: f64, away_goals: f64, winner: Side) -> PredictedScore {
    let round = |g: f64| if g.is_finite() { g.round().clamp(0.0, 20.0) as u32 } else { 0 };
    let (mut home, mut away) = (round(home_goals), round(away_goals));
    match winner {
        Side::Home if home <= away => home = away + 1,
        Side::Away if away <= home => away = home + 1,
        _ => {}
    }
    PredictedScore { home, away }
}

// ── Prediction ────────────────────────────────────────────────────────────────

/// A complete, immutable forecast for one match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub match_id: String,
    pub generated_at: DateTime<Utc>,
    pub home_team: String,
    pub away_team: String,
    pub predicted_winner: String,
    pub winner_side: Side,
    pub predicted_score: PredictedScore,
    pub p_home_win: f64,
    pub p_away_win: f64,
    pub p_other: f64,
    pub confidence: f64,
    pub data_quality: f64,
    pub models: Vec<ModelContribution>,
    pub features: FeatureVector,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub degraded: bool,
}

/// Identity and timing of the match being forecast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRequest {
    pub match_id: String,
    pub home_team: String,
    pub away_team: String,
    pub date: chrono::NaiveDate,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Prediction {
    pub fn from_blend(
        request: &MatchRequest,
        blend: Blend,
        data_quality: f64,
        features: FeatureVector,
    ) -> Self {
        let predicted_winner = match blend.winner {
            Side::Home => request.home_team.clone(),
            Side::Away => request.away_team.clone(),
        };
        Prediction {
            match_id: request.match_id.clone(),
            generated_at: Utc::now(),
            home_team: request.home_team.clone(),
            away_team: request.away_team.clone(),
            predicted_winner,
            winner_side: blend.winner,
            predicted_score: blend.score,
            p_home_win: blend.p_home_win,
            p_away_win: blend.p_away_win,
            p_other: blend.p_other,
            confidence: blend.confidence,
            data_quality: data_quality.clamp(0.0, 1.0),
            models: blend.contributions,
            features,
            scheduled_at: request.scheduled_at,
            degraded: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn equal<'a>(names: impl IntoIterator<Item = &'a str>) -> EnsembleWeights {
        EnsembleWeights(names.into_iter().map(|n| (n.to_string(), 1.0)).collect())
    }

    fn output(name: &str, p_home: f64, confidence: f64) -> ModelOutput {
        let p_other = 0.2;
        ModelOutput {
            name: name.into(),
            distribution: OutcomeDistribution {
                p_home_win: p_home * (1.0 - p_other),
                p_away_win: (1.0 - p_home) * (1.0 - p_other),
                p_other,
                expected_home_goals: 3.0,
                expected_away_goals: 2.5,
                confidence,
            },
        }
    }

    #[test]
    fn test_equal_weights_average() {
        let outputs = vec![
            ModelOutput {
                name: "a".into(),
                distribution: OutcomeDistribution {
                    p_home_win: 0.6,
                    p_away_win: 0.3,
                    p_other: 0.1,
                    expected_home_goals: 3.0,
                    expected_away_goals: 2.0,
                    confidence: 0.5,
                },
            },
            ModelOutput {
                name: "b".into(),
                distribution: OutcomeDistribution {
                    p_home_win: 0.7,
                    p_away_win: 0.2,
                    p_other: 0.1,
                    expected_home_goals: 3.0,
                    expected_away_goals: 2.0,
                    confidence: 0.5,
                },
            },
            ModelOutput {
                name: "c".into(),
                distribution: OutcomeDistribution {
                    p_home_win: 0.5,
                    p_away_win: 0.4,
                    p_other: 0.1,
                    expected_home_goals: 3.0,
                    expected_away_goals: 2.0,
                    confidence: 0.5,
                },
            },
        ];
        let weights = equal(["a", "b", "c"]);
        let b = blend(&outputs, &weights, 1.0, &BlendPolicy::default()).unwrap();
        assert_relative_eq!(b.p_home_win, 0.6, epsilon = 1e-12);
        assert_relative_eq!(b.p_away_win, 0.3, epsilon = 1e-12);
        assert_eq!(b.winner, Side::Home);
    }

    #[test]
    fn test_probabilities_sum_to_one_for_any_subset() {
        let all = vec![
            output("statistical", 0.62, 0.4),
            output("elo", 0.55, 0.3),
            output("poisson", 0.48, 0.2),
            output("neural_net", 0.71, 0.6),
        ];
        let weights = EnsembleWeights::default();
        for mask in 1u32..(1 << all.len()) {
            let subset: Vec<_> = all
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, o)| o.clone())
                .collect();
            let b = blend(&subset, &weights, 0.5, &BlendPolicy::default()).unwrap();
            assert_relative_eq!(b.p_home_win + b.p_away_win + b.p_other, 1.0, epsilon = 1e-9);
            let w: f64 = b.contributions.iter().map(|c| c.weight).sum();
            assert_relative_eq!(w, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_no_models_no_blend() {
        assert!(blend(&[], &EnsembleWeights::default(), 1.0, &BlendPolicy::default()).is_none());
    }

    #[test]
    fn test_tie_goes_to_home() {
        let outputs = vec![output("elo", 0.5, 0.3)];
        let b = blend(&outputs, &EnsembleWeights::default(), 1.0, &BlendPolicy { tie_epsilon: 0.01 }).unwrap();
        assert_eq!(b.winner, Side::Home);
        assert!(b.score.home > b.score.away);
    }

    #[test]
    fn test_disagreement_and_quality_lower_confidence() {
        let agree = vec![output("a", 0.6, 0.5), output("b", 0.6, 0.5)];
        let disagree = vec![output("a", 0.9, 0.5), output("b", 0.3, 0.5)];
        let w = equal(["a", "b"]);
        let p = BlendPolicy::default();
        let c_agree = blend(&agree, &w, 1.0, &p).unwrap().confidence;
        let c_disagree = blend(&disagree, &w, 1.0, &p).unwrap().confidence;
        let c_low_quality = blend(&agree, &w, 0.0, &p).unwrap().confidence;
        assert_relative_eq!(c_agree, 0.5, epsilon = 1e-12);
        assert!(c_disagree < c_agree);
        assert_relative_eq!(c_low_quality, 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_out_of_range_inputs_are_clamped() {
        let mut bad = output("a", 0.6, 0.5);
        bad.distribution.p_home_win = 1.4;
        bad.distribution.p_away_win = -0.2;
        let b = blend(&[bad], &equal(["a"]), 1.0, &BlendPolicy::default()).unwrap();
        for p in [b.p_home_win, b.p_away_win, b.p_other] {
            assert!((0.0..=1.0).contains(&p));
        }
        assert_relative_eq!(b.p_home_win + b.p_away_win + b.p_other, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_missing_weight_uses_mean_of_known() {
        let w = EnsembleWeights(BTreeMap::from([("a".to_string(), 0.2), ("b".to_string(), 0.4)]));
        let n = w.normalized_for(&["a", "b", "new"]);
        assert_relative_eq!(n[2], 0.3 / 0.9, epsilon = 1e-12);
    }

    #[test]
    fn test_all_zero_weights_fall_back_to_equal() {
        let w = EnsembleWeights(BTreeMap::from([("a".to_string(), 0.0), ("b".to_string(), 0.0)]));
        assert_eq!(w.normalized_for(&["a", "b"]), vec![0.5, 0.5]);
    }

    #[test]
    fn test_predicted_score_respects_winner() {
        assert_eq!(predicted_score(2.6, 2.9, Side::Home), PredictedScore { home: 4, away: 3 });
        assert_eq!(predicted_score(3.4, 1.2, Side::Home), PredictedScore { home: 3, away: 1 });
        assert_eq!(predicted_score(2.0, 2.0, Side::Away), PredictedScore { home: 2, away: 3 });
    }
}

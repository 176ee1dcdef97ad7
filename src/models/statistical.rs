use super::{
    decisiveness, three_way, MatchFeatures, MatchResult, ModelKind, ModelState, ModelSummary,
    OutcomeDistribution, PredictionModel,
};
use crate::error::{EngineError, Result};
use crate::features::{FeatureVector, Field, Side};

/// (field, weight) pairs; each contributes `weight * (home - away) / scale`.
const WEIGHTS: [(Field, f64); 8] = [
    (Field::WinPct, 0.30),
    (Field::PointsPct, 0.15),
    (Field::FormWinPct, 0.15),
    (Field::FormGoalDiff, 0.10),
    (Field::GoalieSavePct, 0.10),
    (Field::LineupStrength, 0.10),
    (Field::MarketImpliedProb, 0.05),
    (Field::MatchupWinPct, 0.05),
];

const HOME_BIAS: f64 = 0.15;
const SLOPE: f64 = 4.0;

/// Closed-form baseline: a weighted sum of home-minus-away differences
/// through a logistic link.
#[derive(Clone)]
pub struct StatisticalModel {
    tie_share: f64,
}

impl StatisticalModel {
    pub fn new(tie_share: f64) -> Self {
        StatisticalModel { tie_share }
    }

    fn score(&self, f: &FeatureVector) -> f64 {
        let diff = |field: Field| f.get(field, Side::Home) - f.get(field, Side::Away);
        let mut s: f64 = WEIGHTS
            .iter()
            .map(|(field, w)| match field {
                // Save percentages differ in the third decimal.
                Field::GoalieSavePct => w * diff(*field) * 20.0,
                _ => w * diff(*field) / field.scale(),
            })
            .sum();
        // Goal differential per game from standings.
        let gd_home = f.get(Field::GoalsForPerGame, Side::Home) - f.get(Field::GoalsAgainstPerGame, Side::Home);
        let gd_away = f.get(Field::GoalsForPerGame, Side::Away) - f.get(Field::GoalsAgainstPerGame, Side::Away);
        s += 0.1 * (gd_home - gd_away) / 2.0;
        s -= 0.05 * diff(Field::InjuryImpact);
        s
    }
}

impl PredictionModel for StatisticalModel {
    fn name(&self) -> &str {
        "statistical"
    }

    fn kind(&self) -> ModelKind {
        ModelKind::Statistical
    }

    fn predict(&self, m: &MatchFeatures) -> Result<OutcomeDistribution> {
        let f = &m.features;
        let z = SLOPE * self.score(f) + HOME_BIAS;
        let p = 1.0 / (1.0 + (-z).exp());
        let [p_home_win, p_away_win, p_other] = three_way(p, self.tie_share);

        let expected = |side: Side| {
            let opp = side.opposite();
            0.5 * (f.get(Field::GoalsForPerGame, side) + f.get(Field::GoalsAgainstPerGame, opp))
        };

        Ok(OutcomeDistribution {
            p_home_win,
            p_away_win,
            p_other,
            expected_home_goals: expected(Side::Home).max(0.0),
            expected_away_goals: expected(Side::Away).max(0.0),
            confidence: 0.7 * decisiveness(p_home_win, p_away_win),
        })
    }

    fn update(&mut self, _result: &MatchResult, _features: &MatchFeatures) -> Result<()> {
        Ok(())
    }

    fn snapshot(&self) -> ModelState {
        ModelState::Stateless
    }

    fn restore(&mut self, state: ModelState) -> Result<()> {
        match state {
            ModelState::Stateless => Ok(()),
            other => Err(EngineError::corrupt(
                "statistical",
                format!("stateless model cannot take {} state", other.kind_name()),
            )),
        }
    }

    fn summary(&self) -> ModelSummary {
        let weights: serde_json::Map<String, serde_json::Value> = WEIGHTS
            .iter()
            .map(|(f, w)| (format!("{:?}", f), serde_json::json!(w)))
            .collect();
        ModelSummary {
            name: self.name().to_string(),
            kind: self.kind(),
            trained_matches: 0,
            details: serde_json::json!({ "weights": weights, "home_bias": HOME_BIAS }),
        }
    }

    fn clone_box(&self) -> Box<dyn PredictionModel> {
        Box::new(self.clone())
    }
}

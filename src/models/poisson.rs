use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{
    decisiveness, MatchFeatures, MatchResult, ModelKind, ModelState, ModelSummary,
    OutcomeDistribution, PredictionModel,
};
use crate::error::{EngineError, Result};
use crate::features::{safe_div, Field, Side};

const OFFENSE_BOUNDS: (f64, f64) = (0.5, 1.8);
const DEFENSE_BOUNDS: (f64, f64) = (0.6, 1.5);
const LAMBDA_BOUNDS: (f64, f64) = (0.5, 7.0);
const LEARNING_RATE_BOUNDS: (f64, f64) = (0.03, 0.4);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoissonParams {
    pub league_avg_goals: f64,
    /// Multiplier on the home side's scoring rate.
    pub home_advantage: f64,
    pub base_learning_rate: f64,
    /// Score grid is truncated at this many goals per side.
    pub max_goals: usize,
}

impl Default for PoissonParams {
    fn default() -> Self {
        PoissonParams {
            league_avg_goals: 2.8,
            home_advantage: 1.08,
            base_learning_rate: 0.1,
            max_goals: 12,
        }
    }
}

/// Offense > 1 scores more than average; defense > 1 concedes more.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoissonState {
    pub offense: BTreeMap<String, f64>,
    pub defense: BTreeMap<String, f64>,
    pub games: BTreeMap<String, u32>,
    pub matches_trained: u64,
}

#[derive(Clone)]
pub struct PoissonModel {
    params: PoissonParams,
    state: PoissonState,
}

#[derive(Debug, Clone, Copy)]
struct Rates {
    offense: f64,
    defense: f64,
}

impl PoissonModel {
    pub fn new(params: PoissonParams) -> Self {
        PoissonModel {
            params,
            state: PoissonState::default(),
        }
    }

    /// Learned rates, or rates seeded from the standings features for a team
    /// the model has not trained on yet.
    fn rates(&self, team: &str, m: &MatchFeatures, side: Side) -> Rates {
        let avg = self.params.league_avg_goals;
        let offense = self.state.offense.get(team).copied().unwrap_or_else(|| {
            safe_div(m.features.get(Field::GoalsForPerGame, side), avg, 1.0)
                .clamp(OFFENSE_BOUNDS.0, OFFENSE_BOUNDS.1)
        });
        let defense = self.state.defense.get(team).copied().unwrap_or_else(|| {
            safe_div(m.features.get(Field::GoalsAgainstPerGame, side), avg, 1.0)
                .clamp(DEFENSE_BOUNDS.0, DEFENSE_BOUNDS.1)
        });
        Rates { offense, defense }
    }

    fn lambdas(&self, home: Rates, away: Rates) -> (f64, f64) {
        let avg = self.params.league_avg_goals;
        let home_lambda = home.offense * away.defense * avg * self.params.home_advantage;
        let away_lambda = away.offense * home.defense * avg;
        (
            home_lambda.clamp(LAMBDA_BOUNDS.0, LAMBDA_BOUNDS.1),
            away_lambda.clamp(LAMBDA_BOUNDS.0, LAMBDA_BOUNDS.1),
        )
    }

    fn learning_rate(&self, team: &str, surprise_boost: f64) -> f64 {
        let games = self.state.games.get(team).copied().unwrap_or(0) as f64;
        let decay = 0.6 + 0.4 / (1.0 + games / 40.0);
        (self.params.base_learning_rate * surprise_boost * decay)
            .clamp(LEARNING_RATE_BOUNDS.0, LEARNING_RATE_BOUNDS.1)
    }
}

/// P(X = k) for k in 0..=max, renormalised over the truncated support.
pub(crate) fn poisson_pmf(lambda: f64, max: usize) -> Vec<f64> {
    let mut pmf = Vec::with_capacity(max + 1);
    let mut p = (-lambda).exp();
    pmf.push(p);
    for k in 1..=max {
        p *= lambda / k as f64;
        pmf.push(p);
    }
    let total: f64 = pmf.iter().sum();
    pmf.iter().map(|p| safe_div(*p, total, 0.0)).collect()
}

/// (home ahead, away ahead, level) after regulation.
pub(crate) fn score_grid(home_lambda: f64, away_lambda: f64, max: usize) -> [f64; 3] {
    let home = poisson_pmf(home_lambda, max);
    let away = poisson_pmf(away_lambda, max);
    let mut out = [0.0; 3];
    for (h, ph) in home.iter().enumerate() {
        for (a, pa) in away.iter().enumerate() {
            let p = ph * pa;
            match h.cmp(&a) {
                std::cmp::Ordering::Greater => out[0] += p,
                std::cmp::Ordering::Less => out[1] += p,
                std::cmp::Ordering::Equal => out[2] += p,
            }
        }
    }
    let total: f64 = out.iter().sum();
    out.map(|p| safe_div(p, total, 1.0 / 3.0))
}

impl PredictionModel for PoissonModel {
    fn name(&self) -> &str {
        "poisson"
    }

    fn kind(&self) -> ModelKind {
        ModelKind::Poisson
    }

    fn predict(&self, m: &MatchFeatures) -> Result<OutcomeDistribution> {
        let home = self.rates(&m.home_team, m, Side::Home);
        let away = self.rates(&m.away_team, m, Side::Away);
        let (home_lambda, away_lambda) = self.lambdas(home, away);
        let [p_home_win, p_away_win, p_other] =
            score_grid(home_lambda, away_lambda, self.params.max_goals);

        let games = |t: &str| self.state.games.get(t).copied().unwrap_or(0) as f64;
        let experience = {
            let g = games(&m.home_team).min(games(&m.away_team));
            g / (g + 10.0)
        };

        Ok(OutcomeDistribution {
            p_home_win,
            p_away_win,
            p_other,
            expected_home_goals: home_lambda,
            expected_away_goals: away_lambda,
            confidence: decisiveness(p_home_win, p_away_win) * (0.5 + 0.5 * experience),
        })
    }

    fn update(&mut self, result: &MatchResult, m: &MatchFeatures) -> Result<()> {
        let home = self.rates(&result.home_team, m, Side::Home);
        let away = self.rates(&result.away_team, m, Side::Away);
        let (home_lambda, away_lambda) = self.lambdas(home, away);

        let home_goals = result.home_score as f64;
        let away_goals = result.away_score as f64;
        let surprise = ((home_lambda - home_goals).abs() + (away_lambda - away_goals).abs()) / 2.0;
        let boost = 1.0 + (surprise / 3.0).min(1.0);

        let lr_home = self.learning_rate(&result.home_team, boost);
        let lr_away = self.learning_rate(&result.away_team, boost);

        // Relative error of each side's scoring versus expectation.
        let home_err = home_goals / home_lambda.max(0.1) - 1.0;
        let away_err = away_goals / away_lambda.max(0.1) - 1.0;

        let home_offense = (home.offense * (1.0 + lr_home * home_err)).clamp(OFFENSE_BOUNDS.0, OFFENSE_BOUNDS.1);
        let home_defense = (home.defense * (1.0 + lr_home * away_err)).clamp(DEFENSE_BOUNDS.0, DEFENSE_BOUNDS.1);
        let away_offense = (away.offense * (1.0 + lr_away * away_err)).clamp(OFFENSE_BOUNDS.0, OFFENSE_BOUNDS.1);
        let away_defense = (away.defense * (1.0 + lr_away * home_err)).clamp(DEFENSE_BOUNDS.0, DEFENSE_BOUNDS.1);

        if ![home_offense, home_defense, away_offense, away_defense]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(EngineError::degenerate("poisson", "non-finite rate after update"));
        }

        self.state.offense.insert(result.home_team.clone(), home_offense);
        self.state.defense.insert(result.home_team.clone(), home_defense);
        self.state.offense.insert(result.away_team.clone(), away_offense);
        self.state.defense.insert(result.away_team.clone(), away_defense);
        *self.state.games.entry(result.home_team.clone()).or_default() += 1;
        *self.state.games.entry(result.away_team.clone()).or_default() += 1;
        self.state.matches_trained += 1;
        Ok(())
    }

    fn snapshot(&self) -> ModelState {
        ModelState::Poisson(self.state.clone())
    }

    fn restore(&mut self, state: ModelState) -> Result<()> {
        let ModelState::Poisson(state) = state else {
            return Err(EngineError::corrupt(
                "poisson",
                format!("expected poisson state, found {}", state.kind_name()),
            ));
        };
        let bad = state
            .offense
            .values()
            .chain(state.defense.values())
            .any(|v| !v.is_finite() || *v <= 0.0);
        if bad {
            return Err(EngineError::corrupt("poisson", "non-finite or non-positive rate"));
        }
        self.state = state;
        Ok(())
    }

    fn summary(&self) -> ModelSummary {
        let mut ranked: Vec<(&String, &f64)> = self.state.offense.iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(a.1));
        let top: Vec<_> = ranked
            .iter()
            .take(5)
            .map(|(team, off)| {
                serde_json::json!({
                    "team": team,
                    "offense": off,
                    "defense": self.state.defense.get(*team),
                })
            })
            .collect();

        ModelSummary {
            name: self.name().to_string(),
            kind: self.kind(),
            trained_matches: self.state.matches_trained,
            details: serde_json::json!({
                "teams_tracked": self.state.offense.len(),
                "league_avg_goals": self.params.league_avg_goals,
                "top_offense": top,
            }),
        }
    }

    fn clone_box(&self) -> Box<dyn PredictionModel> {
        Box::new(self.clone())
    }
}

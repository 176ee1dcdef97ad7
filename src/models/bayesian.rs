use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{
    decisiveness, three_way, Decision, MatchFeatures, MatchResult, ModelKind, ModelState,
    ModelSummary, OutcomeDistribution, PredictionModel,
};
use crate::error::{EngineError, Result};
use crate::features::{safe_div, Field, Side};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BayesianParams {
    /// Pseudo-games backing the standings-derived prior.
    pub prior_strength: f64,
    /// Prior probability that the home side wins an even matchup.
    pub home_prior: f64,
}

impl Default for BayesianParams {
    fn default() -> Self {
        BayesianParams {
            prior_strength: 10.0,
            home_prior: 0.55,
        }
    }
}

/// Observed evidence; overtime results count fractionally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub wins: f64,
    pub games: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BayesianState {
    pub teams: BTreeMap<String, Evidence>,
    pub matches_trained: u64,
}

#[derive(Clone)]
pub struct BayesianModel {
    params: BayesianParams,
    tie_share: f64,
    state: BayesianState,
}

impl BayesianModel {
    pub fn new(params: BayesianParams, tie_share: f64) -> Self {
        BayesianModel {
            params,
            tie_share,
            state: BayesianState::default(),
        }
    }

    fn evidence(&self, team: &str) -> Evidence {
        self.state.teams.get(team).copied().unwrap_or_default()
    }

    /// Posterior mean of the team's win rate under a Beta prior centred on
    /// its standings win %.
    fn strength(&self, team: &str, prior_mean: f64) -> f64 {
        let e = self.evidence(team);
        let a = self.params.prior_strength;
        safe_div(prior_mean.clamp(0.01, 0.99) * a + e.wins, a + e.games, 0.5).clamp(0.01, 0.99)
    }

    /// Head-to-head probability from two strengths (log5), then shifted by
    /// the home prior on the odds scale.
    fn home_probability(&self, home: f64, away: f64) -> f64 {
        let num = home * (1.0 - away);
        let log5 = safe_div(num, num + away * (1.0 - home), 0.5);
        let home_prior = self.params.home_prior.clamp(0.01, 0.99);
        let odds = safe_div(log5, 1.0 - log5, 1.0) * home_prior / (1.0 - home_prior);
        safe_div(odds, 1.0 + odds, 0.5)
    }
}

impl PredictionModel for BayesianModel {
    fn name(&self) -> &str {
        "bayesian"
    }

    fn kind(&self) -> ModelKind {
        ModelKind::Bayesian
    }

    fn predict(&self, m: &MatchFeatures) -> Result<OutcomeDistribution> {
        let home = self.strength(&m.home_team, m.features.get(Field::WinPct, Side::Home));
        let away = self.strength(&m.away_team, m.features.get(Field::WinPct, Side::Away));
        let p = self.home_probability(home, away);
        let [p_home_win, p_away_win, p_other] = three_way(p, self.tie_share);

        let games = self.evidence(&m.home_team).games.min(self.evidence(&m.away_team).games);
        let evidence = games / (games + self.params.prior_strength);

        let gf_home = m.features.get(Field::GoalsForPerGame, Side::Home);
        let gf_away = m.features.get(Field::GoalsForPerGame, Side::Away);
        let ga_home = m.features.get(Field::GoalsAgainstPerGame, Side::Home);
        let ga_away = m.features.get(Field::GoalsAgainstPerGame, Side::Away);

        Ok(OutcomeDistribution {
            p_home_win,
            p_away_win,
            p_other,
            expected_home_goals: ((gf_home + ga_away) / 2.0).max(0.0),
            expected_away_goals: ((gf_away + ga_home) / 2.0).max(0.0),
            confidence: decisiveness(p_home_win, p_away_win) * (0.5 + 0.5 * evidence),
        })
    }

    fn update(&mut self, result: &MatchResult, _features: &MatchFeatures) -> Result<()> {
        let winner_share = if result.decision == Decision::Regulation { 1.0 } else { 0.75 };
        let (home_share, away_share) = match result.winner() {
            Side::Home => (winner_share, 1.0 - winner_share),
            Side::Away => (1.0 - winner_share, winner_share),
        };

        let home = self.state.teams.entry(result.home_team.clone()).or_default();
        home.wins += home_share;
        home.games += 1.0;
        let away = self.state.teams.entry(result.away_team.clone()).or_default();
        away.wins += away_share;
        away.games += 1.0;

        self.state.matches_trained += 1;
        Ok(())
    }

    fn snapshot(&self) -> ModelState {
        ModelState::Bayesian(self.state.clone())
    }

    fn restore(&mut self, state: ModelState) -> Result<()> {
        let ModelState::Bayesian(state) = state else {
            return Err(EngineError::corrupt(
                "bayesian",
                format!("expected bayesian state, found {}", state.kind_name()),
            ));
        };
        let bad = state.teams.iter().find(|(_, e)| {
            !e.wins.is_finite() || !e.games.is_finite() || e.wins < 0.0 || e.wins > e.games
        });
        if let Some((team, e)) = bad {
            return Err(EngineError::corrupt(
                "bayesian",
                format!("impossible evidence for {}: {:?}", team, e),
            ));
        }
        self.state = state;
        Ok(())
    }

    fn summary(&self) -> ModelSummary {
        ModelSummary {
            name: self.name().to_string(),
            kind: self.kind(),
            trained_matches: self.state.matches_trained,
            details: serde_json::json!({
                "teams_tracked": self.state.teams.len(),
                "prior_strength": self.params.prior_strength,
                "home_prior": self.params.home_prior,
            }),
        }
    }

    fn clone_box(&self) -> Box<dyn PredictionModel> {
        Box::new(self.clone())
    }
}

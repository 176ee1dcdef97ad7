use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{
    decisiveness, MatchFeatures, MatchResult, ModelKind, ModelState, ModelSummary,
    OutcomeDistribution, PredictionModel,
};
use crate::error::{EngineError, Result};
use crate::features::{Field, Side};

const HOME_BOOST: f64 = 1.05;
const LEAGUE_SAVE_PCT: f64 = 0.905;

/// Simulates the match many times from feature-driven scoring rates.
///
/// The generator is seeded from the teams and the feature bits, so the same
/// input always yields the same distribution.
#[derive(Clone)]
pub struct MonteCarloModel {
    league_avg_goals: f64,
    simulations: usize,
}

impl MonteCarloModel {
    pub fn new(league_avg_goals: f64, simulations: usize) -> Self {
        MonteCarloModel {
            league_avg_goals,
            simulations: simulations.max(1),
        }
    }

    fn scoring_rate(&self, m: &MatchFeatures, side: Side) -> f64 {
        let f = &m.features;
        let opp = side.opposite();
        let mut lambda = 0.5
            * (f.get(Field::GoalsForPerGame, side) + f.get(Field::GoalsAgainstPerGame, opp));
        if !(lambda > 0.0) {
            lambda = self.league_avg_goals;
        }
        // Recent form, opposing goalie, own lineup.
        lambda += 0.15 * f.get(Field::FormGoalDiff, side);
        lambda *= 1.0 - 5.0 * (f.get(Field::GoalieSavePct, opp) - LEAGUE_SAVE_PCT);
        lambda *= 0.8 + 0.4 * f.get(Field::LineupStrength, side).clamp(0.0, 1.0);
        lambda *= 1.0 - 0.3 * f.get(Field::InjuryImpact, side).clamp(0.0, 1.0);
        if side == Side::Home {
            lambda *= HOME_BOOST;
        }
        if !lambda.is_finite() {
            lambda = self.league_avg_goals;
        }
        lambda.clamp(0.3, 7.0)
    }
}

/// FNV-1a over team codes and feature bits.
fn seed_for(m: &MatchFeatures) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    let mut feed = |bytes: &[u8]| {
        for b in bytes {
            hash ^= *b as u64;
            hash = hash.wrapping_mul(PRIME);
        }
    };
    feed(m.home_team.as_bytes());
    feed(b"|");
    feed(m.away_team.as_bytes());
    for v in m.features.values() {
        feed(&v.to_bits().to_le_bytes());
    }
    hash
}

/// Knuth's multiplication method; fine for the small rates seen here.
/// A rate that is not a positive finite number scores nothing.
fn sample_poisson(rng: &mut StdRng, lambda: f64) -> u32 {
    if !(lambda.is_finite() && lambda > 0.0) {
        return 0;
    }
    let limit = (-lambda).exp();
    let mut k = 0;
    let mut p = 1.0;
    loop {
        p *= rng.gen::<f64>();
        if p <= limit {
            return k;
        }
        k += 1;
    }
}

impl PredictionModel for MonteCarloModel {
    fn name(&self) -> &str {
        "monte_carlo"
    }

    fn kind(&self) -> ModelKind {
        ModelKind::MonteCarlo
    }

    fn predict(&self, m: &MatchFeatures) -> Result<OutcomeDistribution> {
        let home_lambda = self.scoring_rate(m, Side::Home);
        let away_lambda = self.scoring_rate(m, Side::Away);
        let mut rng = StdRng::seed_from_u64(seed_for(m));

        let mut counts = [0usize; 3];
        let (mut home_total, mut away_total) = (0u64, 0u64);
        for _ in 0..self.simulations {
            let h = sample_poisson(&mut rng, home_lambda);
            let a = sample_poisson(&mut rng, away_lambda);
            home_total += h as u64;
            away_total += a as u64;
            let slot = match h.cmp(&a) {
                std::cmp::Ordering::Greater => 0,
                std::cmp::Ordering::Less => 1,
                std::cmp::Ordering::Equal => 2,
            };
            counts[slot] += 1;
        }

        let n = self.simulations as f64;
        let p_home_win = counts[0] as f64 / n;
        let p_away_win = counts[1] as f64 / n;
        Ok(OutcomeDistribution {
            p_home_win,
            p_away_win,
            p_other: counts[2] as f64 / n,
            expected_home_goals: home_total as f64 / n,
            expected_away_goals: away_total as f64 / n,
            confidence: 0.8 * decisiveness(p_home_win, p_away_win),
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
                "monte_carlo",
                format!("stateless model cannot take {} state", other.kind_name()),
            )),
        }
    }

    fn summary(&self) -> ModelSummary {
        ModelSummary {
            name: self.name().to_string(),
            kind: self.kind(),
            trained_matches: 0,
            details: serde_json::json!({ "simulations": self.simulations }),
        }
    }

    fn clone_box(&self) -> Box<dyn PredictionModel> {
        Box::new(self.clone())
    }
}

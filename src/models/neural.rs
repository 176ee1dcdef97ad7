use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{
    decisiveness, MatchFeatures, MatchResult, ModelKind, ModelState, ModelSummary,
    OutcomeDistribution, PredictionModel,
};
use crate::error::{EngineError, Result};
use crate::features::{Field, Side, FEATURE_COUNT};

/// Input, two ReLU hidden layers, softmax over {home, away, other}.
pub const ARCHITECTURE: [usize; 4] = [FEATURE_COUNT, 16, 8, 3];
const LEARNING_RATE: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeuralState {
    pub architecture: Vec<usize>,
    /// `weights[l][j][i]`: from unit `i` of layer `l` to unit `j` of layer `l + 1`.
    pub weights: Vec<Vec<Vec<f64>>>,
    pub biases: Vec<Vec<f64>>,
    pub learning_rate: f64,
    pub samples_seen: u64,
}

impl NeuralState {
    /// Xavier-uniform weights from a fixed seed, zero biases.
    pub fn initial(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut weights = Vec::with_capacity(ARCHITECTURE.len() - 1);
        let mut biases = Vec::with_capacity(ARCHITECTURE.len() - 1);
        for pair in ARCHITECTURE.windows(2) {
            let (fan_in, fan_out) = (pair[0], pair[1]);
            let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
            let layer: Vec<Vec<f64>> = (0..fan_out)
                .map(|_| (0..fan_in).map(|_| rng.gen_range(-limit..limit)).collect())
                .collect();
            weights.push(layer);
            biases.push(vec![0.0; fan_out]);
        }
        NeuralState {
            architecture: ARCHITECTURE.to_vec(),
            weights,
            biases,
            learning_rate: LEARNING_RATE,
            samples_seen: 0,
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.architecture != ARCHITECTURE {
            return Err(format!(
                "architecture {:?} does not match {:?}",
                self.architecture, ARCHITECTURE
            ));
        }
        if self.weights.len() != ARCHITECTURE.len() - 1 || self.biases.len() != ARCHITECTURE.len() - 1 {
            return Err("layer count mismatch".into());
        }
        for (l, pair) in ARCHITECTURE.windows(2).enumerate() {
            let (fan_in, fan_out) = (pair[0], pair[1]);
            if self.weights[l].len() != fan_out
                || self.weights[l].iter().any(|row| row.len() != fan_in)
                || self.biases[l].len() != fan_out
            {
                return Err(format!("layer {} has wrong shape", l));
            }
        }
        let finite = self
            .weights
            .iter()
            .flatten()
            .flatten()
            .chain(self.biases.iter().flatten())
            .all(|v| v.is_finite());
        if !finite {
            return Err("non-finite parameter".into());
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(format!("bad learning rate {}", self.learning_rate));
        }
        Ok(())
    }
}

/// Activations of every layer, input first.
struct Pass {
    activations: Vec<Vec<f64>>,
}

impl Pass {
    fn output(&self) -> &[f64] {
        self.activations.last().map(Vec::as_slice).unwrap_or(&[])
    }
}

fn softmax(z: &[f64]) -> Vec<f64> {
    let max = z.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = z.iter().map(|v| (v - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

#[derive(Clone)]
pub struct NeuralNetModel {
    seed: u64,
    state: NeuralState,
}

impl NeuralNetModel {
    pub fn new(seed: u64) -> Self {
        NeuralNetModel {
            seed,
            state: NeuralState::initial(seed),
        }
    }

    fn forward(&self, input: Vec<f64>) -> Pass {
        let layers = self.state.weights.len();
        let mut activations = Vec::with_capacity(layers + 1);
        activations.push(input);
        for l in 0..layers {
            let prev = &activations[l];
            let z: Vec<f64> = self.state.weights[l]
                .iter()
                .zip(&self.state.biases[l])
                .map(|(row, b)| row.iter().zip(prev).map(|(w, x)| w * x).sum::<f64>() + b)
                .collect();
            let a = if l + 1 == layers {
                softmax(&z)
            } else {
                z.into_iter().map(|v| v.max(0.0)).collect()
            };
            activations.push(a);
        }
        Pass { activations }
    }

    /// One step of stochastic gradient descent on cross-entropy loss.
    fn backpropagate(&mut self, pass: &Pass, target: usize) {
        let layers = self.state.weights.len();
        let lr = self.state.learning_rate;

        // Softmax + cross-entropy gradient at the output.
        let mut delta: Vec<f64> = pass
            .output()
            .iter()
            .enumerate()
            .map(|(i, p)| p - if i == target { 1.0 } else { 0.0 })
            .collect();

        for l in (0..layers).rev() {
            let input = &pass.activations[l];

            // Propagate before the weights of this layer change.
            let next_delta: Option<Vec<f64>> = (l > 0).then(|| {
                (0..input.len())
                    .map(|i| {
                        let back: f64 = self.state.weights[l]
                            .iter()
                            .zip(&delta)
                            .map(|(row, d)| row[i] * d)
                            .sum();
                        // ReLU derivative from the stored activation.
                        if input[i] > 0.0 {
                            back
                        } else {
                            0.0
                        }
                    })
                    .collect()
            });

            for (j, d) in delta.iter().enumerate() {
                for (i, x) in input.iter().enumerate() {
                    self.state.weights[l][j][i] -= lr * d * x;
                }
                self.state.biases[l][j] -= lr * d;
            }

            if let Some(next) = next_delta {
                delta = next;
            }
        }
    }
}

impl PredictionModel for NeuralNetModel {
    fn name(&self) -> &str {
        "neural_net"
    }

    fn kind(&self) -> ModelKind {
        ModelKind::NeuralNet
    }

    fn predict(&self, m: &MatchFeatures) -> Result<OutcomeDistribution> {
        let pass = self.forward(m.features.normalized());
        let out = pass.output();
        if out.len() != 3 || out.iter().any(|p| !p.is_finite()) {
            return Err(EngineError::degenerate("neural_net", format!("bad output {:?}", out)));
        }

        let f = &m.features;
        let expected = |side: Side| {
            0.5 * (f.get(Field::GoalsForPerGame, side)
                + f.get(Field::GoalsAgainstPerGame, side.opposite()))
        };
        let samples = self.state.samples_seen as f64;
        let maturity = samples / (samples + 100.0);

        Ok(OutcomeDistribution {
            p_home_win: out[0],
            p_away_win: out[1],
            p_other: out[2],
            expected_home_goals: expected(Side::Home).max(0.0),
            expected_away_goals: expected(Side::Away).max(0.0),
            confidence: decisiveness(out[0], out[1]) * (0.3 + 0.7 * maturity),
        })
    }

    fn update(&mut self, result: &MatchResult, m: &MatchFeatures) -> Result<()> {
        let pass = self.forward(m.features.normalized());
        self.backpropagate(&pass, result.outcome().index());
        self.state.samples_seen += 1;

        if let Err(reason) = self.state.validate() {
            return Err(EngineError::degenerate("neural_net", reason));
        }
        Ok(())
    }

    fn snapshot(&self) -> ModelState {
        ModelState::NeuralNet(self.state.clone())
    }

    fn restore(&mut self, state: ModelState) -> Result<()> {
        let ModelState::NeuralNet(state) = state else {
            return Err(EngineError::corrupt(
                "neural_net",
                format!("expected neural_net state, found {}", state.kind_name()),
            ));
        };
        state
            .validate()
            .map_err(|reason| EngineError::corrupt("neural_net", reason))?;
        self.state = state;
        Ok(())
    }

    fn summary(&self) -> ModelSummary {
        ModelSummary {
            name: self.name().to_string(),
            kind: self.kind(),
            trained_matches: self.state.samples_seen,
            details: serde_json::json!({
                "architecture": self.state.architecture,
                "learning_rate": self.state.learning_rate,
                "init_seed": self.seed,
            }),
        }
    }

    fn clone_box(&self) -> Box<dyn PredictionModel> {
        Box::new(self.clone())
    }
}

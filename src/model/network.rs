//! PolicyNetwork: the model artifact evolved by the orchestrator
//!
//! A dense feed-forward network whose weights live in `nalgebra` matrices.
//! The orchestrator treats it as an opaque blob; only the provider and the
//! runtimes (which need a forward pass to drive units) look inside.

use super::numeric::{ExperimentMode, NumericType};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Activation applied after a layer's affine transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Linear,
    Relu,
    Tanh,
    Sigmoid,
}

impl Activation {
    pub fn apply(&self, x: f64) -> f64 {
        match self {
            Activation::Linear => x,
            Activation::Relu => x.max(0.0),
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        }
    }
}

impl std::str::FromStr for Activation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(Activation::Linear),
            "relu" => Ok(Activation::Relu),
            "tanh" => Ok(Activation::Tanh),
            "sigmoid" => Ok(Activation::Sigmoid),
            other => Err(format!("unknown activation: {}", other)),
        }
    }
}

/// Replay settings for a layer (the structural difference between modes)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplaySettings {
    pub enabled: bool,
    /// "before" or "after" the layer's own pass
    pub phase: String,
    pub offset: i32,
    pub max_replay: u32,
    /// Upper bound for gated replay (DynamicReplay only)
    pub budget: u32,
    /// Constant gate score for gated replay
    pub gate_score: Option<f64>,
}

impl ReplaySettings {
    /// Number of extra passes for this layer
    pub fn repetitions(&self) -> u32 {
        if !self.enabled {
            return 0;
        }
        match self.gate_score {
            Some(score) => {
                let reps = if score > 0.8 {
                    3
                } else if score > 0.6 {
                    2
                } else {
                    1
                };
                reps.min(self.budget.max(1))
            }
            None => self.max_replay,
        }
    }
}

/// A single dense layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    /// out x in weight matrix
    pub weights: DMatrix<f64>,
    pub bias: DVector<f64>,
    pub activation: Activation,
    #[serde(default)]
    pub replay: ReplaySettings,
}

impl DenseLayer {
    pub fn inputs(&self) -> usize {
        self.weights.ncols()
    }

    pub fn outputs(&self) -> usize {
        self.weights.nrows()
    }

    fn pass(&self, input: &DVector<f64>) -> DVector<f64> {
        (&self.weights * input + &self.bias).map(|x| self.activation.apply(x))
    }
}

/// The evolvable policy artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyNetwork {
    pub numeric_type: NumericType,
    pub mode: ExperimentMode,
    pub layers: Vec<DenseLayer>,
    /// Number of perturbations applied since the generation-0 build
    #[serde(default)]
    pub mutations: u64,
}

impl PolicyNetwork {
    /// Build a randomly initialised network, reproducible from `seed`
    ///
    /// `widths` lists every layer including the input, so `[6, 128, 128, 3]`
    /// produces three weight matrices. `activations` has one entry per width;
    /// the first (input) activation is ignored.
    pub fn random(
        numeric_type: NumericType,
        mode: ExperimentMode,
        widths: &[usize],
        activations: &[Activation],
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut layers = Vec::with_capacity(widths.len().saturating_sub(1));
        for i in 1..widths.len() {
            let (fan_in, fan_out) = (widths[i - 1], widths[i]);
            let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
            let weights = DMatrix::from_fn(fan_out, fan_in, |_, _| {
                numeric_type.quantize(rng.gen_range(-bound..bound))
            });
            let activation = activations.get(i).copied().unwrap_or(Activation::Linear);
            layers.push(DenseLayer {
                weights,
                bias: DVector::zeros(fan_out),
                activation,
                replay: ReplaySettings::default(),
            });
        }
        let mut net = Self {
            numeric_type,
            mode,
            layers,
            mutations: 0,
        };
        net.configure_mode();
        net
    }

    /// Apply the structural flags for this network's mode to layer 1
    fn configure_mode(&mut self) {
        let Some(layer) = self.layers.get_mut(1) else {
            return;
        };
        layer.replay = match self.mode {
            ExperimentMode::Standard => ReplaySettings::default(),
            ExperimentMode::Replay => ReplaySettings {
                enabled: true,
                phase: "after".to_string(),
                offset: -1,
                max_replay: 1,
                budget: 0,
                gate_score: None,
            },
            ExperimentMode::DynamicReplay => ReplaySettings {
                enabled: true,
                phase: "after".to_string(),
                offset: 0,
                max_replay: 0,
                budget: 3,
                gate_score: Some(0.6),
            },
        };
    }

    pub fn input_size(&self) -> usize {
        self.layers.first().map(|l| l.inputs()).unwrap_or(0)
    }

    pub fn output_size(&self) -> usize {
        self.layers.last().map(|l| l.outputs()).unwrap_or(0)
    }

    pub fn parameter_count(&self) -> usize {
        self.layers
            .iter()
            .map(|l| l.weights.len() + l.bias.len())
            .sum()
    }

    /// Run a forward pass. Inputs shorter than the first layer are zero-padded,
    /// longer ones truncated.
    pub fn forward(&self, input: &[f64]) -> Vec<f64> {
        let mut x = DVector::from_fn(self.input_size(), |i, _| {
            input.get(i).copied().unwrap_or(0.0)
        });
        for layer in &self.layers {
            x = layer.pass(&x);
            // replay only makes sense when the layer maps onto itself
            if layer.inputs() == layer.outputs() {
                for _ in 0..layer.replay.repetitions() {
                    x = layer.pass(&x);
                }
            }
        }
        x.iter().copied().collect()
    }

    /// Add seeded gaussian noise with standard deviation `stddev` to every
    /// weight and bias, then re-quantise to the network's representation.
    pub fn perturb(&mut self, stddev: f64, seed: u64) {
        if stddev <= 0.0 {
            return;
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let numeric_type = self.numeric_type;
        for layer in &mut self.layers {
            for w in layer.weights.iter_mut() {
                *w = numeric_type.quantize(*w + gaussian(&mut rng) * stddev);
            }
            for b in layer.bias.iter_mut() {
                *b = numeric_type.quantize(*b + gaussian(&mut rng) * stddev);
            }
        }
        self.mutations += 1;
    }
}

/// Standard normal sample (Box-Muller)
fn gaussian(rng: &mut impl Rng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(mode: ExperimentMode) -> PolicyNetwork {
        PolicyNetwork::random(
            NumericType::Float64,
            mode,
            &[6, 8, 8, 3],
            &[Activation::Linear, Activation::Relu, Activation::Relu, Activation::Tanh],
            7,
        )
    }

    #[test]
    fn test_random_is_reproducible() {
        assert_eq!(small(ExperimentMode::Standard), small(ExperimentMode::Standard));
    }

    #[test]
    fn test_shapes() {
        let net = small(ExperimentMode::Standard);
        assert_eq!(net.layers.len(), 3);
        assert_eq!(net.input_size(), 6);
        assert_eq!(net.output_size(), 3);
        assert_eq!(net.parameter_count(), 6 * 8 + 8 + 8 * 8 + 8 + 8 * 3 + 3);
    }

    #[test]
    fn test_forward_output_bounded_by_tanh() {
        let net = small(ExperimentMode::Replay);
        let out = net.forward(&[10.1, -10.2, 10.3, -10.4, 10.5, -10.6]);
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|v| v.abs() <= 1.0));
    }

    #[test]
    fn test_forward_pads_short_input() {
        let net = small(ExperimentMode::Standard);
        let padded = net.forward(&[1.0, 2.0]);
        let explicit = net.forward(&[1.0, 2.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(padded, explicit);
    }

    #[test]
    fn test_perturb_is_deterministic_per_seed() {
        let base = small(ExperimentMode::Standard);
        let mut a = base.clone();
        let mut b = base.clone();
        let mut c = base.clone();
        a.perturb(0.1, 1);
        b.perturb(0.1, 1);
        c.perturb(0.1, 2);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, base);
        assert_eq!(a.mutations, 1);
    }

    #[test]
    fn test_zero_stddev_is_identity() {
        let base = small(ExperimentMode::Standard);
        let mut same = base.clone();
        same.perturb(0.0, 5);
        assert_eq!(same, base);
    }

    #[test]
    fn test_mode_flags() {
        assert_eq!(small(ExperimentMode::Standard).layers[1].replay.repetitions(), 0);
        assert_eq!(small(ExperimentMode::Replay).layers[1].replay.repetitions(), 1);
        // gate score 0.6 is not above 0.6
        assert_eq!(small(ExperimentMode::DynamicReplay).layers[1].replay.repetitions(), 1);
    }

    #[test]
    fn test_integer_perturbation_stays_on_grid() {
        let mut net = PolicyNetwork::random(
            NumericType::Int8,
            ExperimentMode::Standard,
            &[6, 4, 3],
            &[Activation::Linear, Activation::Relu, Activation::Tanh],
            3,
        );
        net.perturb(0.1, 9);
        let q = NumericType::Int8.quantum().unwrap();
        for w in net.layers[0].weights.iter() {
            assert!(((w / q).round() - w / q).abs() < 1e-9);
        }
    }
}

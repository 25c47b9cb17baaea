//! Linear softmax policy trained with REINFORCE.
//!
//! The representation is `[observation, incoming, 1.0]`. Three linear heads
//! read it: action logits (softmax), signal (tanh) and type logits. The
//! update uses discounted, normalised returns and clips the global gradient
//! norm. The signal head has no score-function gradient and stays at its
//! seeded initialisation.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::collaborators::{AgentOutput, Learner, Trajectory};
use crate::protocol::softmax;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearnerParams {
    pub learning_rate: f64,
    pub gamma: f64,
    pub max_grad_norm: f64,
    /// Half-width of the uniform weight initialisation.
    pub init_scale: f64,
}

impl Default for LearnerParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            gamma: 0.99,
            max_grad_norm: 1.0,
            init_scale: 0.1,
        }
    }
}

/// Row-major `rows × cols` matrix.
#[derive(Debug, Clone, PartialEq)]
struct Linear {
    rows: usize,
    cols: usize,
    w: Vec<f64>,
}

impl Linear {
    fn random<R: Rng>(rows: usize, cols: usize, scale: f64, rng: &mut R) -> Self {
        let w = (0..rows * cols).map(|_| rng.gen_range(-scale..=scale)).collect();
        Self { rows, cols, w }
    }

    fn apply(&self, x: &[f64]) -> Vec<f64> {
        self.w
            .chunks(self.cols)
            .map(|row| row.iter().zip(x).map(|(w, x)| w * x).sum())
            .collect()
    }

    /// Accumulate `scale · (onehot(k) − p) ⊗ x` into `grad`.
    fn score_grad(&self, grad: &mut [f64], probs: &[f64], k: usize, x: &[f64], scale: f64) {
        for (r, p) in probs.iter().enumerate().take(self.rows) {
            let coeff = scale * (f64::from(u8::from(r == k)) - p);
            let row = &mut grad[r * self.cols..(r + 1) * self.cols];
            for (g, xi) in row.iter_mut().zip(x) {
                *g += coeff * xi;
            }
        }
    }
}

pub struct SoftmaxLearner {
    input_dim: usize,
    params: LearnerParams,
    action_head: Linear,
    signal_head: Linear,
    type_head: Linear,
}

impl SoftmaxLearner {
    pub fn new(
        observation_dim: usize,
        incoming_dim: usize,
        signal_dim: usize,
        num_actions: usize,
        seed: u64,
        params: LearnerParams,
    ) -> Self {
        let input_dim = observation_dim + incoming_dim + 1;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let s = params.init_scale;
        Self {
            input_dim,
            params,
            action_head: Linear::random(num_actions, input_dim, s, &mut rng),
            signal_head: Linear::random(signal_dim, input_dim, s, &mut rng),
            type_head: Linear::random(3, input_dim, s, &mut rng),
        }
    }

    fn returns(&self, trajectories: &[Trajectory]) -> Vec<f64> {
        let mut all = Vec::new();
        for trajectory in trajectories {
            let mut g = 0.0;
            let mut returns: Vec<f64> = trajectory
                .iter()
                .rev()
                .map(|t| {
                    g = t.reward + self.params.gamma * g;
                    g
                })
                .collect();
            returns.reverse();
            all.extend(returns);
        }
        if all.len() > 1 {
            let n = all.len() as f64;
            let mean = all.iter().sum::<f64>() / n;
            // Sample standard deviation, matching the unbiased estimator.
            let var = all.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / (n - 1.0);
            let std = var.sqrt() + 1e-8;
            all.iter_mut().for_each(|g| *g = (*g - mean) / std);
        }
        all
    }
}

impl Learner for SoftmaxLearner {
    fn encode(&mut self, observation: &[f64], incoming: &[f64]) -> anyhow::Result<Vec<f64>> {
        let mut x = Vec::with_capacity(self.input_dim);
        x.extend_from_slice(observation);
        x.extend_from_slice(incoming);
        x.push(1.0);
        anyhow::ensure!(
            x.len() == self.input_dim,
            "representation has {} features, expected {}",
            x.len(),
            self.input_dim
        );
        Ok(x)
    }

    fn act(&mut self, representation: &[f64]) -> anyhow::Result<AgentOutput> {
        Ok(AgentOutput {
            signal: self
                .signal_head
                .apply(representation)
                .into_iter()
                .map(f64::tanh)
                .collect(),
            action_probs: softmax(&self.action_head.apply(representation), 1.0),
            type_logits: self.type_head.apply(representation),
        })
    }

    fn update(&mut self, trajectories: &[Trajectory]) -> anyhow::Result<f64> {
        let returns = self.returns(trajectories);
        if returns.is_empty() {
            return Ok(0.0);
        }

        let mut grad_action = vec![0.0; self.action_head.w.len()];
        let mut grad_type = vec![0.0; self.type_head.w.len()];
        let mut loss = 0.0;
        for (t, g) in trajectories.iter().flatten().zip(&returns) {
            loss -= t.log_prob * g;
            let x = &t.representation;
            let p = softmax(&self.action_head.apply(x), 1.0);
            self.action_head.score_grad(&mut grad_action, &p, t.action, x, *g);
            if let Some(label) = t.signal_type {
                let q = softmax(&self.type_head.apply(x), 1.0);
                self.type_head.score_grad(&mut grad_type, &q, label.index(), x, *g);
            }
        }
        anyhow::ensure!(loss.is_finite(), "non-finite loss {loss}");

        let norm = grad_action
            .iter()
            .chain(&grad_type)
            .map(|g| g * g)
            .sum::<f64>()
            .sqrt();
        let clip = if norm > self.params.max_grad_norm {
            self.params.max_grad_norm / norm
        } else {
            1.0
        };
        // Gradient ascent on Σ G·log π is descent on the loss.
        let step = self.params.learning_rate * clip;
        for (w, g) in self.action_head.w.iter_mut().zip(&grad_action) {
            *w += step * g;
        }
        for (w, g) in self.type_head.w.iter_mut().zip(&grad_type) {
            *w += step * g;
        }
        Ok(loss)
    }

    fn clear_episode(&mut self) {}
}

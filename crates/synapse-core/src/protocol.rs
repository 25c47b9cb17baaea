//! Protocol policies: reward shaping, signal-type resolution, temperature
//! schedule and per-epoch extras.
//!
//! The set of protocols is closed, so dispatch is a `match` on
//! [`ProtocolPolicy`] rather than a trait object.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use synapse_ledger::StorageError;

use crate::channel::{EpochHistory, SignalType};
use crate::domain::{CostMultipliers, ProtocolId, Result, SimulationConfig, TemperatureSchedule};

/// Outcome of resolving an agent's type logits.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDecision {
    /// Relaxed distribution used for the decision; `None` when the type head
    /// has no differentiable path.
    pub distribution: Option<Vec<f64>>,
    pub label: SignalType,
}

/// Inputs to the per-agent, per-step reward.
#[derive(Debug, Clone, Copy)]
pub struct RewardContext<'a> {
    pub env_reward: f64,
    pub signal: &'a [f64],
    pub signal_type: SignalType,
    pub energy_remaining: f64,
    pub energy_budget: f64,
    pub tax_rate: f64,
    pub survival_bonus: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolPolicy {
    Baseline,
    Interrogative {
        costs: CostMultipliers,
        schedule: TemperatureSchedule,
    },
}

impl ProtocolPolicy {
    pub fn from_config(config: &SimulationConfig) -> Self {
        match config.protocol {
            ProtocolId::Baseline => ProtocolPolicy::Baseline,
            ProtocolId::Interrogative => ProtocolPolicy::Interrogative {
                costs: config.costs,
                schedule: config.temperature,
            },
        }
    }

    pub fn id(&self) -> ProtocolId {
        match self {
            ProtocolPolicy::Baseline => ProtocolId::Baseline,
            ProtocolPolicy::Interrogative { .. } => ProtocolId::Interrogative,
        }
    }

    /// Sampling temperature for `epoch`. Constant 1.0 for the baseline.
    pub fn temperature(&self, epoch: u64) -> f64 {
        match self {
            ProtocolPolicy::Baseline => 1.0,
            ProtocolPolicy::Interrogative { schedule, .. } => schedule.tau(epoch),
        }
    }

    /// Whether the learner should receive type log-probabilities.
    pub fn trains_type_head(&self) -> bool {
        matches!(self, ProtocolPolicy::Interrogative { .. })
    }

    /// Resolve a type label from three logits.
    ///
    /// Training draws a Gumbel-softmax sample at temperature `tau`; evaluation
    /// takes the argmax of the plain softmax. The baseline always declares.
    pub fn resolve_type<R: Rng + ?Sized>(
        &self,
        logits: &[f64],
        tau: f64,
        training: bool,
        rng: &mut R,
    ) -> TypeDecision {
        match self {
            ProtocolPolicy::Baseline => TypeDecision {
                distribution: None,
                label: SignalType::Declare,
            },
            ProtocolPolicy::Interrogative { .. } => {
                let dist = if training {
                    let perturbed: Vec<f64> = logits
                        .iter()
                        .map(|l| l + gumbel(rng))
                        .collect();
                    softmax(&perturbed, tau)
                } else {
                    softmax(logits, 1.0)
                };
                let label = SignalType::from_index(argmax(&dist)).unwrap_or(SignalType::Declare);
                TypeDecision {
                    distribution: Some(dist),
                    label,
                }
            }
        }
    }

    /// `env_reward − tax·m(type)·Σ|signal| + bonus·max(energy/budget, 0)`,
    /// where `m` is 1 for the baseline and the configured multiplier otherwise.
    pub fn reward(&self, ctx: &RewardContext<'_>) -> f64 {
        let multiplier = match self {
            ProtocolPolicy::Baseline => 1.0,
            ProtocolPolicy::Interrogative { costs, .. } => cost_for(costs, ctx.signal_type),
        };
        let magnitude: f64 = ctx.signal.iter().map(|s| s.abs()).sum();
        let signal_cost = ctx.tax_rate * multiplier * magnitude;
        let energy_fraction = (ctx.energy_remaining / ctx.energy_budget).max(0.0);
        ctx.env_reward - signal_cost + ctx.survival_bonus * energy_fraction
    }

    /// Protocol-specific metrics merged into the epoch map.
    pub fn epoch_extras(
        &self,
        history: &EpochHistory,
        target_rate: f64,
        tax_rate: f64,
    ) -> Result<Map<String, Value>> {
        let mut extras = Map::new();
        if let ProtocolPolicy::Interrogative { costs, .. } = self {
            let inquiry = InquiryMetrics::compute(history, target_rate, tax_rate, costs.query);
            let value = serde_json::to_value(inquiry).map_err(StorageError::from)?;
            extras.insert("inquiry".to_string(), value);
        }
        Ok(extras)
    }
}

fn cost_for(costs: &CostMultipliers, t: SignalType) -> f64 {
    match t {
        SignalType::Declare => costs.declare,
        SignalType::Query => costs.query,
        SignalType::Respond => costs.respond,
    }
}

fn gumbel<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
    -(-u.ln()).ln()
}

/// Numerically stable softmax of `logits / tau`.
pub fn softmax(logits: &[f64], tau: f64) -> Vec<f64> {
    if logits.is_empty() {
        return Vec::new();
    }
    let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|l| ((l - max) / tau).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Index of the largest value; ties go to the lowest index.
pub fn argmax(xs: &[f64]) -> usize {
    let mut best = 0;
    for (i, x) in xs.iter().enumerate() {
        if *x > xs[best] {
            best = i;
        }
    }
    best
}

// ---------------------------------------------------------------------------
// Inquiry metrics
// ---------------------------------------------------------------------------

/// Type frequencies across every agent and step of an epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeDistribution {
    #[serde(rename = "DECLARE")]
    pub declare: f64,
    #[serde(rename = "QUERY")]
    pub query: f64,
    #[serde(rename = "RESPOND")]
    pub respond: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InquiryMetrics {
    pub type_distribution: TypeDistribution,
    /// Shannon entropy (nats) of the type distribution.
    pub type_entropy: f64,
    /// Tax attributed to query-typed signals.
    pub query_energy: f64,
    pub inquiry_roi: f64,
    /// P(some agent responds at t+1 | some agent queried at t); 0.0 with no queries.
    pub query_response_coupling: f64,
    pub query_count: u64,
    pub response_count: u64,
}

impl InquiryMetrics {
    pub fn compute(
        history: &EpochHistory,
        target_rate: f64,
        tax_rate: f64,
        query_multiplier: f64,
    ) -> Self {
        if history.is_empty() {
            return Self::default();
        }

        let mut counts = [0u64; 3];
        let mut query_energy = 0.0;
        for frame in &history.steps {
            for (ty, sig) in frame.types.iter().zip(&frame.signals) {
                let Some(ty) = ty else { continue };
                counts[ty.index()] += 1;
                if *ty == SignalType::Query {
                    let magnitude: f64 = sig.iter().flatten().map(|s| s.abs()).sum();
                    query_energy += tax_rate * query_multiplier * magnitude;
                }
            }
        }

        let total = counts.iter().sum::<u64>().max(1) as f64;
        let fracs = counts.map(|c| c as f64 / total);
        let type_entropy = -fracs
            .iter()
            .filter(|p| **p > 0.0)
            .map(|p| p * p.ln())
            .sum::<f64>();

        Self {
            type_distribution: TypeDistribution {
                declare: round4(fracs[0]),
                query: round4(fracs[1]),
                respond: round4(fracs[2]),
            },
            type_entropy,
            query_energy,
            inquiry_roi: target_rate / query_energy.max(1e-8),
            query_response_coupling: query_response_coupling(history),
            query_count: counts[SignalType::Query.index()],
            response_count: counts[SignalType::Respond.index()],
        }
    }
}

/// Fraction of query-bearing steps followed by a response-bearing step.
pub fn query_response_coupling(history: &EpochHistory) -> f64 {
    let has = |i: usize, t: SignalType| history.steps[i].sent_types().any(|x| x == t);
    let query_steps: Vec<usize> = (0..history.steps.len())
        .filter(|&i| has(i, SignalType::Query))
        .collect();
    if query_steps.is_empty() {
        return 0.0;
    }
    let answered = query_steps
        .iter()
        .filter(|&&i| i + 1 < history.steps.len() && has(i + 1, SignalType::Respond))
        .count();
    answered as f64 / query_steps.len() as f64
}

pub(crate) fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

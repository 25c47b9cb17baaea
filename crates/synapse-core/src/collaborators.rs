//! Capability traits for the pluggable parts of a simulation.
//!
//! The engine drives these synchronously on its worker thread and never
//! inspects their internals. Agents are addressed by position in the
//! environment's canonical agent order.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::channel::{EpochHistory, SignalType};

/// What one agent produces for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutput {
    /// Outgoing message; must have the channel's signal dimension.
    pub signal: Vec<f64>,
    /// Probability over discrete actions; must be non-empty and sum to ~1.
    pub action_probs: Vec<f64>,
    /// Three raw logits over `DECLARE`, `QUERY`, `RESPOND`.
    pub type_logits: Vec<f64>,
}

/// One recorded decision and the reward it earned.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub representation: Vec<f64>,
    pub action: usize,
    /// Present when the protocol trains the type head.
    pub signal_type: Option<SignalType>,
    pub log_prob: f64,
    pub reward: f64,
}

/// The transitions of one agent over one episode.
pub type Trajectory = Vec<Transition>;

/// Per-agent perception and policy.
pub trait Learner: Send {
    fn encode(&mut self, observation: &[f64], incoming: &[f64]) -> anyhow::Result<Vec<f64>>;

    fn act(&mut self, representation: &[f64]) -> anyhow::Result<AgentOutput>;

    /// One optimisation step over the epoch's trajectories; returns the loss.
    fn update(&mut self, trajectories: &[Trajectory]) -> anyhow::Result<f64>;

    /// Drop any per-episode state (recurrent memory and the like).
    fn clear_episode(&mut self);
}

/// Why an episode ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    TargetReached,
    EnergyDepleted,
    StepLimit,
}

impl TerminationReason {
    /// Pick the reason when several hold at once:
    /// target reached > energy depleted > step limit.
    pub fn resolve(target_reached: bool, energy_depleted: bool, step_limit: bool) -> Option<Self> {
        if target_reached {
            Some(TerminationReason::TargetReached)
        } else if energy_depleted {
            Some(TerminationReason::EnergyDepleted)
        } else if step_limit {
            Some(TerminationReason::StepLimit)
        } else {
            None
        }
    }
}

/// Result of advancing the environment by one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub observations: Vec<Vec<f64>>,
    pub rewards: Vec<f64>,
    /// Energy left per agent after the step.
    pub energy_remaining: Vec<f64>,
    /// Set on the step that ends the episode.
    pub termination: Option<TerminationReason>,
    /// Total energy consumed by all agents since reset.
    pub energy_spent: f64,
}

/// The simulated world.
pub trait Environment: Send {
    /// Agent ids in canonical order; fixed for the lifetime of the environment.
    fn agent_ids(&self) -> Vec<String>;

    /// Start a new episode; returns the initial observation of every agent.
    fn reset(&mut self, seed: u64) -> anyhow::Result<Vec<Vec<f64>>>;

    fn step(&mut self, actions: &[usize]) -> anyhow::Result<StepOutcome>;
}

/// Pure statistics over one epoch of recorded signals.
///
/// Expected keys are `entropy`, `mutual_information`, `transfer_entropy` and
/// `zipf`; missing ones are filled with empty objects downstream.
pub trait Analyzer: Send {
    fn analyze(&self, history: &EpochHistory) -> Map<String, Value>;
}

/// Everything the engine needs beyond its configuration.
pub struct Collaborators {
    pub environment: Box<dyn Environment>,
    /// One learner per agent, in canonical agent order.
    pub learners: Vec<Box<dyn Learner>>,
    pub analyzer: Box<dyn Analyzer>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termination_priority() {
        use TerminationReason::*;
        assert_eq!(TerminationReason::resolve(true, true, true), Some(TargetReached));
        assert_eq!(TerminationReason::resolve(false, true, true), Some(EnergyDepleted));
        assert_eq!(TerminationReason::resolve(false, false, true), Some(StepLimit));
        assert_eq!(TerminationReason::resolve(false, false, false), None);
    }
}

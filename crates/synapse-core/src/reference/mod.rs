//! Reference collaborators.
//!
//! Small, fully seeded implementations of the collaborator traits used by
//! the `synapse` CLI and the test-suite. The engine never depends on them.

pub mod grid_world;
pub mod softmax_learner;

use serde_json::{Map, Value};

use crate::channel::EpochHistory;
use crate::collaborators::{Analyzer, Collaborators, Environment, Learner};
use crate::domain::SimulationConfig;
use crate::engine::episode_seed;

pub use grid_world::{GridWorld, GridWorldConfig, OBSERVATION_DIM};
pub use softmax_learner::{LearnerParams, SoftmaxLearner};

/// Grid-world action count (four moves and stay).
pub const NUM_ACTIONS: usize = 5;

/// Analyzer that reports nothing; every analysis key is filled with `{}`
/// before persistence.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAnalyzer;

impl Analyzer for NullAnalyzer {
    fn analyze(&self, _history: &EpochHistory) -> Map<String, Value> {
        Map::new()
    }
}

/// A grid world with one softmax learner per agent, all seeded from
/// `config.seed`.
pub fn reference_collaborators(config: &SimulationConfig) -> Collaborators {
    let environment = GridWorld::new(GridWorldConfig::for_simulation(config));
    let agents = environment.agent_ids().len();
    let incoming_dim = config.signal_dim * agents.saturating_sub(1);
    let learners = (0..agents)
        .map(|i| {
            Box::new(SoftmaxLearner::new(
                OBSERVATION_DIM,
                incoming_dim,
                config.signal_dim,
                NUM_ACTIONS,
                episode_seed(config.seed, u64::MAX, i as u32),
                LearnerParams::default(),
            )) as Box<dyn Learner>
        })
        .collect();
    Collaborators {
        environment: Box::new(environment),
        learners,
        analyzer: Box::new(NullAnalyzer),
    }
}

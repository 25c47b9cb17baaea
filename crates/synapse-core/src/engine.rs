//! Epoch scheduler.
//!
//! A [`SimulationEngine`] owns one run's collaborators, channel and protocol
//! policy and is driven synchronously on a single worker. The only way
//! results leave it is the per-epoch callback passed to
//! [`SimulationEngine::run`].

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::channel::{CommunicationChannel, KillSwitch, SignalType};
use crate::collaborators::{
    AgentOutput, Analyzer, Collaborators, Environment, Learner, TerminationReason, Trajectory,
    Transition,
};
use crate::controller::{Boundary, RunController};
use crate::domain::{Result, SimulationConfig, SynapseError};
use crate::protocol::{softmax, ProtocolPolicy, RewardContext};

/// Floor applied before taking logarithms of probabilities.
const PROB_FLOOR: f64 = 1e-12;

/// How the epoch loop ended when it did not fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineExit {
    Completed,
    Stopped,
}

/// Seed for one episode, derived from the run seed and its position.
///
/// SplitMix64 finaliser over the mixed inputs, so neighbouring epochs and
/// episodes get unrelated streams.
pub fn episode_seed(base: u64, epoch: u64, episode: u32) -> u64 {
    let mut z = base
        ^ epoch.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ u64::from(episode).wrapping_mul(0xD1B5_4A32_D192_ED03);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

struct EpisodeSummary {
    total_rewards: Vec<f64>,
    survived: bool,
    target_reached: bool,
    steps: u32,
    energy_spent: f64,
}

pub struct SimulationEngine {
    config: SimulationConfig,
    policy: ProtocolPolicy,
    environment: Box<dyn Environment>,
    learners: Vec<Box<dyn Learner>>,
    analyzer: Box<dyn Analyzer>,
    channel: CommunicationChannel,
    agents: Vec<String>,
    next_epoch: u64,
}

impl SimulationEngine {
    pub fn new(config: SimulationConfig, collaborators: Collaborators) -> Result<Self> {
        Self::with_kill_switch(config, collaborators, KillSwitch::new())
    }

    /// Build an engine whose channel reads `kill`, so a controller created
    /// before the engine can share it.
    pub fn with_kill_switch(
        config: SimulationConfig,
        collaborators: Collaborators,
        kill: KillSwitch,
    ) -> Result<Self> {
        config.validate()?;
        let Collaborators {
            environment,
            learners,
            analyzer,
        } = collaborators;

        let agents = environment.agent_ids();
        if agents.is_empty() {
            return Err(SynapseError::Configuration(
                "environment exposes no agents".to_string(),
            ));
        }
        if learners.len() != agents.len() {
            return Err(SynapseError::Configuration(format!(
                "{} learners supplied for {} agents",
                learners.len(),
                agents.len()
            )));
        }

        let channel = CommunicationChannel::with_kill_switch(agents.clone(), config.signal_dim, kill);
        Ok(Self {
            policy: ProtocolPolicy::from_config(&config),
            config,
            environment,
            learners,
            analyzer,
            channel,
            agents,
            next_epoch: 0,
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn agents(&self) -> &[String] {
        &self.agents
    }

    pub fn kill_switch(&self) -> KillSwitch {
        self.channel.kill_switch()
    }

    /// Index of the next epoch to run.
    pub fn next_epoch(&self) -> u64 {
        self.next_epoch
    }

    /// Drive epochs until the configured count is reached or `controller`
    /// asks to stop at a boundary.
    ///
    /// `on_epoch` runs synchronously after every epoch and before the next
    /// one starts; an error from it ends the loop and is returned as is.
    pub fn run<F>(&mut self, controller: &RunController, mut on_epoch: F) -> Result<EngineExit>
    where
        F: FnMut(u64, Map<String, Value>) -> Result<()>,
    {
        while self.next_epoch < self.config.num_epochs {
            if controller.wait_at_boundary() == Boundary::Stop {
                return Ok(EngineExit::Stopped);
            }
            let epoch = self.next_epoch;
            let metrics = self.run_epoch()?;
            on_epoch(epoch, metrics)?;
            controller.record_epoch(epoch + 1);
        }
        Ok(EngineExit::Completed)
    }

    /// Run the next epoch and return its metrics map.
    pub fn run_epoch(&mut self) -> Result<Map<String, Value>> {
        let epoch = self.next_epoch;
        let tau = self.policy.temperature(epoch);
        let n = self.agents.len();
        let episodes = self.config.episodes_per_epoch;

        let mut trajectories: Vec<Vec<Trajectory>> = vec![Vec::new(); n];
        let mut reward_sums = vec![0.0; n];
        let mut survivals = 0u32;
        let mut targets = 0u32;
        let mut steps = 0u64;
        let mut energy_spent = 0.0;

        for episode in 0..episodes {
            let seed = episode_seed(self.config.seed, epoch, episode);
            let summary = self.run_episode(seed, tau, &mut trajectories)?;
            for (sum, r) in reward_sums.iter_mut().zip(&summary.total_rewards) {
                *sum += r;
            }
            survivals += u32::from(summary.survived);
            targets += u32::from(summary.target_reached);
            steps += u64::from(summary.steps);
            energy_spent += summary.energy_spent;
        }

        let mut losses = Map::new();
        for (i, learner) in self.learners.iter_mut().enumerate() {
            let loss = learner
                .update(&trajectories[i])
                .map_err(|e| learner_fault(&self.agents[i], e))?;
            losses.insert(self.agents[i].clone(), json!(loss));
        }
        trajectories.iter_mut().for_each(Vec::clear);

        let episodes_f = f64::from(episodes);
        let target_rate = f64::from(targets) / episodes_f;

        let history = self.channel.history();
        let analysis = self.analyzer.analyze(history);
        let extras =
            self.policy
                .epoch_extras(history, target_rate, self.config.communication_tax_rate)?;
        let comm_killed = self.channel.is_killed();
        self.channel.reset();

        let avg_reward: Map<String, Value> = self
            .agents
            .iter()
            .zip(&reward_sums)
            .map(|(a, s)| (a.clone(), json!(s / episodes_f)))
            .collect();

        let mut metrics = Map::new();
        metrics.insert("epoch".into(), json!(epoch));
        metrics.insert("avg_reward".into(), Value::Object(avg_reward));
        metrics.insert("survival_rate".into(), json!(f64::from(survivals) / episodes_f));
        metrics.insert("target_reached_rate".into(), json!(target_rate));
        metrics.insert("avg_steps".into(), json!(steps as f64 / episodes_f));
        metrics.insert("avg_energy_spent".into(), json!(energy_spent / episodes_f));
        metrics.insert("losses".into(), Value::Object(losses));
        metrics.extend(analysis);
        metrics.insert("comm_killed".into(), json!(comm_killed));
        metrics.insert("tau".into(), json!(tau));
        metrics.extend(extras);

        debug!(epoch, target_rate, comm_killed, "epoch simulated");
        self.next_epoch += 1;
        Ok(metrics)
    }

    fn run_episode(
        &mut self,
        seed: u64,
        tau: f64,
        trajectories: &mut [Vec<Trajectory>],
    ) -> Result<EpisodeSummary> {
        let n = self.agents.len();
        for learner in self.learners.iter_mut() {
            learner.clear_episode();
        }
        let mut observations = self.environment.reset(seed).map_err(environment_fault)?;
        check_len("reset observations", observations.len(), n)?;

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let trains_type = self.policy.trains_type_head();
        let mut episode: Vec<Trajectory> = vec![Vec::new(); n];
        let mut total_rewards = vec![0.0; n];
        let mut steps = 0u32;

        let termination = loop {
            let incoming: Vec<Vec<f64>> =
                self.agents.iter().map(|a| self.channel.receive_all(a)).collect();
            self.channel.clear();

            let mut decisions = Vec::with_capacity(n);
            for i in 0..n {
                let agent = &self.agents[i];
                let learner = &mut self.learners[i];
                let representation = learner
                    .encode(&observations[i], &incoming[i])
                    .map_err(|e| learner_fault(agent, e))?;
                let output = learner
                    .act(&representation)
                    .map_err(|e| learner_fault(agent, e))?;
                check_output(agent, &output)?;

                let decision = self.policy.resolve_type(
                    &output.type_logits,
                    tau,
                    self.config.training,
                    &mut rng,
                );
                self.channel
                    .send(agent, &output.signal, decision.label)
                    .map_err(|e| learner_fault(agent, e))?;
                decisions.push((representation, output, decision.label));
            }
            self.channel.record_step();

            let mut actions = Vec::with_capacity(n);
            let mut log_probs = Vec::with_capacity(n);
            for (_, output, label) in &decisions {
                let action = sample_index(&output.action_probs, &mut rng);
                let mut log_prob = output.action_probs[action].max(PROB_FLOOR).ln();
                if trains_type {
                    let type_probs = softmax(&output.type_logits, 1.0);
                    log_prob += type_probs[label.index()].max(PROB_FLOOR).ln();
                }
                actions.push(action);
                log_probs.push(log_prob);
            }

            let outcome = self.environment.step(&actions).map_err(environment_fault)?;
            check_len("step observations", outcome.observations.len(), n)?;
            check_len("step rewards", outcome.rewards.len(), n)?;
            check_len("step energy", outcome.energy_remaining.len(), n)?;
            steps += 1;

            for (i, (representation, output, label)) in decisions.into_iter().enumerate() {
                let reward = self.policy.reward(&RewardContext {
                    env_reward: outcome.rewards[i],
                    signal: &output.signal,
                    signal_type: label,
                    energy_remaining: outcome.energy_remaining[i],
                    energy_budget: self.config.energy_budget,
                    tax_rate: self.config.communication_tax_rate,
                    survival_bonus: self.config.survival_bonus,
                });
                total_rewards[i] += reward;
                episode[i].push(Transition {
                    representation,
                    action: actions[i],
                    signal_type: trains_type.then_some(label),
                    log_prob: log_probs[i],
                    reward,
                });
            }

            let energy_spent = outcome.energy_spent;
            observations = outcome.observations;
            let reason = outcome.termination.or_else(|| {
                (steps >= self.config.max_steps).then_some(TerminationReason::StepLimit)
            });
            if let Some(reason) = reason {
                break (reason, energy_spent);
            }
        };

        for (buffer, trajectory) in trajectories.iter_mut().zip(episode) {
            buffer.push(trajectory);
        }
        let (reason, energy_spent) = termination;
        Ok(EpisodeSummary {
            total_rewards,
            survived: reason != TerminationReason::EnergyDepleted,
            target_reached: reason == TerminationReason::TargetReached,
            steps,
            energy_spent,
        })
    }
}

/// Draw an index from a probability vector; falls back to the last index
/// when rounding leaves the cumulative sum short of the draw.
fn sample_index<R: Rng + ?Sized>(probs: &[f64], rng: &mut R) -> usize {
    let u: f64 = rng.gen();
    let mut acc = 0.0;
    for (i, p) in probs.iter().enumerate() {
        acc += p;
        if u < acc {
            return i;
        }
    }
    probs.len() - 1
}

fn check_output(agent: &str, output: &AgentOutput) -> Result<()> {
    let fault = |message: String| SynapseError::LearnerFault {
        agent: agent.to_string(),
        message,
    };
    if output.action_probs.is_empty() {
        return Err(fault("empty action distribution".into()));
    }
    if output.action_probs.iter().any(|p| !p.is_finite() || *p < 0.0) {
        return Err(fault("action distribution holds a negative or non-finite value".into()));
    }
    let total: f64 = output.action_probs.iter().sum();
    if (total - 1.0).abs() > 1e-6 {
        return Err(fault(format!("action distribution sums to {total}")));
    }
    if output.type_logits.len() != SignalType::ALL.len() {
        return Err(fault(format!(
            "expected {} type logits, got {}",
            SignalType::ALL.len(),
            output.type_logits.len()
        )));
    }
    if output.type_logits.iter().chain(&output.signal).any(|x| !x.is_finite()) {
        return Err(fault("non-finite signal or type logit".into()));
    }
    Ok(())
}

fn check_len(what: &str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(SynapseError::EnvironmentFault {
            message: format!("{what}: expected {expected} agents, got {got}"),
        });
    }
    Ok(())
}

fn learner_fault(agent: &str, err: impl std::fmt::Display) -> SynapseError {
    SynapseError::LearnerFault {
        agent: agent.to_string(),
        message: err.to_string(),
    }
}

fn environment_fault(err: anyhow::Error) -> SynapseError {
    SynapseError::EnvironmentFault {
        message: format!("{err:#}"),
    }
}

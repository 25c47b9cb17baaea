//! Seeded grid world with a shared target, static obstacles and per-agent
//! energy budgets.
//!
//! Actions: `0` up, `1` down, `2` left, `3` right, `4` stay. Moving costs
//! `move_cost`; bumping into an obstacle costs `collision_penalty` and leaves
//! the agent in place. The episode ends when any agent stands on the target,
//! every agent's energy is spent, or the step limit is reached.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::collaborators::{Environment, StepOutcome, TerminationReason};
use crate::domain::SimulationConfig;

/// Bonus added to the distance reward on the step an agent reaches the target.
pub const TARGET_BONUS: f64 = 10.0;

/// Length of each agent's observation vector.
pub const OBSERVATION_DIM: usize = 6;

const MOVES: [(i64, i64); 5] = [(-1, 0), (1, 0), (0, -1), (0, 1), (0, 0)];

#[derive(Debug, Clone, PartialEq)]
pub struct GridWorldConfig {
    pub grid_size: i64,
    pub num_obstacles: usize,
    pub agents: Vec<String>,
    pub max_steps: u32,
    pub energy_budget: f64,
    pub move_cost: f64,
    pub collision_penalty: f64,
}

impl Default for GridWorldConfig {
    fn default() -> Self {
        Self {
            grid_size: 20,
            num_obstacles: 8,
            agents: vec!["A".into(), "B".into(), "C".into()],
            max_steps: 100,
            energy_budget: 100.0,
            move_cost: 1.0,
            collision_penalty: 5.0,
        }
    }
}

impl GridWorldConfig {
    /// World shaped by a run's world params, step limit and energy budget.
    pub fn for_simulation(config: &SimulationConfig) -> Self {
        Self {
            grid_size: config.world.grid_size,
            num_obstacles: config.world.num_obstacles,
            max_steps: config.max_steps,
            energy_budget: config.energy_budget,
            move_cost: config.world.move_cost,
            collision_penalty: config.world.collision_penalty,
            ..Self::default()
        }
    }
}

type Cell = (i64, i64);

pub struct GridWorld {
    config: GridWorldConfig,
    target: Cell,
    obstacles: Vec<Cell>,
    positions: Vec<Cell>,
    energy: Vec<f64>,
    step_count: u32,
}

impl GridWorld {
    pub fn new(config: GridWorldConfig) -> Self {
        let n = config.agents.len();
        Self {
            target: (0, 0),
            obstacles: Vec::new(),
            positions: vec![(0, 0); n],
            energy: vec![config.energy_budget; n],
            step_count: 0,
            config,
        }
    }

    pub fn target(&self) -> (i64, i64) {
        self.target
    }

    pub fn positions(&self) -> &[(i64, i64)] {
        &self.positions
    }

    fn max_distance(&self) -> f64 {
        self.config.grid_size as f64 * std::f64::consts::SQRT_2
    }

    fn distance(a: Cell, b: Cell) -> f64 {
        (((a.0 - b.0).pow(2) + (a.1 - b.1).pow(2)) as f64).sqrt()
    }

    fn observe(&self, i: usize) -> Vec<f64> {
        let gs = self.config.grid_size as f64;
        let (x, y) = self.positions[i];
        vec![
            (self.target.0 - x) as f64 / gs,
            (self.target.1 - y) as f64 / gs,
            Self::distance((x, y), self.target) / self.max_distance(),
            self.energy[i] / self.config.energy_budget,
            x as f64 / gs,
            y as f64 / gs,
        ]
    }

    fn observations(&self) -> Vec<Vec<f64>> {
        (0..self.positions.len()).map(|i| self.observe(i)).collect()
    }

    fn energy_spent(&self) -> f64 {
        self.energy
            .iter()
            .map(|e| self.config.energy_budget - e)
            .sum()
    }
}

impl Environment for GridWorld {
    fn agent_ids(&self) -> Vec<String> {
        self.config.agents.clone()
    }

    fn reset(&mut self, seed: u64) -> anyhow::Result<Vec<Vec<f64>>> {
        let gs = self.config.grid_size;
        let free_cells = (gs * gs) as usize;
        anyhow::ensure!(
            1 + self.config.num_obstacles + self.config.agents.len() <= free_cells,
            "grid of size {gs} cannot hold the target, {} obstacles and {} agents",
            self.config.num_obstacles,
            self.config.agents.len()
        );

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut cell = || (rng.gen_range(0..gs), rng.gen_range(0..gs));

        self.step_count = 0;
        self.target = cell();
        self.obstacles.clear();
        for _ in 0..self.config.num_obstacles {
            let pos = loop {
                let pos = cell();
                if pos != self.target {
                    break pos;
                }
            };
            self.obstacles.push(pos);
        }

        self.positions.clear();
        for _ in 0..self.config.agents.len() {
            let pos = loop {
                let pos = cell();
                if pos != self.target
                    && !self.obstacles.contains(&pos)
                    && !self.positions.contains(&pos)
                {
                    break pos;
                }
            };
            self.positions.push(pos);
        }
        self.energy = vec![self.config.energy_budget; self.positions.len()];
        Ok(self.observations())
    }

    fn step(&mut self, actions: &[usize]) -> anyhow::Result<StepOutcome> {
        anyhow::ensure!(
            actions.len() == self.positions.len(),
            "expected {} actions, got {}",
            self.positions.len(),
            actions.len()
        );
        self.step_count += 1;
        let last = self.config.grid_size - 1;
        let max_dist = self.max_distance();

        let mut rewards = Vec::with_capacity(actions.len());
        let mut any_reached = false;
        for (i, &action) in actions.iter().enumerate() {
            let (dx, dy) = MOVES.get(action).copied().unwrap_or((0, 0));
            let (x, y) = self.positions[i];
            let next = ((x + dx).clamp(0, last), (y + dy).clamp(0, last));

            if self.obstacles.contains(&next) {
                self.energy[i] -= self.config.collision_penalty;
            } else {
                self.energy[i] -= self.config.move_cost;
                self.positions[i] = next;
            }

            let pos = self.positions[i];
            let reached = pos == self.target;
            any_reached |= reached;
            let mut reward = 1.0 - Self::distance(pos, self.target) / max_dist;
            if reached {
                reward += TARGET_BONUS;
            }
            rewards.push(reward);
        }

        let all_depleted = self.energy.iter().all(|e| *e <= 0.0);
        let timeout = self.step_count >= self.config.max_steps;
        Ok(StepOutcome {
            observations: self.observations(),
            rewards,
            energy_remaining: self.energy.clone(),
            termination: TerminationReason::resolve(any_reached, all_depleted, timeout),
            energy_spent: self.energy_spent(),
        })
    }
}

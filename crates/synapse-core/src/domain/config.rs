//! Simulation parameters and process settings.
//!
//! `SimulationConfig` is per run and is stored verbatim in the run row, so
//! a manifest can be rebuilt from the ledger alone. `Settings` is per process
//! and comes from `SYNAPSE_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::error::{Result, SynapseError};

/// Closed set of protocol variants. The numeric id is the stored form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ProtocolId {
    /// Flat communication tax, untrained type head.
    Baseline = 0,
    /// Typed signals with per-type costs and an annealed temperature.
    Interrogative = 1,
}

impl ProtocolId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolId::Baseline => "baseline",
            ProtocolId::Interrogative => "interrogative",
        }
    }
}

impl TryFrom<u8> for ProtocolId {
    type Error = SynapseError;

    fn try_from(id: u8) -> Result<Self> {
        match id {
            0 => Ok(ProtocolId::Baseline),
            1 => Ok(ProtocolId::Interrogative),
            other => Err(SynapseError::Configuration(format!(
                "unknown protocol id {other} (valid: 0, 1)"
            ))),
        }
    }
}

impl From<ProtocolId> for u8 {
    fn from(id: ProtocolId) -> Self {
        id as u8
    }
}

impl std::fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-type multipliers on the communication tax.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostMultipliers {
    pub declare: f64,
    pub query: f64,
    pub respond: f64,
}

impl Default for CostMultipliers {
    fn default() -> Self {
        Self {
            declare: 1.0,
            query: 1.5,
            respond: 0.8,
        }
    }
}

impl CostMultipliers {
    pub const fn new(declare: f64, query: f64, respond: f64) -> Self {
        Self {
            declare,
            query,
            respond,
        }
    }
}

/// Preregistered cost conditions of the interrogative campaign.
///
/// `Control` runs the baseline protocol, which ignores per-type costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostCondition {
    Baseline,
    LowPressure,
    HighPressure,
    Extreme,
    Control,
}

impl CostCondition {
    pub const ALL: [CostCondition; 5] = [
        CostCondition::Baseline,
        CostCondition::LowPressure,
        CostCondition::HighPressure,
        CostCondition::Extreme,
        CostCondition::Control,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CostCondition::Baseline => "baseline",
            CostCondition::LowPressure => "low_pressure",
            CostCondition::HighPressure => "high_pressure",
            CostCondition::Extreme => "extreme",
            CostCondition::Control => "control",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }

    pub fn protocol(&self) -> ProtocolId {
        match self {
            CostCondition::Control => ProtocolId::Baseline,
            _ => ProtocolId::Interrogative,
        }
    }

    pub fn costs(&self) -> CostMultipliers {
        match self {
            CostCondition::Baseline | CostCondition::Control => CostMultipliers::default(),
            CostCondition::LowPressure => CostMultipliers::new(1.0, 1.2, 0.9),
            CostCondition::HighPressure => CostMultipliers::new(1.0, 3.0, 0.5),
            CostCondition::Extreme => CostMultipliers::new(1.0, 5.0, 0.3),
        }
    }

    /// Set the protocol and cost multipliers of `config`.
    pub fn apply(&self, config: &mut SimulationConfig) {
        config.protocol = self.protocol();
        config.costs = self.costs();
    }
}

impl std::fmt::Display for CostCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of the reference grid world.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldParams {
    pub grid_size: i64,
    pub num_obstacles: usize,
    pub move_cost: f64,
    pub collision_penalty: f64,
}

impl Default for WorldParams {
    fn default() -> Self {
        Self {
            grid_size: 20,
            num_obstacles: 8,
            move_cost: 1.0,
            collision_penalty: 5.0,
        }
    }
}

/// Named environment constraint sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioPreset {
    /// High move cost, dense obstacles, expensive communication.
    DeepSea,
    /// Wide open space, cheap movement and communication.
    Aerial,
    /// Small crowded grid where collisions are costly.
    Social,
}

impl ScenarioPreset {
    pub const ALL: [ScenarioPreset; 3] = [
        ScenarioPreset::DeepSea,
        ScenarioPreset::Aerial,
        ScenarioPreset::Social,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioPreset::DeepSea => "deep_sea",
            ScenarioPreset::Aerial => "aerial",
            ScenarioPreset::Social => "social",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == s)
    }

    pub fn config(&self) -> SimulationConfig {
        match self {
            ScenarioPreset::DeepSea => SimulationConfig::deep_sea(),
            ScenarioPreset::Aerial => SimulationConfig::aerial(),
            ScenarioPreset::Social => SimulationConfig::social(),
        }
    }
}

impl std::fmt::Display for ScenarioPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Warmup-then-exponential-decay temperature schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSchedule {
    pub warmup_epochs: u64,
    pub decay_epochs: u64,
    pub tau_max: f64,
    pub tau_min: f64,
}

impl Default for TemperatureSchedule {
    fn default() -> Self {
        Self {
            warmup_epochs: 20,
            decay_epochs: 60,
            tau_max: 1.0,
            tau_min: 0.1,
        }
    }
}

impl TemperatureSchedule {
    /// τ for `epoch`: `tau_max` during warmup, then
    /// `tau_min + (tau_max - tau_min)·e^(-3·progress)` floored at `tau_min`.
    pub fn tau(&self, epoch: u64) -> f64 {
        if epoch < self.warmup_epochs {
            return self.tau_max;
        }
        let progress =
            ((epoch - self.warmup_epochs) as f64 / self.decay_epochs.max(1) as f64).min(1.0);
        let tau = self.tau_min + (self.tau_max - self.tau_min) * (-3.0 * progress).exp();
        tau.max(self.tau_min)
    }
}

/// Parameters of one simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub seed: u64,
    pub num_epochs: u64,
    pub episodes_per_epoch: u32,
    pub max_steps: u32,
    pub energy_budget: f64,
    pub signal_dim: usize,
    pub communication_tax_rate: f64,
    pub survival_bonus: f64,
    pub protocol: ProtocolId,
    pub costs: CostMultipliers,
    pub temperature: TemperatureSchedule,
    /// Sample signal types stochastically (training) or by argmax (evaluation).
    pub training: bool,
    pub world: WorldParams,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_epochs: 100,
            episodes_per_epoch: 10,
            max_steps: 100,
            energy_budget: 100.0,
            signal_dim: 8,
            communication_tax_rate: 0.01,
            survival_bonus: 0.1,
            protocol: ProtocolId::Interrogative,
            costs: CostMultipliers::default(),
            temperature: TemperatureSchedule::default(),
            training: true,
            world: WorldParams::default(),
        }
    }
}

impl SimulationConfig {
    pub fn deep_sea() -> Self {
        Self {
            max_steps: 150,
            energy_budget: 80.0,
            communication_tax_rate: 0.02,
            survival_bonus: 0.15,
            world: WorldParams {
                grid_size: 25,
                num_obstacles: 15,
                move_cost: 1.5,
                collision_penalty: 8.0,
            },
            ..Self::default()
        }
    }

    pub fn aerial() -> Self {
        Self {
            max_steps: 80,
            energy_budget: 120.0,
            communication_tax_rate: 0.005,
            survival_bonus: 0.05,
            world: WorldParams {
                grid_size: 30,
                num_obstacles: 5,
                move_cost: 0.5,
                collision_penalty: 3.0,
            },
            ..Self::default()
        }
    }

    pub fn social() -> Self {
        Self {
            max_steps: 120,
            signal_dim: 12,
            communication_tax_rate: 0.005,
            survival_bonus: 0.2,
            world: WorldParams {
                grid_size: 15,
                num_obstacles: 12,
                move_cost: 1.0,
                collision_penalty: 10.0,
            },
            ..Self::default()
        }
    }

    /// Reject parameters no run could use. Nothing is silently clamped.
    pub fn validate(&self) -> Result<()> {
        fn bad(msg: impl Into<String>) -> Result<()> {
            Err(SynapseError::Configuration(msg.into()))
        }
        fn non_negative(name: &str, v: f64) -> Result<()> {
            if !v.is_finite() || v < 0.0 {
                return bad(format!("{name} must be a finite non-negative number, got {v}"));
            }
            Ok(())
        }

        if self.num_epochs == 0 {
            return bad("num_epochs must be at least 1");
        }
        if self.episodes_per_epoch == 0 {
            return bad("episodes_per_epoch must be at least 1");
        }
        if self.max_steps == 0 {
            return bad("max_steps must be at least 1");
        }
        if self.signal_dim == 0 {
            return bad("signal_dim must be at least 1");
        }
        if !self.energy_budget.is_finite() || self.energy_budget <= 0.0 {
            return bad(format!(
                "energy_budget must be positive, got {}",
                self.energy_budget
            ));
        }
        non_negative("communication_tax_rate", self.communication_tax_rate)?;
        non_negative("survival_bonus", self.survival_bonus)?;
        non_negative("costs.declare", self.costs.declare)?;
        non_negative("costs.query", self.costs.query)?;
        non_negative("costs.respond", self.costs.respond)?;

        let t = &self.temperature;
        if !t.tau_min.is_finite() || t.tau_min <= 0.0 {
            return bad(format!("tau_min must be positive, got {}", t.tau_min));
        }
        if !t.tau_max.is_finite() || t.tau_max < t.tau_min {
            return bad(format!(
                "tau_max ({}) must be >= tau_min ({})",
                t.tau_max, t.tau_min
            ));
        }
        if t.decay_epochs == 0 {
            return bad("temperature.decay_epochs must be at least 1");
        }

        let w = &self.world;
        if w.grid_size < 2 {
            return bad(format!("world.grid_size must be at least 2, got {}", w.grid_size));
        }
        let cells = w.grid_size.saturating_mul(w.grid_size) as usize;
        if w.num_obstacles >= cells / 2 {
            return bad(format!(
                "world.num_obstacles ({}) must leave most of the {cells} cells free",
                w.num_obstacles
            ));
        }
        non_negative("world.move_cost", w.move_cost)?;
        non_negative("world.collision_penalty", w.collision_penalty)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Process settings
// ---------------------------------------------------------------------------

pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 2;
pub const DEFAULT_STREAM_CAPACITY: usize = 200;
pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

/// Process-wide settings (`SYNAPSE_*` environment variables).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Cap on simultaneously active runs; `None` means unlimited.
    pub max_concurrent_runs: Option<usize>,
    /// Capacity of each run's live delivery queue.
    pub stream_capacity: usize,
    pub default_seed: u64,
    pub database_url: String,
    /// A non-terminal run whose row was not renewed within this window has
    /// no live worker and may be reconciled. Workers renew at a third of it.
    pub lease_ttl: Duration,
}

impl Settings {
    /// How often a worker renews its run's lease.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.lease_ttl / 3).max(Duration::from_millis(10))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_runs: Some(DEFAULT_MAX_CONCURRENT_RUNS),
            stream_capacity: DEFAULT_STREAM_CAPACITY,
            default_seed: DEFAULT_SEED,
            database_url: synapse_ledger::DEFAULT_DATABASE_URL.to_string(),
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`, so callers can supply a fixed map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
            raw.trim().parse::<T>().map_err(|_| {
                SynapseError::Configuration(format!("{key}={raw:?} is not a valid number"))
            })
        }

        let mut settings = Settings::default();
        if let Some(raw) = lookup("SYNAPSE_MAX_CONCURRENT_RUNS") {
            let n: usize = parse("SYNAPSE_MAX_CONCURRENT_RUNS", &raw)?;
            settings.max_concurrent_runs = (n > 0).then_some(n);
        }
        if let Some(raw) = lookup("SYNAPSE_STREAM_CAPACITY") {
            let n: usize = parse("SYNAPSE_STREAM_CAPACITY", &raw)?;
            if n == 0 {
                return Err(SynapseError::Configuration(
                    "SYNAPSE_STREAM_CAPACITY must be at least 1".to_string(),
                ));
            }
            settings.stream_capacity = n;
        }
        if let Some(raw) = lookup("SYNAPSE_DEFAULT_SEED") {
            settings.default_seed = parse("SYNAPSE_DEFAULT_SEED", &raw)?;
        }
        if let Some(url) = lookup("SYNAPSE_DATABASE_URL") {
            settings.database_url = url;
        }
        if let Some(raw) = lookup("SYNAPSE_LEASE_TTL_SECS") {
            settings.lease_ttl = Duration::from_secs(parse("SYNAPSE_LEASE_TTL_SECS", &raw)?);
        }
        Ok(settings)
    }
}

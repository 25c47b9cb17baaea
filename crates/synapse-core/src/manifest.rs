//! Run summaries derived from the committed epoch sequence.
//!
//! Everything here is a pure function of `(SimulationConfig, [EpochRecord])`,
//! so a manifest can be rebuilt from the ledger at any time and two nodes
//! reading the same chain produce the same document.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use synapse_ledger::{ChainHash, EpochRecord, RunRecord, StorageError};

use crate::domain::{CostMultipliers, ProtocolId, Result, SimulationConfig, SynapseError};
use crate::protocol::round4;

/// Consecutive low-entropy epochs needed to call a protocol crystallized.
pub const CRYSTALLIZATION_STREAK: u32 = 5;
/// Type entropy (nats) below which an epoch counts towards the streak.
pub const CRYSTALLIZATION_THRESHOLD: f64 = 0.95;
/// Minimum single-epoch entropy drop reported as a phase transition.
pub const PHASE_TRANSITION_DROP: f64 = 0.05;
/// Survival drop under a severed channel above which the protocol is load-bearing.
pub const LOAD_BEARING_DROP: f64 = 0.1;

/// `inquiry.type_entropy` of an epoch metrics map, if present.
pub fn type_entropy_of(metrics: &Value) -> Option<f64> {
    metrics.get("inquiry")?.get("type_entropy")?.as_f64()
}

/// Streaming detector for the first epoch of a sustained low-entropy streak.
///
/// Fed one epoch at a time by the live snapshot and in bulk by the manifest,
/// so both report the same epoch.
#[derive(Debug, Clone, Default)]
pub struct CrystallizationDetector {
    streak_start: Option<u64>,
    streak: u32,
    found: Option<u64>,
}

impl CrystallizationDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one epoch; returns the crystallization epoch once found.
    /// A missing entropy value breaks the streak.
    pub fn observe(&mut self, epoch: u64, type_entropy: Option<f64>) -> Option<u64> {
        if self.found.is_some() {
            return self.found;
        }
        match type_entropy {
            Some(h) if h < CRYSTALLIZATION_THRESHOLD => {
                if self.streak == 0 {
                    self.streak_start = Some(epoch);
                }
                self.streak += 1;
                if self.streak >= CRYSTALLIZATION_STREAK {
                    self.found = self.streak_start;
                }
            }
            _ => {
                self.streak = 0;
                self.streak_start = None;
            }
        }
        self.found
    }

    pub fn epoch(&self) -> Option<u64> {
        self.found
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalMetrics {
    pub survival_rate: f64,
    pub target_reached_rate: f64,
    pub energy_roi: f64,
    pub type_entropy: Option<f64>,
    /// Query→response coupling.
    pub qrc: Option<f64>,
}

impl FinalMetrics {
    fn from_metrics(m: &Value) -> Self {
        let num = |k: &str| m.get(k).and_then(Value::as_f64).unwrap_or(0.0);
        Self {
            survival_rate: num("survival_rate"),
            target_reached_rate: num("target_reached_rate"),
            energy_roi: num("energy_roi"),
            type_entropy: type_entropy_of(m),
            qrc: m
                .get("inquiry")
                .and_then(|i| i.get("query_response_coupling"))
                .and_then(Value::as_f64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub epoch: u64,
    pub entropy_before: f64,
    pub entropy_after: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub avg_survival_rate: f64,
    pub avg_target_rate: f64,
    pub max_survival_rate: f64,
    pub max_target_rate: f64,
}

/// Mean survival around the epochs that ran with the channel killed.
///
/// Epochs before the first killed epoch count as `before`; later epochs split
/// into `during` (killed) and `after` (restored). An empty group averages 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerturbationResilience {
    pub first_kill_epoch: u64,
    pub survival_before: f64,
    pub survival_during: f64,
    pub survival_after: f64,
    pub drop: f64,
    pub load_bearing: bool,
}

impl PerturbationResilience {
    /// `None` when no epoch ran with the channel killed.
    fn from_epochs(epochs: &[(u64, Value)]) -> Option<Self> {
        let killed = |m: &Value| m.get("comm_killed").and_then(Value::as_bool) == Some(true);
        let first_kill_epoch = epochs.iter().find(|(_, m)| killed(m)).map(|(e, _)| *e)?;

        let (mut before, mut during, mut after) = (Vec::new(), Vec::new(), Vec::new());
        for (epoch, m) in epochs {
            let survival = m.get("survival_rate").and_then(Value::as_f64).unwrap_or(0.0);
            if *epoch < first_kill_epoch {
                before.push(survival);
            } else if killed(m) {
                during.push(survival);
            } else {
                after.push(survival);
            }
        }
        let mean = |xs: &[f64]| {
            if xs.is_empty() {
                0.0
            } else {
                xs.iter().sum::<f64>() / xs.len() as f64
            }
        };
        let (b, d, a) = (mean(&before), mean(&during), mean(&after));
        let drop = b - d;
        Some(Self {
            first_kill_epoch,
            survival_before: round4(b),
            survival_during: round4(d),
            survival_after: round4(a),
            drop: round4(drop),
            load_bearing: drop > LOAD_BEARING_DROP,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub protocol: ProtocolId,
    pub seed: u64,
    pub costs: CostMultipliers,
    pub epochs_total: u64,
    /// Metrics of the last committed epoch; `None` for an empty run.
    pub final_metrics: Option<FinalMetrics>,
    pub crystallization_epoch: Option<u64>,
    pub phase_transitions: Vec<PhaseTransition>,
    pub performance_stats: PerformanceStats,
    /// Present only when the kill switch severed the channel for some epoch.
    pub perturbation_resilience: Option<PerturbationResilience>,
    /// Hash of the last committed epoch.
    pub chain_head: Option<ChainHash>,
}

impl RunManifest {
    /// Summarise `records`, which must be ordered by epoch index.
    pub fn from_records(config: &SimulationConfig, records: &[EpochRecord]) -> Result<Self> {
        let epochs = records
            .iter()
            .map(|r| Ok((r.epoch_index, r.metrics()?)))
            .collect::<std::result::Result<Vec<_>, StorageError>>()?;

        let mut detector = CrystallizationDetector::new();
        let mut transitions = Vec::new();
        let mut prev: Option<f64> = None;
        for (epoch, metrics) in &epochs {
            let h = type_entropy_of(metrics);
            detector.observe(*epoch, h);
            if let (Some(before), Some(after)) = (prev, h) {
                let delta = before - after;
                if delta > PHASE_TRANSITION_DROP {
                    transitions.push(PhaseTransition {
                        epoch: *epoch,
                        entropy_before: round4(before),
                        entropy_after: round4(after),
                        delta: round4(delta),
                    });
                }
            }
            prev = h;
        }

        Ok(Self {
            protocol: config.protocol,
            seed: config.seed,
            costs: config.costs,
            epochs_total: epochs.len() as u64,
            final_metrics: epochs.last().map(|(_, m)| FinalMetrics::from_metrics(m)),
            crystallization_epoch: detector.epoch(),
            phase_transitions: transitions,
            performance_stats: performance_stats(epochs.iter().map(|(_, m)| m)),
            perturbation_resilience: PerturbationResilience::from_epochs(&epochs),
            chain_head: records.last().map(|r| r.hash.clone()),
        })
    }

    /// Summarise a stored run using the parameters recorded on its row.
    pub fn from_run(run: &RunRecord, records: &[EpochRecord]) -> Result<Self> {
        let config: SimulationConfig = serde_json::from_value(run.params.clone()).map_err(|e| {
            SynapseError::Configuration(format!("run {} has unreadable params: {e}", run.run_id))
        })?;
        Self::from_records(&config, records)
    }
}

fn performance_stats<'a>(epochs: impl Iterator<Item = &'a Value>) -> PerformanceStats {
    let (mut n, mut sum_s, mut sum_t, mut max_s, mut max_t) = (0usize, 0.0, 0.0, 0.0f64, 0.0f64);
    for m in epochs {
        let s = m.get("survival_rate").and_then(Value::as_f64).unwrap_or(0.0);
        let t = m.get("target_reached_rate").and_then(Value::as_f64).unwrap_or(0.0);
        n += 1;
        sum_s += s;
        sum_t += t;
        max_s = max_s.max(s);
        max_t = max_t.max(t);
    }
    let n = n.max(1) as f64;
    PerformanceStats {
        avg_survival_rate: round4(sum_s / n),
        avg_target_rate: round4(sum_t / n),
        max_survival_rate: round4(max_s),
        max_target_rate: round4(max_t),
    }
}

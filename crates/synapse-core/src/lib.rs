//! Synapse Core Library
//!
//! Orchestration and integrity layer for multi-agent simulation runs:
//! the epoch scheduler, protocol policies, the communication channel with
//! its ablation kill switch, the run lifecycle controller and the registry
//! that chains every epoch into the ledger and streams it live.
//!
//! ## Layer 1 - Orchestration
//!
//! - `engine`: `SimulationEngine`, one run driven synchronously per worker
//! - `controller`: `RunController`, the lifecycle state machine
//! - `manager`: `RunManager`, live runs, persistence and streaming
//! - `ledger`: `EpochLedger`, the per-run append cursor over `EpochStore`
//! - `manifest`: run summaries rebuilt from the committed chain
//! - `reference`: seeded grid world and softmax learner for CLI and tests

pub mod channel;
pub mod collaborators;
pub mod controller;
pub mod domain;
pub mod engine;
pub mod ledger;
pub mod manager;
pub mod manifest;
pub mod metrics;
pub mod obs;
pub mod protocol;
pub mod reference;
pub mod stream;
pub mod telemetry;

pub use channel::{
    ChannelError, CommFrame, CommunicationChannel, EpochHistory, KillSwitch, SignalType,
};
pub use collaborators::{
    AgentOutput, Analyzer, Collaborators, Environment, Learner, StepOutcome, TerminationReason,
    Trajectory, Transition,
};
pub use controller::{
    Boundary, ControlOutcome, KillSwitchAction, KillSwitchEvent, RunController, RunLifecycle,
    Terminal,
};
pub use domain::{
    CostCondition, CostMultipliers, ProtocolId, Result, ScenarioPreset, Settings,
    SimulationConfig, SynapseError, TemperatureSchedule, WorldParams,
};
pub use engine::{episode_seed, EngineExit, SimulationEngine};
pub use ledger::{verify_run, EpochLedger};
pub use manager::{finalize_epoch_metrics, RunManager, RunSnapshot, REQUIRED_METRIC_KEYS};
pub use manifest::{CrystallizationDetector, PerturbationResilience, RunManifest};
pub use obs::{
    emit_control_applied, emit_epoch_committed, emit_run_failed, emit_run_finished,
    emit_run_reconciled, emit_run_started, emit_stream_dropped, RunSpan,
};
pub use protocol::{InquiryMetrics, ProtocolPolicy, RewardContext, TypeDecision};
pub use reference::{reference_collaborators, NullAnalyzer};
pub use stream::{DeliveryQueue, StreamItem};
pub use telemetry::init_tracing;

pub use synapse_ledger::{
    verify_chain, ChainHash, ChainVerdict, EpochRecord, EpochStore, RunId, RunRecord, RunStatus,
};

/// Crate version, as recorded in the workspace manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Domain models for Synapse.
//!
//! - `SimulationConfig` / `ProtocolId`: what a run computes, with named
//!   scenario presets and campaign cost conditions
//! - `Settings`: process-wide limits read from the environment
//! - `SynapseError`: the error taxonomy shared by every layer above the store

pub mod config;
pub mod error;

pub use config::{
    CostCondition, CostMultipliers, ProtocolId, ScenarioPreset, Settings, SimulationConfig,
    TemperatureSchedule, WorldParams, DEFAULT_LEASE_TTL, DEFAULT_MAX_CONCURRENT_RUNS,
    DEFAULT_SEED, DEFAULT_STREAM_CAPACITY,
};
pub use error::{Result, SynapseError};

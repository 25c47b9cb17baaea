//! Domain-level error taxonomy for Synapse.

use synapse_ledger::StorageError;

/// Synapse domain errors.
#[derive(Debug, thiserror::Error)]
pub enum SynapseError {
    /// Invalid protocol id or simulation parameter; raised before any run starts.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// `start` attempted while the active-run limit is saturated.
    #[error("concurrency limit reached: {limit} runs already active")]
    ConcurrencyRejection { limit: usize },

    /// A ledger or store write failed during the epoch callback.
    #[error("transient io failure: {0}")]
    TransientIo(String),

    #[error("learner {agent} failed: {message}")]
    LearnerFault { agent: String, message: String },

    #[error("environment failed: {message}")]
    EnvironmentFault { message: String },

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result type for Synapse domain operations.
pub type Result<T> = std::result::Result<T, SynapseError>;

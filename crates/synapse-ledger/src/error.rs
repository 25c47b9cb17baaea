//! Error types for synapse-ledger

use thiserror::Error;

/// Errors raised while connecting to or preparing the SurrealDB backend
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors surfaced through the [`crate::EpochStore`] boundary.
#[derive(Error, Debug)]
pub enum StorageError {
    /// No run with this id exists
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// The run is not in a state that accepts the requested write
    #[error("run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    /// An epoch was committed out of sequence
    #[error("run {run_id}: epoch {got} committed out of order (expected {expected})")]
    EpochOutOfOrder {
        run_id: String,
        expected: u64,
        got: u64,
    },

    /// A stored hash is not 64 lowercase hex characters
    #[error("invalid chain hash: {hash}")]
    InvalidHash { hash: String },

    /// Serialization of a record failed
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Backend (database / IO) failure
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}

//! synapse-ledger: hash-chained epoch ledger and durable run store
//!
//! This crate is the persistence layer for Synapse simulation runs. It owns
//! the canonical hashing rules and every byte that gets written to disk.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: tamper evidence, contiguity, and atomic head updates.
//!
//! ## Key Components
//!
//! - `chain`: canonical JSON, `compute_hash`, `build_chain`, `verify_chain`
//! - `EpochStore`: the async store boundary (runs + epoch records)
//! - `MemoryEpochStore`: in-memory fake for tests
//! - `SurrealEpochStore`: SurrealDB backend (`mem://`, `surrealkv://`, remote)

pub mod chain;
mod error;
pub mod fakes;
pub mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use chain::{
    build_chain, canonical_json, compute_hash, link_epoch, verify_chain, BreakReason,
    ChainVerdict, GENESIS_HASH,
};
pub use error::{StateError, StorageError};
pub use storage_traits::{
    ChainHash, EpochRecord, EpochStore, NewRun, RunId, RunRecord, RunStatus, StorageResult,
};
pub use surreal_store::{SurrealEpochStore, DEFAULT_DATABASE_URL};

/// Result type for backend setup operations
pub type Result<T> = std::result::Result<T, StateError>;

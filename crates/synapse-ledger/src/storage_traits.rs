//! Storage trait definitions for Synapse
//!
//! The ledger boundary is a single trait:
//! - `EpochStore`: run rows plus the append-only, hash-linked epoch records
//!
//! The trait is async and backend-agnostic. An in-memory fake lives in the
//! `fakes` module; `SurrealEpochStore` is the durable implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ChainHash
// ---------------------------------------------------------------------------

/// SHA-256 hash of one chain link, as 64 lowercase hex characters.
///
/// The inner field is private so every value is either produced by hashing
/// or validated through `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChainHash(String);

impl ChainHash {
    /// The fixed predecessor of epoch 0: 64 zero characters.
    pub fn genesis() -> Self {
        ChainHash("0".repeat(64))
    }

    /// Wrap a raw 32-byte digest.
    pub fn from_digest(bytes: &[u8]) -> Self {
        ChainHash(hex::encode(bytes))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }

    pub fn is_genesis(&self) -> bool {
        self.0.bytes().all(|b| b == b'0')
    }
}

impl TryFrom<String> for ChainHash {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidHash { hash: s });
        }
        Ok(ChainHash(s.to_ascii_lowercase()))
    }
}

impl From<ChainHash> for String {
    fn from(hash: ChainHash) -> Self {
        hash.0
    }
}

impl std::fmt::Display for ChainHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Unique identifier for a simulation run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        RunId(s.to_string())
    }
}

/// Lifecycle status of a run.
///
/// `pending → running ⇄ paused`, and `running | paused → completed | stopped | failed`.
/// The last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Stopped,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Stopped => "stopped",
            RunStatus::Failed => "failed",
        }
    }

    /// Parse the lowercase storage form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "paused" => Some(RunStatus::Paused),
            "completed" => Some(RunStatus::Completed),
            "stopped" => Some(RunStatus::Stopped),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Stopped | RunStatus::Failed
        )
    }

    /// Non-terminal states that imply a live worker.
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Paused)
    }

    /// Whether `self → next` is an edge of the lifecycle. A pending run may
    /// only start or be failed by reconciliation.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Paused)
                | (Paused, Running)
                | (Running | Paused, Completed | Stopped | Failed)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters supplied when a run row is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRun {
    pub run_id: RunId,
    pub seed: u64,
    pub total_epochs: u64,
    /// Full simulation parameters, stored verbatim for audit.
    pub params: serde_json::Value,
}

/// Persisted run row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub seed: u64,
    pub status: RunStatus,
    pub total_epochs: u64,
    /// Number of committed epochs (`1 + last epoch_index`, 0 if none).
    pub current_epoch: u64,
    /// Hash of the last committed epoch.
    pub final_hash: Option<ChainHash>,
    pub params: serde_json::Value,
    /// Fault message when `status == Failed`.
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// A fresh `pending` row for `new`.
    pub fn pending(new: NewRun) -> Self {
        let now = Utc::now();
        Self {
            run_id: new.run_id,
            seed: new.seed,
            status: RunStatus::Pending,
            total_epochs: new.total_epochs,
            current_epoch: 0,
            final_hash: None,
            params: new.params,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Hash the next epoch must link to.
    pub fn chain_head(&self) -> ChainHash {
        self.final_hash.clone().unwrap_or_else(ChainHash::genesis)
    }
}

// ---------------------------------------------------------------------------
// Epoch records
// ---------------------------------------------------------------------------

/// One committed epoch: its canonical metrics and its link in the hash chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub run_id: RunId,
    /// 0-based, strictly contiguous within a run.
    pub epoch_index: u64,
    /// Canonical JSON of the epoch metrics, exactly as hashed.
    pub metrics_json: String,
    pub hash: ChainHash,
    pub prev_hash: ChainHash,
    pub timestamp: DateTime<Utc>,
}

impl EpochRecord {
    /// Parse the stored metrics blob.
    pub fn metrics(&self) -> StorageResult<serde_json::Value> {
        Ok(serde_json::from_str(&self.metrics_json)?)
    }
}

/// Durable run/epoch store.
///
/// Guarantees:
/// - Epoch records of a run are contiguous from 0 and never rewritten.
/// - `commit_epoch` appends the record and advances `current_epoch` /
///   `final_hash` atomically.
/// - A run enters a terminal status at most once; terminal runs reject
///   further epochs and status changes.
#[async_trait]
pub trait EpochStore: Send + Sync {
    /// Create a run row in `pending` status.
    async fn create_run(&self, new: NewRun) -> StorageResult<RunRecord>;

    /// Move a run to `status`, recording `reason` (kept for `failed`).
    async fn set_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        reason: Option<String>,
    ) -> StorageResult<RunRecord>;

    /// Renew the liveness lease of a non-terminal run by touching `updated_at`.
    async fn heartbeat(&self, run_id: &RunId) -> StorageResult<()>;

    /// Append an epoch record and advance the run's head in one transaction.
    async fn commit_epoch(&self, record: &EpochRecord) -> StorageResult<()>;

    /// Retrieve a run row by ID.
    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord>;

    /// List runs, optionally filtered by status, newest first.
    async fn list_runs(&self, status: Option<RunStatus>) -> StorageResult<Vec<RunRecord>>;

    /// All epoch records of a run ordered by `epoch_index`.
    async fn get_epochs(&self, run_id: &RunId) -> StorageResult<Vec<EpochRecord>>;
}

/// Shared precondition check for `commit_epoch` implementations.
pub(crate) fn check_commit(run: &RunRecord, record: &EpochRecord) -> StorageResult<()> {
    if run.status.is_terminal() {
        return Err(StorageError::InvalidRunState {
            run_id: run.run_id.0.clone(),
            status: run.status.to_string(),
            expected: "running or paused".to_string(),
        });
    }
    if record.epoch_index != run.current_epoch {
        return Err(StorageError::EpochOutOfOrder {
            run_id: run.run_id.0.clone(),
            expected: run.current_epoch,
            got: record.epoch_index,
        });
    }
    Ok(())
}

/// Shared precondition check for `heartbeat` implementations.
pub(crate) fn check_heartbeat(run: &RunRecord) -> StorageResult<()> {
    if run.status.is_terminal() {
        return Err(StorageError::InvalidRunState {
            run_id: run.run_id.0.clone(),
            status: run.status.to_string(),
            expected: "pending, running or paused".to_string(),
        });
    }
    Ok(())
}

/// Shared precondition check for `set_status` implementations.
pub(crate) fn check_transition(run: &RunRecord, next: RunStatus) -> StorageResult<()> {
    if !run.status.can_transition_to(next) {
        let expected = match next {
            RunStatus::Pending => "no state (pending is initial only)",
            RunStatus::Running => "pending or paused",
            RunStatus::Paused => "running",
            RunStatus::Failed => "pending, running or paused",
            RunStatus::Completed | RunStatus::Stopped => "running or paused",
        };
        return Err(StorageError::InvalidRunState {
            run_id: run.run_id.0.clone(),
            status: run.status.to_string(),
            expected: format!("{expected} before {next}"),
        });
    }
    Ok(())
}

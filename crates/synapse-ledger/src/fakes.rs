//! In-memory fakes for the storage trait (testing only)
//!
//! Provides `MemoryEpochStore`, which satisfies the `EpochStore` contract
//! without any external dependencies, and `FlakyEpochStore`, which wraps it
//! and starts failing epoch commits after a configured count.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryEpochStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RunState {
    record: RunRecord,
    epochs: Vec<EpochRecord>,
}

/// In-memory store backed by a `HashMap<run_id, RunState>`.
#[derive(Debug, Default)]
pub struct MemoryEpochStore {
    runs: Mutex<HashMap<String, RunState>>,
}

impl MemoryEpochStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, HashMap<String, RunState>>> {
        self.runs
            .lock()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))
    }

    /// Overwrite a stored metrics blob in place, bypassing the chain.
    ///
    /// Exists so tests can simulate post-hoc tampering.
    pub fn overwrite_metrics(
        &self,
        run_id: &RunId,
        epoch_index: u64,
        metrics_json: &str,
    ) -> StorageResult<()> {
        let mut runs = self.lock()?;
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        let record = state
            .epochs
            .get_mut(epoch_index as usize)
            .ok_or_else(|| StorageError::EpochOutOfOrder {
                run_id: run_id.0.clone(),
                expected: state.record.current_epoch,
                got: epoch_index,
            })?;
        record.metrics_json = metrics_json.to_string();
        Ok(())
    }
}

#[async_trait]
impl EpochStore for MemoryEpochStore {
    async fn create_run(&self, new: NewRun) -> StorageResult<RunRecord> {
        let mut runs = self.lock()?;
        if runs.contains_key(&new.run_id.0) {
            return Err(StorageError::Backend(format!(
                "run {} already exists",
                new.run_id
            )));
        }
        let record = RunRecord::pending(new);
        runs.insert(
            record.run_id.0.clone(),
            RunState {
                record: record.clone(),
                epochs: Vec::new(),
            },
        );
        Ok(record)
    }

    async fn set_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        reason: Option<String>,
    ) -> StorageResult<RunRecord> {
        let mut runs = self.lock()?;
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        check_transition(&state.record, status)?;

        let now = Utc::now();
        state.record.status = status;
        state.record.updated_at = now;
        if reason.is_some() {
            state.record.failure_reason = reason;
        }
        if status.is_terminal() {
            state.record.completed_at = Some(now);
        }
        Ok(state.record.clone())
    }

    async fn heartbeat(&self, run_id: &RunId) -> StorageResult<()> {
        let mut runs = self.lock()?;
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        check_heartbeat(&state.record)?;
        state.record.updated_at = Utc::now();
        Ok(())
    }

    async fn commit_epoch(&self, record: &EpochRecord) -> StorageResult<()> {
        let mut runs = self.lock()?;
        let state = runs
            .get_mut(&record.run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: record.run_id.0.clone(),
            })?;
        check_commit(&state.record, record)?;

        state.epochs.push(record.clone());
        state.record.current_epoch = record.epoch_index + 1;
        state.record.final_hash = Some(record.hash.clone());
        state.record.updated_at = Utc::now();
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let runs = self.lock()?;
        runs.get(&run_id.0)
            .map(|s| s.record.clone())
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn list_runs(&self, status: Option<RunStatus>) -> StorageResult<Vec<RunRecord>> {
        let runs = self.lock()?;
        let mut records: Vec<RunRecord> = runs
            .values()
            .filter(|s| status.map_or(true, |st| s.record.status == st))
            .map(|s| s.record.clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn get_epochs(&self, run_id: &RunId) -> StorageResult<Vec<EpochRecord>> {
        let runs = self.lock()?;
        runs.get(&run_id.0)
            .map(|s| s.epochs.clone())
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }
}

// ---------------------------------------------------------------------------
// FlakyEpochStore
// ---------------------------------------------------------------------------

/// `MemoryEpochStore` whose `commit_epoch` fails once `ok_commits` have landed.
#[derive(Debug)]
pub struct FlakyEpochStore {
    inner: MemoryEpochStore,
    ok_commits: u64,
    commits: AtomicU64,
}

impl FlakyEpochStore {
    pub fn fail_commits_after(ok_commits: u64) -> Self {
        Self {
            inner: MemoryEpochStore::new(),
            ok_commits,
            commits: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl EpochStore for FlakyEpochStore {
    async fn create_run(&self, new: NewRun) -> StorageResult<RunRecord> {
        self.inner.create_run(new).await
    }

    async fn set_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        reason: Option<String>,
    ) -> StorageResult<RunRecord> {
        self.inner.set_status(run_id, status, reason).await
    }

    async fn heartbeat(&self, run_id: &RunId) -> StorageResult<()> {
        self.inner.heartbeat(run_id).await
    }

    async fn commit_epoch(&self, record: &EpochRecord) -> StorageResult<()> {
        let n = self.commits.fetch_add(1, Ordering::SeqCst);
        if n >= self.ok_commits {
            return Err(StorageError::Backend(format!(
                "injected write failure at epoch {}",
                record.epoch_index
            )));
        }
        self.inner.commit_epoch(record).await
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        self.inner.get_run(run_id).await
    }

    async fn list_runs(&self, status: Option<RunStatus>) -> StorageResult<Vec<RunRecord>> {
        self.inner.list_runs(status).await
    }

    async fn get_epochs(&self, run_id: &RunId) -> StorageResult<Vec<EpochRecord>> {
        self.inner.get_epochs(run_id).await
    }
}

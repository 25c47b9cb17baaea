//! Per-run append cursor over an [`EpochStore`].
//!
//! The ledger remembers the head hash and next index so each append hashes
//! against what was last persisted. The cursor only moves after the store
//! has accepted the record; a failed write leaves it where it was.

use std::sync::Arc;

use serde_json::Value;
use synapse_ledger::{
    link_epoch, verify_chain, ChainHash, ChainVerdict, EpochRecord, EpochStore, RunId,
    StorageResult,
};

pub struct EpochLedger {
    store: Arc<dyn EpochStore>,
    run_id: RunId,
    seed: u64,
    next_index: u64,
    head: ChainHash,
}

impl EpochLedger {
    /// A cursor at genesis for a run with no epochs yet.
    pub fn new(store: Arc<dyn EpochStore>, run_id: RunId, seed: u64) -> Self {
        Self {
            store,
            run_id,
            seed,
            next_index: 0,
            head: ChainHash::genesis(),
        }
    }

    pub fn head(&self) -> &ChainHash {
        &self.head
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Hash `metrics` onto the head and persist it as the next epoch.
    pub async fn append(&mut self, metrics: &Value) -> StorageResult<EpochRecord> {
        let record = link_epoch(&self.run_id, self.next_index, &self.head, metrics, self.seed);
        self.store.commit_epoch(&record).await?;
        self.next_index += 1;
        self.head = record.hash.clone();
        Ok(record)
    }
}

/// Fetch a run's records and verify them against its seed.
pub async fn verify_run(store: &dyn EpochStore, run_id: &RunId) -> StorageResult<ChainVerdict> {
    let run = store.get_run(run_id).await?;
    let records = store.get_epochs(run_id).await?;
    Ok(verify_chain(&records, run.seed))
}

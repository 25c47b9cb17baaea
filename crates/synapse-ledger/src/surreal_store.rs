//! SurrealDB-backed EpochStore implementation
//!
//! Uses `schema::DbRun` and `schema::DbEpoch` for persistence, converting to
//! and from `storage_traits` types at the boundary.

use async_trait::async_trait;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::schema::{DbEpoch, DbRun};
use crate::storage_traits::{
    check_commit, check_heartbeat, check_transition, EpochRecord, EpochStore, NewRun, RunId,
    RunRecord, RunStatus, StorageResult,
};

const NAMESPACE: &str = "synapse";
const DATABASE: &str = "main";

/// Local on-disk default used when no URL is configured.
pub const DEFAULT_DATABASE_URL: &str = "surrealkv://.synapse/db";

/// Appends the epoch row and advances the run head in one transaction.
///
/// The `current_epoch = $idx` guard makes a concurrent writer that raced past
/// the precondition check abort instead of forking the chain.
const COMMIT_EPOCH_SQL: &str = r#"
    BEGIN TRANSACTION;
    CREATE epochs CONTENT $rec;
    LET $advanced = (UPDATE runs
        SET current_epoch = $next, final_hash = $hash, updated_at = time::now()
        WHERE run_id = $rid AND current_epoch = $idx
          AND status NOT IN ["completed", "stopped", "failed"]);
    IF array::len($advanced) == 0 { THROW "run head moved during commit" };
    COMMIT TRANSACTION;
"#;

const HEARTBEAT_SQL: &str = r#"
    UPDATE runs SET updated_at = time::now()
    WHERE run_id = $rid AND status NOT IN ["completed", "stopped", "failed"];
"#;

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// SurrealDB-backed implementation of [`EpochStore`].
pub struct SurrealEpochStore {
    db: Surreal<Any>,
}

impl SurrealEpochStore {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `synapse/main`, and runs `init_schema`.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect("mem://").await
    }

    /// Connect to any SurrealDB endpoint (`mem://`, `surrealkv://path`, `ws://..`).
    ///
    /// For `surrealkv://` the directory is created first.
    pub async fn connect(url: &str) -> crate::Result<Self> {
        if let Some(path) = url.strip_prefix("surrealkv://") {
            std::fs::create_dir_all(path).map_err(|e| {
                StateError::Connection(format!(
                    "Failed to create database directory {}: {}",
                    path, e
                ))
            })?;
        }

        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;

        info!("SurrealEpochStore connected ({})", url);
        Ok(Self { db })
    }

    /// Create from `SYNAPSE_DATABASE_URL`, falling back to local persistence.
    pub async fn from_env() -> crate::Result<Self> {
        let url =
            std::env::var("SYNAPSE_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.into());
        Self::connect(&url).await
    }

    // -- private helpers -----------------------------------------------------

    /// Fetch a run row by ID, returning the DB row or RunNotFound.
    async fn fetch_run(&self, rid: &str) -> StorageResult<DbRun> {
        let rid_owned = rid.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM runs WHERE run_id = $rid")
            .bind(("rid", rid_owned))
            .await
            .map_err(backend)?;

        let rows: Vec<DbRun> = res.take(0).map_err(backend)?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: rid.to_string(),
            })
    }
}

#[async_trait]
impl EpochStore for SurrealEpochStore {
    async fn create_run(&self, new: NewRun) -> StorageResult<RunRecord> {
        let record = RunRecord::pending(new);
        debug!(run_id = %record.run_id, "creating run");

        let _created: Option<DbRun> = self
            .db
            .create("runs")
            .content(DbRun::from(&record))
            .await
            .map_err(backend)?;

        Ok(record)
    }

    async fn set_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        reason: Option<String>,
    ) -> StorageResult<RunRecord> {
        let row = self.fetch_run(&run_id.0).await?;
        let current = row.clone().into_record()?;
        check_transition(&current, status)?;

        let mut assignments = vec!["status = $status", "updated_at = time::now()"];
        if reason.is_some() {
            assignments.push("failure_reason = $reason");
        }
        if status.is_terminal() {
            assignments.push("completed_at = time::now()");
        }
        // Guard on the status we validated against so a concurrent terminal
        // write is never overwritten.
        let sql = format!(
            "UPDATE runs SET {} WHERE run_id = $rid AND status = $prev",
            assignments.join(", ")
        );

        let mut res = self
            .db
            .query(sql)
            .bind(("status", status.as_str().to_string()))
            .bind(("reason", reason))
            .bind(("rid", run_id.0.clone()))
            .bind(("prev", row.status.clone()))
            .await
            .map_err(backend)?;

        let updated: Vec<DbRun> = res.take(0).map_err(backend)?;
        match updated.into_iter().next() {
            Some(row) => row.into_record(),
            None => {
                let latest = self.fetch_run(&run_id.0).await?;
                Err(StorageError::InvalidRunState {
                    run_id: run_id.0.clone(),
                    status: latest.status,
                    expected: row.status,
                })
            }
        }
    }

    async fn heartbeat(&self, run_id: &RunId) -> StorageResult<()> {
        let mut res = self
            .db
            .query(HEARTBEAT_SQL)
            .bind(("rid", run_id.0.clone()))
            .await
            .map_err(backend)?;

        let touched: Vec<DbRun> = res.take(0).map_err(backend)?;
        if touched.is_empty() {
            // Unknown or terminal; let the shared check name which.
            let current = self.fetch_run(&run_id.0).await?.into_record()?;
            check_heartbeat(&current)?;
        }
        Ok(())
    }

    async fn commit_epoch(&self, record: &EpochRecord) -> StorageResult<()> {
        let run = self.fetch_run(&record.run_id.0).await?.into_record()?;
        check_commit(&run, record)?;

        debug!(
            run_id = %record.run_id,
            epoch = record.epoch_index,
            hash = %record.hash.short(),
            "committing epoch"
        );

        self.db
            .query(COMMIT_EPOCH_SQL)
            .bind(("rec", DbEpoch::from(record)))
            .bind(("next", record.epoch_index + 1))
            .bind(("hash", record.hash.as_str().to_string()))
            .bind(("rid", record.run_id.0.clone()))
            .bind(("idx", record.epoch_index))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;

        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        self.fetch_run(&run_id.0).await?.into_record()
    }

    async fn list_runs(&self, status: Option<RunStatus>) -> StorageResult<Vec<RunRecord>> {
        let rows: Vec<DbRun> = if let Some(st) = status {
            let mut res = self
                .db
                .query("SELECT * FROM runs WHERE status = $st ORDER BY created_at DESC")
                .bind(("st", st.as_str().to_string()))
                .await
                .map_err(backend)?;
            res.take(0).map_err(backend)?
        } else {
            let mut res = self
                .db
                .query("SELECT * FROM runs ORDER BY created_at DESC")
                .await
                .map_err(backend)?;
            res.take(0).map_err(backend)?
        };

        rows.into_iter().map(DbRun::into_record).collect()
    }

    async fn get_epochs(&self, run_id: &RunId) -> StorageResult<Vec<EpochRecord>> {
        // Verify run exists
        self.fetch_run(&run_id.0).await?;

        let mut res = self
            .db
            .query("SELECT * FROM epochs WHERE run_id = $rid ORDER BY epoch_index ASC")
            .bind(("rid", run_id.0.clone()))
            .await
            .map_err(backend)?;

        let rows: Vec<DbEpoch> = res.take(0).map_err(backend)?;
        rows.into_iter().map(DbEpoch::into_record).collect()
    }
}

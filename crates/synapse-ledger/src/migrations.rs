//! SurrealDB schema migrations and initialization
//!
//! Sets up the `runs` and `epochs` tables with the indexes the ledger relies
//! on. Safe to call on every connection (idempotent).

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all Synapse tables in SurrealDB
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Synapse SurrealDB schema");

    init_runs_table(db).await?;
    init_epochs_table(db).await?;

    info!("Synapse schema initialization complete");
    Ok(())
}

/// Initialize `runs` table with constraints and indexes
///
/// Schema:
/// ```text
/// TABLE runs {
///   run_id:          STRING (unique)
///   seed:            INT
///   status:          STRING (pending | running | paused | completed | stopped | failed)
///   total_epochs:    INT
///   current_epoch:   INT (1 + last committed epoch_index)
///   final_hash:      STRING?
///   params:          OBJECT
///   failure_reason:  STRING?
///   created_at:      DATETIME
///   updated_at:      DATETIME
///   completed_at:    DATETIME?
/// }
/// ```
///
/// Terminal runs are immutable (enforced via app logic).
async fn init_runs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing runs table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS runs
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_run_id ON TABLE runs COLUMNS run_id UNIQUE;

        -- Reconciliation scans by status
        DEFINE INDEX IF NOT EXISTS idx_status ON TABLE runs COLUMNS status;

        DEFINE INDEX IF NOT EXISTS idx_created_at ON TABLE runs COLUMNS created_at;
    "#;

    db.query(sql).await?.check()?;
    info!("✓ runs table initialized");
    Ok(())
}

/// Initialize `epochs` table with constraints and indexes
///
/// Schema:
/// ```text
/// TABLE epochs {
///   run_id:        STRING
///   epoch_index:   INT (0-based, contiguous within a run)
///   metrics_json:  STRING (canonical JSON, exactly as hashed)
///   hash:          STRING
///   prev_hash:     STRING
///   timestamp:     DATETIME
/// }
/// ```
///
/// `(run_id, epoch_index)` is unique: a second write for the same epoch fails
/// instead of forking the chain.
async fn init_epochs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing epochs table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS epochs
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_run_epoch ON TABLE epochs COLUMNS run_id, epoch_index UNIQUE;

        DEFINE INDEX IF NOT EXISTS idx_epoch_run_id ON TABLE epochs COLUMNS run_id;
    "#;

    db.query(sql).await?.check()?;
    info!("✓ epochs table initialized");
    Ok(())
}

//! Row definitions for the Synapse SurrealDB tables
//!
//! Tables:
//! - runs: one row per simulation run (status, chain head, params)
//! - epochs: append-only hash-chained epoch records
//!
//! These are storage rows only; `surreal_store` converts them to and from the
//! `storage_traits` types at the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::{ChainHash, EpochRecord, RunId, RunRecord, RunStatus, StorageResult};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// `runs` table row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbRun {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub run_id: String,
    pub seed: u64,
    /// "pending" | "running" | "paused" | "completed" | "stopped" | "failed"
    pub status: String,
    pub total_epochs: u64,
    pub current_epoch: u64,
    pub final_hash: Option<String>,
    pub params: serde_json::Value,
    pub failure_reason: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&RunRecord> for DbRun {
    fn from(r: &RunRecord) -> Self {
        DbRun {
            id: None,
            run_id: r.run_id.0.clone(),
            seed: r.seed,
            status: r.status.as_str().to_string(),
            total_epochs: r.total_epochs,
            current_epoch: r.current_epoch,
            final_hash: r.final_hash.as_ref().map(|h| h.as_str().to_string()),
            params: r.params.clone(),
            failure_reason: r.failure_reason.clone(),
            created_at: r.created_at,
            updated_at: r.updated_at,
            completed_at: r.completed_at,
        }
    }
}

impl DbRun {
    pub fn into_record(self) -> StorageResult<RunRecord> {
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| StorageError::Backend(format!("unknown run status: {}", self.status)))?;
        let final_hash = self.final_hash.map(ChainHash::try_from).transpose()?;
        Ok(RunRecord {
            run_id: RunId(self.run_id),
            seed: self.seed,
            status,
            total_epochs: self.total_epochs,
            current_epoch: self.current_epoch,
            final_hash,
            params: self.params,
            failure_reason: self.failure_reason,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}

/// `epochs` table row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbEpoch {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub run_id: String,
    pub epoch_index: u64,
    /// Canonical metrics JSON, stored as a string so it round-trips byte-exact.
    pub metrics_json: String,
    pub hash: String,
    pub prev_hash: String,
    #[serde(with = "surreal_datetime")]
    pub timestamp: DateTime<Utc>,
}

impl From<&EpochRecord> for DbEpoch {
    fn from(e: &EpochRecord) -> Self {
        DbEpoch {
            id: None,
            run_id: e.run_id.0.clone(),
            epoch_index: e.epoch_index,
            metrics_json: e.metrics_json.clone(),
            hash: e.hash.as_str().to_string(),
            prev_hash: e.prev_hash.as_str().to_string(),
            timestamp: e.timestamp,
        }
    }
}

impl DbEpoch {
    pub fn into_record(self) -> StorageResult<EpochRecord> {
        Ok(EpochRecord {
            run_id: RunId(self.run_id),
            epoch_index: self.epoch_index,
            metrics_json: self.metrics_json,
            hash: ChainHash::try_from(self.hash)?,
            prev_hash: ChainHash::try_from(self.prev_hash)?,
            timestamp: self.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_traits::NewRun;

    #[test]
    fn run_row_round_trips_through_record() {
        let record = RunRecord::pending(NewRun {
            run_id: RunId::from("run-1"),
            seed: 42,
            total_epochs: 10,
            params: serde_json::json!({"protocol": 1}),
        });
        let row = DbRun::from(&record);
        assert_eq!(row.status, "pending");
        let back = row.into_record().expect("valid row");
        assert_eq!(back, record);
    }

    #[test]
    fn unknown_status_is_rejected() {
        let record = RunRecord::pending(NewRun {
            run_id: RunId::from("run-2"),
            seed: 1,
            total_epochs: 1,
            params: serde_json::Value::Null,
        });
        let mut row = DbRun::from(&record);
        row.status = "RUNNING".to_string();
        assert!(row.into_record().is_err());
    }

    #[test]
    fn epoch_row_rejects_bad_hash() {
        let row = DbEpoch {
            id: None,
            run_id: "r".to_string(),
            epoch_index: 0,
            metrics_json: "{}".to_string(),
            hash: "not-a-hash".to_string(),
            prev_hash: "0".repeat(64),
            timestamp: Utc::now(),
        };
        assert!(matches!(
            row.into_record(),
            Err(StorageError::InvalidHash { .. })
        ));
    }
}

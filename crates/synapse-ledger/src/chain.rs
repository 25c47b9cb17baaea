//! Canonical JSON and the epoch hash chain.
//!
//! Every committed epoch is bound to its predecessor and to the run seed:
//!
//! ```text
//! hash_n = SHA256( hash_{n-1} | canonical_json(metrics_n) | seed )
//! ```
//!
//! with `hash_{-1}` fixed to [`GENESIS_HASH`]. Editing any stored metrics blob
//! after the fact changes the recomputed hash at that index, and every later
//! link stops matching its `prev_hash`.

use std::fmt::Write as _;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::storage_traits::{ChainHash, EpochRecord, RunId};

/// Predecessor hash of epoch 0.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

// ---------------------------------------------------------------------------
// Canonical JSON
// ---------------------------------------------------------------------------

/// Serialize `value` to its canonical form.
///
/// - object keys sorted by UTF-16 code units, recursively
/// - compact separators (`,` and `:`)
/// - integer-valued floats written as integers (`1.0` → `1`)
///
/// The function is total: `serde_json::Value` cannot hold NaN or infinities.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Number(n) => write_number(n, out),
        Value::String(s) => write_string(s, out),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Null => out.push_str("null"),
    }
}

const I64_MIN_F64: f64 = -9_223_372_036_854_775_808.0;
const I64_END_F64: f64 = 9_223_372_036_854_775_808.0;

fn write_number(n: &serde_json::Number, out: &mut String) {
    if n.is_i64() || n.is_u64() {
        let _ = write!(out, "{n}");
        return;
    }
    match n.as_f64() {
        // i64::MAX as f64 rounds up to 2^63, which does not fit.
        Some(f) if f.fract() == 0.0 && (I64_MIN_F64..I64_END_F64).contains(&f) => {
            let _ = write!(out, "{}", f as i64);
        }
        _ => {
            let _ = write!(out, "{n}");
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    // Display of a string Value yields its JSON-escaped, quoted form.
    let _ = write!(out, "{}", Value::String(s.to_string()));
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Hash one link over an already-canonical metrics string.
pub fn compute_hash_canonical(prev: &ChainHash, canonical_metrics: &str, seed: u64) -> ChainHash {
    let mut hasher = Sha256::new();
    hasher.update(prev.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_metrics.as_bytes());
    hasher.update(b"|");
    hasher.update(seed.to_string().as_bytes());
    ChainHash::from_digest(&hasher.finalize())
}

/// `H(prev | canonical_json(metrics) | seed)`.
pub fn compute_hash(prev: &ChainHash, metrics: &Value, seed: u64) -> ChainHash {
    compute_hash_canonical(prev, &canonical_json(metrics), seed)
}

/// Link `metrics` onto `prev`, producing the record to persist at `epoch_index`.
pub fn link_epoch(
    run_id: &RunId,
    epoch_index: u64,
    prev: &ChainHash,
    metrics: &Value,
    seed: u64,
) -> EpochRecord {
    let metrics_json = canonical_json(metrics);
    let hash = compute_hash_canonical(prev, &metrics_json, seed);
    EpochRecord {
        run_id: run_id.clone(),
        epoch_index,
        metrics_json,
        hash,
        prev_hash: prev.clone(),
        timestamp: Utc::now(),
    }
}

/// Build a complete chain over `metrics`, starting at genesis.
pub fn build_chain(run_id: &RunId, metrics: &[Value], seed: u64) -> Vec<EpochRecord> {
    let mut prev = ChainHash::genesis();
    let mut chain = Vec::with_capacity(metrics.len());
    for (i, m) in metrics.iter().enumerate() {
        let record = link_epoch(run_id, i as u64, &prev, m, seed);
        prev = record.hash.clone();
        chain.push(record);
    }
    chain
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Why a chain stopped verifying at a given epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakReason {
    /// `epoch_index` does not equal the record's position.
    IndexGap { found: u64 },
    /// `prev_hash` does not match the previous record's hash (or genesis).
    PrevHashMismatch,
    /// Recomputed hash differs from the stored one.
    HashMismatch,
    /// Stored metrics blob is not valid JSON.
    MalformedMetrics,
}

impl std::fmt::Display for BreakReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakReason::IndexGap { found } => write!(f, "index gap (found epoch_index {found})"),
            BreakReason::PrevHashMismatch => f.write_str("prev_hash does not link"),
            BreakReason::HashMismatch => f.write_str("recomputed hash differs"),
            BreakReason::MalformedMetrics => f.write_str("metrics blob is not valid JSON"),
        }
    }
}

/// Outcome of [`verify_chain`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ChainVerdict {
    Valid,
    Broken { epoch: u64, reason: BreakReason },
}

impl ChainVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, ChainVerdict::Valid)
    }

    /// Index of the first record that fails, if any.
    pub fn first_broken(&self) -> Option<u64> {
        match self {
            ChainVerdict::Valid => None,
            ChainVerdict::Broken { epoch, .. } => Some(*epoch),
        }
    }
}

/// Walk `chain` from genesis, recomputing every hash.
///
/// Returns the position of the first record whose index, linkage, or hash does
/// not check out. An empty chain is valid.
pub fn verify_chain(chain: &[EpochRecord], seed: u64) -> ChainVerdict {
    let mut prev = ChainHash::genesis();
    for (pos, record) in chain.iter().enumerate() {
        let epoch = pos as u64;
        let broken = |reason| ChainVerdict::Broken { epoch, reason };

        if record.epoch_index != epoch {
            return broken(BreakReason::IndexGap {
                found: record.epoch_index,
            });
        }
        if record.prev_hash != prev {
            return broken(BreakReason::PrevHashMismatch);
        }
        let metrics: Value = match serde_json::from_str(&record.metrics_json) {
            Ok(v) => v,
            Err(_) => return broken(BreakReason::MalformedMetrics),
        };
        if compute_hash(&prev, &metrics, seed) != record.hash {
            return broken(BreakReason::HashMismatch);
        }
        prev = record.hash.clone();
    }
    ChainVerdict::Valid
}

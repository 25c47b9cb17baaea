//! Structured observability hooks for simulation run lifecycle events.
//!
//! This module provides:
//! - Run-scoped tracing spans via `RunSpan` RAII guard
//! - Emission functions for key lifecycle events: start, epoch commit,
//!   control calls, finish, failure, stream drops and reconciliation
//!
//! Events are emitted at `info!` level (warnings for failures and drops);
//! filter with `RUST_LOG`, and pass `json = true` to
//! [`crate::telemetry::init_tracing`] for JSON lines.

use tracing::{info, warn};

/// RAII guard that enters a run-scoped tracing span for the duration of a run.
///
/// # Example
///
/// ```ignore
/// let _span = RunSpan::enter("run-12345");
/// // Every event on this thread now carries run_id = "run-12345"
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    /// Create and enter a span tagged with the run_id.
    pub fn enter(run_id: &str) -> Self {
        let span = tracing::info_span!("synapse.run", run_id = %run_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: run launched with its seed, protocol and epoch budget.
pub fn emit_run_started(run_id: &str, seed: u64, protocol: &str, total_epochs: u64) {
    info!(
        event = "run.started",
        run_id = %run_id,
        seed = seed,
        protocol = %protocol,
        total_epochs = total_epochs,
    );
}

/// Emit event: an epoch record was chained and persisted.
pub fn emit_epoch_committed(run_id: &str, epoch: u64, hash: &str) {
    info!(event = "run.epoch_committed", run_id = %run_id, epoch = epoch, hash = %hash);
}

/// Emit event: an operator control call and whether it applied.
pub fn emit_control_applied(run_id: &str, action: &str, applied: bool) {
    info!(
        event = "run.control",
        run_id = %run_id,
        action = %action,
        applied = applied,
    );
}

/// Emit event: run reached `completed` or `stopped`.
pub fn emit_run_finished(run_id: &str, status: &str, epochs: u64, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        status = %status,
        epochs = epochs,
        duration_ms = duration_ms,
    );
}

/// Emit event: run ended as `failed` (warning level).
pub fn emit_run_failed(run_id: &str, epochs: u64, error: &dyn std::fmt::Display) {
    warn!(event = "run.failed", run_id = %run_id, epochs = epochs, error = %error);
}

/// Emit event: the live queue evicted an undelivered epoch.
pub fn emit_stream_dropped(run_id: &str, epoch: u64, total_dropped: u64) {
    warn!(
        event = "stream.dropped",
        run_id = %run_id,
        epoch = epoch,
        total_dropped = total_dropped,
    );
}

/// Emit event: an orphaned run was marked failed at startup.
pub fn emit_run_reconciled(run_id: &str, previous_status: &str) {
    warn!(
        event = "run.reconciled",
        run_id = %run_id,
        previous_status = %previous_status,
    );
}

//! Global atomic counters for Synapse observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a run).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    epochs_committed: AtomicU64,
    stream_dropped: AtomicU64,
    runs_failed: AtomicU64,
    runs_reconciled: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            epochs_committed: AtomicU64::new(0),
            stream_dropped: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            runs_reconciled: AtomicU64::new(0),
        }
    }

    pub fn inc_epochs_committed(&self) {
        self.epochs_committed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "epochs_committed", "counter incremented");
    }

    pub fn inc_stream_dropped(&self) {
        self.stream_dropped.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "stream_dropped", "counter incremented");
    }

    pub fn inc_runs_failed(&self) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_failed", "counter incremented");
    }

    pub fn inc_runs_reconciled(&self) {
        self.runs_reconciled.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_reconciled", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (end of a run, shutdown)
    /// rather than on every increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            epochs_committed = self.epochs_committed(),
            stream_dropped = self.stream_dropped(),
            runs_failed = self.runs_failed(),
            runs_reconciled = self.runs_reconciled(),
        );
    }

    pub fn epochs_committed(&self) -> u64 {
        self.epochs_committed.load(Ordering::Relaxed)
    }

    pub fn stream_dropped(&self) -> u64 {
        self.stream_dropped.load(Ordering::Relaxed)
    }

    pub fn runs_failed(&self) -> u64 {
        self.runs_failed.load(Ordering::Relaxed)
    }

    pub fn runs_reconciled(&self) -> u64 {
        self.runs_reconciled.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.epochs_committed.store(0, Ordering::Relaxed);
        self.stream_dropped.store(0, Ordering::Relaxed);
        self.runs_failed.store(0, Ordering::Relaxed);
        self.runs_reconciled.store(0, Ordering::Relaxed);
    }
}

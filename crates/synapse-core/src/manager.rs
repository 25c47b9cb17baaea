//! Registry of live runs.
//!
//! Each launched run gets one blocking worker that owns its
//! [`SimulationEngine`]. The worker's epoch callback is the only place that
//! touches the store: it chains the metrics through an [`EpochLedger`],
//! updates the live snapshot, then hands the metrics to the run's
//! [`DeliveryQueue`]. Status reads take the registry lock and a per-run
//! stats lock, never a store round-trip, so slow I/O does not block them.
//!
//! While a worker lives, a companion task renews the run's lease in the
//! store. [`RunManager::reconcile`] only fails runs whose lease has lapsed,
//! so managers in other processes sharing the store are left alone.
//! Finished runs leave the registry once their stream has been read to the
//! end, or when more than [`FINISHED_RUN_RETENTION`] finished runs are
//! still waiting for a reader; after that their status comes from the store.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use synapse_ledger::{
    ChainHash, ChainVerdict, EpochRecord, EpochStore, NewRun, RunId, RunRecord, RunStatus,
    StorageError,
};
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::collaborators::Collaborators;
use crate::controller::{ControlOutcome, KillSwitchEvent, RunController, Terminal};
use crate::domain::{Result, Settings, SimulationConfig, SynapseError};
use crate::engine::{EngineExit, SimulationEngine};
use crate::ledger::{verify_run, EpochLedger};
use crate::manifest::{type_entropy_of, CrystallizationDetector, RunManifest};
use crate::metrics::METRICS;
use crate::obs::{self, RunSpan};
use crate::stream::DeliveryQueue;

/// Keys every persisted epoch carries, filled with `{}` when the analyzer or
/// protocol does not produce them.
pub const REQUIRED_METRIC_KEYS: [&str; 5] = [
    "entropy",
    "mutual_information",
    "transfer_entropy",
    "zipf",
    "inquiry",
];

/// Failure reason recorded on runs whose worker lease lapsed.
pub const ORPHANED_RUN_REASON: &str = "worker lease expired";

/// Finished runs kept registered while nobody has read their stream.
pub const FINISHED_RUN_RETENTION: usize = 64;

/// Add `energy_roi` and the required keys to an engine metrics map.
pub fn finalize_epoch_metrics(mut metrics: Map<String, Value>) -> Value {
    let num = |m: &Map<String, Value>, k: &str| m.get(k).and_then(Value::as_f64).unwrap_or(0.0);
    let target_rate = num(&metrics, "target_reached_rate");
    let avg_energy = num(&metrics, "avg_energy_spent");
    let roi = if avg_energy > 0.0 {
        target_rate / avg_energy
    } else {
        0.0
    };
    metrics.insert("energy_roi".to_string(), json!(roi));
    for key in REQUIRED_METRIC_KEYS {
        metrics
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    Value::Object(metrics)
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub status: RunStatus,
    /// Epochs durably committed.
    pub current_epoch: u64,
    pub total_epochs: u64,
    pub final_hash: Option<ChainHash>,
    pub failure: Option<String>,
    pub comm_killed: bool,
    pub crystallization_epoch: Option<u64>,
    /// Live items evicted from the delivery queue.
    pub stream_dropped: u64,
    pub kill_switch_events: Vec<KillSwitchEvent>,
}

impl RunSnapshot {
    fn from_record(run: RunRecord, crystallization_epoch: Option<u64>) -> Self {
        Self {
            run_id: run.run_id,
            status: run.status,
            current_epoch: run.current_epoch,
            total_epochs: run.total_epochs,
            final_hash: run.final_hash,
            failure: run.failure_reason,
            comm_killed: false,
            crystallization_epoch,
            stream_dropped: 0,
            kill_switch_events: Vec::new(),
        }
    }
}

#[derive(Default)]
struct LiveStats {
    current_epoch: u64,
    final_hash: Option<ChainHash>,
    detector: CrystallizationDetector,
}

struct RunEntry {
    run_id: RunId,
    total_epochs: u64,
    controller: Arc<RunController>,
    queue: Arc<DeliveryQueue>,
    stats: Mutex<LiveStats>,
    done: watch::Sender<bool>,
    finished_at: OnceLock<Instant>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RunEntry {
    fn observe_epoch(&self, record: &EpochRecord, metrics: &Value) {
        let mut stats = lock(&self.stats);
        stats.current_epoch = record.epoch_index + 1;
        stats.final_hash = Some(record.hash.clone());
        stats
            .detector
            .observe(record.epoch_index, type_entropy_of(metrics));
    }

    fn snapshot(&self) -> RunSnapshot {
        let lifecycle = self.controller.snapshot();
        let stats = lock(&self.stats);
        RunSnapshot {
            run_id: self.run_id.clone(),
            status: lifecycle.status,
            current_epoch: stats.current_epoch,
            total_epochs: self.total_epochs,
            final_hash: stats.final_hash.clone(),
            failure: lifecycle.failure,
            comm_killed: self.controller.is_comm_killed(),
            crystallization_epoch: stats.detector.epoch(),
            stream_dropped: self.queue.dropped(),
            kill_switch_events: self.controller.kill_switch_events(),
        }
    }

    fn epochs_committed(&self) -> u64 {
        lock(&self.stats).current_epoch
    }

    fn is_retired(&self) -> bool {
        self.finished_at.get().is_some() && self.queue.is_drained()
    }
}

pub struct RunManager {
    store: Arc<dyn EpochStore>,
    limiter: Option<(Arc<Semaphore>, usize)>,
    stream_capacity: usize,
    lease_ttl: Duration,
    heartbeat_interval: Duration,
    runs: Mutex<HashMap<RunId, Arc<RunEntry>>>,
}

impl RunManager {
    pub fn new(store: Arc<dyn EpochStore>, settings: &Settings) -> Self {
        Self {
            store,
            limiter: settings
                .max_concurrent_runs
                .map(|n| (Arc::new(Semaphore::new(n)), n)),
            stream_capacity: settings.stream_capacity,
            lease_ttl: settings.lease_ttl,
            heartbeat_interval: settings.heartbeat_interval(),
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn EpochStore> {
        &self.store
    }

    fn entry(&self, run_id: &RunId) -> Option<Arc<RunEntry>> {
        lock(&self.runs).get(run_id).cloned()
    }

    /// Drop finished runs whose stream was read to the end, then the oldest
    /// finished runs beyond [`FINISHED_RUN_RETENTION`].
    fn retire_finished(&self) {
        let mut runs = lock(&self.runs);
        runs.retain(|_, entry| !entry.is_retired());

        let mut finished: Vec<(Instant, RunId)> = runs
            .values()
            .filter_map(|e| e.finished_at.get().map(|at| (*at, e.run_id.clone())))
            .collect();
        if finished.len() > FINISHED_RUN_RETENTION {
            finished.sort();
            let excess = finished.len() - FINISHED_RUN_RETENTION;
            for (_, run_id) in finished.into_iter().take(excess) {
                debug!(run_id = %run_id, "retiring unread finished run");
                runs.remove(&run_id);
            }
        }
    }

    /// Validate, persist and start a run on its own worker.
    ///
    /// Rejected configurations and a saturated concurrency limit are returned
    /// before anything is written.
    pub async fn launch(
        &self,
        config: SimulationConfig,
        collaborators: Collaborators,
    ) -> Result<RunId> {
        self.retire_finished();
        let engine = SimulationEngine::new(config.clone(), collaborators)?;
        let controller = Arc::new(RunController::new(
            engine.kill_switch(),
            self.limiter.clone(),
        ));
        controller.start()?;

        let run_id = RunId::new();
        let params = serde_json::to_value(&config)
            .map_err(|e| SynapseError::Configuration(e.to_string()))?;
        let persisted = async {
            self.store
                .create_run(NewRun {
                    run_id: run_id.clone(),
                    seed: config.seed,
                    total_epochs: config.num_epochs,
                    params,
                })
                .await?;
            self.store
                .set_status(&run_id, RunStatus::Running, None)
                .await
        }
        .await;
        if let Err(e) = persisted {
            controller.finish(Terminal::Failed(e.to_string()));
            return Err(e.into());
        }

        let (done, _) = watch::channel(false);
        let entry = Arc::new(RunEntry {
            run_id: run_id.clone(),
            total_epochs: config.num_epochs,
            controller,
            queue: Arc::new(DeliveryQueue::new(self.stream_capacity)),
            stats: Mutex::new(LiveStats::default()),
            done,
            finished_at: OnceLock::new(),
        });
        lock(&self.runs).insert(run_id.clone(), entry.clone());
        tokio::spawn(keep_alive(
            self.store.clone(),
            run_id.clone(),
            entry.done.subscribe(),
            self.heartbeat_interval,
        ));

        obs::emit_run_started(
            &run_id.0,
            config.seed,
            config.protocol.as_str(),
            config.num_epochs,
        );

        let store = self.store.clone();
        let rt = Handle::current();
        let seed = config.seed;
        tokio::task::spawn_blocking(move || drive(engine, entry, store, rt, seed));
        Ok(run_id)
    }

    // -- control -------------------------------------------------------------

    async fn control<F>(&self, run_id: &RunId, action: &str, apply: F) -> Result<ControlOutcome>
    where
        F: FnOnce(&RunController) -> ControlOutcome,
    {
        let Some(entry) = self.entry(run_id) else {
            let run = self.store.get_run(run_id).await.map_err(not_found(run_id))?;
            return Ok(ControlOutcome::Ignored {
                reason: format!("run is {} and has no live worker", run.status),
            });
        };
        let outcome = apply(&entry.controller);
        obs::emit_control_applied(&run_id.0, action, outcome.is_applied());
        Ok(outcome)
    }

    /// Mirror a pause/resume into the run row, outside every lock.
    async fn persist_status(&self, run_id: &RunId, status: RunStatus) {
        if status.is_terminal() {
            return;
        }
        match self.store.set_status(run_id, status, None).await {
            Ok(_) | Err(StorageError::InvalidRunState { .. }) => {}
            Err(e) => warn!(run_id = %run_id, error = %e, "failed to persist run status"),
        }
    }

    pub async fn pause(&self, run_id: &RunId) -> Result<ControlOutcome> {
        let outcome = self.control(run_id, "pause", RunController::pause).await?;
        if outcome.is_applied() {
            self.persist_current(run_id).await;
        }
        Ok(outcome)
    }

    pub async fn resume(&self, run_id: &RunId) -> Result<ControlOutcome> {
        let outcome = self.control(run_id, "resume", RunController::resume).await?;
        if outcome.is_applied() {
            self.persist_current(run_id).await;
        }
        Ok(outcome)
    }

    async fn persist_current(&self, run_id: &RunId) {
        if let Some(entry) = self.entry(run_id) {
            self.persist_status(run_id, entry.controller.status()).await;
        }
    }

    /// Request a stop; the run ends at its next epoch boundary.
    pub async fn stop(&self, run_id: &RunId) -> Result<ControlOutcome> {
        self.control(run_id, "stop", RunController::stop).await
    }

    pub async fn kill_communication(
        &self,
        run_id: &RunId,
        reason: Option<String>,
    ) -> Result<ControlOutcome> {
        self.control(run_id, "kill_communication", |c| {
            c.kill_communication(reason)
        })
        .await
    }

    pub async fn restore_communication(
        &self,
        run_id: &RunId,
        reason: Option<String>,
    ) -> Result<ControlOutcome> {
        self.control(run_id, "restore_communication", |c| {
            c.restore_communication(reason)
        })
        .await
    }

    // -- queries -------------------------------------------------------------

    /// Live snapshot for registered runs, otherwise rebuilt from the store.
    pub async fn status(&self, run_id: &RunId) -> Result<RunSnapshot> {
        self.retire_finished();
        if let Some(entry) = self.entry(run_id) {
            return Ok(entry.snapshot());
        }
        let run = self.store.get_run(run_id).await.map_err(not_found(run_id))?;
        let records = self.store.get_epochs(run_id).await?;
        let mut detector = CrystallizationDetector::new();
        for record in &records {
            detector.observe(record.epoch_index, type_entropy_of(&record.metrics()?));
        }
        Ok(RunSnapshot::from_record(run, detector.epoch()))
    }

    /// The run's live delivery queue. Fails once the run has been retired.
    pub fn subscribe(&self, run_id: &RunId) -> Result<Arc<DeliveryQueue>> {
        self.retire_finished();
        self.entry(run_id)
            .map(|e| e.queue.clone())
            .ok_or_else(|| SynapseError::RunNotFound(run_id.to_string()))
    }

    /// Wait until the run's worker has persisted a terminal status.
    ///
    /// A run no longer registered here answers from the store at once.
    pub async fn wait(&self, run_id: &RunId) -> Result<RunSnapshot> {
        let Some(entry) = self.entry(run_id) else {
            return self.status(run_id).await;
        };
        let mut done = entry.done.subscribe();
        // The sender lives in the entry we hold, so this cannot close.
        let _ = done.wait_for(|d| *d).await;
        Ok(entry.snapshot())
    }

    pub async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<RunRecord>> {
        Ok(self.store.list_runs(status).await?)
    }

    pub async fn verify(&self, run_id: &RunId) -> Result<ChainVerdict> {
        verify_run(self.store.as_ref(), run_id)
            .await
            .map_err(not_found(run_id))
    }

    pub async fn manifest(&self, run_id: &RunId) -> Result<RunManifest> {
        let run = self.store.get_run(run_id).await.map_err(not_found(run_id))?;
        let records = self.store.get_epochs(run_id).await?;
        RunManifest::from_run(&run, &records)
    }

    // -- process lifecycle ---------------------------------------------------

    /// Mark as `failed` every non-terminal run that has no worker in this
    /// process and whose lease was last renewed more than the lease TTL ago.
    pub async fn reconcile(&self) -> Result<Vec<RunId>> {
        let ttl = chrono::Duration::from_std(self.lease_ttl)
            .map_err(|e| SynapseError::Configuration(format!("lease ttl: {e}")))?;
        let cutoff = Utc::now() - ttl;
        let mut reconciled = Vec::new();
        for run in self.store.list_runs(None).await? {
            if run.status.is_terminal() || self.entry(&run.run_id).is_some() {
                continue;
            }
            if run.updated_at > cutoff {
                debug!(run_id = %run.run_id, updated_at = %run.updated_at, "run lease still held");
                continue;
            }
            match self
                .store
                .set_status(
                    &run.run_id,
                    RunStatus::Failed,
                    Some(ORPHANED_RUN_REASON.to_string()),
                )
                .await
            {
                Ok(_) => {
                    METRICS.inc_runs_reconciled();
                    obs::emit_run_reconciled(&run.run_id.0, run.status.as_str());
                    reconciled.push(run.run_id);
                }
                // Finished between the listing and the update.
                Err(StorageError::InvalidRunState { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(reconciled)
    }

    /// Stop every live run and wait for its worker to finish.
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<RunEntry>> = lock(&self.runs).values().cloned().collect();
        for entry in &entries {
            entry.controller.stop();
        }
        for entry in entries {
            let mut done = entry.done.subscribe();
            let _ = done.wait_for(|d| *d).await;
        }
        METRICS.flush();
    }
}

/// Renew `run_id`'s lease every `period` until its worker signals done.
async fn keep_alive(
    store: Arc<dyn EpochStore>,
    run_id: RunId,
    mut done: watch::Receiver<bool>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        let finished = *done.borrow();
        if finished {
            return;
        }
        tokio::select! {
            changed = done.changed() => if changed.is_err() {
                return;
            },
            _ = ticker.tick() => match store.heartbeat(&run_id).await {
                Ok(()) => {}
                // Terminal already; the worker is settling.
                Err(StorageError::InvalidRunState { .. }) => return,
                Err(e) => warn!(run_id = %run_id, error = %e, "failed to renew run lease"),
            },
        }
    }
}

fn not_found(run_id: &RunId) -> impl FnOnce(StorageError) -> SynapseError + '_ {
    move |e| match e {
        StorageError::RunNotFound { .. } => SynapseError::RunNotFound(run_id.to_string()),
        other => other.into(),
    }
}

/// Worker body: run the engine to an exit, then settle the run.
fn drive(
    mut engine: SimulationEngine,
    entry: Arc<RunEntry>,
    store: Arc<dyn EpochStore>,
    rt: Handle,
    seed: u64,
) {
    let run_id = entry.run_id.to_string();
    let _span = RunSpan::enter(&run_id);
    let started = Instant::now();
    let mut ledger = EpochLedger::new(store.clone(), entry.run_id.clone(), seed);

    let exit = std::panic::catch_unwind(AssertUnwindSafe(|| {
        engine.run(&entry.controller, |epoch, metrics| {
            let metrics = finalize_epoch_metrics(metrics);
            let record = rt
                .block_on(ledger.append(&metrics))
                .map_err(|e| SynapseError::TransientIo(format!("epoch {epoch}: {e}")))?;
            entry.observe_epoch(&record, &metrics);
            METRICS.inc_epochs_committed();
            obs::emit_epoch_committed(&run_id, epoch, record.hash.as_str());
            if entry.queue.push(metrics) {
                METRICS.inc_stream_dropped();
                obs::emit_stream_dropped(&run_id, epoch, entry.queue.dropped());
            }
            Ok(())
        })
    }));

    let terminal = match exit {
        Ok(Ok(EngineExit::Completed)) => Terminal::Completed,
        Ok(Ok(EngineExit::Stopped)) => Terminal::Stopped,
        Ok(Err(e)) => Terminal::Failed(e.to_string()),
        Err(_) => Terminal::Failed("simulation worker panicked".to_string()),
    };
    let status = terminal.status();
    let reason = match &terminal {
        Terminal::Failed(reason) => Some(reason.clone()),
        _ => None,
    };

    entry.controller.finish(terminal);
    if let Err(e) = rt.block_on(store.set_status(&entry.run_id, status, reason.clone())) {
        warn!(run_id = %run_id, error = %e, "failed to persist terminal status");
    }

    let epochs = entry.epochs_committed();
    match reason {
        Some(reason) => {
            METRICS.inc_runs_failed();
            obs::emit_run_failed(&run_id, epochs, &reason);
        }
        None => obs::emit_run_finished(
            &run_id,
            status.as_str(),
            epochs,
            started.elapsed().as_millis() as u64,
        ),
    }

    entry.queue.close();
    let _ = entry.finished_at.set(Instant::now());
    entry.done.send_replace(true);
}

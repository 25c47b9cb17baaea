//! RunManager lifecycle tests against the in-memory store.
//!
//! Runs use the reference grid world behind a gate: every episode reset
//! takes one permit, so the test decides exactly how many epochs may run.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde_json::Value;
use synapse_core::collaborators::{AgentOutput, Learner, StepOutcome, Trajectory};
use synapse_core::manager::{FINISHED_RUN_RETENTION, ORPHANED_RUN_REASON};
use synapse_core::reference::{GridWorld, GridWorldConfig};
use synapse_core::{
    reference_collaborators, Collaborators, ControlOutcome, Environment, KillSwitchAction,
    RunManager, Settings, SimulationConfig, StreamItem, SynapseError,
};
use synapse_ledger::fakes::{FlakyEpochStore, MemoryEpochStore};
use synapse_ledger::{ChainVerdict, EpochStore, NewRun, RunId, RunStatus};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct Gate(Arc<(Mutex<u64>, Condvar)>);

impl Gate {
    fn open(&self, permits: u64) {
        let (lock, cvar) = &*self.0;
        *lock.lock().unwrap() += permits;
        cvar.notify_all();
    }

    fn release_all(&self) {
        self.open(u64::MAX / 2);
    }

    fn pass(&self) {
        let (lock, cvar) = &*self.0;
        let mut permits = lock.lock().unwrap();
        while *permits == 0 {
            permits = cvar.wait(permits).unwrap();
        }
        *permits -= 1;
    }
}

struct GatedWorld {
    inner: GridWorld,
    gate: Gate,
}

impl Environment for GatedWorld {
    fn agent_ids(&self) -> Vec<String> {
        self.inner.agent_ids()
    }

    fn reset(&mut self, seed: u64) -> anyhow::Result<Vec<Vec<f64>>> {
        self.gate.pass();
        self.inner.reset(seed)
    }

    fn step(&mut self, actions: &[usize]) -> anyhow::Result<StepOutcome> {
        self.inner.step(actions)
    }
}

/// Delegates to a reference learner but fails its `fail_at`-th update.
struct FailingLearner {
    inner: Box<dyn Learner>,
    updates: u32,
    fail_at: u32,
}

impl Learner for FailingLearner {
    fn encode(&mut self, observation: &[f64], incoming: &[f64]) -> anyhow::Result<Vec<f64>> {
        self.inner.encode(observation, incoming)
    }

    fn act(&mut self, representation: &[f64]) -> anyhow::Result<AgentOutput> {
        self.inner.act(representation)
    }

    fn update(&mut self, trajectories: &[Trajectory]) -> anyhow::Result<f64> {
        self.updates += 1;
        if self.updates == self.fail_at {
            anyhow::bail!("gradient exploded");
        }
        self.inner.update(trajectories)
    }

    fn clear_episode(&mut self) {
        self.inner.clear_episode()
    }
}

fn config(epochs: u64) -> SimulationConfig {
    SimulationConfig {
        num_epochs: epochs,
        episodes_per_epoch: 1,
        max_steps: 8,
        signal_dim: 4,
        ..SimulationConfig::default()
    }
}

fn gated(config: &SimulationConfig, gate: &Gate) -> Collaborators {
    let mut c = reference_collaborators(config);
    c.environment = Box::new(GatedWorld {
        inner: GridWorld::new(GridWorldConfig::for_simulation(config)),
        gate: gate.clone(),
    });
    c
}

fn manager(store: Arc<dyn EpochStore>, max_runs: Option<usize>, capacity: usize) -> RunManager {
    let settings = Settings {
        max_concurrent_runs: max_runs,
        stream_capacity: capacity,
        ..Settings::default()
    };
    RunManager::new(store, &settings)
}

fn leased_manager(store: Arc<dyn EpochStore>, lease_ttl: Duration) -> RunManager {
    let settings = Settings {
        max_concurrent_runs: None,
        lease_ttl,
        ..Settings::default()
    };
    RunManager::new(store, &settings)
}

fn memory() -> Arc<dyn EpochStore> {
    Arc::new(MemoryEpochStore::new())
}

async fn wait_for_epochs(m: &RunManager, run_id: &RunId, n: u64) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if m.status(run_id).await.unwrap().current_epoch >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("epochs were not committed in time");
}

async fn drain(m: &RunManager, run_id: &RunId) -> Vec<Value> {
    let queue = m.subscribe(run_id).unwrap();
    let mut epochs = Vec::new();
    loop {
        match queue.pull(Duration::from_secs(10)).await {
            Some(StreamItem::Epoch(v)) => epochs.push(v),
            Some(StreamItem::End) => return epochs,
            None => panic!("stream stalled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_completes_and_chain_verifies() {
    let store = memory();
    let m = manager(store.clone(), Some(2), 200);
    let gate = Gate::default();
    gate.release_all();

    let cfg = config(4);
    let run_id = m.launch(cfg.clone(), gated(&cfg, &gate)).await.unwrap();
    let snap = m.wait(&run_id).await.unwrap();

    assert_eq!(snap.status, RunStatus::Completed);
    assert_eq!(snap.current_epoch, 4);
    assert!(snap.failure.is_none());

    let run = store.get_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.current_epoch, 4);
    assert_eq!(run.final_hash, snap.final_hash);
    assert!(run.completed_at.is_some());

    let records = store.get_epochs(&run_id).await.unwrap();
    let indices: Vec<u64> = records.iter().map(|r| r.epoch_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    assert_eq!(m.verify(&run_id).await.unwrap(), ChainVerdict::Valid);

    let metrics = records[0].metrics().unwrap();
    for key in synapse_core::REQUIRED_METRIC_KEYS {
        assert!(metrics.get(key).is_some(), "missing {key}");
    }
    assert!(metrics["energy_roi"].is_number());
    assert!(metrics["inquiry"]["type_entropy"].is_number());

    let streamed = drain(&m, &run_id).await;
    assert_eq!(streamed.len(), 4);
    assert_eq!(streamed[3]["epoch"], 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn baseline_run_fills_inquiry_with_empty_object() {
    let m = manager(memory(), None, 200);
    let cfg = SimulationConfig {
        protocol: synapse_core::ProtocolId::Baseline,
        ..config(2)
    };
    let run_id = m.launch(cfg.clone(), reference_collaborators(&cfg)).await.unwrap();
    m.wait(&run_id).await.unwrap();
    let epochs = drain(&m, &run_id).await;
    assert_eq!(epochs[0]["inquiry"], serde_json::json!({}));
    let manifest = m.manifest(&run_id).await.unwrap();
    assert_eq!(manifest.crystallization_epoch, None);
    assert_eq!(manifest.final_metrics.unwrap().type_entropy, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_epoch_completes_while_paused() {
    let store = memory();
    let m = manager(store.clone(), None, 200);
    let gate = Gate::default();
    let cfg = config(5);
    let run_id = m.launch(cfg.clone(), gated(&cfg, &gate)).await.unwrap();

    // Epoch 0 is in flight (blocked on the gate) when the pause lands.
    assert_eq!(m.pause(&run_id).await.unwrap(), ControlOutcome::Applied);
    assert_eq!(m.status(&run_id).await.unwrap().status, RunStatus::Paused);
    assert_eq!(store.get_run(&run_id).await.unwrap().status, RunStatus::Paused);

    gate.open(1);
    wait_for_epochs(&m, &run_id, 1).await;

    gate.release_all();
    tokio::time::sleep(Duration::from_millis(250)).await;
    let snap = m.status(&run_id).await.unwrap();
    assert_eq!(snap.current_epoch, 1);
    assert_eq!(snap.status, RunStatus::Paused);

    assert!(!m.pause(&run_id).await.unwrap().is_applied());
    assert_eq!(m.resume(&run_id).await.unwrap(), ControlOutcome::Applied);
    let snap = m.wait(&run_id).await.unwrap();
    assert_eq!(snap.status, RunStatus::Completed);
    assert_eq!(snap.current_epoch, 5);

    let indices: Vec<u64> = store
        .get_epochs(&run_id)
        .await
        .unwrap()
        .iter()
        .map(|r| r.epoch_index)
        .collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    assert!(m.verify(&run_id).await.unwrap().is_valid());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_takes_effect_at_the_next_boundary() {
    let store = memory();
    let m = manager(store.clone(), None, 200);
    let gate = Gate::default();
    let cfg = config(10);
    let run_id = m.launch(cfg.clone(), gated(&cfg, &gate)).await.unwrap();

    m.pause(&run_id).await.unwrap();
    gate.open(2);
    wait_for_epochs(&m, &run_id, 1).await;

    assert_eq!(m.stop(&run_id).await.unwrap(), ControlOutcome::Applied);
    assert!(!m.stop(&run_id).await.unwrap().is_applied());
    let snap = m.wait(&run_id).await.unwrap();
    gate.release_all();

    assert_eq!(snap.status, RunStatus::Stopped);
    assert_eq!(snap.current_epoch, 1);
    let run = store.get_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Stopped);
    assert_eq!(run.current_epoch, 1);

    // Controls on a finished run are reported, not errors.
    assert!(matches!(
        m.resume(&run_id).await.unwrap(),
        ControlOutcome::Ignored { .. }
    ));
    assert_eq!(drain(&m, &run_id).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_switch_applies_to_the_next_epoch_only() {
    let m = manager(memory(), None, 200);
    let gate = Gate::default();
    let cfg = config(3);
    let run_id = m.launch(cfg.clone(), gated(&cfg, &gate)).await.unwrap();

    m.pause(&run_id).await.unwrap();
    gate.open(1);
    wait_for_epochs(&m, &run_id, 1).await;

    let kill = m
        .kill_communication(&run_id, Some("ablation".to_string()))
        .await
        .unwrap();
    assert_eq!(kill, ControlOutcome::Applied);
    assert!(!m.kill_communication(&run_id, None).await.unwrap().is_applied());
    let snap = m.status(&run_id).await.unwrap();
    assert!(snap.comm_killed);
    assert_eq!(snap.kill_switch_events.len(), 1);
    assert_eq!(snap.kill_switch_events[0].action, KillSwitchAction::Kill);
    assert_eq!(
        snap.kill_switch_events[0].reason.as_deref(),
        Some("ablation")
    );

    m.resume(&run_id).await.unwrap();
    gate.release_all();
    m.wait(&run_id).await.unwrap();

    let killed: Vec<bool> = drain(&m, &run_id)
        .await
        .iter()
        .map(|e| e["comm_killed"].as_bool().unwrap())
        .collect();
    assert_eq!(killed, vec![false, true, false]);

    let resilience = m
        .manifest(&run_id)
        .await
        .unwrap()
        .perturbation_resilience
        .unwrap();
    assert_eq!(resilience.first_kill_epoch, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn learner_fault_fails_the_run() {
    let store = memory();
    let m = manager(store.clone(), None, 200);
    let cfg = config(5);
    let mut collaborators = reference_collaborators(&cfg);
    let inner = collaborators.learners.remove(1);
    collaborators.learners.insert(
        1,
        Box::new(FailingLearner {
            inner,
            updates: 0,
            fail_at: 3,
        }),
    );

    let run_id = m.launch(cfg, collaborators).await.unwrap();
    let snap = m.wait(&run_id).await.unwrap();
    assert_eq!(snap.status, RunStatus::Failed);
    assert_eq!(snap.current_epoch, 2);
    let failure = snap.failure.unwrap();
    assert!(failure.contains("learner B"), "{failure}");
    assert!(failure.contains("gradient exploded"), "{failure}");

    let run = store.get_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failure_reason.as_deref(), Some(failure.as_str()));
    assert_eq!(drain(&m, &run_id).await.len(), 2);
    assert!(m.verify(&run_id).await.unwrap().is_valid());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn store_failure_fails_the_run_without_a_gap() {
    let store: Arc<dyn EpochStore> = Arc::new(FlakyEpochStore::fail_commits_after(3));
    let m = manager(store.clone(), None, 200);
    let cfg = config(6);
    let run_id = m.launch(cfg.clone(), reference_collaborators(&cfg)).await.unwrap();

    let snap = m.wait(&run_id).await.unwrap();
    assert_eq!(snap.status, RunStatus::Failed);
    assert!(snap.failure.unwrap().contains("transient io failure"));

    let run = store.get_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.current_epoch, 3);
    assert_eq!(store.get_epochs(&run_id).await.unwrap().len(), 3);
    assert!(m.verify(&run_id).await.unwrap().is_valid());
    // The epoch that failed to persist is never streamed.
    assert_eq!(drain(&m, &run_id).await.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrency_limit_rejects_without_side_effects() {
    let store = memory();
    let m = manager(store.clone(), Some(1), 200);
    let gate = Gate::default();
    let cfg = config(3);

    let first = m.launch(cfg.clone(), gated(&cfg, &gate)).await.unwrap();
    let err = m
        .launch(cfg.clone(), reference_collaborators(&cfg))
        .await
        .unwrap_err();
    assert!(matches!(err, SynapseError::ConcurrencyRejection { limit: 1 }));
    assert_eq!(store.list_runs(None).await.unwrap().len(), 1);
    assert_eq!(m.status(&first).await.unwrap().status, RunStatus::Running);

    gate.release_all();
    m.wait(&first).await.unwrap();

    let second = m.launch(cfg.clone(), reference_collaborators(&cfg)).await.unwrap();
    assert_eq!(m.wait(&second).await.unwrap().status, RunStatus::Completed);
}

#[tokio::test]
async fn invalid_config_is_rejected_before_persisting() {
    let store = memory();
    let m = manager(store.clone(), Some(1), 200);
    let cfg = SimulationConfig {
        energy_budget: 0.0,
        ..config(3)
    };
    let err = m
        .launch(cfg, reference_collaborators(&config(3)))
        .await
        .unwrap_err();
    assert!(matches!(err, SynapseError::Configuration(_)));
    assert!(store.list_runs(None).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backpressure_keeps_the_newest_epochs() {
    let m = manager(memory(), None, 2);
    let cfg = config(6);
    let run_id = m.launch(cfg.clone(), reference_collaborators(&cfg)).await.unwrap();
    let snap = m.wait(&run_id).await.unwrap();
    assert_eq!(snap.current_epoch, 6);
    // Six epochs plus the sentinel through two slots: only the newest epoch survives.
    assert_eq!(snap.stream_dropped, 5);

    let queue = m.subscribe(&run_id).unwrap();
    assert!(queue.len() <= 2);
    let epochs = drain(&m, &run_id).await;
    assert_eq!(epochs.len(), 1);
    assert_eq!(epochs[0]["epoch"], 5);
    assert_eq!(queue.dropped(), 5);
}

#[tokio::test]
async fn reconcile_fails_orphaned_runs() {
    let store = memory();
    let seed_run = |id: &str| NewRun {
        run_id: RunId::from(id),
        seed: 1,
        total_epochs: 10,
        params: serde_json::to_value(config(10)).unwrap(),
    };
    for (id, status) in [
        ("running", Some(RunStatus::Running)),
        ("paused", Some(RunStatus::Paused)),
        ("pending", None),
        ("done", Some(RunStatus::Completed)),
    ] {
        store.create_run(seed_run(id)).await.unwrap();
        if let Some(status) = status {
            if status.is_terminal() {
                store
                    .set_status(&RunId::from(id), RunStatus::Running, None)
                    .await
                    .unwrap();
            }
            store.set_status(&RunId::from(id), status, None).await.unwrap();
        }
    }

    let m = leased_manager(store.clone(), Duration::ZERO);
    let mut reconciled = m.reconcile().await.unwrap();
    reconciled.sort();
    assert_eq!(
        reconciled,
        vec![RunId::from("paused"), RunId::from("pending"), RunId::from("running")]
    );

    for id in ["running", "paused", "pending"] {
        let run = store.get_run(&RunId::from(id)).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure_reason.as_deref(), Some(ORPHANED_RUN_REASON));
    }
    assert_eq!(
        store.get_run(&RunId::from("done")).await.unwrap().status,
        RunStatus::Completed
    );
    assert!(m.reconcile().await.unwrap().is_empty());

    // Stored runs answer status and control without a live worker.
    let snap = m.status(&RunId::from("running")).await.unwrap();
    assert_eq!(snap.status, RunStatus::Failed);
    assert!(!m.pause(&RunId::from("running")).await.unwrap().is_applied());
}

#[tokio::test]
async fn fresh_leases_are_not_reconciled() {
    let store = memory();
    let run_id = RunId::from("elsewhere");
    store
        .create_run(NewRun {
            run_id: run_id.clone(),
            seed: 1,
            total_epochs: 10,
            params: serde_json::to_value(config(10)).unwrap(),
        })
        .await
        .unwrap();
    store
        .set_status(&run_id, RunStatus::Running, None)
        .await
        .unwrap();

    let m = leased_manager(store.clone(), Duration::from_secs(30));
    assert!(m.reconcile().await.unwrap().is_empty());
    assert_eq!(store.get_run(&run_id).await.unwrap().status, RunStatus::Running);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconcile_spares_runs_live_in_another_manager() {
    let store = memory();
    let ttl = Duration::from_millis(300);
    let owner = leased_manager(store.clone(), ttl);
    let other = leased_manager(store.clone(), ttl);
    let gate = Gate::default();
    let cfg = config(3);
    let run_id = owner.launch(cfg.clone(), gated(&cfg, &gate)).await.unwrap();

    owner.pause(&run_id).await.unwrap();
    gate.open(1);
    wait_for_epochs(&owner, &run_id, 1).await;

    // Paused with no commits for well past the TTL: only heartbeats keep the lease.
    tokio::time::sleep(ttl * 3).await;
    assert!(other.reconcile().await.unwrap().is_empty());
    assert_eq!(store.get_run(&run_id).await.unwrap().status, RunStatus::Paused);

    owner.resume(&run_id).await.unwrap();
    gate.release_all();
    let snap = owner.wait(&run_id).await.unwrap();
    assert_eq!(snap.status, RunStatus::Completed);
    assert_eq!(snap.current_epoch, 3);
    assert!(snap.failure.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drained_runs_leave_the_registry() {
    let store = memory();
    let m = manager(store.clone(), None, 200);
    let cfg = config(2);
    let run_id = m.launch(cfg.clone(), reference_collaborators(&cfg)).await.unwrap();
    let live = m.wait(&run_id).await.unwrap();
    assert_eq!(drain(&m, &run_id).await.len(), 2);

    assert!(matches!(
        m.subscribe(&run_id),
        Err(SynapseError::RunNotFound(_))
    ));
    let stored = m.status(&run_id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Completed);
    assert_eq!(stored.current_epoch, 2);
    assert_eq!(stored.final_hash, live.final_hash);
    assert_eq!(m.wait(&run_id).await.unwrap().status, RunStatus::Completed);
    assert!(matches!(
        m.stop(&run_id).await.unwrap(),
        ControlOutcome::Ignored { .. }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unread_finished_runs_are_capped() {
    let m = manager(memory(), None, 4);
    let cfg = SimulationConfig {
        max_steps: 2,
        ..config(1)
    };
    let mut runs = Vec::new();
    for _ in 0..=FINISHED_RUN_RETENTION {
        let run_id = m.launch(cfg.clone(), reference_collaborators(&cfg)).await.unwrap();
        m.wait(&run_id).await.unwrap();
        runs.push(run_id);
    }

    assert!(matches!(
        m.subscribe(&runs[0]),
        Err(SynapseError::RunNotFound(_))
    ));
    assert!(m.subscribe(&runs[1]).is_ok());
    assert!(m.subscribe(&runs[FINISHED_RUN_RETENTION]).is_ok());
    assert_eq!(
        m.status(&runs[0]).await.unwrap().status,
        RunStatus::Completed
    );
}

#[tokio::test]
async fn unknown_run_is_not_found() {
    let m = manager(memory(), None, 200);
    let ghost = RunId::from("ghost");
    assert!(matches!(
        m.status(&ghost).await,
        Err(SynapseError::RunNotFound(_))
    ));
    assert!(matches!(m.stop(&ghost).await, Err(SynapseError::RunNotFound(_))));
    assert!(matches!(m.subscribe(&ghost), Err(SynapseError::RunNotFound(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manifest_matches_the_chain() {
    let m = manager(memory(), None, 200);
    let cfg = config(6);
    let run_id = m.launch(cfg.clone(), reference_collaborators(&cfg)).await.unwrap();
    let snap = m.wait(&run_id).await.unwrap();

    let manifest = m.manifest(&run_id).await.unwrap();
    assert_eq!(manifest.epochs_total, 6);
    assert_eq!(manifest.seed, cfg.seed);
    assert_eq!(manifest.protocol, cfg.protocol);
    assert_eq!(manifest.chain_head, snap.final_hash);
    assert_eq!(manifest.crystallization_epoch, snap.crystallization_epoch);
    assert!(manifest.final_metrics.unwrap().type_entropy.is_some());
    assert!(manifest.perturbation_resilience.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_stops_live_runs() {
    let store = memory();
    let m = manager(store.clone(), None, 200);
    let gate = Gate::default();
    let cfg = config(50);
    let run_id = m.launch(cfg.clone(), gated(&cfg, &gate)).await.unwrap();
    gate.open(2);
    wait_for_epochs(&m, &run_id, 1).await;

    let releaser = {
        let gate = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            gate.release_all();
        })
    };
    m.shutdown().await;
    releaser.await.unwrap();

    let run = store.get_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Stopped);
    assert!(run.current_epoch < 50);
}

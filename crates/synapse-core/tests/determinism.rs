//! Reproducibility: a seed fixes every epoch's metrics and therefore the
//! whole hash chain.

use std::sync::Arc;

use proptest::prelude::*;
use synapse_core::{
    episode_seed, reference_collaborators, EpochRecord, EpochStore, ProtocolId, RunManager,
    Settings, SimulationConfig, SimulationEngine,
};
use synapse_ledger::fakes::MemoryEpochStore;

fn config(seed: u64) -> SimulationConfig {
    SimulationConfig {
        seed,
        num_epochs: 3,
        episodes_per_epoch: 2,
        max_steps: 12,
        signal_dim: 4,
        ..SimulationConfig::default()
    }
}

async fn run_to_completion(config: SimulationConfig) -> Vec<EpochRecord> {
    let store: Arc<dyn EpochStore> = Arc::new(MemoryEpochStore::new());
    let manager = RunManager::new(store.clone(), &Settings::default());
    let run_id = manager
        .launch(config.clone(), reference_collaborators(&config))
        .await
        .unwrap();
    manager.wait(&run_id).await.unwrap();
    store.get_epochs(&run_id).await.unwrap()
}

#[test]
fn engines_with_equal_seeds_agree_epoch_by_epoch() {
    let cfg = config(7);
    let mut a = SimulationEngine::new(cfg.clone(), reference_collaborators(&cfg)).unwrap();
    let mut b = SimulationEngine::new(cfg.clone(), reference_collaborators(&cfg)).unwrap();
    for _ in 0..3 {
        assert_eq!(a.run_epoch().unwrap(), b.run_epoch().unwrap());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn equal_seeds_produce_identical_chains() {
    let a = run_to_completion(config(11)).await;
    let b = run_to_completion(config(11)).await;
    assert_eq!(a.len(), 3);
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(&b) {
        assert_eq!(x.metrics_json, y.metrics_json);
        assert_eq!(x.hash, y.hash);
        assert_eq!(x.prev_hash, y.prev_hash);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn different_seeds_diverge() {
    let a = run_to_completion(config(1)).await;
    let b = run_to_completion(config(2)).await;
    assert_ne!(a[0].hash, b[0].hash);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn protocol_is_part_of_the_chain() {
    let a = run_to_completion(config(5)).await;
    let b = run_to_completion(SimulationConfig {
        protocol: ProtocolId::Baseline,
        ..config(5)
    })
    .await;
    assert_ne!(a[0].hash, b[0].hash);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn episode_seeds_are_distinct_within_an_epoch(base in any::<u64>(), epoch in 0u64..10_000) {
        let seeds: std::collections::HashSet<u64> =
            (0..32).map(|e| episode_seed(base, epoch, e)).collect();
        prop_assert_eq!(seeds.len(), 32);
    }

    #[test]
    fn first_epoch_is_a_function_of_the_seed(seed in any::<u64>()) {
        let cfg = SimulationConfig {
            episodes_per_epoch: 1,
            max_steps: 4,
            ..config(seed)
        };
        let mut a = SimulationEngine::new(cfg.clone(), reference_collaborators(&cfg)).unwrap();
        let mut b = SimulationEngine::new(cfg.clone(), reference_collaborators(&cfg)).unwrap();
        prop_assert_eq!(a.run_epoch().unwrap(), b.run_epoch().unwrap());
    }
}

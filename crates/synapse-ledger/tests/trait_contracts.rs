//! Trait contract tests for EpochStore.
//!
//! Each contract is written once against `&dyn EpochStore` and run against
//! the in-memory fake and the in-memory SurrealDB backend. Any conforming
//! implementation must pass these.

use serde_json::json;
use synapse_ledger::fakes::{FlakyEpochStore, MemoryEpochStore};
use synapse_ledger::storage_traits::*;
use synapse_ledger::{link_epoch, verify_chain, ChainVerdict, StorageError, SurrealEpochStore};

fn new_run(total_epochs: u64) -> NewRun {
    NewRun {
        run_id: RunId::new(),
        seed: 42,
        total_epochs,
        params: json!({"protocol": "interrogative", "episodes_per_epoch": 2}),
    }
}

/// Commit `n` epochs onto `run`, returning the records in order.
async fn commit_n(store: &dyn EpochStore, run: &RunRecord, n: u64) -> Vec<EpochRecord> {
    let mut head = store.get_run(&run.run_id).await.unwrap().chain_head();
    let start = store.get_run(&run.run_id).await.unwrap().current_epoch;
    let mut out = Vec::new();
    for i in start..start + n {
        let rec = link_epoch(
            &run.run_id,
            i,
            &head,
            &json!({"epoch": i, "survival_rate": 0.25}),
            run.seed,
        );
        store.commit_epoch(&rec).await.unwrap();
        head = rec.hash.clone();
        out.push(rec);
    }
    out
}

// ===========================================================================
// Contracts
// ===========================================================================

async fn create_run_is_pending(store: &dyn EpochStore) {
    let run = store.create_run(new_run(5)).await.unwrap();
    assert_eq!(run.status, RunStatus::Pending);
    assert_eq!(run.current_epoch, 0);
    assert!(run.final_hash.is_none());

    let fetched = store.get_run(&run.run_id).await.unwrap();
    assert_eq!(fetched.run_id, run.run_id);
    assert_eq!(fetched.seed, 42);
    assert_eq!(fetched.total_epochs, 5);
    assert_eq!(fetched.params["episodes_per_epoch"], 2);
}

async fn get_run_not_found(store: &dyn EpochStore) {
    let err = store.get_run(&RunId::from("nonexistent")).await.unwrap_err();
    assert!(matches!(err, StorageError::RunNotFound { .. }));
}

async fn commit_advances_head(store: &dyn EpochStore) {
    let run = store.create_run(new_run(3)).await.unwrap();
    store
        .set_status(&run.run_id, RunStatus::Running, None)
        .await
        .unwrap();
    let records = commit_n(store, &run, 3).await;

    let fetched = store.get_run(&run.run_id).await.unwrap();
    assert_eq!(fetched.current_epoch, 3);
    assert_eq!(fetched.final_hash.as_ref(), Some(&records[2].hash));

    let stored = store.get_epochs(&run.run_id).await.unwrap();
    assert_eq!(stored.len(), 3);
    for (i, rec) in stored.iter().enumerate() {
        assert_eq!(rec.epoch_index, i as u64);
        assert_eq!(rec.hash, records[i].hash);
        assert_eq!(rec.metrics_json, records[i].metrics_json);
    }
    assert_eq!(verify_chain(&stored, run.seed), ChainVerdict::Valid);
}

async fn commit_rejects_gap_and_duplicate(store: &dyn EpochStore) {
    let run = store.create_run(new_run(5)).await.unwrap();
    store
        .set_status(&run.run_id, RunStatus::Running, None)
        .await
        .unwrap();
    let first = commit_n(store, &run, 1).await;

    let dup = first[0].clone();
    let err = store.commit_epoch(&dup).await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::EpochOutOfOrder {
            expected: 1,
            got: 0,
            ..
        }
    ));

    let gap = link_epoch(&run.run_id, 5, &first[0].hash, &json!({"epoch": 5}), 42);
    let err = store.commit_epoch(&gap).await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::EpochOutOfOrder {
            expected: 1,
            got: 5,
            ..
        }
    ));

    assert_eq!(store.get_epochs(&run.run_id).await.unwrap().len(), 1);
}

async fn commit_unknown_run_fails(store: &dyn EpochStore) {
    let rec = link_epoch(
        &RunId::from("ghost"),
        0,
        &ChainHash::genesis(),
        &json!({}),
        1,
    );
    let err = store.commit_epoch(&rec).await.unwrap_err();
    assert!(matches!(err, StorageError::RunNotFound { .. }));
}

async fn terminal_status_is_final(store: &dyn EpochStore) {
    let run = store.create_run(new_run(2)).await.unwrap();
    store
        .set_status(&run.run_id, RunStatus::Running, None)
        .await
        .unwrap();
    commit_n(store, &run, 1).await;

    let stopped = store
        .set_status(&run.run_id, RunStatus::Stopped, None)
        .await
        .unwrap();
    assert_eq!(stopped.status, RunStatus::Stopped);
    assert!(stopped.completed_at.is_some());

    let err = store
        .set_status(&run.run_id, RunStatus::Completed, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));

    let head = store.get_run(&run.run_id).await.unwrap().chain_head();
    let late = link_epoch(&run.run_id, 1, &head, &json!({"epoch": 1}), 42);
    let err = store.commit_epoch(&late).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));

    let fetched = store.get_run(&run.run_id).await.unwrap();
    assert_eq!(fetched.status, RunStatus::Stopped);
    assert_eq!(fetched.current_epoch, 1);
}

async fn failure_reason_is_retained(store: &dyn EpochStore) {
    let run = store.create_run(new_run(2)).await.unwrap();
    store
        .set_status(&run.run_id, RunStatus::Running, None)
        .await
        .unwrap();
    store
        .set_status(
            &run.run_id,
            RunStatus::Failed,
            Some("learner agent_1 diverged".to_string()),
        )
        .await
        .unwrap();

    let fetched = store.get_run(&run.run_id).await.unwrap();
    assert_eq!(fetched.status, RunStatus::Failed);
    assert_eq!(
        fetched.failure_reason.as_deref(),
        Some("learner agent_1 diverged")
    );
}

async fn list_runs_filters_by_status(store: &dyn EpochStore) {
    let a = store.create_run(new_run(1)).await.unwrap();
    let b = store.create_run(new_run(1)).await.unwrap();
    store
        .set_status(&b.run_id, RunStatus::Running, None)
        .await
        .unwrap();

    let all = store.list_runs(None).await.unwrap();
    assert!(all.iter().any(|r| r.run_id == a.run_id));
    assert!(all.iter().any(|r| r.run_id == b.run_id));

    let running = store.list_runs(Some(RunStatus::Running)).await.unwrap();
    assert!(running.iter().all(|r| r.status == RunStatus::Running));
    assert!(running.iter().any(|r| r.run_id == b.run_id));
    assert!(!running.iter().any(|r| r.run_id == a.run_id));
}

async fn pause_and_resume_allowed(store: &dyn EpochStore) {
    let run = store.create_run(new_run(4)).await.unwrap();
    store
        .set_status(&run.run_id, RunStatus::Running, None)
        .await
        .unwrap();
    commit_n(store, &run, 1).await;
    store
        .set_status(&run.run_id, RunStatus::Paused, None)
        .await
        .unwrap();
    // Epochs finishing while a pause is pending still land.
    commit_n(store, &run, 1).await;
    store
        .set_status(&run.run_id, RunStatus::Running, None)
        .await
        .unwrap();
    commit_n(store, &run, 2).await;

    let fetched = store.get_run(&run.run_id).await.unwrap();
    assert_eq!(fetched.current_epoch, 4);
    let chain = store.get_epochs(&run.run_id).await.unwrap();
    assert!(verify_chain(&chain, 42).is_valid());
}

async fn lifecycle_edges_are_enforced(store: &dyn EpochStore) {
    let run = store.create_run(new_run(3)).await.unwrap();
    for illegal in [RunStatus::Paused, RunStatus::Completed, RunStatus::Stopped] {
        let err = store
            .set_status(&run.run_id, illegal, None)
            .await
            .unwrap_err();
        assert!(
            matches!(err, StorageError::InvalidRunState { .. }),
            "pending -> {illegal}"
        );
    }

    store
        .set_status(&run.run_id, RunStatus::Running, None)
        .await
        .unwrap();
    let err = store
        .set_status(&run.run_id, RunStatus::Pending, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));
    assert_eq!(
        store.get_run(&run.run_id).await.unwrap().status,
        RunStatus::Running
    );
}

async fn heartbeat_renews_lease(store: &dyn EpochStore) {
    let run = store.create_run(new_run(2)).await.unwrap();
    store
        .set_status(&run.run_id, RunStatus::Running, None)
        .await
        .unwrap();
    let before = store.get_run(&run.run_id).await.unwrap().updated_at;

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    store.heartbeat(&run.run_id).await.unwrap();
    let after = store.get_run(&run.run_id).await.unwrap().updated_at;
    assert!(after > before, "{after} should be after {before}");

    store
        .set_status(&run.run_id, RunStatus::Completed, None)
        .await
        .unwrap();
    let err = store.heartbeat(&run.run_id).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));

    let err = store.heartbeat(&RunId::from("ghost")).await.unwrap_err();
    assert!(matches!(err, StorageError::RunNotFound { .. }));
}

// ===========================================================================
// MemoryEpochStore
// ===========================================================================

mod memory_store_tests {
    use super::*;

    #[tokio::test]
    async fn create_run_is_pending_memory() {
        create_run_is_pending(&MemoryEpochStore::new()).await;
    }

    #[tokio::test]
    async fn get_run_not_found_memory() {
        get_run_not_found(&MemoryEpochStore::new()).await;
    }

    #[tokio::test]
    async fn commit_advances_head_memory() {
        commit_advances_head(&MemoryEpochStore::new()).await;
    }

    #[tokio::test]
    async fn commit_rejects_gap_and_duplicate_memory() {
        commit_rejects_gap_and_duplicate(&MemoryEpochStore::new()).await;
    }

    #[tokio::test]
    async fn commit_unknown_run_fails_memory() {
        commit_unknown_run_fails(&MemoryEpochStore::new()).await;
    }

    #[tokio::test]
    async fn terminal_status_is_final_memory() {
        terminal_status_is_final(&MemoryEpochStore::new()).await;
    }

    #[tokio::test]
    async fn failure_reason_is_retained_memory() {
        failure_reason_is_retained(&MemoryEpochStore::new()).await;
    }

    #[tokio::test]
    async fn list_runs_filters_by_status_memory() {
        list_runs_filters_by_status(&MemoryEpochStore::new()).await;
    }

    #[tokio::test]
    async fn pause_and_resume_allowed_memory() {
        pause_and_resume_allowed(&MemoryEpochStore::new()).await;
    }

    #[tokio::test]
    async fn lifecycle_edges_are_enforced_memory() {
        lifecycle_edges_are_enforced(&MemoryEpochStore::new()).await;
    }

    #[tokio::test]
    async fn heartbeat_renews_lease_memory() {
        heartbeat_renews_lease(&MemoryEpochStore::new()).await;
    }

    #[tokio::test]
    async fn tampering_is_detected_at_exact_index() {
        let store = MemoryEpochStore::new();
        let run = store.create_run(new_run(6)).await.unwrap();
        store
            .set_status(&run.run_id, RunStatus::Running, None)
            .await
            .unwrap();
        commit_n(&store, &run, 6).await;

        store
            .overwrite_metrics(&run.run_id, 3, r#"{"epoch":3,"survival_rate":1}"#)
            .unwrap();
        let chain = store.get_epochs(&run.run_id).await.unwrap();
        assert_eq!(verify_chain(&chain, 42).first_broken(), Some(3));
    }

    #[tokio::test]
    async fn flaky_store_fails_after_budget() {
        let store = FlakyEpochStore::fail_commits_after(2);
        let run = store.create_run(new_run(5)).await.unwrap();
        store
            .set_status(&run.run_id, RunStatus::Running, None)
            .await
            .unwrap();
        commit_n(&store, &run, 2).await;

        let head = store.get_run(&run.run_id).await.unwrap().chain_head();
        let third = link_epoch(&run.run_id, 2, &head, &json!({"epoch": 2}), 42);
        let err = store.commit_epoch(&third).await.unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
        assert_eq!(store.get_run(&run.run_id).await.unwrap().current_epoch, 2);
    }
}

// ===========================================================================
// SurrealEpochStore (in-memory engine)
// ===========================================================================

mod surreal_store_tests {
    use super::*;

    async fn store() -> SurrealEpochStore {
        SurrealEpochStore::in_memory()
            .await
            .expect("in_memory() failed")
    }

    #[tokio::test]
    async fn create_run_is_pending_surreal() {
        create_run_is_pending(&store().await).await;
    }

    #[tokio::test]
    async fn get_run_not_found_surreal() {
        get_run_not_found(&store().await).await;
    }

    #[tokio::test]
    async fn commit_advances_head_surreal() {
        commit_advances_head(&store().await).await;
    }

    #[tokio::test]
    async fn commit_rejects_gap_and_duplicate_surreal() {
        commit_rejects_gap_and_duplicate(&store().await).await;
    }

    #[tokio::test]
    async fn commit_unknown_run_fails_surreal() {
        commit_unknown_run_fails(&store().await).await;
    }

    #[tokio::test]
    async fn terminal_status_is_final_surreal() {
        terminal_status_is_final(&store().await).await;
    }

    #[tokio::test]
    async fn failure_reason_is_retained_surreal() {
        failure_reason_is_retained(&store().await).await;
    }

    #[tokio::test]
    async fn list_runs_filters_by_status_surreal() {
        list_runs_filters_by_status(&store().await).await;
    }

    #[tokio::test]
    async fn pause_and_resume_allowed_surreal() {
        pause_and_resume_allowed(&store().await).await;
    }

    #[tokio::test]
    async fn lifecycle_edges_are_enforced_surreal() {
        lifecycle_edges_are_enforced(&store().await).await;
    }

    #[tokio::test]
    async fn heartbeat_renews_lease_surreal() {
        heartbeat_renews_lease(&store().await).await;
    }

    #[tokio::test]
    async fn surrealkv_persists_across_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("surrealkv://{}", dir.path().join("db").display());

        let run_id = {
            let store = SurrealEpochStore::connect(&url).await.unwrap();
            let run = store.create_run(new_run(2)).await.unwrap();
            store
                .set_status(&run.run_id, RunStatus::Running, None)
                .await
                .unwrap();
            commit_n(&store, &run, 2).await;
            run.run_id
        };

        let store = SurrealEpochStore::connect(&url).await.unwrap();
        let fetched = store.get_run(&run_id).await.unwrap();
        assert_eq!(fetched.current_epoch, 2);
        let chain = store.get_epochs(&run_id).await.unwrap();
        assert!(verify_chain(&chain, 42).is_valid());
    }
}

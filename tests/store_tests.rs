//! Integration tests for the generic task store over the in-memory backend.
//!
//! Organized into module blocks per concern: claims, optimistic updates,
//! queries, and property tests over deltas and the status state machine.

use std::sync::Arc;

use chrono::{Duration, Utc};
use proptest::prelude::*;

use taskweave::domain::TaskModification;
use taskweave::store::generic::GenericTaskStore;
use taskweave::store::memory::InMemoryBackend;
use taskweave::store::{StoreConfig, TaskQuery};
use taskweave::{
    EngineError, ExecutionStatus, ExtensionDelta, HandlerFrame, NodeRecord, TaskDelta, TaskRecord,
    TaskStore,
};

fn test_store() -> Arc<GenericTaskStore<InMemoryBackend>> {
    Arc::new(GenericTaskStore::new(InMemoryBackend::new()))
}

fn frame() -> HandlerFrame {
    HandlerFrame::new("h")
}

// ─── Claim Tests ────────────────────────────────────────────────────────────

mod claim_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_concurrent_claims_have_single_winner() {
        let store = test_store();
        let task = store.create(TaskRecord::new(frame())).await.unwrap();

        let mut claimers = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            let task_id = task.task_id.clone();
            claimers.push(tokio::spawn(async move {
                store
                    .compare_and_set_claim(&task_id, &format!("node-{i}"), Utc::now())
                    .await
                    .unwrap()
            }));
        }

        let mut winners = Vec::new();
        for claimer in claimers {
            if let Some(record) = claimer.await.unwrap() {
                winners.push(record);
            }
        }
        assert_eq!(winners.len(), 1);

        let stored = store.get(&task.task_id).await.unwrap();
        assert_eq!(stored.execution_status, ExecutionStatus::Running);
        assert_eq!(stored.owner_node, winners[0].owner_node);
    }

    #[tokio::test]
    async fn test_claim_sets_run_start_and_owner() {
        let store = test_store();
        let task = store.create(TaskRecord::new(frame())).await.unwrap();
        let now = Utc::now();

        let claimed = store
            .compare_and_set_claim(&task.task_id, "node-a", now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.owner_node.as_deref(), Some("node-a"));
        assert_eq!(claimed.last_run_start, Some(now));
        assert!(claimed.is_running_externally());
        assert!(claimed.version > task.version);
    }

    #[tokio::test]
    async fn test_future_task_is_not_claimable() {
        let store = test_store();
        let now = Utc::now();
        let task = store
            .create(TaskRecord::new(frame()).with_next_run_at(now + Duration::minutes(5)))
            .await
            .unwrap();

        assert!(store
            .compare_and_set_claim(&task.task_id, "node-a", now)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .compare_and_set_claim(&task.task_id, "node-a", now + Duration::minutes(6))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_claim_of_missing_task_is_not_found() {
        let store = test_store();
        let err = store
            .compare_and_set_claim("nope", "node-a", Utc::now())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}

// ─── Update Tests ───────────────────────────────────────────────────────────

mod update_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let store = test_store();
        let task = store.create(TaskRecord::new(frame())).await.unwrap();
        let delta = TaskDelta::new().add_progress(1);

        store.update(&task.task_id, &delta, task.version).await.unwrap();
        let err = store
            .update(&task.task_id, &delta, task.version)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ConcurrentModification { .. }));
        assert!(err.is_retryable());
        assert_eq!(store.get(&task.task_id).await.unwrap().progress, 1);
    }

    #[tokio::test]
    async fn test_invalid_transition_writes_nothing() {
        let store = test_store();
        let task = store.create(TaskRecord::new(frame())).await.unwrap();
        let delta = TaskDelta::new()
            .add_progress(3)
            .set_status(ExecutionStatus::Waiting);

        let err = store.modify(&task.task_id, &delta).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(store.get(&task.task_id).await.unwrap().progress, 0);
    }

    #[tokio::test]
    async fn test_concurrent_modify_loses_no_progress() {
        let store = Arc::new(
            GenericTaskStore::new(InMemoryBackend::new()).with_config(StoreConfig {
                max_conflict_retries: 100,
            }),
        );
        let task = store.create(TaskRecord::new(frame())).await.unwrap();

        let mut writers = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let task_id = task.task_id.clone();
            writers.push(tokio::spawn(async move {
                store
                    .modify(&task_id, &TaskDelta::new().add_progress(1))
                    .await
                    .unwrap();
            }));
        }
        for writer in writers {
            writer.await.unwrap();
        }
        assert_eq!(store.get(&task.task_id).await.unwrap().progress, 8);
    }

    #[tokio::test]
    async fn test_extension_null_removes_key() {
        let store = test_store();
        let task = store
            .create(
                TaskRecord::new(frame())
                    .with_extension(&ExtensionDelta::new().set("a", serde_json::json!(1))),
            )
            .await
            .unwrap();
        let delta = TaskDelta::new().apply_extension(ExtensionDelta::new().remove("a"));
        let updated = store.modify(&task.task_id, &delta).await.unwrap();
        assert!(updated.extension.get("a").is_none());
    }
}

// ─── Query and Node Tests ───────────────────────────────────────────────────

mod query_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_claimable_query_skips_owned_and_closed() {
        let store = test_store();
        let free = store.create(TaskRecord::new(frame())).await.unwrap();
        let owned = store.create(TaskRecord::new(frame())).await.unwrap();
        let closed = store.create(TaskRecord::new(frame())).await.unwrap();
        store
            .compare_and_set_claim(&owned.task_id, "node-a", Utc::now())
            .await
            .unwrap();
        store
            .modify(
                &closed.task_id,
                &TaskDelta::new().set_status(ExecutionStatus::Closed),
            )
            .await
            .unwrap();

        let claimable = store
            .query(&TaskQuery::claimable_at(Utc::now()))
            .await
            .unwrap();
        let ids: Vec<_> = claimable.into_iter().map(|t| t.task_id).collect();
        assert_eq!(ids, vec![free.task_id]);
    }

    #[tokio::test]
    async fn test_query_limit() {
        let store = test_store();
        for _ in 0..5 {
            store.create(TaskRecord::new(frame())).await.unwrap();
        }
        let page = store.query(&TaskQuery::new().with_limit(3)).await.unwrap();
        assert_eq!(page.len(), 3);
    }

    #[tokio::test]
    async fn test_node_heartbeats() {
        let store = test_store();
        let now = Utc::now();
        store
            .record_node_heartbeat(&NodeRecord {
                node_id: "node-a".to_string(),
                url: Some("http://127.0.0.1:8620".to_string()),
                scheduler_running: true,
                running_tasks: 2,
                last_check_in: now,
            })
            .await
            .unwrap();

        let node = store.get_node("node-a").await.unwrap();
        assert!(node.is_alive(now + Duration::seconds(10), Duration::seconds(60)));
        assert!(!node.is_alive(now + Duration::seconds(61), Duration::seconds(60)));
        assert_eq!(store.list_nodes().await.unwrap().len(), 1);
        assert!(matches!(
            store.get_node("node-b").await,
            Err(EngineError::NodeNotFound { .. })
        ));
    }
}

// ─── Property Tests ─────────────────────────────────────────────────────────

fn arb_status() -> impl Strategy<Value = ExecutionStatus> {
    prop::sample::select(vec![
        ExecutionStatus::Runnable,
        ExecutionStatus::Running,
        ExecutionStatus::Waiting,
        ExecutionStatus::Closed,
    ])
}

fn arb_progress_modification() -> impl Strategy<Value = TaskModification> {
    prop_oneof![
        (0u64..1_000).prop_map(TaskModification::AddProgress),
        (0u64..10_000).prop_map(TaskModification::RaiseProgress),
    ]
}

proptest! {
    /// Progress never decreases, whatever mix of add/raise is applied.
    #[test]
    fn progress_is_monotonic(mods in prop::collection::vec(arb_progress_modification(), 1..40)) {
        let mut record = TaskRecord::new(frame());
        let mut last = record.progress;
        for modification in mods {
            TaskDelta::new().with(modification).apply(&mut record).unwrap();
            prop_assert!(record.progress >= last);
            last = record.progress;
        }
    }

    /// Closed is terminal.
    #[test]
    fn closed_rejects_everything(to in arb_status()) {
        prop_assert!(!ExecutionStatus::Closed.can_transition_to(&to));
    }

    /// Validation agrees with the transition table for every pair.
    #[test]
    fn validation_matches_table(from in arb_status(), to in arb_status()) {
        let validated = from.validate_transition("t", &to);
        prop_assert_eq!(validated.is_ok(), from.can_transition_to(&to));
        if let Err(err) = validated {
            let is_invalid_transition = matches!(err, EngineError::InvalidTransition { .. });
            prop_assert!(is_invalid_transition);
        }
    }
}

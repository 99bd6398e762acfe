//! Subtask join.
//!
//! A waiting parent carries a persisted [`SubtaskWait`](crate::domain::SubtaskWait):
//! the number of children that must be closed, the children created since
//! the previous wait, and the extension changes to apply when enough of
//! them are. Children joined by an earlier wait never count again. The barrier is re-evaluated whenever a child
//! closes on any node, and by the scheduler's periodic waiting sweep.
//!
//! Release is a compare-and-set from WAITING to RUNNABLE that clears the
//! wait in the same write, so concurrent evaluators release a parent
//! exactly once.

use crate::domain::TaskDelta;
use crate::error::{EngineError, Result};
use crate::store::{TaskQuery, TaskStore};
use crate::types::task::ExecutionStatus;

const MAX_EVALUATION_ATTEMPTS: u32 = 5;

/// Releases `task_id` if it is waiting and enough children are closed.
///
/// Returns `true` if this call released the task.
pub async fn evaluate_wait(store: &dyn TaskStore, task_id: &str) -> Result<bool> {
    for _ in 0..MAX_EVALUATION_ATTEMPTS {
        let record = store.get(task_id).await?;
        if record.execution_status != ExecutionStatus::Waiting {
            return Ok(false);
        }
        let Some(wait) = record.wait.clone() else {
            return Ok(false);
        };

        let closed = store
            .query(
                &TaskQuery::new()
                    .children_of(task_id)
                    .with_status(ExecutionStatus::Closed),
            )
            .await?
            .iter()
            .filter(|child| wait.children.contains(&child.task_id))
            .count();
        if closed < wait.expected {
            tracing::trace!(
                task_id = task_id,
                closed,
                expected = wait.expected,
                "subtask wait not yet satisfied"
            );
            return Ok(false);
        }

        let delta = TaskDelta::new()
            .set_status(ExecutionStatus::Runnable)
            .apply_extension(wait.on_satisfied)
            .set_wait(None)
            .set_next_run_at(None);
        match store.update(task_id, &delta, record.version).await {
            Ok(_) => {
                tracing::info!(
                    task_id = task_id,
                    closed,
                    expected = wait.expected,
                    "subtask wait satisfied, task runnable again"
                );
                return Ok(true);
            },
            Err(EngineError::ConcurrentModification { .. }) => continue,
            Err(e) => return Err(e),
        }
    }

    tracing::warn!(
        task_id = task_id,
        "subtask wait evaluation kept conflicting, leaving it to the next sweep"
    );
    Ok(false)
}

/// Evaluates every waiting task. Returns how many were released.
pub async fn sweep_waiting(store: &dyn TaskStore) -> Result<usize> {
    let waiting = store
        .query(&TaskQuery::new().with_status(ExecutionStatus::Waiting))
        .await?;
    let mut released = 0;
    for task in waiting {
        match evaluate_wait(store, &task.task_id).await {
            Ok(true) => released += 1,
            Ok(false) => {},
            Err(e) => {
                tracing::warn!(
                    task_id = %task.task_id,
                    error = %e,
                    "waiting task evaluation failed"
                );
            },
        }
    }
    Ok(released)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExtensionDelta, SubtaskWait, TaskRecord};
    use crate::store::generic::GenericTaskStore;
    use crate::store::memory::InMemoryBackend;
    use crate::types::task::HandlerFrame;
    use chrono::Utc;
    use serde_json::json;

    async fn waiting_parent(
        store: &GenericTaskStore<InMemoryBackend>,
        expected: usize,
        children: usize,
    ) -> (String, Vec<String>) {
        let parent = store
            .create(TaskRecord::new(HandlerFrame::new("wfs")))
            .await
            .unwrap();
        store
            .compare_and_set_claim(&parent.task_id, "node-a", Utc::now())
            .await
            .unwrap()
            .unwrap();
        let child_ids = link_children(store, &parent.task_id, children).await;
        store
            .modify(
                &parent.task_id,
                &TaskDelta::new()
                    .set_status(ExecutionStatus::Waiting)
                    .set_wait(Some(SubtaskWait {
                        expected,
                        on_satisfied: ExtensionDelta::new().set("wfsFlag", json!(true)),
                        since: Utc::now(),
                        children: Vec::new(),
                    }))
                    .release_claim(),
            )
            .await
            .unwrap();
        (parent.task_id, child_ids)
    }

    async fn link_children(
        store: &GenericTaskStore<InMemoryBackend>,
        parent: &str,
        count: usize,
    ) -> Vec<String> {
        let mut ids = Vec::new();
        for _ in 0..count {
            let child = store
                .create(TaskRecord::new(HandlerFrame::new("child")).with_parent(parent))
                .await
                .unwrap();
            store
                .modify(parent, &TaskDelta::new().add_child(&child.task_id))
                .await
                .unwrap();
            ids.push(child.task_id);
        }
        ids
    }

    async fn close(store: &GenericTaskStore<InMemoryBackend>, child: &str) {
        store
            .modify(child, &TaskDelta::new().pop_frame())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn releases_only_when_enough_children_closed() {
        let store = GenericTaskStore::new(InMemoryBackend::new());
        let (parent, children) = waiting_parent(&store, 2, 2).await;

        close(&store, &children[0]).await;
        assert!(!evaluate_wait(&store, &parent).await.unwrap());

        close(&store, &children[1]).await;
        assert!(evaluate_wait(&store, &parent).await.unwrap());

        let record = store.get(&parent).await.unwrap();
        assert_eq!(record.execution_status, ExecutionStatus::Runnable);
        assert_eq!(record.extension.get("wfsFlag"), Some(&json!(true)));
        assert!(record.wait.is_none());

        assert!(!evaluate_wait(&store, &parent).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_counts_released_tasks() {
        let store = GenericTaskStore::new(InMemoryBackend::new());
        let (_, children) = waiting_parent(&store, 1, 1).await;
        assert_eq!(sweep_waiting(&store).await.unwrap(), 0);
        close(&store, &children[0]).await;
        assert_eq!(sweep_waiting(&store).await.unwrap(), 1);
        assert_eq!(sweep_waiting(&store).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn children_outside_the_wait_do_not_count() {
        let store = GenericTaskStore::new(InMemoryBackend::new());
        let (parent, _) = waiting_parent(&store, 1, 1).await;
        let stray = store
            .create(TaskRecord::new(HandlerFrame::new("child")).with_parent(&parent))
            .await
            .unwrap();
        close(&store, &stray.task_id).await;

        assert!(!evaluate_wait(&store, &parent).await.unwrap());
        assert_eq!(
            store.get(&parent).await.unwrap().execution_status,
            ExecutionStatus::Waiting
        );
    }
}

//! The in-memory projection of a claimed task.
//!
//! A [`RunningTask`] exists on the node that holds the claim, for as long as
//! the execution loop drives the task. Handlers receive it on every
//! invocation and use it to read extension data, chain handler frames,
//! spawn subtasks and report live progress. The stalled task watcher and
//! the cluster surface see it through the loop's running-task table.
//!
//! Every write goes through an ownership-checked compare-and-set: if
//! another node reclaimed the task in the meantime, the write fails with
//! [`EngineError::ClaimLost`] instead of clobbering the new owner's state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::domain::{ExtensionDelta, SubtaskWait, TaskDelta, TaskRecord};
use crate::error::{EngineError, Result};
use crate::handler::TaskHandler;
use crate::store::TaskStore;
use crate::types::task::{HandlerFrame, Schedule};

/// A task claimed by this node.
pub struct RunningTask {
    task_id: String,
    node_id: String,
    store: Arc<dyn TaskStore>,
    record: Mutex<TaskRecord>,
    interrupt: CancellationToken,
    live_progress: Mutex<Option<u64>>,
    stack_changed: AtomicBool,
    wait_request: Mutex<Option<SubtaskWait>>,
    handler: Mutex<Option<Arc<dyn TaskHandler>>>,
    invocation_started: Mutex<Option<DateTime<Utc>>>,
    max_persist_retries: u32,
}

impl std::fmt::Debug for RunningTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningTask")
            .field("task_id", &self.task_id)
            .field("node_id", &self.node_id)
            .field("interrupted", &self.is_interrupted())
            .finish_non_exhaustive()
    }
}

impl RunningTask {
    pub(crate) fn new(
        record: TaskRecord,
        store: Arc<dyn TaskStore>,
        node_id: impl Into<String>,
        interrupt: CancellationToken,
        max_persist_retries: u32,
    ) -> Self {
        Self {
            task_id: record.task_id.clone(),
            node_id: node_id.into(),
            store,
            record: Mutex::new(record),
            interrupt,
            live_progress: Mutex::new(None),
            stack_changed: AtomicBool::new(false),
            wait_request: Mutex::new(None),
            handler: Mutex::new(None),
            invocation_started: Mutex::new(None),
            max_persist_retries,
        }
    }

    /// Task identifier.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Node executing the task.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Latest persisted state as seen by this node.
    pub fn record(&self) -> TaskRecord {
        self.record.lock().clone()
    }

    /// Persisted progress, as of the start of the current invocation or
    /// the handler's last write.
    pub fn progress(&self) -> u64 {
        self.record.lock().progress
    }

    /// The frame currently executing.
    pub fn top_frame(&self) -> Option<HandlerFrame> {
        self.record.lock().top_frame().cloned()
    }

    // ---- Extension accessors ----

    /// Raw extension value.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.record.lock().extension.get(key).cloned()
    }

    /// Boolean extension value; `None` if absent or not a boolean.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get_value(key).and_then(|v| v.as_bool())
    }

    /// Integer extension value; `None` if absent or not an integer.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get_value(key).and_then(|v| v.as_i64())
    }

    /// String extension value; `None` if absent or not a string.
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get_value(key)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    /// Typed extension value; `None` if absent or not convertible.
    pub fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.record.lock().extension_value(key)
    }

    // ---- Interruption ----

    /// Returns `true` once a stop has been requested.
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    /// Completes when a stop is requested.
    pub async fn interrupted(&self) {
        self.interrupt.cancelled().await;
    }

    /// Requests a cooperative stop.
    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }

    // ---- Live progress ----

    /// Reports progress made inside the current invocation.
    pub fn report_live_progress(&self, progress: u64) {
        *self.live_progress.lock() = Some(progress);
    }

    /// Progress last reported inside the current invocation.
    pub fn live_progress(&self) -> Option<u64> {
        *self.live_progress.lock()
    }

    /// Asks the current handler for live progress.
    pub fn heartbeat(&self) -> Option<u64> {
        let handler = self.handler.lock().clone();
        handler.and_then(|h| h.heartbeat(self))
    }

    /// Monitoring category, as decided by the current handler.
    pub fn category(&self) -> String {
        let handler = self.handler.lock().clone();
        let record = self.record();
        match handler {
            Some(h) => h.category(&record),
            None => record.category,
        }
    }

    /// When the current handler invocation started.
    pub fn invocation_started_at(&self) -> Option<DateTime<Utc>> {
        *self.invocation_started.lock()
    }

    // ---- Handler stack ----

    /// Pushes `frame` on top of the stack and applies `delta`, atomically.
    ///
    /// The new frame runs once the current invocation returns; a FINISHED or
    /// RESTART_REQUESTED result then continues with it according to its
    /// binding.
    pub async fn push_handler(&self, frame: HandlerFrame, delta: ExtensionDelta) -> Result<()> {
        tracing::debug!(
            task_id = %self.task_id,
            handler_id = %frame.handler_id,
            binding = ?frame.binding,
            "pushing handler"
        );
        self.persist(&TaskDelta::new().push_frame(frame).apply_extension(delta))
            .await?;
        self.stack_changed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Pops the current frame and applies `delta`, atomically.
    ///
    /// Popping the last frame closes the task.
    pub async fn finish_handler(&self, delta: ExtensionDelta) -> Result<()> {
        tracing::debug!(task_id = %self.task_id, "finishing handler");
        self.persist(&TaskDelta::new().pop_frame().apply_extension(delta))
            .await?;
        self.stack_changed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Persists extension changes.
    pub async fn update_extension(&self, delta: ExtensionDelta) -> Result<()> {
        self.persist(&TaskDelta::new().apply_extension(delta))
            .await
            .map(|_| ())
    }

    // ---- Subtasks ----

    /// Creates a RUNNABLE child task linked to this one.
    ///
    /// The child inherits this task's category.
    pub async fn create_subtask(
        &self,
        handler_id: impl Into<String>,
        schedule: Schedule,
    ) -> Result<TaskRecord> {
        let parent = self.record();
        let child = TaskRecord::new(HandlerFrame::new(handler_id).with_schedule(schedule))
            .with_parent(&self.task_id)
            .with_category(parent.category);
        let child = self.store.create(child).await?;
        self.persist(&TaskDelta::new().add_child(&child.task_id))
            .await?;
        tracing::info!(
            task_id = %self.task_id,
            child_id = %child.task_id,
            "subtask created"
        );
        Ok(child)
    }

    /// Asks to wait until `expected` children are closed.
    ///
    /// Only children created since the previous wait count towards it.
    ///
    /// Once the current invocation returns, the task is persisted WAITING
    /// together with the wait, and yields its claim. When the barrier is
    /// satisfied `on_satisfied` is applied to the extension and the task
    /// becomes RUNNABLE again.
    pub fn wait_for_subtasks(&self, expected: usize, on_satisfied: ExtensionDelta) {
        *self.wait_request.lock() = Some(SubtaskWait {
            expected,
            on_satisfied,
            since: Utc::now(),
            children: Vec::new(),
        });
    }

    // ---- Loop plumbing ----

    pub(crate) fn begin_invocation(&self, handler: Arc<dyn TaskHandler>) {
        *self.handler.lock() = Some(handler);
        *self.live_progress.lock() = None;
        *self.wait_request.lock() = None;
        *self.invocation_started.lock() = Some(Utc::now());
        self.stack_changed.store(false, Ordering::SeqCst);
    }

    pub(crate) fn stack_changed(&self) -> bool {
        self.stack_changed.load(Ordering::SeqCst)
    }

    pub(crate) fn take_wait_request(&self) -> Option<SubtaskWait> {
        self.wait_request.lock().take()
    }

    /// Touches the claim so reclaim sweeps on other nodes leave it alone.
    pub(crate) async fn refresh_claim(&self) -> Result<()> {
        self.persist(&TaskDelta::new()).await.map(|_| ())
    }

    /// Ownership-checked write with bounded conflict retries.
    ///
    /// A task closed by this node (its last frame popped) no longer has an
    /// owner; follow-up writes to it are still accepted.
    pub(crate) async fn persist(&self, delta: &TaskDelta) -> Result<TaskRecord> {
        let mut attempt = 0;
        loop {
            let current = self.store.get(&self.task_id).await?;
            let closed_here = self.record.lock().execution_status.is_terminal();
            let owned = current.owner_node.as_deref() == Some(self.node_id.as_str());
            if !owned && !(closed_here && current.execution_status.is_terminal()) {
                tracing::warn!(
                    task_id = %self.task_id,
                    node_id = %self.node_id,
                    owner = ?current.owner_node,
                    "claim lost"
                );
                return Err(EngineError::ClaimLost {
                    task_id: self.task_id.clone(),
                    node_id: self.node_id.clone(),
                });
            }

            let full = TaskDelta::new()
                .refresh_claim(Utc::now())
                .extend(delta.clone());
            match self
                .store
                .update(&self.task_id, &full, current.version)
                .await
            {
                Ok(updated) => {
                    *self.record.lock() = updated.clone();
                    return Ok(updated);
                },
                Err(EngineError::ConcurrentModification { .. })
                    if attempt < self.max_persist_retries =>
                {
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::generic::GenericTaskStore;
    use crate::store::memory::InMemoryBackend;
    use crate::types::task::ExecutionStatus;
    use serde_json::json;

    async fn claimed(store: &Arc<dyn TaskStore>, node: &str) -> RunningTask {
        let created = store
            .create(
                TaskRecord::new(HandlerFrame::new("h1"))
                    .with_category("import")
                    .with_extension(&ExtensionDelta::new().set("count", json!(3))),
            )
            .await
            .unwrap();
        let record = store
            .compare_and_set_claim(&created.task_id, node, Utc::now())
            .await
            .unwrap()
            .unwrap();
        RunningTask::new(record, Arc::clone(store), node, CancellationToken::new(), 3)
    }

    fn store() -> Arc<dyn TaskStore> {
        Arc::new(GenericTaskStore::new(InMemoryBackend::new()))
    }

    #[tokio::test]
    async fn typed_accessors_read_extension() {
        let store = store();
        let task = claimed(&store, "node-a").await;
        assert_eq!(task.get_i64("count"), Some(3));
        assert_eq!(task.get_typed::<u8>("count"), Some(3));
        assert_eq!(task.get_bool("count"), None);
        assert_eq!(task.get_string("missing"), None);
    }

    #[tokio::test]
    async fn push_handler_is_persisted_with_extension() {
        let store = store();
        let task = claimed(&store, "node-a").await;
        task.push_handler(
            HandlerFrame::new("h2"),
            ExtensionDelta::new().set("l1Flag", json!(true)),
        )
        .await
        .unwrap();
        assert!(task.stack_changed());

        let stored = store.get(task.task_id()).await.unwrap();
        assert_eq!(stored.handler_ids(), vec!["h1".to_string(), "h2".to_string()]);
        assert_eq!(stored.extension.get("l1Flag"), Some(&json!(true)));
        assert_eq!(stored.execution_status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn finishing_last_handler_closes_and_allows_follow_up() {
        let store = store();
        let task = claimed(&store, "node-a").await;
        task.finish_handler(ExtensionDelta::new()).await.unwrap();
        assert_eq!(task.record().execution_status, ExecutionStatus::Closed);
        task.persist(&TaskDelta::new().mark_run_finished(Utc::now()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn writes_fail_after_reclaim() {
        let store = store();
        let task = claimed(&store, "node-a").await;
        let current = store.get(task.task_id()).await.unwrap();
        store
            .update(
                task.task_id(),
                &TaskDelta::new()
                    .set_status(ExecutionStatus::Runnable)
                    .release_claim(),
                current.version,
            )
            .await
            .unwrap();

        let err = task
            .update_extension(ExtensionDelta::new().set("x", json!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ClaimLost { .. }));
    }

    #[tokio::test]
    async fn subtasks_inherit_category_and_link_back() {
        let store = store();
        let task = claimed(&store, "node-a").await;
        let child = task.create_subtask("child", Schedule::single()).await.unwrap();
        assert_eq!(child.category, "import");
        assert_eq!(child.parent_id.as_deref(), Some(task.task_id()));
        assert_eq!(task.record().child_ids, vec![child.task_id]);
    }

    #[tokio::test]
    async fn interruption_is_observable() {
        let store = store();
        let task = claimed(&store, "node-a").await;
        assert!(!task.is_interrupted());
        task.interrupt();
        assert!(task.is_interrupted());
        task.interrupted().await;
    }
}

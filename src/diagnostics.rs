//! Diagnostic capture for stalled tasks.
//!
//! When the watcher notifies about a stalled task it asks a
//! [`DiagnosticRecorder`] to capture what the task was doing. Capture is
//! best effort: the watcher logs failures and carries on.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::domain::{DiagnosticEntry, TaskDelta};
use crate::error::Result;
use crate::execution::RunningTask;
use crate::store::TaskStore;

/// Captures a diagnostic snapshot of a running task.
#[async_trait]
pub trait DiagnosticRecorder: Send + Sync {
    /// Records a snapshot of `task` explaining `reason`.
    async fn record(&self, task: &RunningTask, reason: &str) -> Result<DiagnosticEntry>;
}

/// Appends snapshots to the task record.
///
/// The record keeps the most recent
/// [`MAX_DIAGNOSTICS`](crate::domain::MAX_DIAGNOSTICS) entries.
pub struct StoreDiagnosticRecorder {
    store: Arc<dyn TaskStore>,
    node_id: String,
}

impl StoreDiagnosticRecorder {
    /// Creates a recorder writing through `store`.
    pub fn new(store: Arc<dyn TaskStore>, node_id: impl Into<String>) -> Self {
        Self {
            store,
            node_id: node_id.into(),
        }
    }
}

impl std::fmt::Debug for StoreDiagnosticRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreDiagnosticRecorder")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

/// Builds the snapshot for `task`.
pub fn snapshot(task: &RunningTask, node_id: &str, reason: &str) -> DiagnosticEntry {
    let now = Utc::now();
    let record = task.record();
    DiagnosticEntry {
        recorded_at: now,
        node_id: node_id.to_string(),
        reason: reason.to_string(),
        handler_stack: record.handler_ids(),
        progress: record.progress,
        live_progress: task.heartbeat(),
        running_for_ms: task
            .invocation_started_at()
            .map_or(0, |start| (now - start).num_milliseconds()),
    }
}

#[async_trait]
impl DiagnosticRecorder for StoreDiagnosticRecorder {
    async fn record(&self, task: &RunningTask, reason: &str) -> Result<DiagnosticEntry> {
        let entry = snapshot(task, &self.node_id, reason);
        self.store
            .modify(task.task_id(), &TaskDelta::new().add_diagnostic(entry.clone()))
            .await?;
        tracing::debug!(task_id = %task.task_id(), "diagnostic snapshot recorded");
        Ok(entry)
    }
}

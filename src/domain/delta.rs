//! Task deltas.
//!
//! Every persisted change to a [`TaskRecord`] goes through a [`TaskDelta`]:
//! an ordered list of [`TaskModification`]s applied to a freshly read record
//! and written back with a version check. Applying a delta validates each
//! status change against the state machine before anything is written, and
//! enforces the record invariants:
//!
//! - progress never decreases,
//! - a record whose handler stack is empty is closed, with no owner,
//! - the diagnostic list stays bounded.

use chrono::{DateTime, Utc};

use super::extension::ExtensionDelta;
use super::record::{DiagnosticEntry, SubtaskWait, TaskRecord, MAX_DIAGNOSTICS};
use crate::error::Result;
use crate::types::result::OperationResult;
use crate::types::task::{ExecutionStatus, HandlerFrame};

/// One change to a task record.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskModification {
    /// Transition the execution status (validated).
    SetStatus(ExecutionStatus),
    /// Add to progress.
    AddProgress(u64),
    /// Raise progress to at least the given value.
    RaiseProgress(u64),
    /// Take ownership: sets owner, claim refresh and run start.
    Claim {
        /// Claiming node.
        node_id: String,
        /// Claim time, recorded as the run start.
        at: DateTime<Utc>,
    },
    /// Clear owner and claim refresh.
    ReleaseClaim,
    /// Prove the owner still holds the claim.
    RefreshClaim(DateTime<Utc>),
    /// Record the end of the current run.
    MarkRunFinished(DateTime<Utc>),
    /// Push a frame on top of the handler stack.
    PushFrame(HandlerFrame),
    /// Pop the top frame; no-op on an empty stack.
    PopFrame,
    /// Apply extension changes.
    ApplyExtension(ExtensionDelta),
    /// Set or clear the subtask wait.
    SetWait(Option<SubtaskWait>),
    /// Set or clear the earliest next run.
    SetNextRunAt(Option<DateTime<Utc>>),
    /// Set the consecutive temporary error count.
    SetRetryCount(u32),
    /// Record the task outcome.
    SetResult(OperationResult),
    /// Link a child task.
    AddChild(String),
    /// Append a diagnostic snapshot.
    AddDiagnostic(DiagnosticEntry),
}

/// Ordered set of modifications applied atomically to one task.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use taskweave::domain::{ExtensionDelta, TaskDelta, TaskRecord};
/// use taskweave::{ExecutionStatus, HandlerFrame};
///
/// let mut record = TaskRecord::new(HandlerFrame::new("urn:handler:l1"));
/// TaskDelta::new()
///     .push_frame(HandlerFrame::new("urn:handler:l2"))
///     .apply_extension(ExtensionDelta::new().set("l1Flag", json!(true)))
///     .add_progress(1)
///     .apply(&mut record)
///     .unwrap();
///
/// assert_eq!(record.handler_stack.len(), 2);
/// assert_eq!(record.progress, 1);
/// assert_eq!(record.execution_status, ExecutionStatus::Runnable);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskDelta {
    modifications: Vec<TaskModification>,
}

impl TaskDelta {
    /// Creates an empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a modification.
    pub fn with(mut self, modification: TaskModification) -> Self {
        self.modifications.push(modification);
        self
    }

    /// Appends all modifications of `other`.
    pub fn extend(mut self, other: TaskDelta) -> Self {
        self.modifications.extend(other.modifications);
        self
    }

    /// Status transition.
    pub fn set_status(self, status: ExecutionStatus) -> Self {
        self.with(TaskModification::SetStatus(status))
    }

    /// Progress increment.
    pub fn add_progress(self, delta: u64) -> Self {
        self.with(TaskModification::AddProgress(delta))
    }

    /// Progress floor.
    pub fn raise_progress(self, value: u64) -> Self {
        self.with(TaskModification::RaiseProgress(value))
    }

    /// Ownership claim.
    pub fn claim(self, node_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.with(TaskModification::Claim {
            node_id: node_id.into(),
            at,
        })
    }

    /// Ownership release.
    pub fn release_claim(self) -> Self {
        self.with(TaskModification::ReleaseClaim)
    }

    /// Claim keep-alive.
    pub fn refresh_claim(self, at: DateTime<Utc>) -> Self {
        self.with(TaskModification::RefreshClaim(at))
    }

    /// Run end timestamp.
    pub fn mark_run_finished(self, at: DateTime<Utc>) -> Self {
        self.with(TaskModification::MarkRunFinished(at))
    }

    /// Frame push.
    pub fn push_frame(self, frame: HandlerFrame) -> Self {
        self.with(TaskModification::PushFrame(frame))
    }

    /// Frame pop.
    pub fn pop_frame(self) -> Self {
        self.with(TaskModification::PopFrame)
    }

    /// Extension changes; empty deltas are skipped.
    pub fn apply_extension(self, delta: ExtensionDelta) -> Self {
        if delta.is_empty() {
            self
        } else {
            self.with(TaskModification::ApplyExtension(delta))
        }
    }

    /// Subtask wait.
    pub fn set_wait(self, wait: Option<SubtaskWait>) -> Self {
        self.with(TaskModification::SetWait(wait))
    }

    /// Next run time.
    pub fn set_next_run_at(self, at: Option<DateTime<Utc>>) -> Self {
        self.with(TaskModification::SetNextRunAt(at))
    }

    /// Retry counter.
    pub fn set_retry_count(self, count: u32) -> Self {
        self.with(TaskModification::SetRetryCount(count))
    }

    /// Outcome.
    pub fn set_result(self, result: OperationResult) -> Self {
        self.with(TaskModification::SetResult(result))
    }

    /// Child link.
    pub fn add_child(self, child_id: impl Into<String>) -> Self {
        self.with(TaskModification::AddChild(child_id.into()))
    }

    /// Diagnostic snapshot.
    pub fn add_diagnostic(self, entry: DiagnosticEntry) -> Self {
        self.with(TaskModification::AddDiagnostic(entry))
    }

    /// Returns `true` if the delta changes nothing.
    pub fn is_empty(&self) -> bool {
        self.modifications.is_empty()
    }

    /// The modifications in application order.
    pub fn modifications(&self) -> &[TaskModification] {
        &self.modifications
    }

    /// Returns `true` if the delta pushes or pops a frame.
    pub fn changes_stack(&self) -> bool {
        self.modifications.iter().any(|m| {
            matches!(
                m,
                TaskModification::PushFrame(_) | TaskModification::PopFrame
            )
        })
    }

    /// Applies the delta to `record` in place.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidTransition`](crate::EngineError::InvalidTransition)
    /// if a status change is not allowed. The record may be partially
    /// modified on error; callers discard it.
    pub fn apply(&self, record: &mut TaskRecord) -> Result<()> {
        for modification in &self.modifications {
            match modification {
                TaskModification::SetStatus(next) => {
                    record
                        .execution_status
                        .validate_transition(&record.task_id, next)?;
                    record.execution_status = *next;
                },
                TaskModification::AddProgress(delta) => {
                    record.progress = record.progress.saturating_add(*delta);
                },
                TaskModification::RaiseProgress(value) => {
                    record.progress = record.progress.max(*value);
                },
                TaskModification::Claim { node_id, at } => {
                    record.owner_node = Some(node_id.clone());
                    record.claim_refreshed_at = Some(*at);
                    record.last_run_start = Some(*at);
                },
                TaskModification::ReleaseClaim => {
                    record.owner_node = None;
                    record.claim_refreshed_at = None;
                },
                TaskModification::RefreshClaim(at) => {
                    if record.owner_node.is_some() {
                        record.claim_refreshed_at = Some(*at);
                    }
                },
                TaskModification::MarkRunFinished(at) => {
                    record.last_run_finish = Some(*at);
                },
                TaskModification::PushFrame(frame) => {
                    record.handler_stack.push(frame.clone());
                },
                TaskModification::PopFrame => {
                    record.handler_stack.pop();
                },
                TaskModification::ApplyExtension(delta) => {
                    delta.apply_to(&mut record.extension);
                },
                TaskModification::SetWait(None) => {
                    record.wait = None;
                },
                TaskModification::SetWait(Some(wait)) => {
                    let first = record.joined_children.min(record.child_ids.len());
                    let mut wait = wait.clone();
                    wait.children = record.child_ids[first..].to_vec();
                    record.joined_children = record.child_ids.len();
                    record.wait = Some(wait);
                },
                TaskModification::SetNextRunAt(at) => {
                    record.next_run_at = *at;
                },
                TaskModification::SetRetryCount(count) => {
                    record.retry_count = *count;
                },
                TaskModification::SetResult(result) => {
                    record.result = Some(result.clone());
                },
                TaskModification::AddChild(child_id) => {
                    if !record.child_ids.contains(child_id) {
                        record.child_ids.push(child_id.clone());
                    }
                },
                TaskModification::AddDiagnostic(entry) => {
                    record.diagnostics.push(entry.clone());
                    let overflow = record.diagnostics.len().saturating_sub(MAX_DIAGNOSTICS);
                    if overflow > 0 {
                        record.diagnostics.drain(..overflow);
                    }
                },
            }
        }

        if record.handler_stack.is_empty() && !record.execution_status.is_terminal() {
            record
                .execution_status
                .validate_transition(&record.task_id, &ExecutionStatus::Closed)?;
            record.execution_status = ExecutionStatus::Closed;
        }
        if record.execution_status.is_terminal() {
            record.owner_node = None;
            record.claim_refreshed_at = None;
            record.wait = None;
            record.next_run_at = None;
        }

        record.last_updated_at = Utc::now();
        Ok(())
    }
}

//! The execution loop.
//!
//! [`ExecutionLoop::execute`] drives one claimed task: resolve the top
//! frame's handler, invoke it once, interpret the [`TaskRunResult`], persist
//! the next state, and either go around again (tight chaining) or hand the
//! task back to the scheduler.
//!
//! # Run result interpretation
//!
//! | Result              | Stack changed by handler | Top frame                 | Next                                   |
//! |---------------------|--------------------------|---------------------------|----------------------------------------|
//! | `FINISHED`          | yes                      | new top, tight            | run it now                             |
//! | `FINISHED`          | yes                      | new top, loose            | RUNNABLE after its interval            |
//! | `FINISHED`          | no                       | recurring                 | RUNNABLE after the interval            |
//! | `FINISHED`          | no                       | single-run                | pop; parent resumes, empty = CLOSED    |
//! | `RESTART_REQUESTED` | either                   | tight, single-run         | run it now                             |
//! | `RESTART_REQUESTED` | either                   | loose or recurring        | RUNNABLE after its interval            |
//! | `TEMPORARY_ERROR`   | -                        | -                         | RUNNABLE after back-off, or escalate   |
//! | `PERMANENT_ERROR`   | -                        | -                         | CLOSED with a failure result           |
//! | `INTERRUPTED`       | -                        | -                         | RUNNABLE, claim released, no failure   |
//!
//! A wait requested through [`RunningTask::wait_for_subtasks`] takes
//! precedence over `FINISHED` and `RESTART_REQUESTED`: the task becomes
//! WAITING and yields.
//!
//! Handler errors become `TEMPORARY_ERROR` and handler panics become
//! `PERMANENT_ERROR`; neither escapes the loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::running::RunningTask;
use super::waiting;
use crate::config::ExecutionConfig;
use crate::domain::{TaskDelta, TaskRecord};
use crate::error::{EngineError, Result};
use crate::handler::{HandlerRegistry, TaskHandler};
use crate::store::TaskStore;
use crate::types::result::{OperationResult, OperationStatus, RunResultStatus, TaskRunResult};
use crate::types::task::{ExecutionStatus, HandlerFrame, TaskBinding};

/// How an execution ended, from this node's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The task is closed.
    Closed,
    /// The task is RUNNABLE again and will be claimed later.
    Requeued,
    /// A temporary error is being retried later.
    Retrying,
    /// The task is WAITING for subtasks.
    Waiting,
    /// The task was stopped and released.
    Interrupted,
    /// Another node reclaimed the task; this node stopped touching it.
    ClaimLost,
}

enum Step {
    Continue,
    Yield(ExecutionOutcome),
}

/// Drives claimed tasks and keeps the node's running-task table.
pub struct ExecutionLoop {
    node_id: String,
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    config: ExecutionConfig,
    running: DashMap<String, Arc<RunningTask>>,
    interrupt_all: CancellationToken,
}

impl std::fmt::Debug for ExecutionLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionLoop")
            .field("node_id", &self.node_id)
            .field("running", &self.running.len())
            .finish_non_exhaustive()
    }
}

impl ExecutionLoop {
    /// Creates a loop for `node_id`.
    pub fn new(
        node_id: impl Into<String>,
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            store,
            registry,
            config,
            running: DashMap::new(),
            interrupt_all: CancellationToken::new(),
        }
    }

    /// Node this loop runs on.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    // ---- Running-task table ----

    /// Tasks currently executing on this node.
    pub fn running_tasks(&self) -> Vec<Arc<RunningTask>> {
        self.running.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// A task executing on this node.
    pub fn running_task(&self, task_id: &str) -> Option<Arc<RunningTask>> {
        self.running.get(task_id).map(|e| Arc::clone(e.value()))
    }

    /// Number of tasks executing on this node.
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Returns `true` if `task_id` is executing on this node.
    pub fn is_executing(&self, task_id: &str) -> bool {
        self.running.contains_key(task_id)
    }

    /// Requests a cooperative stop of one local task.
    ///
    /// Returns `false` if the task is not executing here.
    pub fn interrupt(&self, task_id: &str) -> bool {
        match self.running_task(task_id) {
            Some(task) => {
                tracing::info!(task_id = task_id, node_id = %self.node_id, "interrupt requested");
                task.interrupt();
                true
            },
            None => false,
        }
    }

    /// Requests a cooperative stop of every local task.
    pub fn interrupt_all(&self) {
        tracing::info!(
            node_id = %self.node_id,
            running = self.running.len(),
            "interrupting all local tasks"
        );
        self.interrupt_all.cancel();
    }

    // ---- Execution ----

    /// Drives a task this node has just claimed until it yields.
    ///
    /// # Errors
    ///
    /// Store failures other than a lost claim. The task then stays RUNNING
    /// until its claim goes stale and a reclaim sweep releases it.
    pub async fn execute(&self, record: TaskRecord) -> Result<ExecutionOutcome> {
        if record.owner_node.as_deref() != Some(self.node_id.as_str()) {
            return Err(EngineError::ClaimLost {
                task_id: record.task_id,
                node_id: self.node_id.clone(),
            });
        }

        let task_id = record.task_id.clone();
        let task = Arc::new(RunningTask::new(
            record,
            Arc::clone(&self.store),
            self.node_id.clone(),
            self.interrupt_all.child_token(),
            self.config.max_persist_retries,
        ));
        self.running.insert(task_id.clone(), Arc::clone(&task));

        let outcome = match self.drive(&task).await {
            Err(EngineError::ClaimLost { .. }) => Ok(ExecutionOutcome::ClaimLost),
            other => other,
        };
        self.running.remove(&task_id);

        match &outcome {
            Ok(o) => tracing::debug!(task_id = %task_id, outcome = ?o, "execution yielded"),
            Err(e) => tracing::error!(task_id = %task_id, error = %e, "execution aborted"),
        }
        outcome
    }

    async fn drive(&self, task: &Arc<RunningTask>) -> Result<ExecutionOutcome> {
        loop {
            if task.is_interrupted() {
                return self.release_interrupted(task, 0).await;
            }

            let record = task.record();
            let Some(frame) = record.top_frame().cloned() else {
                return Ok(ExecutionOutcome::Closed);
            };

            let handler = match self.registry.resolve(&frame.handler_id) {
                Ok(handler) => handler,
                Err(e) => {
                    tracing::error!(
                        task_id = %record.task_id,
                        handler_id = %frame.handler_id,
                        "cannot resolve handler, closing task"
                    );
                    let result = OperationResult::fatal("execution.resolveHandler", e.to_string());
                    return self.close_failed(task, result).await;
                },
            };

            task.begin_invocation(Arc::clone(&handler));
            tracing::debug!(
                task_id = %record.task_id,
                handler_id = %frame.handler_id,
                progress = record.progress,
                "invoking handler"
            );
            let result = self.invoke(task, handler.as_ref()).await;
            Self::log_result(task, &frame, &result);

            match self.interpret(task, &frame, result).await? {
                Step::Continue => continue,
                Step::Yield(outcome) => return Ok(outcome),
            }
        }
    }

    /// Runs the handler once, refreshing the claim while it is in flight.
    async fn invoke(&self, task: &RunningTask, handler: &dyn TaskHandler) -> TaskRunResult {
        let run = AssertUnwindSafe(handler.run(task)).catch_unwind();
        tokio::pin!(run);

        let mut keep_alive = tokio::time::interval(self.config.claim_refresh_interval());
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keep_alive.tick().await;

        let outcome = loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                _ = keep_alive.tick() => {
                    if let Err(e) = task.refresh_claim().await {
                        tracing::warn!(
                            task_id = %task.task_id(),
                            error = %e,
                            "claim keep-alive failed"
                        );
                    }
                },
            }
        };

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => TaskRunResult::temporary_error(e.to_string()),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                TaskRunResult::permanent_error(format!("handler panicked: {message}"))
            },
        }
    }

    fn log_result(task: &RunningTask, frame: &HandlerFrame, result: &TaskRunResult) {
        let op = &result.operation;
        match op.status {
            OperationStatus::Success => tracing::debug!(
                task_id = %task.task_id(),
                handler_id = %frame.handler_id,
                status = %result.status,
                operation = %op.operation,
                "handler returned"
            ),
            OperationStatus::PartialError => tracing::info!(
                task_id = %task.task_id(),
                handler_id = %frame.handler_id,
                status = %result.status,
                operation = %op.operation,
                message = op.message.as_deref().unwrap_or_default(),
                "handler returned with partial error"
            ),
            OperationStatus::FatalError => tracing::warn!(
                task_id = %task.task_id(),
                handler_id = %frame.handler_id,
                status = %result.status,
                operation = %op.operation,
                message = op.message.as_deref().unwrap_or_default(),
                "handler returned with error"
            ),
        }
    }

    async fn interpret(
        &self,
        task: &Arc<RunningTask>,
        frame: &HandlerFrame,
        result: TaskRunResult,
    ) -> Result<Step> {
        let now = Utc::now();
        let record = task.record();
        let progress = match result.status {
            RunResultStatus::Finished | RunResultStatus::RestartRequested => {
                result.progress_delta.unwrap_or(1).max(1)
            },
            RunResultStatus::Interrupted => result.progress_delta.unwrap_or(0),
            RunResultStatus::TemporaryError | RunResultStatus::PermanentError => 0,
        };

        let wait = task.take_wait_request();
        if let Some(wait) = wait {
            if !result.is_error()
                && result.status != RunResultStatus::Interrupted
                && !record.execution_status.is_terminal()
            {
                tracing::info!(
                    task_id = %task.task_id(),
                    expected = wait.expected,
                    "waiting for subtasks"
                );
                let delta = TaskDelta::new()
                    .add_progress(progress)
                    .set_retry_count(0)
                    .set_status(ExecutionStatus::Waiting)
                    .set_wait(Some(wait))
                    .mark_run_finished(now)
                    .release_claim();
                task.persist(&delta).await?;
                if let Err(e) = waiting::evaluate_wait(self.store.as_ref(), task.task_id()).await
                {
                    tracing::warn!(
                        task_id = %task.task_id(),
                        error = %e,
                        "immediate wait evaluation failed"
                    );
                }
                return Ok(Step::Yield(ExecutionOutcome::Waiting));
            }
        }

        match result.status {
            RunResultStatus::Finished => {
                let base = TaskDelta::new().add_progress(progress).set_retry_count(0);
                if record.execution_status.is_terminal() {
                    self.close_succeeded(task, base).await
                } else if task.stack_changed() {
                    self.advance(task, base, now, true).await
                } else if frame.schedule.is_recurring() {
                    let at = now + frame.schedule.delay();
                    self.requeue(task, base, at, ExecutionOutcome::Requeued).await
                } else if record.handler_stack.len() <= 1 {
                    self.close_succeeded(task, base.pop_frame()).await
                } else {
                    self.advance(task, base.pop_frame(), now, true).await
                }
            },
            RunResultStatus::RestartRequested => {
                let base = TaskDelta::new().add_progress(progress).set_retry_count(0);
                if record.execution_status.is_terminal() {
                    self.close_succeeded(task, base).await
                } else {
                    self.advance(task, base, now, task.stack_changed()).await
                }
            },
            RunResultStatus::Interrupted => {
                self.release_interrupted(task, progress).await.map(Step::Yield)
            },
            RunResultStatus::TemporaryError => {
                let attempts = record.retry_count.saturating_add(1);
                if attempts > self.config.max_retries || record.execution_status.is_terminal() {
                    let message = format!(
                        "giving up after {} temporary errors: {}",
                        attempts,
                        result.operation.message.as_deref().unwrap_or("no message")
                    );
                    let op = OperationResult::fatal(result.operation.operation, message);
                    return self.close_failed(task, op).await.map(Step::Yield);
                }
                let delay = if frame.schedule.is_recurring() {
                    frame.schedule.delay()
                } else {
                    chrono::Duration::from_std(self.config.retry_delay())
                        .unwrap_or_else(|_| chrono::Duration::zero())
                };
                tracing::info!(
                    task_id = %task.task_id(),
                    attempt = attempts,
                    max_retries = self.config.max_retries,
                    "temporary error, retrying later"
                );
                self.requeue(
                    task,
                    TaskDelta::new().set_retry_count(attempts),
                    now + delay,
                    ExecutionOutcome::Retrying,
                )
                .await
            },
            RunResultStatus::PermanentError => {
                self.close_failed(task, result.operation).await.map(Step::Yield)
            },
        }
    }

    /// Persists `delta` and continues with whatever frame ends up on top.
    ///
    /// A tight frame that just became the top (pushed, or uncovered by a
    /// pop) runs now. Otherwise a recurring or loose top frame waits for
    /// its interval.
    async fn advance(
        &self,
        task: &Arc<RunningTask>,
        delta: TaskDelta,
        now: DateTime<Utc>,
        stack_changed: bool,
    ) -> Result<Step> {
        let mut preview = task.record();
        delta.apply(&mut preview)?;
        let Some(top) = preview.top_frame().cloned() else {
            return self.close_succeeded(task, delta).await;
        };

        let runs_now =
            top.binding == TaskBinding::Tight && (stack_changed || !top.schedule.is_recurring());
        if runs_now {
            task.persist(&delta).await?;
            Ok(Step::Continue)
        } else {
            self.requeue(task, delta, now + top.schedule.delay(), ExecutionOutcome::Requeued)
                .await
        }
    }

    async fn requeue(
        &self,
        task: &RunningTask,
        delta: TaskDelta,
        at: DateTime<Utc>,
        outcome: ExecutionOutcome,
    ) -> Result<Step> {
        let delta = delta
            .set_status(ExecutionStatus::Runnable)
            .set_next_run_at(Some(at))
            .mark_run_finished(Utc::now())
            .release_claim();
        task.persist(&delta).await?;
        Ok(Step::Yield(outcome))
    }

    async fn close_succeeded(&self, task: &RunningTask, delta: TaskDelta) -> Result<Step> {
        let delta = delta
            .mark_run_finished(Utc::now())
            .set_result(OperationResult::success("execution.run"));
        let closed = task.persist(&delta).await?;
        tracing::info!(task_id = %task.task_id(), progress = closed.progress, "task closed");
        self.notify_parent(&closed).await;
        Ok(Step::Yield(ExecutionOutcome::Closed))
    }

    async fn close_failed(
        &self,
        task: &RunningTask,
        result: OperationResult,
    ) -> Result<ExecutionOutcome> {
        let mut delta = TaskDelta::new()
            .mark_run_finished(Utc::now())
            .set_result(result.clone());
        if !task.record().execution_status.is_terminal() {
            delta = delta.set_status(ExecutionStatus::Closed);
        }
        let closed = task.persist(&delta).await?;
        tracing::warn!(
            task_id = %task.task_id(),
            operation = %result.operation,
            message = result.message.as_deref().unwrap_or_default(),
            "task closed with failure"
        );
        self.notify_parent(&closed).await;
        Ok(ExecutionOutcome::Closed)
    }

    async fn release_interrupted(
        &self,
        task: &RunningTask,
        progress: u64,
    ) -> Result<ExecutionOutcome> {
        let record = task.record();
        let now = Utc::now();
        let mut delta = TaskDelta::new().add_progress(progress);
        if record.execution_status == ExecutionStatus::Running {
            let next = record
                .top_frame()
                .filter(|f| f.schedule.is_recurring())
                .map(|f| now + f.schedule.delay());
            delta = delta
                .set_status(ExecutionStatus::Runnable)
                .set_next_run_at(next)
                .mark_run_finished(now)
                .release_claim();
        } else {
            delta = delta.mark_run_finished(now);
        }
        task.persist(&delta).await?;
        tracing::info!(task_id = %task.task_id(), "task interrupted and released");
        Ok(ExecutionOutcome::Interrupted)
    }

    async fn notify_parent(&self, closed: &TaskRecord) {
        let Some(parent_id) = closed.parent_id.as_deref() else {
            return;
        };
        match waiting::evaluate_wait(self.store.as_ref(), parent_id).await {
            Ok(true) => tracing::debug!(
                task_id = %closed.task_id,
                parent_id = parent_id,
                "parent released by subtask completion"
            ),
            Ok(false) => {},
            Err(e) => tracing::warn!(
                task_id = %closed.task_id,
                parent_id = parent_id,
                error = %e,
                "parent evaluation failed, waiting sweep will retry"
            ),
        }
    }
}

//! Stalled task watcher.
//!
//! Periodically compares the progress of every locally running task with
//! the last observation. A task whose `(run start, progress)` pair has not
//! changed for longer than the stall threshold is stalled. Notifications
//! for a stalled task are rate limited by a separate repeat interval, and
//! each one triggers a best-effort diagnostic capture.
//!
//! Progress comes from the handler's live [`heartbeat`](crate::handler::TaskHandler::heartbeat)
//! when it answers, and from the task store otherwise.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::config::WatcherConfig;
use crate::diagnostics::DiagnosticRecorder;
use crate::domain::TaskRecord;
use crate::execution::{ExecutionLoop, RunningTask};
use crate::store::TaskStore;

/// Last observation of one task's progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Observed progress.
    pub progress: u64,
    /// When that progress was first observed.
    pub measured_at: DateTime<Utc>,
    /// Run start the observation belongs to.
    pub run_started_at: Option<DateTime<Utc>>,
    /// Last stall notification; `None` if never notified.
    pub last_notified_at: Option<DateTime<Utc>>,
}

/// What one sweep saw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Tasks examined.
    pub checked: usize,
    /// Tasks skipped by category.
    pub skipped: usize,
    /// Tasks currently stalled.
    pub stalled: Vec<String>,
    /// Tasks a notification was emitted for in this sweep.
    pub notified: Vec<String>,
}

/// Flags running tasks that stopped making progress.
pub struct StalledTaskWatcher {
    config: WatcherConfig,
    executor: Arc<ExecutionLoop>,
    store: Arc<dyn TaskStore>,
    recorder: Arc<dyn DiagnosticRecorder>,
    snapshots: DashMap<String, ProgressSnapshot>,
}

impl std::fmt::Debug for StalledTaskWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StalledTaskWatcher")
            .field("config", &self.config)
            .field("snapshots", &self.snapshots.len())
            .finish_non_exhaustive()
    }
}

fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

impl StalledTaskWatcher {
    /// Creates a watcher over `executor`'s running-task table.
    pub fn new(
        config: WatcherConfig,
        executor: Arc<ExecutionLoop>,
        store: Arc<dyn TaskStore>,
        recorder: Arc<dyn DiagnosticRecorder>,
    ) -> Self {
        Self {
            config,
            executor,
            store,
            recorder,
            snapshots: DashMap::new(),
        }
    }

    /// Current snapshot for a task.
    pub fn snapshot(&self, task_id: &str) -> Option<ProgressSnapshot> {
        self.snapshots.get(task_id).map(|s| s.clone())
    }

    /// Number of tracked tasks.
    pub fn tracked(&self) -> usize {
        self.snapshots.len()
    }

    /// Sweeps at the current time.
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Sweeps as if the current time were `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let threshold = to_chrono(self.config.stall_threshold());
        let repeat = to_chrono(self.config.repeat_notification());
        let mut report = SweepReport::default();
        let mut seen = HashSet::new();

        for task in self.executor.running_tasks() {
            let task_id = task.task_id().to_string();
            seen.insert(task_id.clone());

            let category = task.category();
            if self.config.skips(&category) {
                report.skipped += 1;
                continue;
            }
            report.checked += 1;

            let Some(progress) = self.current_progress(&task).await else {
                continue;
            };
            let run_started_at = task.record().last_run_start;

            let previous = self.snapshot(&task_id);
            let snapshot = match previous {
                Some(s) if s.run_started_at == run_started_at && s.progress == progress => s,
                _ => {
                    tracing::trace!(
                        task_id = %task_id,
                        progress,
                        "progress changed, resetting stall clock"
                    );
                    self.snapshots.insert(
                        task_id,
                        ProgressSnapshot {
                            progress,
                            measured_at: now,
                            run_started_at,
                            last_notified_at: None,
                        },
                    );
                    continue;
                },
            };

            if now - snapshot.measured_at <= threshold {
                continue;
            }
            report.stalled.push(task_id.clone());

            let due = snapshot
                .last_notified_at
                .is_none_or(|at| now - at > repeat);
            if !due {
                continue;
            }

            tracing::error!(
                task_id = %task_id,
                category = %category,
                progress,
                run_started_at = ?run_started_at,
                stalled_since = %snapshot.measured_at,
                "task seems to be stalled"
            );
            if let Some(mut entry) = self.snapshots.get_mut(&task_id) {
                entry.last_notified_at = Some(now);
            }
            report.notified.push(task_id.clone());

            let reason = format!(
                "progress {progress} unchanged since {}",
                snapshot.measured_at.to_rfc3339()
            );
            if let Err(e) = self.recorder.record(&task, &reason).await {
                tracing::warn!(
                    task_id = %task_id,
                    error = %e,
                    "couldn't record diagnostic for stalled task"
                );
            }
        }

        self.snapshots.retain(|task_id, _| seen.contains(task_id));
        tracing::trace!(tracked = self.snapshots.len(), "stall sweep finished");
        report
    }

    async fn current_progress(&self, task: &RunningTask) -> Option<u64> {
        if let Some(progress) = task.heartbeat() {
            return Some(progress);
        }
        match self.store.get(task.task_id()).await {
            Ok(record) => Some(record.progress),
            Err(e) => {
                tracing::warn!(task_id = %task.task_id(), error = %e, "cannot read task progress");
                None
            },
        }
    }

    /// Since when `record` has been stalled, as observed by this node.
    ///
    /// `None` if the task is not running from an external observer's
    /// viewpoint, if its run or progress moved past the last observation,
    /// or if it is not stalled.
    pub fn stalled_since(&self, record: &TaskRecord, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !record.is_running_externally() {
            return None;
        }
        let snapshot = self.snapshot(&record.task_id)?;
        if snapshot.run_started_at != record.last_run_start || record.progress > snapshot.progress {
            return None;
        }
        let threshold = to_chrono(self.config.stall_threshold());
        (now - snapshot.measured_at > threshold).then_some(snapshot.measured_at)
    }

    /// Sweeps every configured interval until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.config.interval().max(std::time::Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if !report.stalled.is_empty() {
                        tracing::debug!(stalled = report.stalled.len(), "stalled tasks present");
                    }
                },
            }
        }
        tracing::debug!("stalled task watcher stopped");
    }
}

//! Local scheduler.
//!
//! Each [`tick`](LocalScheduler::tick) does the following in order:
//!
//! 1. Reaps finished executions.
//! 2. Re-evaluates WAITING tasks, when the waiting sweep is due.
//! 3. Releases orphaned claims, when the reclaim sweep is due.
//! 4. While the scheduler is started, claims as many claimable tasks as
//!    there are free worker permits and hands each one to the
//!    [`ExecutionLoop`] on its own tokio task.
//!
//! Stopping the scheduler stops step 4 only. In-flight executions keep
//! running until they yield.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{NodeConfig, SchedulerConfig};
use crate::domain::{NodeRecord, TaskDelta, TaskRecord};
use crate::error::{EngineError, Result};
use crate::execution::{self, ExecutionLoop};
use crate::store::{TaskQuery, TaskStore};
use crate::types::task::ExecutionStatus;

/// A task executing on this node, as reported by `GET /scheduler`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutingTask {
    /// Task identifier.
    pub task_id: String,
    /// Handler currently on top of the stack.
    pub handler_id: Option<String>,
    /// Live progress when the handler reports it, persisted progress otherwise.
    pub progress: u64,
    /// Start of the current handler invocation.
    pub started_at: Option<DateTime<Utc>>,
}

/// Scheduler status of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerInformation {
    /// Node identifier.
    pub node_id: String,
    /// Whether the scheduler is claiming new tasks.
    pub running: bool,
    /// Maximum concurrent executions.
    pub worker_limit: usize,
    /// Tasks executing right now.
    pub executing: Vec<ExecutingTask>,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Executions reaped since the previous tick.
    pub reaped: usize,
    /// WAITING tasks released.
    pub released_waiting: usize,
    /// Orphaned claims released.
    pub reclaimed: usize,
    /// Tasks claimed by this tick.
    pub claimed: Vec<String>,
}

/// Claims runnable tasks for this node and runs them concurrently.
pub struct LocalScheduler {
    node: NodeConfig,
    config: SchedulerConfig,
    store: Arc<dyn TaskStore>,
    executor: Arc<ExecutionLoop>,
    running: AtomicBool,
    permits: Arc<Semaphore>,
    in_flight: tokio::sync::Mutex<JoinSet<()>>,
    last_reclaim: Mutex<Option<DateTime<Utc>>>,
    last_waiting_sweep: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for LocalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalScheduler")
            .field("node_id", &self.node.id)
            .field("running", &self.is_running())
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

fn is_due(
    last: &Mutex<Option<DateTime<Utc>>>,
    now: DateTime<Utc>,
    every: chrono::Duration,
) -> bool {
    let mut last = last.lock();
    let due = last.is_none_or(|at| now - at >= every);
    if due {
        *last = Some(now);
    }
    due
}

impl LocalScheduler {
    /// Creates a stopped scheduler.
    pub fn new(
        node: NodeConfig,
        config: SchedulerConfig,
        store: Arc<dyn TaskStore>,
        executor: Arc<ExecutionLoop>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.worker_limit.max(1)));
        Self {
            node,
            config,
            store,
            executor,
            running: AtomicBool::new(false),
            permits,
            in_flight: tokio::sync::Mutex::new(JoinSet::new()),
            last_reclaim: Mutex::new(None),
            last_waiting_sweep: Mutex::new(None),
        }
    }

    /// Node this scheduler claims for.
    pub fn node_id(&self) -> &str {
        &self.node.id
    }

    // ---- Controls ----

    /// Starts claiming new tasks.
    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            tracing::info!(node_id = %self.node.id, "scheduler started");
        }
    }

    /// Stops claiming new tasks. In-flight executions are not touched.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!(
                node_id = %self.node.id,
                executing = self.executor.running_count(),
                "scheduler stopped"
            );
        }
    }

    /// Returns `true` while claiming new tasks.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot of the scheduler and its executing tasks.
    pub fn information(&self) -> SchedulerInformation {
        let mut executing: Vec<ExecutingTask> = self
            .executor
            .running_tasks()
            .iter()
            .map(|task| {
                let record = task.record();
                ExecutingTask {
                    task_id: record.task_id.clone(),
                    handler_id: record.top_frame().map(|f| f.handler_id.clone()),
                    progress: task.heartbeat().unwrap_or(record.progress),
                    started_at: task.invocation_started_at().or(record.last_run_start),
                }
            })
            .collect();
        executing.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        SchedulerInformation {
            node_id: self.node.id.clone(),
            running: self.is_running(),
            worker_limit: self.config.worker_limit.max(1),
            executing,
        }
    }

    // ---- Periodic work ----

    /// Runs one tick at the current time.
    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// Runs one tick as if the current time were `now`.
    ///
    /// # Errors
    ///
    /// Store failures while listing claimable tasks. Sweep failures are
    /// logged and do not fail the tick.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport {
            reaped: self.reap().await,
            ..TickReport::default()
        };

        let waiting_sweep = to_chrono(self.config.waiting_sweep_interval());
        if is_due(&self.last_waiting_sweep, now, waiting_sweep) {
            match execution::sweep_waiting(self.store.as_ref()).await {
                Ok(released) => report.released_waiting = released,
                Err(e) => {
                    tracing::warn!(node_id = %self.node.id, error = %e, "waiting sweep failed")
                },
            }
        }

        if is_due(&self.last_reclaim, now, to_chrono(self.config.reclaim_interval())) {
            match self.reclaim_orphans(now).await {
                Ok(reclaimed) => report.reclaimed = reclaimed,
                Err(e) => {
                    tracing::warn!(node_id = %self.node.id, error = %e, "reclaim sweep failed")
                },
            }
        }

        if !self.is_running() {
            return Ok(report);
        }
        let available = self.permits.available_permits();
        if available == 0 {
            tracing::trace!(node_id = %self.node.id, "all workers busy");
            return Ok(report);
        }

        let candidates = self
            .store
            .query(&TaskQuery::claimable_at(now).with_limit(available.saturating_mul(2)))
            .await?;
        for candidate in candidates {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                break;
            };
            let claimed = match self
                .store
                .compare_and_set_claim(&candidate.task_id, &self.node.id, now)
                .await
            {
                Ok(Some(record)) => record,
                Ok(None) => {
                    tracing::trace!(task_id = %candidate.task_id, "claim lost to another node");
                    continue;
                },
                Err(e) => {
                    tracing::warn!(task_id = %candidate.task_id, error = %e, "claim failed");
                    continue;
                },
            };

            tracing::debug!(
                task_id = %claimed.task_id,
                node_id = %self.node.id,
                handler_id = claimed.top_frame().map(|f| f.handler_id.as_str()).unwrap_or_default(),
                "task claimed"
            );
            report.claimed.push(claimed.task_id.clone());

            let executor = Arc::clone(&self.executor);
            self.in_flight.lock().await.spawn(async move {
                let _permit = permit;
                let task_id = claimed.task_id.clone();
                if let Err(e) = executor.execute(claimed).await {
                    tracing::error!(task_id = %task_id, error = %e, "execution failed");
                }
            });
        }

        Ok(report)
    }

    async fn reap(&self) -> usize {
        let mut in_flight = self.in_flight.lock().await;
        let mut reaped = 0;
        while let Some(joined) = in_flight.try_join_next() {
            reaped += 1;
            if let Err(e) = joined {
                tracing::error!(node_id = %self.node.id, error = %e, "execution task aborted");
            }
        }
        reaped
    }

    /// Waits for every in-flight execution to yield.
    pub async fn drain(&self) {
        let mut in_flight = self.in_flight.lock().await;
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::error!(node_id = %self.node.id, error = %e, "execution task aborted");
            }
        }
    }

    /// Writes this node's liveness record.
    pub async fn heartbeat(&self) -> Result<()> {
        let record = NodeRecord {
            node_id: self.node.id.clone(),
            url: self.node.url.clone(),
            scheduler_running: self.is_running(),
            running_tasks: self.executor.running_count(),
            last_check_in: Utc::now(),
        };
        self.store.record_node_heartbeat(&record).await
    }

    // ---- Crash recovery ----

    /// Releases RUNNING tasks whose owner is gone or whose claim is stale.
    ///
    /// A task owned by this node is only released when it is not executing
    /// here and its claim is stale; claims made a moment ago may not have
    /// reached the execution loop yet. An owner without a node record is
    /// treated the same way, since its first heartbeat may still be on the
    /// way.
    pub async fn reclaim_orphans(&self, now: DateTime<Utc>) -> Result<usize> {
        let nodes: HashMap<String, NodeRecord> = self
            .store
            .list_nodes()
            .await?
            .into_iter()
            .map(|n| (n.node_id.clone(), n))
            .collect();
        let dead_after = to_chrono(self.node.dead_after());
        let claim_timeout = to_chrono(self.config.claim_timeout());

        let running = self
            .store
            .query(&TaskQuery::new().with_status(ExecutionStatus::Running))
            .await?;
        let mut released = 0;
        for record in running {
            let stale = record.is_claim_stale(now, claim_timeout);
            let reason = match record.owner_node.as_deref() {
                None => "running without owner",
                Some(owner) if owner == self.node.id => {
                    if self.executor.is_executing(&record.task_id) || !stale {
                        continue;
                    }
                    "own claim stale"
                },
                Some(owner) => match nodes.get(owner) {
                    None if stale => "owner node unknown",
                    None => continue,
                    Some(node) if !node.is_alive(now, dead_after) => "owner node dead",
                    Some(_) if stale => "claim stale",
                    Some(_) => continue,
                },
            };
            if self.release(&record, now, reason).await? {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Releases RUNNING tasks this node owned before a restart.
    pub async fn recover_own_tasks(&self) -> Result<usize> {
        let now = Utc::now();
        let owned = self
            .store
            .query(
                &TaskQuery::new()
                    .with_status(ExecutionStatus::Running)
                    .owned_by(self.node.id.clone()),
            )
            .await?;
        let mut released = 0;
        for record in owned {
            if self.executor.is_executing(&record.task_id) {
                continue;
            }
            if self.release(&record, now, "recovered after restart").await? {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Compare-and-set RUNNING back to RUNNABLE. A concurrent update wins.
    async fn release(&self, record: &TaskRecord, now: DateTime<Utc>, reason: &str) -> Result<bool> {
        let delta = TaskDelta::new()
            .set_status(ExecutionStatus::Runnable)
            .release_claim()
            .mark_run_finished(now);
        match self.store.update(&record.task_id, &delta, record.version).await {
            Ok(_) => {
                tracing::warn!(
                    task_id = %record.task_id,
                    previous_owner = record.owner_node.as_deref().unwrap_or_default(),
                    node_id = %self.node.id,
                    reason,
                    "orphaned claim released"
                );
                Ok(true)
            },
            Err(EngineError::ConcurrentModification { .. } | EngineError::TaskNotFound { .. }) => {
                tracing::debug!(task_id = %record.task_id, "task changed during reclaim, skipping");
                Ok(false)
            },
            Err(e) => Err(e),
        }
    }

    /// Ticks and heartbeats until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut scan = tokio::time::interval(self.config.scan_interval());
        scan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval(self.node.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        tracing::warn!(
                            node_id = %self.node.id,
                            error = %e,
                            "node heartbeat failed"
                        );
                    }
                },
                _ = scan.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!(
                            node_id = %self.node.id,
                            error = %e,
                            "scheduler tick failed"
                        );
                    }
                },
            }
        }
        tracing::debug!(node_id = %self.node.id, "scheduler loop stopped");
    }
}

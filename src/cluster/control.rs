//! Cluster control operations, independent of the transport.
//!
//! Every operation takes a [`NodeCredential`]; holding one is the
//! authorization check.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::auth::{NodeAuthenticator, NodeCredential};
use super::events::{ClusterEvent, EventDispatcher};
use super::reports::ReportDirectory;
use crate::error::Result;
use crate::execution::ExecutionLoop;
use crate::scheduler::{LocalScheduler, SchedulerInformation};
use crate::store::TaskStore;
use crate::types::result::OperationResult;

/// Answer to `GET /scheduler`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    /// Outcome of the call.
    pub result: OperationResult,
    /// Scheduler state and executing tasks.
    pub information: SchedulerInformation,
}

/// What other nodes may ask this node to do.
pub struct ClusterControl {
    store: Arc<dyn TaskStore>,
    scheduler: Arc<LocalScheduler>,
    executor: Arc<ExecutionLoop>,
    events: Arc<dyn EventDispatcher>,
    reports: ReportDirectory,
    authenticator: NodeAuthenticator,
}

impl std::fmt::Debug for ClusterControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterControl")
            .field("node_id", &self.scheduler.node_id())
            .field("reports", &self.reports)
            .field("authenticator", &self.authenticator)
            .finish_non_exhaustive()
    }
}

impl ClusterControl {
    /// Creates the control surface of one node.
    pub fn new(
        store: Arc<dyn TaskStore>,
        scheduler: Arc<LocalScheduler>,
        executor: Arc<ExecutionLoop>,
        events: Arc<dyn EventDispatcher>,
        reports: ReportDirectory,
        authenticator: NodeAuthenticator,
    ) -> Self {
        Self {
            store,
            scheduler,
            executor,
            events,
            reports,
            authenticator,
        }
    }

    /// Node served by this surface.
    pub fn node_id(&self) -> &str {
        self.scheduler.node_id()
    }

    /// Verifies a raw `Authorization` header value.
    pub fn authenticate(&self, header: Option<&str>) -> Result<NodeCredential> {
        self.authenticator.authenticate(header).inspect_err(|e| {
            tracing::warn!(node_id = %self.node_id(), error = %e, "cluster call rejected");
        })
    }

    /// Scheduler status and executing tasks.
    pub fn scheduler_information(&self, caller: &NodeCredential) -> SchedulerStatus {
        tracing::debug!(caller = caller.node_id(), "scheduler information requested");
        SchedulerStatus {
            result: OperationResult::success("cluster.getSchedulerInformation"),
            information: self.scheduler.information(),
        }
    }

    /// Stops claiming new tasks on this node.
    pub fn stop_scheduler(&self, caller: &NodeCredential) -> OperationResult {
        tracing::info!(
            caller = caller.node_id(),
            node_id = %self.node_id(),
            "remote scheduler stop"
        );
        self.scheduler.stop();
        OperationResult::success("cluster.stopScheduler")
    }

    /// Resumes claiming new tasks on this node.
    pub fn start_scheduler(&self, caller: &NodeCredential) -> OperationResult {
        tracing::info!(
            caller = caller.node_id(),
            node_id = %self.node_id(),
            "remote scheduler start"
        );
        self.scheduler.start();
        OperationResult::success("cluster.startScheduler")
    }

    /// Interrupts a task executing on this node.
    ///
    /// A known task that is not executing here gets a partial result.
    ///
    /// # Errors
    ///
    /// [`TaskNotFound`](crate::EngineError::TaskNotFound) if the store has no such task.
    pub async fn stop_task(
        &self,
        caller: &NodeCredential,
        task_id: &str,
    ) -> Result<OperationResult> {
        tracing::info!(caller = caller.node_id(), task_id, "remote task stop");
        if self.executor.interrupt(task_id) {
            return Ok(OperationResult::success("cluster.stopLocalTask"));
        }
        self.store.get(task_id).await?;
        Ok(OperationResult::partial(
            "cluster.stopLocalTask",
            format!("task {task_id} is not running on {}", self.node_id()),
        ))
    }

    /// Hands an event to the dispatcher.
    pub async fn dispatch_event(
        &self,
        caller: &NodeCredential,
        event_type: &str,
        payload: Value,
    ) -> Result<OperationResult> {
        tracing::debug!(caller = caller.node_id(), event_type, "cluster event received");
        let event = ClusterEvent {
            event_type: event_type.to_string(),
            payload,
        };
        self.events.dispatch(&event).await
    }

    /// Reads a report file.
    pub async fn read_report(&self, caller: &NodeCredential, name: &str) -> Result<Vec<u8>> {
        tracing::debug!(caller = caller.node_id(), file = name, "report file requested");
        self.reports.read(name).await
    }

    /// Deletes a report file.
    pub async fn delete_report(
        &self,
        caller: &NodeCredential,
        name: &str,
    ) -> Result<OperationResult> {
        tracing::info!(
            caller = caller.node_id(),
            file = name,
            "report file deletion requested"
        );
        self.reports.delete(name).await?;
        Ok(OperationResult::success("cluster.deleteReportFile"))
    }
}

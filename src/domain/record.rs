//! Task record -- the persisted representation of a task.
//!
//! [`TaskRecord`] holds the handler stack, execution status, progress, run
//! timestamps, extension data, claim information, and the subtask tree.
//! [`NodeRecord`] is the per-node liveness entry written by each scheduler.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::extension::ExtensionDelta;
use crate::types::result::OperationResult;
use crate::types::task::{ExecutionStatus, HandlerFrame};

/// Category assigned when a task is created without one.
pub const DEFAULT_CATEGORY: &str = "default";

/// Maximum number of diagnostic entries kept on a task; oldest are dropped.
pub const MAX_DIAGNOSTICS: usize = 10;

/// Persisted wait-for-subtasks barrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskWait {
    /// Number of children that must be closed before the task resumes.
    pub expected: usize,
    /// Extension changes applied when the barrier is satisfied.
    #[serde(default)]
    pub on_satisfied: ExtensionDelta,
    /// When the wait started.
    pub since: DateTime<Utc>,
    /// Children the barrier counts: those linked since the previous wait.
    /// Filled in when the wait is applied to the record.
    #[serde(default)]
    pub children: Vec<String>,
}

/// Diagnostic snapshot captured while a task looked stalled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticEntry {
    /// When the snapshot was taken.
    pub recorded_at: DateTime<Utc>,
    /// Node that took the snapshot.
    pub node_id: String,
    /// Why the snapshot was taken.
    pub reason: String,
    /// Handler identifiers from bottom to top.
    pub handler_stack: Vec<String>,
    /// Persisted progress at capture time.
    pub progress: u64,
    /// Live progress reported by the handler, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_progress: Option<u64>,
    /// Milliseconds the current invocation has been running.
    pub running_for_ms: i64,
}

/// Persisted task.
///
/// The top of the handler stack is the **last** element of
/// [`handler_stack`](Self::handler_stack). A record with an empty stack is
/// always [`ExecutionStatus::Closed`]; the store enforces this whenever a
/// delta is applied.
///
/// # Construction
///
/// ```
/// use taskweave::domain::TaskRecord;
/// use taskweave::{ExecutionStatus, HandlerFrame};
///
/// let record = TaskRecord::new(HandlerFrame::new("urn:handler:l1"))
///     .with_name("nightly import")
///     .with_category("import");
/// assert_eq!(record.execution_status, ExecutionStatus::Runnable);
/// assert_eq!(record.top_frame().map(|f| f.handler_id.as_str()), Some("urn:handler:l1"));
/// assert_eq!(record.progress, 0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    /// Stable unique identifier (UUIDv4).
    pub task_id: String,

    /// Optional display name; never used for identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Resumable frames, bottom first.
    pub handler_stack: Vec<HandlerFrame>,

    /// Current execution status.
    pub execution_status: ExecutionStatus,

    /// Monotonically non-decreasing progress counter.
    pub progress: u64,

    /// Start of the most recent run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_start: Option<DateTime<Utc>>,

    /// End of the most recent run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_finish: Option<DateTime<Utc>>,

    /// Open key-value state carried between invocations.
    #[serde(default)]
    pub extension: Map<String, Value>,

    /// Node currently believed to be executing the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_node: Option<String>,

    /// Last time the owner proved it still holds the claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_refreshed_at: Option<DateTime<Utc>>,

    /// Parent task, for subtasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Direct children.
    #[serde(default)]
    pub child_ids: Vec<String>,

    /// Leading entries of `child_ids` already covered by an earlier wait.
    #[serde(default)]
    pub joined_children: usize,

    /// Classification used to select monitoring policy.
    pub category: String,

    /// Active wait-for-subtasks barrier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<SubtaskWait>,

    /// Earliest time the scheduler may claim the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,

    /// Consecutive temporary errors of the top frame.
    #[serde(default)]
    pub retry_count: u32,

    /// Outcome recorded when the task closed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<OperationResult>,

    /// Bounded list of diagnostic snapshots.
    #[serde(default)]
    pub diagnostics: Vec<DiagnosticEntry>,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    /// Last persisted modification.
    pub last_updated_at: DateTime<Utc>,

    /// Storage version; populated by the store, not serialized.
    #[serde(skip)]
    pub version: u64,
}

impl TaskRecord {
    /// Creates a runnable task whose stack holds `frame`.
    pub fn new(frame: HandlerFrame) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4().to_string(),
            name: None,
            handler_stack: vec![frame],
            execution_status: ExecutionStatus::Runnable,
            progress: 0,
            last_run_start: None,
            last_run_finish: None,
            extension: Map::new(),
            owner_node: None,
            claim_refreshed_at: None,
            parent_id: None,
            child_ids: Vec::new(),
            joined_children: 0,
            category: DEFAULT_CATEGORY.to_string(),
            wait: None,
            next_run_at: None,
            retry_count: 0,
            result: None,
            diagnostics: Vec::new(),
            created_at: now,
            last_updated_at: now,
            version: 0,
        }
    }

    /// Sets the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Links the task to a parent.
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Applies initial extension data.
    pub fn with_extension(mut self, delta: &ExtensionDelta) -> Self {
        delta.apply_to(&mut self.extension);
        self
    }

    /// Delays the first claim until `at`.
    pub fn with_next_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(at);
        self
    }

    /// The frame currently executing.
    pub fn top_frame(&self) -> Option<&HandlerFrame> {
        self.handler_stack.last()
    }

    /// Handler identifiers from bottom to top.
    pub fn handler_ids(&self) -> Vec<String> {
        self.handler_stack
            .iter()
            .map(|f| f.handler_id.clone())
            .collect()
    }

    /// Returns `true` if the scheduler may claim the task at `now`.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.execution_status == ExecutionStatus::Runnable
            && self.owner_node.is_none()
            && !self.handler_stack.is_empty()
            && self.next_run_at.is_none_or(|at| at <= now)
    }

    /// Returns `true` if an external observer should consider the task
    /// running: its run has started and has not finished since.
    pub fn is_running_externally(&self) -> bool {
        match (self.last_run_start, self.last_run_finish) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(start), Some(finish)) => finish < start,
        }
    }

    /// Returns `true` if the task is RUNNING but its claim has not been
    /// refreshed within `timeout`.
    pub fn is_claim_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if self.execution_status != ExecutionStatus::Running {
            return false;
        }
        match self.claim_refreshed_at.or(self.last_run_start) {
            Some(at) => now - at > timeout,
            None => true,
        }
    }

    /// Reads an extension value, deserializing into `T`.
    ///
    /// Returns `None` if the key is absent or cannot be converted.
    pub fn extension_value<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.extension
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Liveness entry for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    /// Node identifier.
    pub node_id: String,
    /// Base URL of the node's cluster control surface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Whether the node's scheduler is claiming tasks.
    pub scheduler_running: bool,
    /// Number of tasks executing on the node at check-in.
    pub running_tasks: usize,
    /// Last heartbeat.
    pub last_check_in: DateTime<Utc>,
}

impl NodeRecord {
    /// Returns `true` if the node checked in within `dead_after`.
    pub fn is_alive(&self, now: DateTime<Utc>, dead_after: Duration) -> bool {
        now - self.last_check_in <= dead_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_record_has_uuid_task_id() {
        let record = TaskRecord::new(HandlerFrame::new("h"));
        assert_eq!(record.task_id.len(), 36);
        assert!(Uuid::parse_str(&record.task_id).is_ok());
        assert_eq!(record.category, DEFAULT_CATEGORY);
    }

    #[test]
    fn claimable_respects_next_run_and_owner() {
        let now = Utc::now();
        let mut record = TaskRecord::new(HandlerFrame::new("h"));
        assert!(record.is_claimable_at(now));

        record.next_run_at = Some(now + Duration::seconds(5));
        assert!(!record.is_claimable_at(now));
        assert!(record.is_claimable_at(now + Duration::seconds(5)));

        record.next_run_at = None;
        record.owner_node = Some("node-a".to_string());
        assert!(!record.is_claimable_at(now));
    }

    #[test]
    fn running_externally_compares_timestamps() {
        let now = Utc::now();
        let mut record = TaskRecord::new(HandlerFrame::new("h"));
        assert!(!record.is_running_externally());

        record.last_run_start = Some(now);
        assert!(record.is_running_externally());

        record.last_run_finish = Some(now - Duration::seconds(1));
        assert!(record.is_running_externally());

        record.last_run_finish = Some(now);
        assert!(!record.is_running_externally());
    }

    #[test]
    fn claim_staleness_only_applies_to_running() {
        let now = Utc::now();
        let mut record = TaskRecord::new(HandlerFrame::new("h"));
        assert!(!record.is_claim_stale(now, Duration::seconds(1)));

        record.execution_status = ExecutionStatus::Running;
        record.claim_refreshed_at = Some(now - Duration::seconds(10));
        assert!(record.is_claim_stale(now, Duration::seconds(5)));
        assert!(!record.is_claim_stale(now, Duration::seconds(30)));
    }

    #[test]
    fn extension_value_typed() {
        let record = TaskRecord::new(HandlerFrame::new("h"))
            .with_extension(&ExtensionDelta::new().set("count", json!(3)));
        assert_eq!(record.extension_value::<u32>("count"), Some(3));
        assert_eq!(record.extension_value::<bool>("count"), None);
        assert_eq!(record.extension_value::<u32>("missing"), None);
    }

    #[test]
    fn version_is_not_serialized() {
        let mut record = TaskRecord::new(HandlerFrame::new("h"));
        record.version = 7;
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("version").is_none());
        let back: TaskRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back.version, 0);
        assert_eq!(back.task_id, record.task_id);
    }

    #[test]
    fn node_liveness() {
        let now = Utc::now();
        let node = NodeRecord {
            node_id: "n1".to_string(),
            url: None,
            scheduler_running: true,
            running_tasks: 0,
            last_check_in: now - Duration::seconds(20),
        };
        assert!(node.is_alive(now, Duration::seconds(30)));
        assert!(!node.is_alive(now, Duration::seconds(10)));
    }
}

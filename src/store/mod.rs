//! Task store trait, generic implementation, and supporting types.
//!
//! # Architecture
//!
//! 1. **[`TaskStore`]** -- object-safe interface used as `Arc<dyn TaskStore>`
//!    by the execution loop, scheduler, watcher and cluster surface.
//! 2. **[`GenericTaskStore<B>`](generic::GenericTaskStore)** -- all domain
//!    logic: delta validation, claim compare-and-set, conflict retries,
//!    query filtering, serialization.
//! 3. **[`StorageBackend`]** -- dumb versioned KV that backends implement.
//!
//! The store is the single source of truth shared by every node; no
//! component assumes shared memory across nodes.

pub mod backend;
pub mod generic;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use backend::{StorageBackend, StorageError, Versioned};

use crate::domain::{NodeRecord, TaskDelta, TaskRecord};
use crate::error::Result;
use crate::types::task::ExecutionStatus;

/// Store behaviour knobs.
///
/// # Examples
///
/// ```
/// use taskweave::store::StoreConfig;
///
/// let config = StoreConfig::default();
/// assert_eq!(config.max_conflict_retries, 5);
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How many times [`TaskStore::modify`] re-reads and re-applies a
    /// delta after a version conflict before surfacing it.
    pub max_conflict_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 5,
        }
    }
}

/// Predicate for [`TaskStore::query`].
///
/// All set fields must match. Results are ordered by creation time.
///
/// # Examples
///
/// ```
/// use chrono::Utc;
/// use taskweave::store::TaskQuery;
/// use taskweave::ExecutionStatus;
///
/// let query = TaskQuery::new()
///     .with_status(ExecutionStatus::Running)
///     .owned_by("node-a")
///     .with_limit(10);
/// assert_eq!(query.limit, Some(10));
///
/// let claimable = TaskQuery::claimable_at(Utc::now());
/// assert_eq!(claimable.status, Some(ExecutionStatus::Runnable));
/// ```
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    /// Required execution status.
    pub status: Option<ExecutionStatus>,
    /// Required owner node.
    pub owner_node: Option<String>,
    /// Required parent task.
    pub parent_id: Option<String>,
    /// Required category.
    pub category: Option<String>,
    /// Only tasks claimable at this instant.
    pub claimable_at: Option<DateTime<Utc>>,
    /// Maximum number of results.
    pub limit: Option<usize>,
}

impl TaskQuery {
    /// Matches every task.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runnable, unowned tasks whose next run time has passed.
    pub fn claimable_at(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(ExecutionStatus::Runnable),
            claimable_at: Some(now),
            ..Self::default()
        }
    }

    /// Filters on status.
    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filters on owner node.
    pub fn owned_by(mut self, node_id: impl Into<String>) -> Self {
        self.owner_node = Some(node_id.into());
        self
    }

    /// Filters on parent task.
    pub fn children_of(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Filters on category.
    pub fn in_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Caps the number of results.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns `true` if `record` satisfies every set field.
    pub fn matches(&self, record: &TaskRecord) -> bool {
        self.status.is_none_or(|s| record.execution_status == s)
            && self
                .owner_node
                .as_deref()
                .is_none_or(|n| record.owner_node.as_deref() == Some(n))
            && self
                .parent_id
                .as_deref()
                .is_none_or(|p| record.parent_id.as_deref() == Some(p))
            && self
                .category
                .as_deref()
                .is_none_or(|c| record.category == c)
            && self
                .claimable_at
                .is_none_or(|now| record.is_claimable_at(now))
    }
}

/// Object-safe interface to task persistence.
///
/// Every mutation is optimistic-concurrency checked. Conflicts surface as
/// [`EngineError::ConcurrentModification`](crate::EngineError::ConcurrentModification),
/// which is retryable.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persists a new task. Returns it with its storage version.
    async fn create(&self, record: TaskRecord) -> Result<TaskRecord>;

    /// Reads a task.
    async fn get(&self, task_id: &str) -> Result<TaskRecord>;

    /// Atomically claims a task for `node_id`.
    ///
    /// Succeeds only if the task is RUNNABLE, has no owner and is due at
    /// `now`; the task becomes RUNNING with the owner and run start set.
    /// Returns `None` if the task was not claimable or another claimer won.
    async fn compare_and_set_claim(
        &self,
        task_id: &str,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>>;

    /// Applies `delta` if the stored version is still `expected_version`.
    async fn update(
        &self,
        task_id: &str,
        delta: &TaskDelta,
        expected_version: u64,
    ) -> Result<TaskRecord>;

    /// Applies `delta` to the latest version, re-reading on conflicts up
    /// to the configured retry bound.
    async fn modify(&self, task_id: &str, delta: &TaskDelta) -> Result<TaskRecord>;

    /// Lists tasks matching `query`.
    async fn query(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>>;

    /// Deletes a task. Returns `false` if it did not exist.
    async fn delete(&self, task_id: &str) -> Result<bool>;

    /// Writes a node heartbeat.
    async fn record_node_heartbeat(&self, node: &NodeRecord) -> Result<()>;

    /// Reads a node heartbeat.
    async fn get_node(&self, node_id: &str) -> Result<NodeRecord>;

    /// Lists every known node.
    async fn list_nodes(&self) -> Result<Vec<NodeRecord>>;
}

//! Task store logic layered over any [`StorageBackend`].
//!
//! [`GenericTaskStore`] implements every domain operation on top of any
//! backend: delta validation against the state machine, the atomic claim,
//! bounded conflict retries, query filtering and JSON serialization at the
//! storage boundary.
//!
//! # CAS Semantics
//!
//! All mutations except `create` and node heartbeats go through
//! [`StorageBackend::put_if_version`]. A version mismatch surfaces as
//! [`EngineError::ConcurrentModification`].
//!
//! # Construction
//!
//! ```
//! use taskweave::store::generic::GenericTaskStore;
//! use taskweave::store::memory::InMemoryBackend;
//! use taskweave::store::StoreConfig;
//!
//! let store = GenericTaskStore::new(InMemoryBackend::new()).with_config(StoreConfig {
//!     max_conflict_retries: 10,
//! });
//! assert_eq!(store.config().max_conflict_retries, 10);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::domain::{NodeRecord, TaskDelta, TaskRecord};
use crate::error::{EngineError, Result};
use crate::store::backend::{
    node_key, task_key, StorageBackend, StorageError, NODE_PREFIX, TASK_PREFIX,
};
use crate::store::{StoreConfig, TaskQuery, TaskStore};
use crate::types::task::ExecutionStatus;

/// Task store over a versioned key-value backend.
///
/// # Type Parameters
///
/// * `B` - A [`StorageBackend`] implementation.
#[derive(Debug)]
pub struct GenericTaskStore<B: StorageBackend> {
    backend: B,
    config: StoreConfig,
}

impl<B: StorageBackend> GenericTaskStore<B> {
    /// Creates a store with default configuration.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            config: StoreConfig::default(),
        }
    }

    /// Sets the store configuration.
    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Returns the underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    // ---- JSON at the storage boundary ----

    fn serialize<T: Serialize>(value: &T, what: &str) -> Result<Vec<u8>> {
        serde_json::to_vec(value)
            .map_err(|e| EngineError::Store(format!("failed to serialize {what}: {e}")))
    }

    fn deserialize<T: DeserializeOwned>(data: &[u8], what: &str) -> Result<T> {
        serde_json::from_slice(data)
            .map_err(|e| EngineError::Store(format!("failed to deserialize {what}: {e}")))
    }

    fn map_storage_error(err: StorageError, task_id: &str) -> EngineError {
        match err {
            StorageError::NotFound { .. } => EngineError::TaskNotFound {
                task_id: task_id.to_string(),
            },
            StorageError::VersionConflict {
                expected, actual, ..
            } => EngineError::ConcurrentModification {
                task_id: task_id.to_string(),
                expected_version: expected,
                actual_version: actual,
            },
            StorageError::AlreadyExists { .. } => {
                EngineError::Store(format!("task {task_id} already exists"))
            },
            StorageError::Unavailable { message, .. } => EngineError::Store(message),
        }
    }

    async fn read(&self, task_id: &str) -> Result<TaskRecord> {
        let versioned = self
            .backend
            .get(&task_key(task_id))
            .await
            .map_err(|e| Self::map_storage_error(e, task_id))?;
        let mut record: TaskRecord = Self::deserialize(&versioned.bytes, "TaskRecord")?;
        record.version = versioned.version;
        Ok(record)
    }

    async fn write_if_version(&self, mut record: TaskRecord, expected: u64) -> Result<TaskRecord> {
        let bytes = Self::serialize(&record, "TaskRecord")?;
        let new_version = self
            .backend
            .put_if_version(&task_key(&record.task_id), &bytes, expected)
            .await
            .map_err(|e| Self::map_storage_error(e, &record.task_id))?;
        record.version = new_version;
        Ok(record)
    }

    // ---- Tasks ----

    /// Persists a new task.
    ///
    /// Rejects records that are not RUNNABLE or have an empty stack, and
    /// identifiers that already exist.
    pub async fn create(&self, mut record: TaskRecord) -> Result<TaskRecord> {
        if record.handler_stack.is_empty() {
            return Err(EngineError::Store(format!(
                "task {} has an empty handler stack",
                record.task_id
            )));
        }
        if record.execution_status != ExecutionStatus::Runnable {
            return Err(EngineError::InvalidTransition {
                task_id: record.task_id.clone(),
                from: record.execution_status,
                to: ExecutionStatus::Runnable,
            });
        }

        let bytes = Self::serialize(&record, "TaskRecord")?;
        record.version = self
            .backend
            .insert(&task_key(&record.task_id), &bytes)
            .await
            .map_err(|e| Self::map_storage_error(e, &record.task_id))?;

        tracing::debug!(
            task_id = %record.task_id,
            handler_id = record.top_frame().map(|f| f.handler_id.as_str()).unwrap_or_default(),
            category = %record.category,
            "task created"
        );
        Ok(record)
    }

    /// Reads a task.
    pub async fn get(&self, task_id: &str) -> Result<TaskRecord> {
        self.read(task_id).await
    }

    /// Atomically claims a task for `node_id`.
    ///
    /// A lost race (version conflict) is reported as `Ok(None)`, never as
    /// an error: the other claimer won.
    pub async fn compare_and_set_claim(
        &self,
        task_id: &str,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>> {
        let mut record = self.read(task_id).await?;
        if !record.is_claimable_at(now) {
            return Ok(None);
        }

        let expected = record.version;
        TaskDelta::new()
            .set_status(ExecutionStatus::Running)
            .claim(node_id, now)
            .set_next_run_at(None)
            .apply(&mut record)?;

        match self.write_if_version(record, expected).await {
            Ok(claimed) => {
                tracing::debug!(task_id = task_id, node_id = node_id, "task claimed");
                Ok(Some(claimed))
            },
            Err(EngineError::ConcurrentModification { .. }) => {
                tracing::debug!(task_id = task_id, node_id = node_id, "claim lost to another node");
                Ok(None)
            },
            Err(e) => Err(e),
        }
    }

    /// Applies `delta` if the stored version is `expected_version`.
    pub async fn update(
        &self,
        task_id: &str,
        delta: &TaskDelta,
        expected_version: u64,
    ) -> Result<TaskRecord> {
        let mut record = self.read(task_id).await?;
        if record.version != expected_version {
            return Err(EngineError::ConcurrentModification {
                task_id: task_id.to_string(),
                expected_version,
                actual_version: record.version,
            });
        }
        delta.apply(&mut record)?;
        self.write_if_version(record, expected_version).await
    }

    /// Applies `delta` to the latest version with bounded conflict retries.
    pub async fn modify(&self, task_id: &str, delta: &TaskDelta) -> Result<TaskRecord> {
        let mut attempt = 0;
        loop {
            let mut record = self.read(task_id).await?;
            let expected = record.version;
            delta.apply(&mut record)?;
            match self.write_if_version(record, expected).await {
                Err(EngineError::ConcurrentModification { .. })
                    if attempt < self.config.max_conflict_retries =>
                {
                    attempt += 1;
                    tracing::trace!(task_id = task_id, attempt, "retrying conflicting update");
                },
                other => return other,
            }
        }
    }

    /// Lists tasks matching `query`, oldest first.
    pub async fn query(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>> {
        let entries = self
            .backend
            .list_by_prefix(TASK_PREFIX)
            .await
            .map_err(|e| Self::map_storage_error(e, ""))?;

        let mut records = Vec::new();
        for (key, versioned) in entries {
            let mut record: TaskRecord = match Self::deserialize(&versioned.bytes, "TaskRecord") {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping unreadable task record");
                    continue;
                },
            };
            record.version = versioned.version;
            if query.matches(&record) {
                records.push(record);
            }
        }

        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    /// Deletes a task.
    pub async fn delete(&self, task_id: &str) -> Result<bool> {
        self.backend
            .delete(&task_key(task_id))
            .await
            .map_err(|e| Self::map_storage_error(e, task_id))
    }

    /// Writes a node heartbeat unconditionally.
    pub async fn record_node_heartbeat(&self, node: &NodeRecord) -> Result<()> {
        let bytes = Self::serialize(node, "NodeRecord")?;
        self.backend
            .put(&node_key(&node.node_id), &bytes)
            .await
            .map_err(|e| Self::map_storage_error(e, ""))?;
        Ok(())
    }

    /// Reads a node heartbeat.
    pub async fn get_node(&self, node_id: &str) -> Result<NodeRecord> {
        let versioned = self
            .backend
            .get(&node_key(node_id))
            .await
            .map_err(|e| match e {
                StorageError::NotFound { .. } => EngineError::NodeNotFound {
                    node_id: node_id.to_string(),
                },
                other => Self::map_storage_error(other, ""),
            })?;
        Self::deserialize(&versioned.bytes, "NodeRecord")
    }

    /// Lists every node heartbeat.
    pub async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        let entries = self
            .backend
            .list_by_prefix(NODE_PREFIX)
            .await
            .map_err(|e| Self::map_storage_error(e, ""))?;
        let mut nodes = entries
            .iter()
            .map(|(_, versioned)| Self::deserialize::<NodeRecord>(&versioned.bytes, "NodeRecord"))
            .collect::<Result<Vec<_>>>()?;
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }
}

#[async_trait]
impl<B: StorageBackend + 'static> TaskStore for GenericTaskStore<B> {
    async fn create(&self, record: TaskRecord) -> Result<TaskRecord> {
        GenericTaskStore::create(self, record).await
    }

    async fn get(&self, task_id: &str) -> Result<TaskRecord> {
        GenericTaskStore::get(self, task_id).await
    }

    async fn compare_and_set_claim(
        &self,
        task_id: &str,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>> {
        GenericTaskStore::compare_and_set_claim(self, task_id, node_id, now).await
    }

    async fn update(
        &self,
        task_id: &str,
        delta: &TaskDelta,
        expected_version: u64,
    ) -> Result<TaskRecord> {
        GenericTaskStore::update(self, task_id, delta, expected_version).await
    }

    async fn modify(&self, task_id: &str, delta: &TaskDelta) -> Result<TaskRecord> {
        GenericTaskStore::modify(self, task_id, delta).await
    }

    async fn query(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>> {
        GenericTaskStore::query(self, query).await
    }

    async fn delete(&self, task_id: &str) -> Result<bool> {
        GenericTaskStore::delete(self, task_id).await
    }

    async fn record_node_heartbeat(&self, node: &NodeRecord) -> Result<()> {
        GenericTaskStore::record_node_heartbeat(self, node).await
    }

    async fn get_node(&self, node_id: &str) -> Result<NodeRecord> {
        GenericTaskStore::get_node(self, node_id).await
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        GenericTaskStore::list_nodes(self).await
    }
}

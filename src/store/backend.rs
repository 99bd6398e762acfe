//! Versioned key-value contract underneath the task store.
//!
//! A backend knows nothing about tasks. It stores opaque JSON blobs under
//! string keys, stamps each write with a version, and offers one
//! conditional write ([`put_if_version`](StorageBackend::put_if_version))
//! that every claim and state change is built on. Everything else (delta
//! validation, claim rules, serde) lives in
//! [`GenericTaskStore`](super::generic::GenericTaskStore).
//!
//! Tasks live under `task:{id}`, node heartbeats under `node:{id}`. Task
//! ids are UUIDs, so a scan of `task:` never picks up a node.

use async_trait::async_trait;
use thiserror::Error;

/// Key prefix of task records.
pub const TASK_PREFIX: &str = "task:";

/// Key prefix of node heartbeats.
pub const NODE_PREFIX: &str = "node:";

/// Stored bytes and the version they were written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    /// JSON-encoded record.
    pub bytes: Vec<u8>,
    /// Starts at 1 and grows by one per write.
    pub version: u64,
}

/// Backend failure, translated into [`EngineError`](crate::EngineError)
/// by the store.
///
/// ```
/// use taskweave::store::backend::StorageError;
///
/// let err = StorageError::VersionConflict {
///     key: "task:t1".to_string(),
///     expected: 2,
///     actual: 3,
/// };
/// assert!(err.to_string().contains("expected 2"));
/// ```
#[derive(Debug, Error)]
pub enum StorageError {
    /// Nothing stored under the key.
    #[error("no record under {key}")]
    NotFound {
        /// Requested key.
        key: String,
    },

    /// [`insert`](StorageBackend::insert) hit an existing key.
    #[error("record under {key} already exists")]
    AlreadyExists {
        /// Conflicting key.
        key: String,
    },

    /// A conditional write lost against a newer version.
    #[error("stale write to {key}: expected version {expected}, stored {actual}")]
    VersionConflict {
        /// Written key.
        key: String,
        /// Version the writer read.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// The backend itself failed.
    #[error("storage unavailable: {message}")]
    Unavailable {
        /// What failed.
        message: String,
        /// Underlying cause.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Versioned key-value storage shared by every component of a node, and
/// by every node of a cluster.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Reads the current value under `key`.
    async fn get(&self, key: &str) -> Result<Versioned, StorageError>;

    /// Creates `key` at version 1.
    ///
    /// Fails with [`StorageError::AlreadyExists`] if the key is taken.
    async fn insert(&self, key: &str, bytes: &[u8]) -> Result<u64, StorageError>;

    /// Writes `key` whatever its current version; returns the new one.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<u64, StorageError>;

    /// Writes `key` only if it is still at `expected_version`.
    ///
    /// Fails with [`StorageError::NotFound`] for a missing key and
    /// [`StorageError::VersionConflict`] for a stale one.
    async fn put_if_version(
        &self,
        key: &str,
        bytes: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError>;

    /// Removes `key`. `false` if it was absent.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Every entry whose key starts with `prefix`, in no particular order.
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StorageError>;
}

/// Key of a task record.
///
/// ```
/// use taskweave::store::backend::task_key;
///
/// assert_eq!(task_key("abc"), "task:abc");
/// ```
pub fn task_key(task_id: &str) -> String {
    format!("{TASK_PREFIX}{task_id}")
}

/// Key of a node heartbeat.
pub fn node_key(node_id: &str) -> String {
    format!("{NODE_PREFIX}{node_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_keeps_its_cause() {
        let err = StorageError::Unavailable {
            message: "connection reset".to_string(),
            source: Some(Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "peer went away",
            ))),
        };
        assert_eq!(err.to_string(), "storage unavailable: connection reset");
        let cause = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(cause.as_deref(), Some("peer went away"));
    }

    #[test]
    fn node_keys_stay_out_of_task_scans() {
        assert_eq!(node_key("n1"), "node:n1");
        assert!(!node_key("n1").starts_with(TASK_PREFIX));
    }
}

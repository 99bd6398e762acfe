//! Process-local [`StorageBackend`] on a [`DashMap`].
//!
//! Engines that share one `Arc` of a store over this backend behave like
//! nodes sharing a database, which is how the integration tests and the
//! node binary's demo mode run a cluster inside one process.
//!
//! ```
//! use std::sync::Arc;
//! use taskweave::store::generic::GenericTaskStore;
//! use taskweave::store::memory::InMemoryBackend;
//! use taskweave::store::TaskStore;
//!
//! let store: Arc<dyn TaskStore> = Arc::new(GenericTaskStore::new(InMemoryBackend::new()));
//! ```

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::backend::{StorageBackend, StorageError, Versioned};

/// Keeps every record in memory. Per-key operations lock one shard only.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    slots: DashMap<String, Versioned>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored keys, tasks and nodes alike.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn not_found(key: &str) -> StorageError {
    StorageError::NotFound {
        key: key.to_string(),
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Versioned, StorageError> {
        self.slots
            .get(key)
            .map(|slot| slot.value().clone())
            .ok_or_else(|| not_found(key))
    }

    async fn insert(&self, key: &str, bytes: &[u8]) -> Result<u64, StorageError> {
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(_) => Err(StorageError::AlreadyExists {
                key: key.to_string(),
            }),
            Entry::Vacant(vacant) => {
                vacant.insert(Versioned {
                    bytes: bytes.to_vec(),
                    version: 1,
                });
                Ok(1)
            },
        }
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<u64, StorageError> {
        let mut slot = self.slots.entry(key.to_string()).or_insert(Versioned {
            bytes: Vec::new(),
            version: 0,
        });
        slot.version += 1;
        slot.bytes = bytes.to_vec();
        Ok(slot.version)
    }

    async fn put_if_version(
        &self,
        key: &str,
        bytes: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        let mut slot = self.slots.get_mut(key).ok_or_else(|| not_found(key))?;
        if slot.version != expected_version {
            return Err(StorageError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: slot.version,
            });
        }
        slot.version += 1;
        slot.bytes = bytes.to_vec();
        Ok(slot.version)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.slots.remove(key).is_some())
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StorageError> {
        Ok(self
            .slots
            .iter()
            .filter(|slot| slot.key().starts_with(prefix))
            .map(|slot| (slot.key().clone(), slot.value().clone()))
            .collect())
    }
}

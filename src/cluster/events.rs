//! Cluster events.
//!
//! Nodes broadcast cache invalidations to each other through
//! `POST /event/{type}`. The receiving node hands the event to an
//! [`EventDispatcher`].

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::types::result::OperationResult;

/// An event received from another node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEvent {
    /// Event type, taken from the URL.
    pub event_type: String,
    /// Optional JSON payload.
    #[serde(default)]
    pub payload: Value,
}

/// Handles cluster events.
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    /// Dispatches `event`.
    ///
    /// Returns [`EngineError::UnknownEventType`] for types nobody handles.
    async fn dispatch(&self, event: &ClusterEvent) -> Result<OperationResult>;
}

type Invalidator = Arc<dyn Fn(&Value) + Send + Sync>;

/// Named caches invalidated by event type.
#[derive(Default)]
pub struct CacheRegistry {
    caches: DashMap<String, Vec<Invalidator>>,
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}

impl CacheRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an invalidation callback for `event_type`.
    pub fn register<F>(&self, event_type: impl Into<String>, invalidate: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.caches
            .entry(event_type.into())
            .or_default()
            .push(Arc::new(invalidate));
    }

    /// Event types with at least one callback, sorted.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.caches.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }
}

#[async_trait]
impl EventDispatcher for CacheRegistry {
    async fn dispatch(&self, event: &ClusterEvent) -> Result<OperationResult> {
        let callbacks = self
            .caches
            .get(&event.event_type)
            .map(|c| c.clone())
            .ok_or_else(|| EngineError::UnknownEventType(event.event_type.clone()))?;
        for invalidate in &callbacks {
            invalidate(&event.payload);
        }
        tracing::debug!(
            event_type = %event.event_type,
            caches = callbacks.len(),
            "caches invalidated"
        );
        Ok(OperationResult::success("cluster.event"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn dispatch_invokes_every_callback() {
        let registry = CacheRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let hits = Arc::clone(&hits);
            registry.register("templates", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        let event = ClusterEvent {
            event_type: "templates".to_string(),
            payload: json!({"id": 7}),
        };
        assert!(!registry.dispatch(&event).await.unwrap().is_fatal());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_type_is_an_error() {
        let registry = CacheRegistry::new();
        let event = ClusterEvent {
            event_type: "nope".to_string(),
            payload: Value::Null,
        };
        let err = registry.dispatch(&event).await.unwrap_err();
        assert_eq!(err.status_code().as_u16(), 400);
    }
}

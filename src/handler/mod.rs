//! Task handlers and the handler registry.
//!
//! A [`TaskHandler`] performs one increment of a task's work per call to
//! [`run`](TaskHandler::run). Handlers are stateless across invocations:
//! anything they need to remember goes into the task's extension data or
//! the handler stack, both persisted through the
//! [`RunningTask`](crate::execution::RunningTask) they receive.
//!
//! The [`HandlerRegistry`] maps handler identifiers (URI-like strings) to
//! implementations. It is built once at process start and passed to the
//! engine; there is no global registry.

pub mod noop;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::TaskRecord;
use crate::error::{EngineError, Result};
use crate::execution::RunningTask;
use crate::types::result::TaskRunResult;

pub use noop::{NoOpHandler, NOOP_HANDLER_ID};

/// Work implementation for one kind of task.
///
/// Returning `Err` from [`run`](Self::run) is treated as a temporary error;
/// a panic is treated as a permanent error. Neither terminates the
/// execution loop.
///
/// Handlers that block for a long time inside one invocation should poll
/// [`RunningTask::is_interrupted`] and report intermediate progress with
/// [`RunningTask::report_live_progress`] so the stalled task watcher sees
/// them advance.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Runs one increment of work.
    async fn run(&self, task: &RunningTask) -> Result<TaskRunResult>;

    /// Live progress probe used by the stalled task watcher.
    ///
    /// The default returns whatever the handler last reported through
    /// [`RunningTask::report_live_progress`].
    fn heartbeat(&self, task: &RunningTask) -> Option<u64> {
        task.live_progress()
    }

    /// Category used to select the monitoring policy for `task`.
    fn category(&self, task: &TaskRecord) -> String {
        task.category.clone()
    }
}

/// Maps handler identifiers to implementations.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use taskweave::handler::{HandlerRegistry, NoOpHandler, NOOP_HANDLER_ID};
///
/// let registry = HandlerRegistry::new().with_handler(NOOP_HANDLER_ID, Arc::new(NoOpHandler::default()));
/// assert!(registry.resolve(NOOP_HANDLER_ID).is_ok());
/// assert!(registry.resolve("urn:handler:missing").is_err());
/// ```
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn TaskHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handler_ids())
            .finish()
    }
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, builder style.
    pub fn with_handler(
        self,
        handler_id: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        self.register(handler_id, handler);
        self
    }

    /// Registers or replaces a handler.
    pub fn register(&self, handler_id: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let handler_id = handler_id.into();
        tracing::debug!(handler_id = %handler_id, "handler registered");
        self.handlers.insert(handler_id, handler);
    }

    /// Resolves a handler.
    ///
    /// # Errors
    ///
    /// [`EngineError::HandlerNotFound`] if nothing is registered.
    pub fn resolve(&self, handler_id: &str) -> Result<Arc<dyn TaskHandler>> {
        self.handlers
            .get(handler_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::HandlerNotFound {
                handler_id: handler_id.to_string(),
            })
    }

    /// Registered identifiers, sorted.
    pub fn handler_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Finishing;

    #[async_trait]
    impl TaskHandler for Finishing {
        async fn run(&self, _task: &RunningTask) -> Result<TaskRunResult> {
            Ok(TaskRunResult::finished())
        }
    }

    #[test]
    fn register_replaces_existing() {
        let registry = HandlerRegistry::new();
        registry.register("h", Arc::new(Finishing));
        registry.register("h", Arc::new(NoOpHandler::default()));
        assert_eq!(registry.handler_ids(), vec!["h".to_string()]);
    }

    #[test]
    fn missing_handler_is_not_found() {
        let err = HandlerRegistry::new().resolve("x").err().unwrap();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "no handler registered for x");
    }
}

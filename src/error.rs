//! Error types for engine operations.
//!
//! Provides [`EngineError`], the crate-wide error enum with context fields,
//! a retryability classification used by the conflict-retry loops, and an
//! HTTP status mapping used by the cluster control surface.

use http::StatusCode;
use thiserror::Error;

use crate::types::task::ExecutionStatus;

/// Errors that can occur while storing, executing or controlling tasks.
///
/// Each variant carries contextual information (task ID, handler ID, etc.)
/// to aid debugging. Use [`is_retryable`](EngineError::is_retryable) to
/// decide whether a bounded local retry makes sense, and
/// [`status_code`](EngineError::status_code) to map to a wire response.
///
/// # Examples
///
/// ```
/// use taskweave::EngineError;
///
/// let err = EngineError::TaskNotFound {
///     task_id: "missing-task".to_string(),
/// };
/// assert!(!err.is_retryable());
/// assert_eq!(err.status_code().as_u16(), 404);
/// assert!(err.to_string().contains("missing-task"));
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    /// Task with the given ID was not found.
    #[error("task not found: {task_id}")]
    TaskNotFound {
        /// The task ID that was not found.
        task_id: String,
    },

    /// No handler is registered under the given identifier.
    #[error("no handler registered for {handler_id}")]
    HandlerNotFound {
        /// The handler identifier that failed to resolve.
        handler_id: String,
    },

    /// No node record exists for the given node.
    #[error("node not found: {node_id}")]
    NodeNotFound {
        /// The node ID that was not found.
        node_id: String,
    },

    /// An optimistic concurrency check failed.
    #[error(
        "concurrent modification of task {task_id}: \
         expected version {expected_version}, found {actual_version}"
    )]
    ConcurrentModification {
        /// The task being modified.
        task_id: String,
        /// The version the caller read.
        expected_version: u64,
        /// The version found in storage.
        actual_version: u64,
    },

    /// Attempted an invalid state machine transition.
    #[error("invalid transition from {from} to {to} for task {task_id}")]
    InvalidTransition {
        /// The task that was being transitioned.
        task_id: String,
        /// The current status of the task.
        from: ExecutionStatus,
        /// The target status that was rejected.
        to: ExecutionStatus,
    },

    /// This node no longer holds the claim on a task it was executing.
    #[error("claim on task {task_id} lost by node {node_id}")]
    ClaimLost {
        /// The task whose claim was lost.
        task_id: String,
        /// The node that believed it held the claim.
        node_id: String,
    },

    /// A cluster call arrived without a valid node credential.
    #[error("node authentication is expected but not present: {0}")]
    Unauthorized(String),

    /// A report file name was rejected before touching the filesystem.
    #[error("file name '{name}' is forbidden")]
    ForbiddenFile {
        /// The rejected file name.
        name: String,
    },

    /// A report file does not exist.
    #[error("report file '{name}' does not exist")]
    FileNotFound {
        /// The missing file name.
        name: String,
    },

    /// A cluster event named a type no dispatcher knows about.
    #[error("unknown cluster event type: {0}")]
    UnknownEventType(String),

    /// A cluster request could not be understood.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A remote node could not be reached or answered with an error.
    #[error("remote call to node {node_id} failed: {message}")]
    Remote {
        /// The node that was called.
        node_id: String,
        /// Human-readable failure description.
        message: String,
    },

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem error outside of report-file resolution.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Backend storage error.
    #[error("store error: {0}")]
    Store(String),
}

impl EngineError {
    /// Returns `true` for errors worth a bounded local retry.
    ///
    /// Only optimistic-concurrency conflicts and transient backend
    /// failures qualify; everything else is surfaced immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. } | Self::Store(_))
    }

    /// Returns `true` for the not-found family (task, handler, node, file).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::TaskNotFound { .. }
                | Self::HandlerNotFound { .. }
                | Self::NodeNotFound { .. }
                | Self::FileNotFound { .. }
        )
    }

    /// Maps this error to the HTTP status used on the cluster surface.
    ///
    /// ```
    /// use taskweave::EngineError;
    ///
    /// let err = EngineError::Unauthorized("missing header".to_string());
    /// assert_eq!(err.status_code().as_u16(), 403);
    ///
    /// let err = EngineError::Store("db timeout".to_string());
    /// assert_eq!(err.status_code().as_u16(), 500);
    /// ```
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::TaskNotFound { .. }
            | Self::HandlerNotFound { .. }
            | Self::NodeNotFound { .. }
            | Self::FileNotFound { .. } => StatusCode::NOT_FOUND,
            Self::ConcurrentModification { .. } | Self::ClaimLost { .. } => StatusCode::CONFLICT,
            Self::InvalidTransition { .. }
            | Self::UnknownEventType(_)
            | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) | Self::ForbiddenFile { .. } => StatusCode::FORBIDDEN,
            Self::Remote { .. } => StatusCode::BAD_GATEWAY,
            Self::Config(_) | Self::Io(_) | Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = EngineError::TaskNotFound {
            task_id: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "task not found: abc");

        let err = EngineError::ConcurrentModification {
            task_id: "t1".to_string(),
            expected_version: 2,
            actual_version: 3,
        };
        assert!(err.to_string().contains("expected version 2"));
        assert!(err.to_string().contains("found 3"));

        let err = EngineError::InvalidTransition {
            task_id: "t2".to_string(),
            from: ExecutionStatus::Closed,
            to: ExecutionStatus::Running,
        };
        assert_eq!(
            err.to_string(),
            "invalid transition from closed to running for task t2"
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(EngineError::ConcurrentModification {
            task_id: "t".to_string(),
            expected_version: 1,
            actual_version: 2,
        }
        .is_retryable());
        assert!(EngineError::Store("timeout".to_string()).is_retryable());
        assert!(!EngineError::Unauthorized("none".to_string()).is_retryable());
        assert!(!EngineError::HandlerNotFound {
            handler_id: "h".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn status_codes() {
        assert_eq!(
            EngineError::FileNotFound {
                name: "a.csv".to_string()
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            EngineError::ForbiddenFile {
                name: "../x".to_string()
            }
            .status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            EngineError::UnknownEventType("bogus".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            EngineError::ClaimLost {
                task_id: "t".to_string(),
                node_id: "n".to_string()
            }
            .status_code(),
            StatusCode::CONFLICT
        );
    }
}

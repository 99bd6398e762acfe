//! Handler run results and operation outcomes.
//!
//! [`TaskRunResult`] is what a handler returns from one invocation. It is
//! never persisted as-is; the execution loop derives the next task state
//! from it. [`OperationResult`] is the outcome record carried inside a run
//! result, stored on closed tasks, and returned by every cluster endpoint.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status reported by one handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunResultStatus {
    /// The current frame's work is done.
    Finished,
    /// Run the (possibly newly pushed) top frame again.
    RestartRequested,
    /// The handler noticed an interruption request and stopped early.
    Interrupted,
    /// A transient failure; retried according to the frame schedule.
    TemporaryError,
    /// An unrecoverable failure; the task is closed.
    PermanentError,
}

impl fmt::Display for RunResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finished => write!(f, "FINISHED"),
            Self::RestartRequested => write!(f, "RESTART_REQUESTED"),
            Self::Interrupted => write!(f, "INTERRUPTED"),
            Self::TemporaryError => write!(f, "TEMPORARY_ERROR"),
            Self::PermanentError => write!(f, "PERMANENT_ERROR"),
        }
    }
}

/// Coarse outcome of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Completed without problems.
    #[default]
    Success,
    /// Completed with some failures.
    PartialError,
    /// Failed.
    FatalError,
}

/// Named outcome of an operation with an optional message.
///
/// # Examples
///
/// ```
/// use taskweave::{OperationResult, OperationStatus};
///
/// let result = OperationResult::success("cluster.stopLocalScheduler");
/// assert_eq!(result.status, OperationStatus::Success);
///
/// let result = OperationResult::fatal("cluster.stopLocalTask", "task not found: t1");
/// assert!(result.is_fatal());
/// assert_eq!(result.message.as_deref(), Some("task not found: t1"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    /// Dotted operation name, e.g. `execution.run`.
    pub operation: String,
    /// Outcome classification.
    pub status: OperationStatus,
    /// Human-readable detail, usually present for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OperationResult {
    /// Successful outcome without a message.
    pub fn success(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            status: OperationStatus::Success,
            message: None,
        }
    }

    /// Partially failed outcome.
    pub fn partial(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            status: OperationStatus::PartialError,
            message: Some(message.into()),
        }
    }

    /// Failed outcome.
    pub fn fatal(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            status: OperationStatus::FatalError,
            message: Some(message.into()),
        }
    }

    /// Attaches a message, keeping the status.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Returns `true` if the status is [`OperationStatus::FatalError`].
    pub fn is_fatal(&self) -> bool {
        self.status == OperationStatus::FatalError
    }
}

/// Result of one handler invocation.
///
/// # Examples
///
/// ```
/// use taskweave::{RunResultStatus, TaskRunResult};
///
/// let result = TaskRunResult::finished().with_progress(5);
/// assert_eq!(result.status, RunResultStatus::Finished);
/// assert_eq!(result.progress_delta, Some(5));
///
/// let result = TaskRunResult::temporary_error("connection refused");
/// assert!(result.operation.is_fatal());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRunResult {
    /// What the loop should do next.
    pub status: RunResultStatus,
    /// Progress made by this invocation; the loop applies at least 1.
    pub progress_delta: Option<u64>,
    /// Outcome of the invocation, always logged by the loop.
    pub operation: OperationResult,
}

impl TaskRunResult {
    fn with_status(status: RunResultStatus, operation: OperationResult) -> Self {
        Self {
            status,
            progress_delta: None,
            operation,
        }
    }

    /// The current frame is done.
    pub fn finished() -> Self {
        Self::with_status(
            RunResultStatus::Finished,
            OperationResult::success("execution.run"),
        )
    }

    /// Run the top frame again.
    pub fn restart_requested() -> Self {
        Self::with_status(
            RunResultStatus::RestartRequested,
            OperationResult::success("execution.run"),
        )
    }

    /// The handler stopped because it was asked to.
    pub fn interrupted() -> Self {
        Self::with_status(
            RunResultStatus::Interrupted,
            OperationResult::partial("execution.run", "interrupted"),
        )
    }

    /// A retryable failure.
    pub fn temporary_error(message: impl Into<String>) -> Self {
        Self::with_status(
            RunResultStatus::TemporaryError,
            OperationResult::fatal("execution.run", message),
        )
    }

    /// A non-retryable failure.
    pub fn permanent_error(message: impl Into<String>) -> Self {
        Self::with_status(
            RunResultStatus::PermanentError,
            OperationResult::fatal("execution.run", message),
        )
    }

    /// Sets the progress reported for this invocation.
    pub fn with_progress(mut self, delta: u64) -> Self {
        self.progress_delta = Some(delta);
        self
    }

    /// Replaces the operation outcome.
    pub fn with_operation(mut self, operation: OperationResult) -> Self {
        self.operation = operation;
        self
    }

    /// Returns `true` for either error status.
    pub fn is_error(&self) -> bool {
        matches!(
            self.status,
            RunResultStatus::TemporaryError | RunResultStatus::PermanentError
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operation_result_wire_shape() {
        let result = OperationResult::fatal("cluster.getReportFile", "forbidden");
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({
                "operation": "cluster.getReportFile",
                "status": "fatal_error",
                "message": "forbidden"
            })
        );

        let result = OperationResult::success("cluster.startLocalScheduler");
        let value = serde_json::to_value(&result).unwrap();
        assert!(value.get("message").is_none());
    }

    #[test]
    fn run_result_status_display() {
        assert_eq!(RunResultStatus::RestartRequested.to_string(), "RESTART_REQUESTED");
        assert_eq!(RunResultStatus::PermanentError.to_string(), "PERMANENT_ERROR");
    }

    #[test]
    fn error_constructors() {
        assert!(TaskRunResult::temporary_error("x").is_error());
        assert!(TaskRunResult::permanent_error("x").is_error());
        assert!(!TaskRunResult::interrupted().is_error());
        assert!(!TaskRunResult::finished().is_error());
    }
}

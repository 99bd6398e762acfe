//! Execution status and its state machine.
//!
//! ```text
//! Runnable -> Running, Closed
//! Running  -> Runnable, Waiting, Closed
//! Waiting  -> Runnable, Closed
//! Closed   -> (terminal, no transitions)
//! ```
//!
//! Pushing or popping handler frames does not change the status; only the
//! transitions above are ever persisted.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::EngineError;

/// Persisted execution status of a task.
///
/// `Running` is written together with an owner node and a claim timestamp.
/// Observers on other nodes must pair it with a staleness check (see
/// [`TaskRecord::is_claim_stale`](crate::domain::TaskRecord::is_claim_stale))
/// before trusting it, since a node that crashed mid-run leaves it behind.
///
/// # Examples
///
/// ```
/// use taskweave::ExecutionStatus;
///
/// let status = ExecutionStatus::Runnable;
/// assert!(!status.is_terminal());
/// assert!(status.can_transition_to(&ExecutionStatus::Running));
/// assert!(!status.can_transition_to(&ExecutionStatus::Waiting));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Ready to be claimed by a scheduler.
    Runnable,
    /// Blocked on subtasks or an external event; re-evaluated later.
    Waiting,
    /// Claimed and executing on its owner node.
    Running,
    /// Finished (successfully or not). Terminal.
    Closed,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Runnable => write!(f, "runnable"),
            Self::Waiting => write!(f, "waiting"),
            Self::Running => write!(f, "running"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl ExecutionStatus {
    /// Returns `true` if this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Returns `true` if transitioning from this status to `next` is valid.
    ///
    /// Self-transitions are rejected.
    ///
    /// # Examples
    ///
    /// ```
    /// use taskweave::ExecutionStatus;
    ///
    /// assert!(ExecutionStatus::Running.can_transition_to(&ExecutionStatus::Waiting));
    /// assert!(ExecutionStatus::Waiting.can_transition_to(&ExecutionStatus::Runnable));
    /// assert!(!ExecutionStatus::Closed.can_transition_to(&ExecutionStatus::Runnable));
    /// assert!(!ExecutionStatus::Running.can_transition_to(&ExecutionStatus::Running));
    /// ```
    pub fn can_transition_to(&self, next: &Self) -> bool {
        if self == next {
            return false;
        }

        match self {
            Self::Runnable => matches!(next, Self::Running | Self::Closed),
            Self::Running => matches!(next, Self::Runnable | Self::Waiting | Self::Closed),
            Self::Waiting => matches!(next, Self::Runnable | Self::Closed),
            Self::Closed => false,
        }
    }

    /// Validates a transition from this status to `next`.
    ///
    /// Returns [`EngineError::InvalidTransition`] with the task ID on
    /// rejection.
    pub fn validate_transition(&self, task_id: &str, next: &Self) -> Result<(), EngineError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(EngineError::InvalidTransition {
                task_id: task_id.to_string(),
                from: *self,
                to: *next,
            })
        }
    }
}

/// How a pushed handler frame is executed relative to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskBinding {
    /// Continue in the same execution, without returning to the scheduler.
    #[default]
    Tight,
    /// Hand control back to the scheduler and run on its own schedule.
    Loose,
}

/// Recurrence of a handler frame.
///
/// A frame without an interval runs until it reports FINISHED once and is
/// then popped. A frame with an interval is re-run that many milliseconds
/// after each FINISHED run, until the handler pops it explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    /// Recurrence interval in milliseconds; `None` for a single run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
}

impl Schedule {
    /// A frame that runs until FINISHED once.
    pub fn single() -> Self {
        Self { interval_ms: None }
    }

    /// A frame re-run every `ms` milliseconds.
    pub fn recurring(ms: u64) -> Self {
        Self {
            interval_ms: Some(ms),
        }
    }

    /// Returns `true` if the frame recurs.
    pub fn is_recurring(&self) -> bool {
        self.interval_ms.is_some()
    }

    /// Delay before the next run, zero for single-run frames.
    pub fn delay(&self) -> chrono::Duration {
        self.interval_ms
            .and_then(|ms| i64::try_from(ms).ok())
            .and_then(chrono::Duration::try_milliseconds)
            .unwrap_or_else(chrono::Duration::zero)
    }
}

/// One resumable frame of a task's handler stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerFrame {
    /// Identifier resolved through the [`HandlerRegistry`](crate::handler::HandlerRegistry).
    pub handler_id: String,
    /// Recurrence of this frame.
    #[serde(default)]
    pub schedule: Schedule,
    /// Execution binding of this frame.
    #[serde(default)]
    pub binding: TaskBinding,
}

impl HandlerFrame {
    /// Creates a single-run, tightly bound frame.
    pub fn new(handler_id: impl Into<String>) -> Self {
        Self {
            handler_id: handler_id.into(),
            schedule: Schedule::single(),
            binding: TaskBinding::Tight,
        }
    }

    /// Sets the frame schedule.
    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Sets the frame binding.
    pub fn with_binding(mut self, binding: TaskBinding) -> Self {
        self.binding = binding;
        self
    }
}

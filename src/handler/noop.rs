//! Built-in handler that does nothing, slowly.
//!
//! Useful for smoke-testing a node: each invocation sleeps through a number
//! of steps, reports live progress after each one and finishes. It stops
//! early when the task is interrupted.

use std::time::Duration;

use async_trait::async_trait;

use super::TaskHandler;
use crate::error::Result;
use crate::execution::RunningTask;
use crate::types::result::TaskRunResult;

/// Identifier the node binary registers [`NoOpHandler`] under.
pub const NOOP_HANDLER_ID: &str = "taskweave:handler/noop";

/// Extension key overriding the step count per task.
pub const STEPS_KEY: &str = "steps";

/// Extension key overriding the per-step delay (milliseconds) per task.
pub const DELAY_KEY: &str = "delayMs";

/// Sleeps through `steps` steps of `delay` each.
#[derive(Debug, Clone)]
pub struct NoOpHandler {
    steps: u64,
    delay: Duration,
}

impl Default for NoOpHandler {
    fn default() -> Self {
        Self {
            steps: 10,
            delay: Duration::from_millis(100),
        }
    }
}

impl NoOpHandler {
    /// Creates a handler with the given defaults.
    pub fn new(steps: u64, delay: Duration) -> Self {
        Self { steps, delay }
    }
}

#[async_trait]
impl TaskHandler for NoOpHandler {
    async fn run(&self, task: &RunningTask) -> Result<TaskRunResult> {
        let steps = task
            .get_i64(STEPS_KEY)
            .and_then(|s| u64::try_from(s).ok())
            .unwrap_or(self.steps);
        let delay = task
            .get_i64(DELAY_KEY)
            .and_then(|ms| u64::try_from(ms).ok())
            .map_or(self.delay, Duration::from_millis);

        let base = task.progress();
        for step in 0..steps {
            if task.is_interrupted() {
                tracing::debug!(task_id = %task.task_id(), step, "noop handler interrupted");
                return Ok(TaskRunResult::interrupted().with_progress(step));
            }
            tokio::select! {
                () = tokio::time::sleep(delay) => {},
                () = task.interrupted() => {},
            }
            task.report_live_progress(base + step + 1);
        }

        Ok(TaskRunResult::finished().with_progress(steps.max(1)))
    }
}

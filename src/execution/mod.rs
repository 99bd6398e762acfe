//! Task execution: the loop, the running-task projection, and subtask join.

pub mod executor;
pub mod running;
pub mod waiting;

pub use executor::{ExecutionLoop, ExecutionOutcome};
pub use running::RunningTask;
pub use waiting::{evaluate_wait, sweep_waiting};

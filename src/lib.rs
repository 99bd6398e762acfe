//! Distributed long-running task execution.
//!
//! A task is a persisted unit of work driven by a stack of handler frames.
//! Each invocation of the top handler does one increment of work and
//! returns a [`TaskRunResult`] telling the engine what happens next: run
//! again, continue with another frame, back off, wait for subtasks, or
//! close. Because the stack is persisted with the task, a multi-phase task
//! survives process restarts and moves between cluster nodes.
//!
//! # Module Organization
//!
//! - [`types`] - Status enums, handler frames and run results
//! - [`domain`] - Persisted task/node records and the deltas that change them
//! - [`store`] - Task store trait, generic implementation, in-memory backend
//! - [`handler`] - Handler trait and registry
//! - [`execution`] - Execution loop, running tasks and subtask join
//! - [`scheduler`] - Claiming, worker limit and crash recovery
//! - [`watcher`] - Stalled task detection
//! - [`cluster`] - Node-to-node control surface
//! - [`engine`] - Facade wiring one node together
//!
//! # Feature Flags
//!
//! - `logging` (default): [`logging::init_logging`] via `tracing-subscriber`
//! - `cluster` (default): axum router and reqwest client for cluster calls

pub mod cluster;
pub mod config;
pub mod diagnostics;
pub mod domain;
pub mod engine;
pub mod error;
pub mod execution;
pub mod handler;
#[cfg(feature = "logging")]
pub mod logging;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod watcher;

pub use config::EngineConfig;
pub use domain::{ExtensionDelta, NodeRecord, TaskDelta, TaskRecord};
pub use engine::{TaskEngine, TaskEngineBuilder};
pub use error::{EngineError, Result};
pub use execution::{ExecutionLoop, ExecutionOutcome, RunningTask};
pub use handler::{HandlerRegistry, TaskHandler};
pub use scheduler::{LocalScheduler, SchedulerInformation};
pub use store::{TaskQuery, TaskStore};
pub use types::{
    ExecutionStatus, HandlerFrame, OperationResult, OperationStatus, RunResultStatus, Schedule,
    TaskBinding, TaskRunResult,
};
pub use watcher::StalledTaskWatcher;

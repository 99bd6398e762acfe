//! Persisted domain records and the deltas that modify them.
//!
//! - [`TaskRecord`] and [`NodeRecord`]: what the store keeps.
//! - [`TaskDelta`]: every write, validated against the state machine.
//! - [`ExtensionDelta`]: changes to a task's open key-value bag.

pub mod delta;
pub mod extension;
pub mod record;

pub use delta::{TaskDelta, TaskModification};
pub use extension::ExtensionDelta;
pub use record::{
    DiagnosticEntry, NodeRecord, SubtaskWait, TaskRecord, DEFAULT_CATEGORY, MAX_DIAGNOSTICS,
};

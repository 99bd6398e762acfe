//! Value types shared across the engine.
//!
//! Domain records that carry storage concerns (versions, claims, wait
//! state) live in [`domain`](crate::domain).

pub mod result;
pub mod task;

pub use result::*;
pub use task::*;

//! reelforge-common: shared errors, task identifiers, and the run event bus.
//!
//! This crate is the foundational dependency for the other reelforge
//! crates:
//!
//! - **Errors**: a unified [`Error`] enum and [`Result`] alias
//! - **Ids**: the opaque [`TaskId`] used by queue units and pipeline runs
//! - **Events**: the [`EventBus`](events::EventBus) reporting context

pub mod error;
pub mod events;
pub mod ids;

pub use error::{Error, Result};
pub use ids::{validate_task_id, TaskId};

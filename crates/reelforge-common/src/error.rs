//! Unified error type for reelforge.
//!
//! Every library crate funnels its failures into [`Error`]. Timeouts,
//! cancellations and task failures are separate variants so callers can
//! tell a slow unit of work apart from a broken one.

use std::fmt;
use std::time::Duration;

/// Unified error type covering all failure modes in reelforge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "task", "checkpoint").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// A caller-facing deadline passed before the awaited condition held.
    #[error("Timed out after {after:?}: {operation}")]
    Timeout {
        /// What the caller was waiting for.
        operation: String,
        /// The deadline that elapsed, measured from the call.
        after: Duration,
    },

    /// A unit of work was cancelled before it started.
    #[error("Task cancelled: {0}")]
    Cancelled(String),

    /// A unit of work ran and returned an error.
    #[error("Task {task_id} failed: {message}")]
    TaskFailed {
        /// The failed unit's id.
        task_id: String,
        /// The captured error description.
        message: String,
    },

    /// A checkpoint could not be written or relocated.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Input data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A pipeline stage failed.
    #[error("Stage error [{stage}]: {message}")]
    Stage {
        /// The stage that failed.
        stage: String,
        /// Human-readable error description.
        message: String,
    },

    /// Every per-scene unit of a stage failed.
    #[error("All scenes failed in {stage}: {}", failed.join(", "))]
    AllScenesFailed {
        /// The stage whose units all failed.
        stage: String,
        /// Ids of the failed scenes.
        failed: Vec<String>,
    },

    /// JSON (de)serialization failed.
    #[error("Serialization error: {source}")]
    Serialization {
        /// The underlying serde error.
        #[from]
        source: serde_json::Error,
    },

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Timeout`].
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Convenience constructor for [`Error::TaskFailed`].
    pub fn task_failed(task_id: impl fmt::Display, message: impl Into<String>) -> Self {
        Error::TaskFailed {
            task_id: task_id.to_string(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Stage`].
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Whether this error is a caller-facing timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Whether this error reports a cancelled unit of work.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

//! Opaque string identifiers.
//!
//! Queue units and pipeline runs are keyed by a [`TaskId`]. Callers may
//! supply their own id (for example to resume a run), so the inner value is
//! an arbitrary string rather than a UUID.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Reject ids that cannot be used as a file name component: empty ids and
/// ids containing path separators or `..`.
pub fn validate_task_id(task_id: &str) -> Result<()> {
    if task_id.is_empty()
        || task_id.contains('/')
        || task_id.contains('\\')
        || task_id.contains("..")
    {
        return Err(Error::Validation(format!("invalid task id: {task_id:?}")));
    }
    Ok(())
}

/// Identifier for a unit of work or a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Create a new random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check that the id is safe to embed in file and directory names.
    pub fn validate(&self) -> Result<()> {
        validate_task_id(&self.0)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

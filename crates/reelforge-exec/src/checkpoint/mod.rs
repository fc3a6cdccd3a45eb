//! Stage checkpoints for resumable runs.
//!
//! A checkpoint is a JSON snapshot of one stage's output, keyed by
//! `(task id, stage)`. The stage vocabulary is fixed and ordered
//! ([`CheckpointStage::ORDER`]); [`CheckpointStore::resume_stage`] uses that
//! order to say where an interrupted run should pick up.

mod store;

pub use store::CheckpointStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// One stage of the checkpoint vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStage {
    Parsing,
    ImageGeneration,
    VideoGeneration,
    Composition,
}

impl CheckpointStage {
    /// The vocabulary in execution order.
    pub const ORDER: [CheckpointStage; 4] = [
        CheckpointStage::Parsing,
        CheckpointStage::ImageGeneration,
        CheckpointStage::VideoGeneration,
        CheckpointStage::Composition,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStage::Parsing => "parsing",
            CheckpointStage::ImageGeneration => "image_generation",
            CheckpointStage::VideoGeneration => "video_generation",
            CheckpointStage::Composition => "composition",
        }
    }

    /// Position within [`ORDER`](Self::ORDER).
    pub fn index(&self) -> usize {
        Self::ORDER
            .iter()
            .position(|s| s == self)
            .unwrap_or_default()
    }

    /// The stage after this one, or `None` for the last stage.
    pub fn next(&self) -> Option<CheckpointStage> {
        Self::ORDER.get(self.index() + 1).copied()
    }
}

impl fmt::Display for CheckpointStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ORDER
            .iter()
            .find(|stage| stage.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown checkpoint stage: {s}"))
    }
}

/// Where a run should pick up, according to its checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "stage", rename_all = "snake_case")]
pub enum ResumePoint {
    /// No checkpoints exist; nothing to resume.
    Fresh,
    /// Resume by running this stage.
    Next(CheckpointStage),
    /// Every stage has been checkpointed.
    Completed,
    /// The latest checkpoint names a stage outside the vocabulary.
    Unknown(String),
}

impl fmt::Display for ResumePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumePoint::Fresh => f.write_str("nothing to resume"),
            ResumePoint::Next(stage) => f.write_str(stage.as_str()),
            ResumePoint::Completed => f.write_str("completed"),
            ResumePoint::Unknown(stage) => write!(f, "cannot determine (stage {stage})"),
        }
    }
}

/// A persisted stage snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub task_id: String,
    /// Stage name; normally one of the vocabulary, kept as text so foreign
    /// records can still be listed.
    pub stage: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Listing entry returned by [`CheckpointStore::list_stages`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointSummary {
    pub stage: String,
    pub timestamp: DateTime<Utc>,
    pub path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_order_and_next() {
        assert_eq!(
            CheckpointStage::Parsing.next(),
            Some(CheckpointStage::ImageGeneration)
        );
        assert_eq!(
            CheckpointStage::VideoGeneration.next(),
            Some(CheckpointStage::Composition)
        );
        assert_eq!(CheckpointStage::Composition.next(), None);
        assert_eq!(CheckpointStage::Composition.index(), 3);
    }

    #[test]
    fn parse_stage_names() {
        assert_eq!(
            "image_generation".parse::<CheckpointStage>(),
            Ok(CheckpointStage::ImageGeneration)
        );
        assert!("metadata".parse::<CheckpointStage>().is_err());
        for stage in CheckpointStage::ORDER {
            assert_eq!(stage.as_str().parse::<CheckpointStage>(), Ok(stage));
        }
    }

    #[test]
    fn resume_point_display() {
        assert_eq!(ResumePoint::Fresh.to_string(), "nothing to resume");
        assert_eq!(
            ResumePoint::Next(CheckpointStage::ImageGeneration).to_string(),
            "image_generation"
        );
        assert_eq!(ResumePoint::Completed.to_string(), "completed");
    }
}

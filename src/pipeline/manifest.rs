//! The per-run manifest written beside the final video.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use reelforge_common::{Result, TaskId};
use serde::{Deserialize, Serialize};

use super::stage::Variant;
use super::types::{ImageSource, ReferenceProvenance, ReferenceSet, SceneOutcome};
use crate::config::Config;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceStats {
    pub total: usize,
    pub supplied: usize,
    pub custom_base: usize,
    pub generated: usize,
}

impl ReferenceStats {
    pub fn from_set(set: &ReferenceSet) -> Self {
        Self {
            total: set.len(),
            supplied: set.count(ReferenceProvenance::Supplied),
            custom_base: set.count(ReferenceProvenance::CustomBase),
            generated: set.count(ReferenceProvenance::Generated),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneStats {
    pub succeeded: usize,
    pub failed: usize,
    /// Image stage only: how successful images were obtained.
    pub provided: usize,
    pub custom_base: usize,
    pub generated: usize,
}

impl SceneStats {
    pub fn from_outcomes(outcomes: &[SceneOutcome]) -> Self {
        let mut stats = SceneStats::default();
        for outcome in outcomes {
            if !outcome.success {
                stats.failed += 1;
                continue;
            }
            stats.succeeded += 1;
            match outcome.source {
                Some(ImageSource::Provided) => stats.provided += 1,
                Some(ImageSource::CustomBase) => stats.custom_base += 1,
                Some(ImageSource::Generated) => stats.generated += 1,
                None => {}
            }
        }
        stats
    }
}

/// Durable record of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub task_id: TaskId,
    pub variant: Variant,
    pub generated_at: DateTime<Utc>,
    pub title: String,
    pub scene_count: usize,
    pub character_count: usize,
    pub output_video: PathBuf,
    pub references: ReferenceStats,
    pub images: SceneStats,
    pub videos: SceneStats,
    /// Scenes missing from the final video.
    pub failed_scenes: Vec<String>,
    pub warnings: Vec<String>,
    /// Checkpoint stage the run resumed after, if any.
    pub resumed_after: Option<String>,
    pub config: Config,
    pub elapsed_secs: f64,
}

impl RunManifest {
    /// `<dir>/<stem>.json` for an output video at `<dir>/<stem>.<ext>`.
    pub fn path_for(output_video: &Path) -> PathBuf {
        output_video.with_extension("json")
    }

    /// Write the manifest as pretty JSON, returning where it went.
    pub async fn write(&self) -> Result<PathBuf> {
        let path = Self::path_for(&self.output_video);
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&path, json).await?;
        Ok(path)
    }
}

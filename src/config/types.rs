use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub checkpoints: CheckpointSettings,

    #[serde(default)]
    pub pipeline: PipelineSettings,

    #[serde(default)]
    pub video: VideoSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct QueueSettings {
    /// Number of concurrent per-scene workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Run higher-priority units first
    #[serde(default)]
    pub priority: bool,

    /// How often idle workers wake up to check for shutdown
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            priority: false,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl QueueSettings {
    pub fn to_queue_config(&self) -> reelforge_exec::QueueConfig {
        reelforge_exec::QueueConfig {
            workers: self.workers,
            priority: self.priority,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    100
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CheckpointSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,

    /// Age after which `checkpoints cleanup` deletes records
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,

    /// Move a run's checkpoints to the archive once it succeeds
    #[serde(default)]
    pub archive_on_success: bool,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_checkpoint_dir(),
            archive_dir: default_archive_dir(),
            retention_days: default_retention_days(),
            archive_on_success: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("./checkpoints")
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("./checkpoints/archive")
}

fn default_retention_days() -> u64 {
    7
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PipelineSettings {
    /// Where final videos and manifests are written
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Generate character reference images before scene images
    #[serde(default = "default_true")]
    pub character_references: bool,

    /// Deadline for a single scene unit's result; `None` waits indefinitely
    #[serde(default = "default_scene_timeout")]
    pub scene_timeout_secs: Option<u64>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            character_references: true,
            scene_timeout_secs: default_scene_timeout(),
        }
    }
}

impl PipelineSettings {
    pub fn scene_timeout(&self) -> Option<Duration> {
        self.scene_timeout_secs.map(Duration::from_secs)
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}

fn default_scene_timeout() -> Option<u64> {
    Some(600)
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VideoSettings {
    #[serde(default = "default_fps")]
    pub fps: u32,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    /// Scene length used when a scene does not specify its own
    #[serde(default = "default_scene_secs")]
    pub default_scene_secs: f64,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            width: default_width(),
            height: default_height(),
            default_scene_secs: default_scene_secs(),
        }
    }
}

fn default_fps() -> u32 {
    24
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_scene_secs() -> f64 {
    5.0
}

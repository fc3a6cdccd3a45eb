//! reelforge-exec: the execution substrate under the pipeline coordinator.
//!
//! - [`progress`]: progress tracking with observer fan-out and band rebasing
//! - [`checkpoint`]: per-stage JSON checkpoints and resume-point derivation
//! - [`queue`]: a bounded worker pool with optional priority ordering

pub mod checkpoint;
pub mod progress;
pub mod queue;

pub use checkpoint::{CheckpointRecord, CheckpointStage, CheckpointStore, ResumePoint};
pub use progress::{ProgressBand, ProgressObserver, ProgressSample, ProgressSender, ProgressTracker};
pub use queue::{ExecutionQueue, QueueConfig, QueueStats, TaskInfo, TaskStatus};

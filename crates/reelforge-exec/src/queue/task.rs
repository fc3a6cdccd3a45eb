use chrono::{DateTime, Utc};
use reelforge_common::TaskId;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a queued unit of work.
///
/// Transitions only go forward: `Pending -> Running | Cancelled` and
/// `Running -> Completed | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Snapshot of a unit's bookkeeping, without its body or result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub status: TaskStatus,
    /// Higher runs sooner when the queue orders by priority.
    pub priority: i32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskInfo {
    pub(crate) fn new(id: TaskId, priority: i32) -> Self {
        Self {
            id,
            status: TaskStatus::Pending,
            priority,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub(crate) fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn complete(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn fail(&mut self, error: String) {
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn cancel(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    /// Run time in seconds, once the unit has both started and finished.
    pub fn duration_secs(&self) -> Option<f64> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        Some((completed - started).num_microseconds()? as f64 / 1_000_000.0)
    }
}

/// Aggregate queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Units still waiting in line.
    pub queue_depth: usize,
    /// Mean run time of completed and failed units.
    pub mean_duration_secs: Option<f64>,
    /// Completed units as a percentage of finished (completed + failed) units.
    pub success_rate: f64,
}

impl QueueStats {
    pub(crate) fn from_tasks<'a>(tasks: impl Iterator<Item = &'a TaskInfo>, queue_depth: usize) -> Self {
        let mut stats = QueueStats {
            queue_depth,
            ..Default::default()
        };
        let mut durations = Vec::new();

        for task in tasks {
            stats.total += 1;
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
            if matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) {
                durations.extend(task.duration_secs());
            }
        }

        if !durations.is_empty() {
            stats.mean_duration_secs = Some(durations.iter().sum::<f64>() / durations.len() as f64);
        }
        let finished = stats.completed + stats.failed;
        if finished > 0 {
            stats.success_rate = stats.completed as f64 / finished as f64 * 100.0;
        }
        stats
    }
}

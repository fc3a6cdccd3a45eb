//! Bounded worker pool draining a (optionally priority-ordered) queue.
//!
//! [`ExecutionQueue`] accepts units of work via [`submit`](ExecutionQueue::submit)
//! and runs them on a fixed number of Tokio worker tasks once
//! [`start`](ExecutionQueue::start) is called. A unit's error (or panic) is
//! captured on the unit and only surfaces when a caller asks for that unit's
//! result; it never stops a worker or touches sibling units.
//!
//! Cancellation is cooperative: a unit can be cancelled only while it is
//! still waiting in line. Running units always finish.
//!
//! # Example
//!
//! ```rust,ignore
//! let queue = ExecutionQueue::new(QueueConfig { workers: 4, ..Default::default() });
//! queue.start();
//! let id = queue.submit(|| async { Ok::<_, String>(42) }, 0);
//! assert_eq!(queue.get_result(&id, Some(Duration::from_secs(5))).await?, 42);
//! queue.stop(true).await;
//! ```

mod task;

pub use task::{QueueStats, TaskInfo, TaskStatus};

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use reelforge_common::{Error, Result, TaskId};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of concurrent workers (at least one is always started).
    pub workers: usize,
    /// Dequeue higher-priority units first. Equal priorities have no
    /// guaranteed order.
    pub priority: bool,
    /// How often an idle worker wakes to check for shutdown.
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            priority: false,
            poll_interval: Duration::from_millis(100),
        }
    }
}

type TaskBody<T> = Box<dyn FnOnce() -> BoxFuture<'static, std::result::Result<T, String>> + Send>;

struct Entry<T> {
    info: TaskInfo,
    body: Option<TaskBody<T>>,
    result: Option<T>,
}

/// Position of a unit in the waiting line.
#[derive(Debug, PartialEq, Eq)]
struct Queued {
    priority: i32,
    seq: u64,
    id: TaskId,
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner<T> {
    tasks: HashMap<TaskId, Entry<T>>,
    line: BinaryHeap<Queued>,
    seq: u64,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    /// Signalled when a unit is enqueued.
    work_ready: Notify,
    /// Signalled whenever a unit reaches a terminal state.
    transitions: Notify,
}

struct WorkerPool {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// A bounded pool of workers executing submitted units of work.
pub struct ExecutionQueue<T> {
    config: QueueConfig,
    shared: Arc<Shared<T>>,
    pool: Mutex<Option<WorkerPool>>,
}

impl<T: Clone + Send + 'static> ExecutionQueue<T> {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    tasks: HashMap::new(),
                    line: BinaryHeap::new(),
                    seq: 0,
                }),
                work_ready: Notify::new(),
                transitions: Notify::new(),
            }),
            pool: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue a unit of work and return its id immediately.
    ///
    /// `priority` only affects ordering when the queue was configured with
    /// `priority: true`.
    pub fn submit<F, Fut, E>(&self, body: F, priority: i32) -> TaskId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Display,
    {
        let id = TaskId::new();
        let body: TaskBody<T> = Box::new(move || {
            let fut = body();
            async move { fut.await.map_err(|e| e.to_string()) }.boxed()
        });

        {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            inner.seq += 1;
            inner.tasks.insert(
                id.clone(),
                Entry {
                    info: TaskInfo::new(id.clone(), priority),
                    body: Some(body),
                    result: None,
                },
            );
            inner.line.push(Queued {
                priority: if self.config.priority { priority } else { 0 },
                seq: inner.seq,
                id: id.clone(),
            });
        }

        self.shared.work_ready.notify_one();
        debug!(task_id = %id, priority, "Task submitted");
        id
    }

    /// Launch the worker pool. Calling this on a running queue does nothing.
    pub fn start(&self) {
        let mut pool = self.pool.lock();
        if pool.is_some() {
            debug!("Execution queue already running");
            return;
        }

        let shutdown = CancellationToken::new();
        let workers = self.config.workers.max(1);
        let handles = (0..workers)
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    self.shared.clone(),
                    shutdown.clone(),
                    self.config.poll_interval,
                ))
            })
            .collect();

        *pool = Some(WorkerPool { shutdown, handles });
        info!(workers, priority = self.config.priority, "Execution queue started");
    }

    /// Stop the worker pool, first draining every queued unit when
    /// `graceful` is set. Units already running always finish; pending units
    /// left behind by a non-graceful stop run after the next [`start`](Self::start).
    pub async fn stop(&self, graceful: bool) {
        if graceful && self.is_running() {
            if let Err(e) = self.wait_all(None).await {
                warn!(error = %e, "Drain before stop did not finish");
            }
        }

        let Some(pool) = self.pool.lock().take() else {
            return;
        };
        pool.shutdown.cancel();
        for handle in pool.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Queue worker ended abnormally");
            }
        }
        info!(graceful, "Execution queue stopped");
    }

    pub fn is_running(&self) -> bool {
        self.pool.lock().is_some()
    }

    /// Wait for unit `id` to finish and return its result.
    ///
    /// Fails with [`Error::TaskFailed`] if the unit failed,
    /// [`Error::Cancelled`] if it was cancelled, [`Error::NotFound`] for an
    /// unknown id, and [`Error::Timeout`] if `timeout` elapses first.
    pub async fn get_result(&self, id: &TaskId, timeout: Option<Duration>) -> Result<T> {
        let deadline = timeout.map(|after| (Instant::now() + after, after));

        loop {
            let notified = self.shared.transitions.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.shared.outcome(id) {
                return outcome;
            }

            match deadline {
                Some((deadline, after)) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(Error::timeout(format!("result of task {id}"), after));
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Cancel a unit that has not started yet.
    ///
    /// Returns `false`, leaving the unit untouched, if it is unknown, running,
    /// or already finished.
    pub fn cancel(&self, id: &TaskId) -> bool {
        let cancelled = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            match inner.tasks.get_mut(id) {
                Some(entry) if entry.info.status == TaskStatus::Pending => {
                    entry.info.cancel();
                    entry.body = None;
                    inner.line.retain(|queued| queued.id != *id);
                    true
                }
                _ => false,
            }
        };

        if cancelled {
            self.shared.transitions.notify_waiters();
            info!(task_id = %id, "Task cancelled");
        }
        cancelled
    }

    /// Wait until every unit not yet finished at the time of the call has
    /// reached a terminal state.
    pub async fn wait_all(&self, timeout: Option<Duration>) -> Result<()> {
        let watched: Vec<TaskId> = {
            let inner = self.shared.inner.lock();
            inner
                .tasks
                .values()
                .filter(|entry| !entry.info.status.is_terminal())
                .map(|entry| entry.info.id.clone())
                .collect()
        };
        let deadline = timeout.map(|after| (Instant::now() + after, after));

        loop {
            let notified = self.shared.transitions.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let remaining = {
                let inner = self.shared.inner.lock();
                watched
                    .iter()
                    .filter(|id| {
                        inner
                            .tasks
                            .get(*id)
                            .is_some_and(|entry| !entry.info.status.is_terminal())
                    })
                    .count()
            };
            if remaining == 0 {
                return Ok(());
            }

            match deadline {
                Some((deadline, after)) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(Error::timeout(
                            format!("{remaining} unfinished queued tasks"),
                            after,
                        ));
                    }
                }
                None => notified.await,
            }
        }
    }

    pub fn task_info(&self, id: &TaskId) -> Option<TaskInfo> {
        let inner = self.shared.inner.lock();
        inner.tasks.get(id).map(|entry| entry.info.clone())
    }

    /// Snapshots of all units (optionally only those in `status`), oldest first.
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<TaskInfo> {
        let inner = self.shared.inner.lock();
        let mut tasks: Vec<TaskInfo> = inner
            .tasks
            .values()
            .filter(|entry| status.map_or(true, |s| entry.info.status == s))
            .map(|entry| entry.info.clone())
            .collect();
        tasks.sort_by_key(|info| info.created_at);
        tasks
    }

    /// Forget a finished unit. Returns `false` for unknown or unfinished units.
    pub fn remove(&self, id: &TaskId) -> bool {
        let mut inner = self.shared.inner.lock();
        let finished = inner
            .tasks
            .get(id)
            .is_some_and(|entry| entry.info.status.is_terminal());
        if finished {
            inner.tasks.remove(id);
        }
        finished
    }

    /// Forget every finished unit. Returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        let mut inner = self.shared.inner.lock();
        let before = inner.tasks.len();
        inner
            .tasks
            .retain(|_, entry| !entry.info.status.is_terminal());
        before - inner.tasks.len()
    }

    pub fn statistics(&self) -> QueueStats {
        let inner = self.shared.inner.lock();
        QueueStats::from_tasks(inner.tasks.values().map(|e| &e.info), inner.line.len())
    }
}

impl<T> Drop for ExecutionQueue<T> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.get_mut().take() {
            pool.shutdown.cancel();
        }
    }
}

impl<T: Clone + Send + 'static> Shared<T> {
    /// Pop the next pending unit and mark it running.
    fn claim_next(&self) -> Option<(TaskId, TaskBody<T>)> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        while let Some(queued) = inner.line.pop() {
            let Some(entry) = inner.tasks.get_mut(&queued.id) else {
                continue;
            };
            if entry.info.status != TaskStatus::Pending {
                continue;
            }
            let Some(body) = entry.body.take() else {
                continue;
            };
            entry.info.start();
            return Some((queued.id, body));
        }
        None
    }

    async fn run(&self, id: TaskId, body: TaskBody<T>) {
        debug!(task_id = %id, "Task started");
        let outcome = AssertUnwindSafe(async move { body().await })
            .catch_unwind()
            .await;

        {
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.tasks.get_mut(&id) {
                if entry.info.status == TaskStatus::Running {
                    match outcome {
                        Ok(Ok(value)) => {
                            entry.result = Some(value);
                            entry.info.complete();
                            debug!(task_id = %id, "Task completed");
                        }
                        Ok(Err(message)) => {
                            warn!(task_id = %id, error = %message, "Task failed");
                            entry.info.fail(message);
                        }
                        Err(panic) => {
                            let message = panic_message(panic.as_ref());
                            warn!(task_id = %id, error = %message, "Task panicked");
                            entry.info.fail(message);
                        }
                    }
                }
            }
        }

        self.transitions.notify_waiters();
    }

    /// The terminal outcome of unit `id`, or `None` while it is unfinished.
    fn outcome(&self, id: &TaskId) -> Option<Result<T>> {
        let inner = self.inner.lock();
        let Some(entry) = inner.tasks.get(id) else {
            return Some(Err(Error::not_found("task", id)));
        };

        match entry.info.status {
            TaskStatus::Completed => Some(
                entry
                    .result
                    .clone()
                    .ok_or_else(|| Error::Internal(format!("task {id} completed without a result"))),
            ),
            TaskStatus::Failed => Some(Err(Error::task_failed(
                id,
                entry.info.error.clone().unwrap_or_default(),
            ))),
            TaskStatus::Cancelled => Some(Err(Error::Cancelled(id.to_string()))),
            TaskStatus::Pending | TaskStatus::Running => None,
        }
    }
}

async fn worker_loop<T: Clone + Send + 'static>(
    worker: usize,
    shared: Arc<Shared<T>>,
    shutdown: CancellationToken,
    poll_interval: Duration,
) {
    debug!(worker, "Queue worker started");

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        match shared.claim_next() {
            Some((id, body)) => shared.run(id, body).await,
            None => {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,
                    _ = shared.work_ready.notified() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }

    debug!(worker, "Queue worker stopped");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

//! Progress tracking with non-blocking observer fan-out.
//!
//! A [`ProgressTracker`] follows one task along a `0..total_steps` scale.
//! Every [`update`](ProgressTracker::update) records a [`ProgressSample`] in
//! a bounded history; samples whose step differs from the previous one (or
//! that are forced) are queued to a dispatcher task which hands them to each
//! registered [`ProgressObserver`] in call order. The caller never waits on an
//! observer, and an observer that fails or panics is logged and skipped.
//!
//! Nested components report through a [`ProgressSender`], whose
//! [`scoped`](ProgressSender::scoped) form rebases a `0..100` sub-scale into
//! a [`ProgressBand`] of the parent's scale.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

/// Number of samples retained in a tracker's history.
const MAX_HISTORY: usize = 100;

/// Error type observers may return.
pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

// ---------------------------------------------------------------------------
// ProgressSample
// ---------------------------------------------------------------------------

/// One recorded position of a tracked task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSample {
    /// Completion percentage, `0.0..=100.0`.
    pub percent: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Estimated seconds remaining; `None` until a step has completed.
    pub eta_secs: Option<f64>,
    pub current_step: Option<u64>,
    pub total_steps: Option<u64>,
}

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

/// Receives progress samples from a [`ProgressTracker`].
#[async_trait]
pub trait ProgressObserver: Send + Sync {
    async fn on_progress(&self, sample: &ProgressSample) -> Result<(), ObserverError>;
}

/// Adapter turning a synchronous closure into a [`ProgressObserver`].
pub struct FnObserver<F> {
    f: F,
}

impl<F> FnObserver<F>
where
    F: Fn(&ProgressSample) -> Result<(), ObserverError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> ProgressObserver for FnObserver<F>
where
    F: Fn(&ProgressSample) -> Result<(), ObserverError> + Send + Sync,
{
    async fn on_progress(&self, sample: &ProgressSample) -> Result<(), ObserverError> {
        (self.f)(sample)
    }
}

/// Wrap an infallible synchronous callback as a shareable observer.
pub fn observer_fn<F>(f: F) -> Arc<dyn ProgressObserver>
where
    F: Fn(&ProgressSample) + Send + Sync + 'static,
{
    Arc::new(FnObserver::new(move |sample: &ProgressSample| {
        f(sample);
        Ok(())
    }))
}

/// Handle returned by [`ProgressTracker::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type ObserverList = Arc<RwLock<Vec<(ObserverId, Arc<dyn ProgressObserver>)>>>;

enum Dispatch {
    Sample(ProgressSample),
    Flush(oneshot::Sender<()>),
}

// ---------------------------------------------------------------------------
// ProgressTracker
// ---------------------------------------------------------------------------

struct TrackerState {
    current_step: u64,
    last_step: Option<u64>,
    started: Instant,
    history: VecDeque<ProgressSample>,
}

/// Tracks one task's position and fans updates out to observers.
pub struct ProgressTracker {
    total_steps: u64,
    state: Mutex<TrackerState>,
    observers: ObserverList,
    next_observer: AtomicU64,
    tx: mpsc::UnboundedSender<Dispatch>,
}

impl ProgressTracker {
    /// Create a tracker for `total_steps` steps (a zero total is treated as 1).
    ///
    /// Spawns the observer dispatcher, so this must be called from within a
    /// Tokio runtime. The dispatcher exits when the tracker is dropped.
    pub fn new(total_steps: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let observers: ObserverList = Arc::new(RwLock::new(Vec::new()));
        tokio::spawn(dispatch(rx, observers.clone()));

        Self {
            total_steps: total_steps.max(1),
            state: Mutex::new(TrackerState {
                current_step: 0,
                last_step: None,
                started: Instant::now(),
                history: VecDeque::with_capacity(MAX_HISTORY),
            }),
            observers,
            next_observer: AtomicU64::new(0),
            tx,
        }
    }

    /// Register an observer; returns a handle for [`unregister`](Self::unregister).
    pub fn register(&self, observer: Arc<dyn ProgressObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, observer));
        id
    }

    /// Remove an observer. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() < before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Record the task's position.
    ///
    /// Observers are notified only when `step` differs from the previously
    /// recorded step, unless `force_notify` is set.
    pub fn update(&self, step: u64, message: impl Into<String>, force_notify: bool) -> ProgressSample {
        let (sample, notify) = {
            let mut state = self.state.lock();
            let changed = state.last_step != Some(step);
            state.current_step = step;
            state.last_step = Some(step);

            let percent = (step as f64 / self.total_steps as f64 * 100.0).clamp(0.0, 100.0);
            let eta_secs = eta(state.started.elapsed(), step, self.total_steps);

            let sample = ProgressSample {
                percent,
                message: message.into(),
                timestamp: Utc::now(),
                eta_secs,
                current_step: Some(step),
                total_steps: Some(self.total_steps),
            };

            if state.history.len() >= MAX_HISTORY {
                state.history.pop_front();
            }
            state.history.push_back(sample.clone());

            (sample, changed || force_notify)
        };

        if notify && self.tx.send(Dispatch::Sample(sample.clone())).is_err() {
            tracing::debug!("Progress dispatcher stopped; sample not delivered");
        }

        sample
    }

    /// Record a position given as a percentage of the total.
    pub fn update_percent(&self, percent: f64, message: impl Into<String>) -> ProgressSample {
        let step = (percent.clamp(0.0, 100.0) / 100.0 * self.total_steps as f64).round() as u64;
        self.update(step, message, false)
    }

    /// Wait until every sample queued so far has been delivered.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Dispatch::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }

    pub fn current_step(&self) -> u64 {
        self.state.lock().current_step
    }

    pub fn percent(&self) -> f64 {
        (self.current_step() as f64 / self.total_steps as f64 * 100.0).clamp(0.0, 100.0)
    }

    /// Whether the current step has reached (or passed) the total.
    pub fn is_complete(&self) -> bool {
        self.current_step() >= self.total_steps
    }

    pub fn elapsed(&self) -> Duration {
        self.state.lock().started.elapsed()
    }

    pub fn latest(&self) -> Option<ProgressSample> {
        self.state.lock().history.back().cloned()
    }

    /// Recorded samples, oldest first.
    pub fn history(&self) -> Vec<ProgressSample> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Return to step zero and restart the ETA clock. Observers stay registered.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.current_step = 0;
        state.last_step = None;
        state.started = Instant::now();
        state.history.clear();
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("total_steps", &self.total_steps)
            .field("current_step", &self.current_step())
            .finish_non_exhaustive()
    }
}

fn eta(elapsed: Duration, step: u64, total: u64) -> Option<f64> {
    if step == 0 {
        return None;
    }
    let remaining = total.saturating_sub(step);
    Some(elapsed.as_secs_f64() / step as f64 * remaining as f64)
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<Dispatch>, observers: ObserverList) {
    while let Some(msg) = rx.recv().await {
        match msg {
            Dispatch::Sample(sample) => {
                let snapshot: Vec<_> = observers.read().iter().map(|(_, o)| o.clone()).collect();
                for observer in snapshot {
                    match AssertUnwindSafe(observer.on_progress(&sample))
                        .catch_unwind()
                        .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::warn!(error = %e, "Progress observer failed");
                        }
                        Err(_) => {
                            tracing::warn!("Progress observer panicked");
                        }
                    }
                }
            }
            Dispatch::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Bands and senders
// ---------------------------------------------------------------------------

/// A reserved sub-range of a parent's `0..100` progress scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressBand {
    pub start: f64,
    pub end: f64,
}

impl ProgressBand {
    pub const fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// Map a `0..100` sub-progress value into this band.
    pub fn rebase(&self, sub: f64) -> f64 {
        self.start + (self.end - self.start) * sub.clamp(0.0, 100.0) / 100.0
    }
}

/// Sender for reporting progress from within a collaborator.
///
/// Wraps a callback that receives a progress percentage (0.0 -- 100.0) and a
/// human-readable step description.
#[derive(Clone)]
pub struct ProgressSender {
    callback: Arc<dyn Fn(f64, &str) + Send + Sync>,
}

impl ProgressSender {
    /// Create a new sender from the given callback.
    pub fn new(callback: impl Fn(f64, &str) + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Create a no-op sender that discards all progress reports.
    pub fn noop() -> Self {
        Self::new(|_, _| {})
    }

    /// Report progress.
    pub fn send(&self, progress: f64, step: &str) {
        (self.callback)(progress, step);
    }

    /// A sender whose `0..100` reports land inside `band` of this sender's scale.
    pub fn scoped(&self, band: ProgressBand) -> Self {
        let parent = self.clone();
        Self::new(move |sub, step| parent.send(band.rebase(sub), step))
    }
}

impl std::fmt::Debug for ProgressSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSender").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collecting_observer() -> (Arc<dyn ProgressObserver>, Arc<Mutex<Vec<ProgressSample>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer = observer_fn(move |sample| sink.lock().push(sample.clone()));
        (observer, seen)
    }

    struct FailingObserver;

    #[async_trait]
    impl ProgressObserver for FailingObserver {
        async fn on_progress(&self, _sample: &ProgressSample) -> Result<(), ObserverError> {
            Err("observer exploded".into())
        }
    }

    struct PanickingObserver;

    #[async_trait]
    impl ProgressObserver for PanickingObserver {
        async fn on_progress(&self, _sample: &ProgressSample) -> Result<(), ObserverError> {
            panic!("observer panicked");
        }
    }

    #[tokio::test]
    async fn halfway_update_reports_percent_and_eta() {
        let tracker = ProgressTracker::new(100);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let sample = tracker.update(50, "halfway", false);
        assert_eq!(sample.percent, 50.0);
        assert_eq!(sample.current_step, Some(50));
        assert_eq!(sample.total_steps, Some(100));
        let eta = sample.eta_secs.expect("eta defined after first step");
        assert!(eta > 0.0, "eta: {eta}");
    }

    #[tokio::test]
    async fn eta_undefined_at_step_zero() {
        let tracker = ProgressTracker::new(10);
        let sample = tracker.update(0, "starting", false);
        assert_eq!(sample.eta_secs, None);
        assert_eq!(sample.percent, 0.0);
    }

    #[tokio::test]
    async fn repeated_step_is_coalesced() {
        let tracker = ProgressTracker::new(100);
        let (observer, seen) = collecting_observer();
        tracker.register(observer);

        tracker.update(50, "halfway", false);
        tracker.update(50, "halfway again", false);
        tracker.flush().await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].message, "halfway");
        // Both updates still land in history.
        assert_eq!(tracker.history().len(), 2);
    }

    #[tokio::test]
    async fn force_notify_bypasses_coalescing() {
        let tracker = ProgressTracker::new(100);
        let (observer, seen) = collecting_observer();
        tracker.register(observer);

        tracker.update(50, "halfway", false);
        tracker.update(50, "halfway again", true);
        tracker.flush().await;

        let messages: Vec<_> = seen.lock().iter().map(|s| s.message.clone()).collect();
        assert_eq!(messages, vec!["halfway", "halfway again"]);
    }

    #[tokio::test]
    async fn notifications_preserve_call_order() {
        let tracker = ProgressTracker::new(10);
        let (observer, seen) = collecting_observer();
        tracker.register(observer);

        for step in [1, 3, 2, 7] {
            tracker.update(step, format!("step {step}"), false);
        }
        tracker.flush().await;

        let steps: Vec<_> = seen.lock().iter().filter_map(|s| s.current_step).collect();
        assert_eq!(steps, vec![1, 3, 2, 7]);
    }

    #[tokio::test]
    async fn broken_observers_do_not_block_others() {
        let tracker = ProgressTracker::new(4);
        tracker.register(Arc::new(FailingObserver));
        tracker.register(Arc::new(PanickingObserver));
        let (observer, seen) = collecting_observer();
        tracker.register(observer);

        tracker.update(1, "one", false);
        tracker.update(2, "two", false);
        tracker.flush().await;

        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn unregister_stops_delivery() {
        let tracker = ProgressTracker::new(10);
        let (observer, seen) = collecting_observer();
        let id = tracker.register(observer);

        tracker.update(1, "one", false);
        tracker.flush().await;
        assert!(tracker.unregister(id));
        assert!(!tracker.unregister(id));

        tracker.update(2, "two", false);
        tracker.flush().await;
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(tracker.observer_count(), 0);
    }

    #[tokio::test]
    async fn update_percent_converts_to_steps() {
        let tracker = ProgressTracker::new(1000);
        let sample = tracker.update_percent(30.0, "thirty");
        assert_eq!(sample.current_step, Some(300));
        assert_eq!(sample.percent, 30.0);
        assert_eq!(tracker.current_step(), 300);
    }

    #[tokio::test]
    async fn overshoot_counts_as_complete() {
        let tracker = ProgressTracker::new(5);
        assert!(!tracker.is_complete());
        let sample = tracker.update(7, "overshoot", false);
        assert!(tracker.is_complete());
        assert_eq!(sample.percent, 100.0);
        assert_eq!(sample.eta_secs, Some(0.0));
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let tracker = ProgressTracker::new(1000);
        for step in 0..250 {
            tracker.update(step, "tick", false);
        }
        let history = tracker.history();
        assert_eq!(history.len(), MAX_HISTORY);
        assert_eq!(history[0].current_step, Some(150));
        assert_eq!(tracker.latest().and_then(|s| s.current_step), Some(249));
    }

    #[tokio::test]
    async fn reset_clears_position() {
        let tracker = ProgressTracker::new(10);
        tracker.update(6, "six", false);
        tracker.reset();
        assert_eq!(tracker.current_step(), 0);
        assert!(tracker.history().is_empty());
    }

    #[test]
    fn band_rebase() {
        let band = ProgressBand::new(15.0, 45.0);
        assert_eq!(band.rebase(0.0), 15.0);
        assert_eq!(band.rebase(50.0), 30.0);
        assert_eq!(band.rebase(100.0), 45.0);
        assert_eq!(band.rebase(150.0), 45.0);
        assert_eq!(band.rebase(-5.0), 15.0);
    }

    #[test]
    fn scoped_sender_rebases_into_band() {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        let root = ProgressSender::new(move |pct, step| sink.lock().push((pct, step.to_string())));

        let images = root.scoped(ProgressBand::new(15.0, 45.0));
        images.send(0.0, "start");
        images.send(50.0, "half");
        images.send(100.0, "done");

        let values: Vec<f64> = reports.lock().iter().map(|(p, _)| *p).collect();
        assert_eq!(values, vec![15.0, 30.0, 45.0]);
    }

    #[test]
    fn nested_scopes_compose() {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        let root = ProgressSender::new(move |pct, _| sink.lock().push(pct));

        let inner = root
            .scoped(ProgressBand::new(0.0, 50.0))
            .scoped(ProgressBand::new(50.0, 100.0));
        inner.send(0.0, "x");
        inner.send(100.0, "y");

        assert_eq!(*reports.lock(), vec![25.0, 50.0]);
    }
}

//! Shared test harness for pipeline integration tests.
//!
//! Provides [`TestHarness`], which owns a temporary working directory, a
//! config pointing into it, an [`EventBus`], and [`FakeAgents`]: one
//! scriptable stand-in for every collaborator that records its calls.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use reelforge::config::Config;
use reelforge::pipeline::{
    Agents, Character, CharacterReference, CharacterReferenceAgent, Composer, CompositionRequest,
    Coordinator, ImageAgent, ImageRequest, ReferenceProvenance, ReferenceSet, Scene, Script,
    ScriptParser, VideoAgent, VideoRequest,
};
use reelforge_common::events::EventBus;
use reelforge_common::{Error, Result};
use reelforge_exec::progress::{ObserverError, ProgressObserver, ProgressSample};
use reelforge_exec::ProgressSender;

/// Message the fake composer reports its progress with.
pub const COMPOSING: &str = "composing";
/// Prefix of the fake image agent's progress messages.
pub const PAINTING: &str = "painting";

#[derive(Default)]
pub struct Calls {
    pub parse: AtomicUsize,
    pub references: AtomicUsize,
    pub images: AtomicUsize,
    pub videos: AtomicUsize,
    pub compose: AtomicUsize,
}

impl Calls {
    pub fn parse(&self) -> usize {
        self.parse.load(Ordering::SeqCst)
    }
    pub fn references(&self) -> usize {
        self.references.load(Ordering::SeqCst)
    }
    pub fn images(&self) -> usize {
        self.images.load(Ordering::SeqCst)
    }
    pub fn videos(&self) -> usize {
        self.videos.load(Ordering::SeqCst)
    }
    pub fn compose(&self) -> usize {
        self.compose.load(Ordering::SeqCst)
    }
}

/// Scriptable collaborators. Every knob can be flipped between runs.
pub struct FakeAgents {
    pub script: Mutex<Script>,
    pub parse_fails: AtomicBool,
    pub references_fail: AtomicBool,
    pub failing_images: Mutex<HashSet<String>>,
    pub failing_videos: Mutex<HashSet<String>>,
    /// Scenes whose clip takes this long to render.
    pub slow_videos: Mutex<HashMap<String, Duration>>,
    pub compose_fails: AtomicBool,
    /// Path the composer claims to have written instead of the requested one.
    pub compose_output: Mutex<Option<PathBuf>>,
    pub calls: Calls,
}

impl FakeAgents {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            parse_fails: AtomicBool::new(false),
            references_fail: AtomicBool::new(false),
            failing_images: Mutex::new(HashSet::new()),
            failing_videos: Mutex::new(HashSet::new()),
            slow_videos: Mutex::new(HashMap::new()),
            compose_fails: AtomicBool::new(false),
            compose_output: Mutex::new(None),
            calls: Calls::default(),
        })
    }

    pub fn agents(self: &Arc<Self>) -> Agents {
        Agents {
            parser: self.clone(),
            references: self.clone(),
            images: self.clone(),
            videos: self.clone(),
            composer: self.clone(),
        }
    }

    pub fn fail_videos(&self, scene_ids: &[&str]) {
        let mut failing = self.failing_videos.lock();
        failing.clear();
        failing.extend(scene_ids.iter().map(|id| id.to_string()));
    }

    pub fn slow_video(&self, scene_id: &str, delay: Duration) {
        self.slow_videos.lock().insert(scene_id.to_string(), delay);
    }

    pub fn fail_images(&self, scene_ids: &[&str]) {
        let mut failing = self.failing_images.lock();
        failing.clear();
        failing.extend(scene_ids.iter().map(|id| id.to_string()));
    }
}

#[async_trait]
impl ScriptParser for FakeAgents {
    async fn parse(&self, _script: &Path, progress: ProgressSender) -> Result<Script> {
        self.calls.parse.fetch_add(1, Ordering::SeqCst);
        progress.send(50.0, "reading script");
        if self.parse_fails.load(Ordering::SeqCst) {
            return Err(Error::Validation("unterminated scene block".into()));
        }
        Ok(self.script.lock().clone())
    }
}

#[async_trait]
impl CharacterReferenceAgent for FakeAgents {
    async fn generate(
        &self,
        characters: &[Character],
        _base_image: Option<&Path>,
        output_dir: &Path,
        progress: ProgressSender,
    ) -> Result<ReferenceSet> {
        self.calls.references.fetch_add(1, Ordering::SeqCst);
        if self.references_fail.load(Ordering::SeqCst) {
            return Err(Error::Internal("reference model unavailable".into()));
        }
        progress.send(100.0, "references done");
        Ok(ReferenceSet {
            references: characters
                .iter()
                .map(|c| CharacterReference {
                    character: c.name.clone(),
                    image_path: output_dir.join(format!("{}.png", c.name)),
                    provenance: ReferenceProvenance::Generated,
                })
                .collect(),
        })
    }
}

#[async_trait]
impl ImageAgent for FakeAgents {
    async fn generate(&self, request: ImageRequest, progress: ProgressSender) -> Result<PathBuf> {
        self.calls.images.fetch_add(1, Ordering::SeqCst);
        let message = format!("{PAINTING} {}", request.scene.id);
        progress.send(0.0, &message);
        progress.send(50.0, &message);
        if self.failing_images.lock().contains(&request.scene.id) {
            return Err(Error::Internal("image model rejected prompt".into()));
        }
        progress.send(100.0, &message);
        Ok(request.output)
    }
}

#[async_trait]
impl VideoAgent for FakeAgents {
    async fn generate(&self, request: VideoRequest, progress: ProgressSender) -> Result<PathBuf> {
        self.calls.videos.fetch_add(1, Ordering::SeqCst);
        let delay = self.slow_videos.lock().get(&request.scene_id).copied();
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        if self.failing_videos.lock().contains(&request.scene_id) {
            return Err(Error::Internal(format!(
                "video service rejected {}",
                request.scene_id
            )));
        }
        progress.send(100.0, &format!("clip {}", request.scene_id));
        Ok(request.output)
    }
}

#[async_trait]
impl Composer for FakeAgents {
    async fn compose(&self, request: CompositionRequest, progress: ProgressSender) -> Result<PathBuf> {
        self.calls.compose.fetch_add(1, Ordering::SeqCst);
        progress.send(0.0, COMPOSING);
        progress.send(50.0, COMPOSING);
        if self.compose_fails.load(Ordering::SeqCst) {
            return Err(Error::Internal("mux failed".into()));
        }
        progress.send(100.0, COMPOSING);
        Ok(self
            .compose_output
            .lock()
            .clone()
            .unwrap_or(request.output))
    }
}

/// Observer that keeps every sample it is handed.
#[derive(Default)]
pub struct RecordingObserver {
    pub samples: Mutex<Vec<ProgressSample>>,
}

impl RecordingObserver {
    /// Percentages of samples whose message starts with `prefix`, in order.
    pub fn percents(&self, prefix: &str) -> Vec<f64> {
        self.samples
            .lock()
            .iter()
            .filter(|s| s.message.starts_with(prefix))
            .map(|s| s.percent)
            .collect()
    }
}

#[async_trait]
impl ProgressObserver for RecordingObserver {
    async fn on_progress(&self, sample: &ProgressSample) -> std::result::Result<(), ObserverError> {
        self.samples.lock().push(sample.clone());
        Ok(())
    }
}

/// A script with `scenes` scenes `s1..sN`; character Ada appears in `s1`.
pub fn script(scenes: usize) -> Script {
    Script {
        title: "The Harbor".into(),
        scenes: (1..=scenes)
            .map(|n| Scene {
                id: format!("s{n}"),
                description: format!("Scene {n} at the harbor"),
                prompt: None,
                duration_secs: Some(4.0),
                characters: if n == 1 { vec!["Ada".into()] } else { Vec::new() },
            })
            .collect(),
        characters: vec![Character {
            name: "Ada".into(),
            description: "a retired sea captain".into(),
        }],
    }
}

pub struct TestHarness {
    pub dir: TempDir,
    pub config: Config,
    pub events: Arc<EventBus>,
    pub fake: Arc<FakeAgents>,
}

impl TestHarness {
    pub fn new(scenes: usize) -> Self {
        Self::with_config(scenes, |_| {})
    }

    pub fn with_config(scenes: usize, tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();

        let mut config = Config::default();
        config.queue.workers = 2;
        config.queue.poll_interval_ms = 10;
        config.checkpoints.dir = dir.path().join("checkpoints");
        config.checkpoints.archive_dir = dir.path().join("archive");
        config.pipeline.output_dir = dir.path().join("output");
        config.pipeline.scene_timeout_secs = Some(5);
        tweak(&mut config);

        std::fs::write(dir.path().join("script.txt"), "# The Harbor\n\nScene one.\n").unwrap();

        Self {
            dir,
            config,
            events: Arc::new(EventBus::default()),
            fake: FakeAgents::new(script(scenes)),
        }
    }

    pub fn coordinator(&self) -> Coordinator {
        Coordinator::new(self.config.clone(), self.fake.agents(), self.events.clone())
    }

    pub fn script_path(&self) -> PathBuf {
        self.dir.path().join("script.txt")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.config.pipeline.output_dir.clone()
    }
}

/// Approximate float comparison for progress percentages.
pub fn assert_percents(actual: &[f64], expected: &[f64]) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "got {actual:?}, expected {expected:?}"
    );
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-6, "got {actual:?}, expected {expected:?}");
    }
}

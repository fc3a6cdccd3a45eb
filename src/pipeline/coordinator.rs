//! Stage sequencing for full and quick runs.
//!
//! A [`Coordinator`] walks a run through its stages strictly in order,
//! rebasing every collaborator's `0..100` progress into the stage's band of
//! the run's overall scale. Per-scene image and video work fans out through
//! a shared [`ExecutionQueue`].
//!
//! Failure policy per stage:
//!
//! | Stage | On failure |
//! |-------|------------|
//! | parse | abort |
//! | character references | warn, continue with text-only prompts |
//! | images | abort only if no scene has an image |
//! | videos | abort only if no scene has a clip; otherwise warn |
//! | composition | abort |
//! | metadata | log, keep the run successful |
//!
//! Aborts invoke the error hook before the error is returned.

use std::collections::HashMap;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use reelforge_common::events::{EventBus, EventPayload};
use reelforge_common::{Error, Result, TaskId};
use reelforge_exec::{
    CheckpointStage, CheckpointStore, ExecutionQueue, ProgressObserver, ProgressSender,
    ProgressTracker, QueueStats, ResumePoint,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::agents::{Agents, CompositionRequest, ImageRequest, VideoRequest};
use super::manifest::{ReferenceStats, RunManifest, SceneStats};
use super::report::EventBusObserver;
use super::stage::{PipelineStage, Variant};
use super::types::{
    Character, CharacterReference, CompositionSnapshot, ImageSource, ImageStageSnapshot,
    QuickScene, ReferenceProvenance, ReferenceSet, SceneOutcome, Script, VideoStageSnapshot,
};
use crate::config::Config;

/// Resolution of a run's overall progress scale (0.1%).
const TRACKER_STEPS: u64 = 1000;

pub type CompleteHook = Arc<dyn Fn(&Path) + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&Error) + Send + Sync>;

/// Input of a full run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Script file handed to the parser.
    pub script: PathBuf,
    /// Reuse an id (required to resume); a fresh one is generated otherwise.
    pub task_id: Option<TaskId>,
    /// Skip stages whose checkpoints can be restored.
    pub resume: bool,
    /// Caller-supplied images by scene id; these scenes skip image generation.
    pub provided_images: HashMap<String, PathBuf>,
    /// Caller-supplied reference images by character name; these characters
    /// skip reference generation.
    pub provided_references: HashMap<String, PathBuf>,
    /// Base image to derive references and scene images from.
    pub base_image: Option<PathBuf>,
    /// Output file stem; defaults to the task id.
    pub output_name: Option<String>,
}

impl RunRequest {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            ..Default::default()
        }
    }
}

/// Input of a quick run: ready images and explicit per-scene parameters.
#[derive(Debug, Clone, Default)]
pub struct QuickRunRequest {
    pub task_id: Option<TaskId>,
    pub title: String,
    pub scenes: Vec<QuickScene>,
    pub output_name: Option<String>,
}

/// What a successful run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub task_id: TaskId,
    pub output_video: PathBuf,
    /// `None` when writing the manifest failed.
    pub manifest_path: Option<PathBuf>,
    pub warnings: Vec<String>,
    pub manifest: RunManifest,
}

/// State owned by one run.
struct Run {
    task_id: TaskId,
    variant: Variant,
    started: Instant,
    tracker: Arc<ProgressTracker>,
    progress: ProgressSender,
    planned_output: PathBuf,
    warnings: Vec<String>,
    resumed_after: Option<CheckpointStage>,
}

/// A scene ready for video generation, or the failed outcome of one that is not.
type VideoJob = std::result::Result<VideoRequest, SceneOutcome>;

/// Per-scene work queued on the execution queue.
type SceneWork = Box<dyn FnOnce(ProgressSender) -> BoxFuture<'static, SceneOutcome> + Send>;

enum SceneUnit {
    /// Decided without a collaborator call.
    Settled(SceneOutcome),
    Queued { scene_id: String, work: SceneWork },
}

pub struct Coordinator {
    config: Config,
    agents: Agents,
    events: Arc<EventBus>,
    queue: Arc<ExecutionQueue<SceneOutcome>>,
    checkpoints: Option<CheckpointStore>,
    observers: Vec<Arc<dyn ProgressObserver>>,
    on_complete: Option<CompleteHook>,
    on_error: Option<ErrorHook>,
}

impl Coordinator {
    pub fn new(config: Config, agents: Agents, events: Arc<EventBus>) -> Self {
        let checkpoints = config
            .checkpoints
            .enabled
            .then(|| CheckpointStore::new(&config.checkpoints.dir));
        let queue = Arc::new(ExecutionQueue::new(config.queue.to_queue_config()));

        Self {
            config,
            agents,
            events,
            queue,
            checkpoints,
            observers: Vec::new(),
            on_complete: None,
            on_error: None,
        }
    }

    /// Called with the final video path after every successful run.
    pub fn with_on_complete(mut self, hook: impl Fn(&Path) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(hook));
        self
    }

    /// Called with the error of every aborted run, before it is returned.
    pub fn with_on_error(mut self, hook: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Receive every run's progress samples in addition to the event bus.
    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn checkpoints(&self) -> Option<&CheckpointStore> {
        self.checkpoints.as_ref()
    }

    pub fn queue_statistics(&self) -> QueueStats {
        self.queue.statistics()
    }

    /// Drain and stop the scene worker pool.
    pub async fn shutdown(&self) {
        self.queue.stop(true).await;
    }

    /// Run the full workflow: parse, character references, images, videos,
    /// composition, metadata.
    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome> {
        let task_id = request.task_id.clone().unwrap_or_default();
        let mut run = self.begin_run(task_id, Variant::Full, request.output_name.as_deref());
        let result = self.execute_full(&mut run, &request).await;
        self.finish(run, result).await
    }

    /// Run the quick workflow: videos, composition, metadata.
    pub async fn run_quick(&self, request: QuickRunRequest) -> Result<RunOutcome> {
        let task_id = request.task_id.clone().unwrap_or_default();
        let mut run = self.begin_run(task_id, Variant::Quick, request.output_name.as_deref());
        let result = self.execute_quick(&mut run, &request).await;
        self.finish(run, result).await
    }

    fn begin_run(&self, task_id: TaskId, variant: Variant, output_name: Option<&str>) -> Run {
        let tracker = Arc::new(ProgressTracker::new(TRACKER_STEPS));
        tracker.register(Arc::new(EventBusObserver::new(
            self.events.clone(),
            task_id.clone(),
        )));
        for observer in &self.observers {
            tracker.register(observer.clone());
        }

        let progress = {
            let tracker = tracker.clone();
            ProgressSender::new(move |percent, message| {
                let step = (percent.clamp(0.0, 100.0) / 100.0 * TRACKER_STEPS as f64).round() as u64;
                // A new message is worth reporting even when the step holds.
                let fresh = tracker.latest().map_or(true, |s| s.message != message);
                tracker.update(step, message, fresh);
            })
        };

        let stem = output_name
            .map(str::to_string)
            .unwrap_or_else(|| task_id.to_string());
        let planned_output = self.config.pipeline.output_dir.join(format!("{stem}.mp4"));

        self.queue.start();
        info!(task_id = %task_id, variant = %variant, "Run started");
        self.events.broadcast(
            &task_id,
            EventPayload::RunStarted {
                variant: variant.as_str().to_string(),
            },
        );

        Run {
            task_id,
            variant,
            started: Instant::now(),
            tracker,
            progress,
            planned_output,
            warnings: Vec::new(),
            resumed_after: None,
        }
    }

    async fn finish(&self, run: Run, result: Result<RunOutcome>) -> Result<RunOutcome> {
        run.tracker.flush().await;

        match result {
            Ok(outcome) => {
                if self.config.checkpoints.archive_on_success {
                    self.archive_checkpoints(&run.task_id).await;
                }
                info!(
                    task_id = %run.task_id,
                    output = %outcome.output_video.display(),
                    warnings = outcome.warnings.len(),
                    elapsed_secs = run.started.elapsed().as_secs_f64(),
                    "Run completed"
                );
                self.events.broadcast(
                    &run.task_id,
                    EventPayload::RunCompleted {
                        output: outcome.output_video.clone(),
                    },
                );
                if let Some(hook) = &self.on_complete {
                    hook(&outcome.output_video);
                }
                Ok(outcome)
            }
            Err(e) => {
                error!(task_id = %run.task_id, error = %e, "Run failed");
                self.events.broadcast(
                    &run.task_id,
                    EventPayload::RunFailed {
                        error: e.to_string(),
                    },
                );
                if let Some(hook) = &self.on_error {
                    hook(&e);
                }
                Err(e)
            }
        }
    }

    async fn execute_full(&self, run: &mut Run, request: &RunRequest) -> Result<RunOutcome> {
        run.task_id.validate()?;
        if request.resume && request.task_id.is_none() {
            return Err(Error::Validation(
                "resuming a run requires its task id".into(),
            ));
        }

        let mut restorable = if request.resume {
            self.resume_depth(run).await
        } else {
            0
        };

        let script = match self
            .restore::<Script>(run, PipelineStage::Parse, &mut restorable)
            .await
        {
            Some(script) => script,
            None => {
                let script = self.parse_stage(run, &request.script).await?;
                self.checkpoint(run, PipelineStage::Parse, &script).await?;
                script
            }
        };

        let images = match self
            .restore::<ImageStageSnapshot>(run, PipelineStage::Images, &mut restorable)
            .await
        {
            Some(snapshot) => snapshot,
            None => {
                let references = self.reference_stage(run, &script, request).await?;
                let images = self
                    .image_stage(run, &script, &references, request)
                    .await?;
                let snapshot = ImageStageSnapshot { references, images };
                self.checkpoint(run, PipelineStage::Images, &snapshot).await?;
                snapshot
            }
        };

        let videos = match self
            .restore::<VideoStageSnapshot>(run, PipelineStage::Videos, &mut restorable)
            .await
        {
            Some(snapshot) => snapshot.videos,
            None => {
                let jobs = self.video_jobs(run, &script, &images.images).await?;
                let videos = self.video_stage(run, jobs).await?;
                self.checkpoint(
                    run,
                    PipelineStage::Videos,
                    &VideoStageSnapshot {
                        videos: videos.clone(),
                    },
                )
                .await?;
                videos
            }
        };

        let output_video = match self
            .restore::<CompositionSnapshot>(run, PipelineStage::Composition, &mut restorable)
            .await
        {
            Some(snapshot) => snapshot.output_video,
            None => {
                let output = self.composition_stage(run, &script.title, &videos).await?;
                self.checkpoint(
                    run,
                    PipelineStage::Composition,
                    &CompositionSnapshot {
                        output_video: output.clone(),
                    },
                )
                .await?;
                output
            }
        };

        let manifest = RunManifest {
            task_id: run.task_id.clone(),
            variant: run.variant,
            generated_at: Utc::now(),
            title: script.title.clone(),
            scene_count: script.scenes.len(),
            character_count: script.characters.len(),
            output_video: output_video.clone(),
            references: ReferenceStats::from_set(&images.references),
            images: SceneStats::from_outcomes(&images.images),
            videos: SceneStats::from_outcomes(&videos),
            failed_scenes: failed_ids(&videos),
            warnings: run.warnings.clone(),
            resumed_after: run.resumed_after.map(|stage| stage.as_str().to_string()),
            config: self.config.clone(),
            elapsed_secs: run.started.elapsed().as_secs_f64(),
        };
        let manifest_path = self.metadata_stage(run, &manifest).await;

        Ok(RunOutcome {
            task_id: run.task_id.clone(),
            output_video,
            manifest_path,
            warnings: run.warnings.clone(),
            manifest,
        })
    }

    async fn execute_quick(&self, run: &mut Run, request: &QuickRunRequest) -> Result<RunOutcome> {
        run.task_id.validate()?;
        if request.scenes.is_empty() {
            return Err(Error::Validation(
                "a quick run needs at least one scene".into(),
            ));
        }

        let clip_dir = self.work_dir(run).join("clips");
        tokio::fs::create_dir_all(&clip_dir).await?;

        let jobs: Vec<VideoJob> = request
            .scenes
            .iter()
            .map(|scene| {
                Ok(VideoRequest {
                    scene_id: scene.scene_id.clone(),
                    image: scene.image.clone(),
                    prompt: scene.prompt.clone(),
                    duration_secs: scene
                        .duration_secs
                        .unwrap_or(self.config.video.default_scene_secs),
                    fps: self.config.video.fps,
                    output: clip_dir.join(format!("{}.mp4", scene.scene_id)),
                })
            })
            .collect();

        let videos = self.video_stage(run, jobs).await?;
        self.checkpoint(
            run,
            PipelineStage::Videos,
            &VideoStageSnapshot {
                videos: videos.clone(),
            },
        )
        .await?;

        let output_video = self.composition_stage(run, &request.title, &videos).await?;
        self.checkpoint(
            run,
            PipelineStage::Composition,
            &CompositionSnapshot {
                output_video: output_video.clone(),
            },
        )
        .await?;

        let images: Vec<SceneOutcome> = request
            .scenes
            .iter()
            .map(|scene| {
                SceneOutcome::succeeded(
                    scene.scene_id.clone(),
                    scene.image.clone(),
                    Some(ImageSource::Provided),
                )
            })
            .collect();

        let manifest = RunManifest {
            task_id: run.task_id.clone(),
            variant: run.variant,
            generated_at: Utc::now(),
            title: request.title.clone(),
            scene_count: request.scenes.len(),
            character_count: 0,
            output_video: output_video.clone(),
            references: ReferenceStats::default(),
            images: SceneStats::from_outcomes(&images),
            videos: SceneStats::from_outcomes(&videos),
            failed_scenes: failed_ids(&videos),
            warnings: run.warnings.clone(),
            resumed_after: None,
            config: self.config.clone(),
            elapsed_secs: run.started.elapsed().as_secs_f64(),
        };
        let manifest_path = self.metadata_stage(run, &manifest).await;

        Ok(RunOutcome {
            task_id: run.task_id.clone(),
            output_video,
            manifest_path,
            warnings: run.warnings.clone(),
            manifest,
        })
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    async fn parse_stage(&self, run: &Run, script: &Path) -> Result<Script> {
        let stage = PipelineStage::Parse;
        let progress = self.begin_stage(run, stage);

        let parsed = self
            .agents
            .parser
            .parse(script, progress.clone())
            .await
            .map_err(|e| stage_error(stage, e))?;
        if parsed.scenes.is_empty() {
            return Err(Error::stage(stage.name(), "script contains no scenes"));
        }

        info!(
            task_id = %run.task_id,
            title = %parsed.title,
            scenes = parsed.scenes.len(),
            characters = parsed.characters.len(),
            "Script parsed"
        );
        self.end_stage(run, stage, &progress);
        Ok(parsed)
    }

    async fn reference_stage(
        &self,
        run: &mut Run,
        script: &Script,
        request: &RunRequest,
    ) -> Result<ReferenceSet> {
        let stage = PipelineStage::CharacterReferences;
        let progress = self.begin_stage(run, stage);

        let mut references: Vec<CharacterReference> = script
            .characters
            .iter()
            .filter_map(|character| {
                let image_path = request.provided_references.get(&character.name)?;
                Some(CharacterReference {
                    character: character.name.clone(),
                    image_path: image_path.clone(),
                    provenance: ReferenceProvenance::Supplied,
                })
            })
            .collect();
        let missing: Vec<Character> = script
            .characters
            .iter()
            .filter(|character| !request.provided_references.contains_key(&character.name))
            .cloned()
            .collect();

        if !self.config.pipeline.character_references {
            debug!(task_id = %run.task_id, "Character reference generation disabled");
        } else if missing.is_empty() {
            debug!(task_id = %run.task_id, "No character needs a generated reference");
        } else {
            let dir = self.work_dir(run).join("references");
            tokio::fs::create_dir_all(&dir).await?;

            match self
                .agents
                .references
                .generate(&missing, request.base_image.as_deref(), &dir, progress.clone())
                .await
            {
                Ok(set) => references.extend(set.references),
                Err(e) => {
                    self.warn(
                        run,
                        format!("Character references unavailable, using text-only prompts: {e}"),
                    );
                }
            }
        }

        let references = ReferenceSet { references };
        if !references.is_empty() {
            let stats = ReferenceStats::from_set(&references);
            info!(
                task_id = %run.task_id,
                supplied = stats.supplied,
                custom_base = stats.custom_base,
                generated = stats.generated,
                "Character references ready"
            );
        }

        self.end_stage(run, stage, &progress);
        Ok(references)
    }

    async fn image_stage(
        &self,
        run: &mut Run,
        script: &Script,
        references: &ReferenceSet,
        request: &RunRequest,
    ) -> Result<Vec<SceneOutcome>> {
        let stage = PipelineStage::Images;
        let progress = self.begin_stage(run, stage);

        let image_dir = self.work_dir(run).join("images");
        tokio::fs::create_dir_all(&image_dir).await?;

        let source = if request.base_image.is_some() {
            ImageSource::CustomBase
        } else {
            ImageSource::Generated
        };

        let units: Vec<SceneUnit> = script
            .scenes
            .iter()
            .map(|scene| {
                if let Some(image) = request.provided_images.get(&scene.id) {
                    return SceneUnit::Settled(SceneOutcome::succeeded(
                        scene.id.clone(),
                        image.clone(),
                        Some(ImageSource::Provided),
                    ));
                }

                let agent = self.agents.images.clone();
                let scene_id = scene.id.clone();
                let image_request = ImageRequest {
                    scene: scene.clone(),
                    references: references.for_scene(scene),
                    base_image: request.base_image.clone(),
                    output: image_dir.join(format!("{}.png", scene.id)),
                    width: self.config.video.width,
                    height: self.config.video.height,
                };
                let work: SceneWork = Box::new(move |progress| {
                    async move {
                        match agent.generate(image_request, progress).await {
                            Ok(path) => SceneOutcome::succeeded(scene_id, path, Some(source)),
                            Err(e) => SceneOutcome::failed(scene_id, e.to_string()),
                        }
                    }
                    .boxed()
                });
                SceneUnit::Queued {
                    scene_id: scene.id.clone(),
                    work,
                }
            })
            .collect();

        let outcomes = self.fan_out(run, stage, units, &progress).await;
        let failed = failed_ids(&outcomes);
        if failed.len() == outcomes.len() {
            return Err(Error::AllScenesFailed {
                stage: CheckpointStage::ImageGeneration.as_str().to_string(),
                failed,
            });
        }
        if !failed.is_empty() {
            self.warn(
                run,
                format!(
                    "{} of {} scenes have no image: {}",
                    failed.len(),
                    outcomes.len(),
                    failed.join(", ")
                ),
            );
        }

        let stats = SceneStats::from_outcomes(&outcomes);
        info!(
            task_id = %run.task_id,
            provided = stats.provided,
            custom_base = stats.custom_base,
            generated = stats.generated,
            failed = stats.failed,
            "Scene images ready"
        );
        self.end_stage(run, stage, &progress);
        Ok(outcomes)
    }

    /// Pair each scene with its image; scenes without one become failed
    /// video outcomes.
    async fn video_jobs(
        &self,
        run: &Run,
        script: &Script,
        images: &[SceneOutcome],
    ) -> Result<Vec<VideoJob>> {
        let clip_dir = self.work_dir(run).join("clips");
        tokio::fs::create_dir_all(&clip_dir).await?;

        let by_scene: HashMap<&str, &SceneOutcome> = images
            .iter()
            .map(|outcome| (outcome.scene_id.as_str(), outcome))
            .collect();

        Ok(script
            .scenes
            .iter()
            .map(|scene| {
                let image = by_scene
                    .get(scene.id.as_str())
                    .filter(|outcome| outcome.success)
                    .and_then(|outcome| outcome.output.clone());
                match image {
                    Some(image) => Ok(VideoRequest {
                        scene_id: scene.id.clone(),
                        image,
                        prompt: scene.prompt().to_string(),
                        duration_secs: scene
                            .duration_secs
                            .unwrap_or(self.config.video.default_scene_secs),
                        fps: self.config.video.fps,
                        output: clip_dir.join(format!("{}.mp4", scene.id)),
                    }),
                    None => Err(SceneOutcome::failed(scene.id.clone(), "no source image")),
                }
            })
            .collect())
    }

    async fn video_stage(
        &self,
        run: &mut Run,
        jobs: Vec<VideoJob>,
    ) -> Result<Vec<SceneOutcome>> {
        let stage = PipelineStage::Videos;
        let progress = self.begin_stage(run, stage);

        let units: Vec<SceneUnit> = jobs
            .into_iter()
            .map(|job| match job {
                Err(skipped) => SceneUnit::Settled(skipped),
                Ok(video_request) => {
                    let agent = self.agents.videos.clone();
                    let scene_id = video_request.scene_id.clone();
                    let work: SceneWork = Box::new(move |progress| {
                        async move {
                            let scene_id = video_request.scene_id.clone();
                            match agent.generate(video_request, progress).await {
                                Ok(path) => SceneOutcome::succeeded(scene_id, path, None),
                                Err(e) => SceneOutcome::failed(scene_id, e.to_string()),
                            }
                        }
                        .boxed()
                    });
                    SceneUnit::Queued { scene_id, work }
                }
            })
            .collect();

        let outcomes = self.fan_out(run, stage, units, &progress).await;
        let failed = failed_ids(&outcomes);
        if failed.len() == outcomes.len() {
            return Err(Error::AllScenesFailed {
                stage: CheckpointStage::VideoGeneration.as_str().to_string(),
                failed,
            });
        }
        if !failed.is_empty() {
            self.warn(
                run,
                format!(
                    "{} of {} scenes failed video generation: {}",
                    failed.len(),
                    outcomes.len(),
                    failed.join(", ")
                ),
            );
        }

        self.end_stage(run, stage, &progress);
        Ok(outcomes)
    }

    async fn composition_stage(
        &self,
        run: &Run,
        title: &str,
        videos: &[SceneOutcome],
    ) -> Result<PathBuf> {
        let stage = PipelineStage::Composition;
        let progress = self.begin_stage(run, stage);

        if let Some(parent) = run.planned_output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let request = CompositionRequest {
            title: title.to_string(),
            clips: videos
                .iter()
                .filter(|outcome| outcome.success)
                .filter_map(|outcome| outcome.output.clone())
                .collect(),
            output: run.planned_output.clone(),
            fps: self.config.video.fps,
            width: self.config.video.width,
            height: self.config.video.height,
        };
        let clips = request.clips.len();

        let output = self
            .agents
            .composer
            .compose(request, progress.clone())
            .await
            .map_err(|e| stage_error(stage, e))?;

        info!(task_id = %run.task_id, clips, output = %output.display(), "Video composed");
        self.end_stage(run, stage, &progress);
        Ok(output)
    }

    /// Write the manifest. Failures are logged and never abort the run.
    async fn metadata_stage(&self, run: &Run, manifest: &RunManifest) -> Option<PathBuf> {
        let stage = PipelineStage::Metadata;
        let progress = self.begin_stage(run, stage);

        let path = match manifest.write().await {
            Ok(path) => {
                info!(task_id = %run.task_id, path = %path.display(), "Manifest written");
                Some(path)
            }
            Err(e) => {
                error!(task_id = %run.task_id, error = %e, "Failed to write run manifest");
                None
            }
        };

        self.end_stage(run, stage, &progress);
        path
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn begin_stage(&self, run: &Run, stage: PipelineStage) -> ProgressSender {
        info!(task_id = %run.task_id, stage = %stage, "Stage started");
        self.events.broadcast(
            &run.task_id,
            EventPayload::StageStarted {
                stage: stage.name().to_string(),
            },
        );
        let progress = run.progress.scoped(stage.band(run.variant));
        progress.send(0.0, &format!("Starting {stage}"));
        progress
    }

    fn end_stage(&self, run: &Run, stage: PipelineStage, progress: &ProgressSender) {
        progress.send(100.0, &format!("Finished {stage}"));
        debug!(task_id = %run.task_id, stage = %stage, "Stage finished");
        self.events.broadcast(
            &run.task_id,
            EventPayload::StageCompleted {
                stage: stage.name().to_string(),
            },
        );
    }

    fn warn(&self, run: &mut Run, message: String) {
        warn!(task_id = %run.task_id, "{message}");
        self.events.broadcast(
            &run.task_id,
            EventPayload::Warning {
                message: message.clone(),
            },
        );
        run.warnings.push(message);
    }

    fn work_dir(&self, run: &Run) -> PathBuf {
        self.config.pipeline.output_dir.join(run.task_id.as_str())
    }

    /// Run per-scene units on the queue and collect their outcomes in input
    /// order. A unit that times out or cannot be retrieved counts as failed.
    async fn fan_out(
        &self,
        run: &Run,
        stage: PipelineStage,
        units: Vec<SceneUnit>,
        progress: &ProgressSender,
    ) -> Vec<SceneOutcome> {
        let total = units.len();
        let fanout = SceneFanout::new(total, progress.clone());
        let mut outcomes: Vec<Option<SceneOutcome>> = vec![None; total];
        let mut queued = Vec::new();

        for (index, unit) in units.into_iter().enumerate() {
            match unit {
                SceneUnit::Settled(outcome) => {
                    fanout.finish(index, &format!("Scene {} ready", outcome.scene_id));
                    outcomes[index] = Some(outcome);
                }
                SceneUnit::Queued { scene_id, work } => {
                    let scene_progress = fanout.sender(index);
                    let id = self.queue.submit(
                        move || async move { Ok::<_, Infallible>(work(scene_progress).await) },
                        (total - index) as i32,
                    );
                    debug!(task_id = %run.task_id, stage = %stage, scene_id = %scene_id, unit = %id, "Scene queued");
                    queued.push((index, scene_id, id));
                }
            }
        }

        let timeout = self.config.pipeline.scene_timeout();
        for (index, scene_id, id) in queued {
            let outcome = match self.queue.get_result(&id, timeout).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    if e.is_timeout() {
                        self.queue.cancel(&id);
                    }
                    warn!(
                        task_id = %run.task_id,
                        stage = %stage,
                        scene_id = %scene_id,
                        error = %e,
                        "Scene unit did not complete"
                    );
                    SceneOutcome::failed(scene_id.clone(), e.to_string())
                }
            };
            if !self.queue.remove(&id) {
                self.reap_late(id);
            }
            fanout.finish(index, &format!("Scene {scene_id} done"));
            outcomes[index] = Some(outcome);
        }

        fanout.close();
        outcomes.into_iter().flatten().collect()
    }

    /// Drop a unit that outlived its deadline from the queue once it ends.
    fn reap_late(&self, id: TaskId) {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            let _ = queue.get_result(&id, None).await;
            if queue.remove(&id) {
                debug!(unit = %id, "Late scene unit removed");
            }
        });
    }

    async fn checkpoint<T: Serialize + ?Sized>(
        &self,
        run: &Run,
        stage: PipelineStage,
        data: &T,
    ) -> Result<()> {
        let (Some(store), Some(checkpoint)) = (&self.checkpoints, stage.checkpoint()) else {
            return Ok(());
        };
        let metadata = serde_json::json!({
            "variant": run.variant.as_str(),
            "pipeline_stage": stage.name(),
        });
        store
            .save(run.task_id.as_str(), checkpoint, data, Some(metadata))
            .await?;
        Ok(())
    }

    /// How many checkpoint stages (in vocabulary order) a resumed run may
    /// restore instead of recomputing.
    async fn resume_depth(&self, run: &mut Run) -> usize {
        let Some(store) = &self.checkpoints else {
            warn!(task_id = %run.task_id, "Checkpoints disabled; nothing to resume");
            return 0;
        };

        let point = store.resume_stage(run.task_id.as_str()).await;
        info!(task_id = %run.task_id, resume = %point, "Resume point");
        match point {
            ResumePoint::Fresh => 0,
            ResumePoint::Next(stage) => stage.index(),
            ResumePoint::Completed => CheckpointStage::ORDER.len(),
            ResumePoint::Unknown(stage) => {
                self.warn(
                    run,
                    format!("Unrecognized checkpoint stage '{stage}'; starting from scratch"),
                );
                0
            }
        }
    }

    /// Load the checkpoint payload of `stage` if it lies within the
    /// restorable depth. An unreadable payload shrinks the depth so this
    /// stage and everything after it are recomputed.
    async fn restore<T: DeserializeOwned>(
        &self,
        run: &mut Run,
        stage: PipelineStage,
        restorable: &mut usize,
    ) -> Option<T> {
        let checkpoint = stage.checkpoint()?;
        if checkpoint.index() >= *restorable {
            return None;
        }
        let store = self.checkpoints.as_ref()?;

        match store.load_data::<T>(run.task_id.as_str(), checkpoint).await {
            Some(data) => {
                info!(task_id = %run.task_id, stage = %stage, "Stage restored from checkpoint");
                run.resumed_after = Some(checkpoint);
                run.progress
                    .scoped(stage.band(run.variant))
                    .send(100.0, &format!("Restored {stage}"));
                self.events.broadcast(
                    &run.task_id,
                    EventPayload::StageCompleted {
                        stage: stage.name().to_string(),
                    },
                );
                Some(data)
            }
            None => {
                warn!(
                    task_id = %run.task_id,
                    stage = %stage,
                    "Checkpoint unavailable; recomputing from this stage"
                );
                *restorable = checkpoint.index();
                None
            }
        }
    }

    async fn archive_checkpoints(&self, task_id: &TaskId) {
        let Some(store) = &self.checkpoints else {
            return;
        };
        if let Err(e) = store
            .archive(task_id.as_str(), &self.config.checkpoints.archive_dir)
            .await
        {
            warn!(task_id = %task_id, error = %e, "Failed to archive checkpoints");
        }
    }
}

/// Averages per-scene sub-progress into one stage-level sender.
///
/// Once closed, per-scene senders go quiet, so a unit that outlives its
/// stage cannot move the run's progress.
struct SceneFanout {
    slots: Arc<Mutex<Vec<f64>>>,
    stage: ProgressSender,
    closed: Arc<AtomicBool>,
}

impl SceneFanout {
    fn new(scenes: usize, stage: ProgressSender) -> Self {
        Self {
            slots: Arc::new(Mutex::new(vec![0.0; scenes])),
            stage,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn sender(&self, index: usize) -> ProgressSender {
        let slots = self.slots.clone();
        let stage = self.stage.clone();
        let closed = self.closed.clone();
        ProgressSender::new(move |percent, message| {
            if closed.load(Ordering::Acquire) {
                return;
            }
            let mean = record(&slots, index, percent);
            stage.send(mean, message);
        })
    }

    /// Settle one scene at 100%.
    fn finish(&self, index: usize, message: &str) {
        let mean = record(&self.slots, index, 100.0);
        self.stage.send(mean, message);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn record(slots: &Mutex<Vec<f64>>, index: usize, percent: f64) -> f64 {
    let mut slots = slots.lock();
    if let Some(slot) = slots.get_mut(index) {
        *slot = percent.clamp(0.0, 100.0);
    }
    if slots.is_empty() {
        return 100.0;
    }
    slots.iter().sum::<f64>() / slots.len() as f64
}

fn failed_ids(outcomes: &[SceneOutcome]) -> Vec<String> {
    outcomes
        .iter()
        .filter(|outcome| !outcome.success)
        .map(|outcome| outcome.scene_id.clone())
        .collect()
}

fn stage_error(stage: PipelineStage, e: Error) -> Error {
    match e {
        Error::Stage { .. } => e,
        other => Error::stage(stage.name(), other.to_string()),
    }
}

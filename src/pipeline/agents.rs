//! Collaborator interfaces consumed by the [`Coordinator`](super::Coordinator).
//!
//! Each trait wraps one external generative or media-processing service.
//! Every call receives a [`ProgressSender`] on a `0..100` scale; the
//! coordinator rebases it into the caller's overall timeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reelforge_common::Result;
use reelforge_exec::ProgressSender;

use super::types::{Character, CharacterReference, ReferenceSet, Scene, Script};

/// Input for one per-scene image.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub scene: Scene,
    /// References for the characters in this scene; empty for text-only prompting.
    pub references: Vec<CharacterReference>,
    pub base_image: Option<PathBuf>,
    pub output: PathBuf,
    pub width: u32,
    pub height: u32,
}

/// Input for one per-scene video clip.
#[derive(Debug, Clone)]
pub struct VideoRequest {
    pub scene_id: String,
    pub image: PathBuf,
    pub prompt: String,
    pub duration_secs: f64,
    pub fps: u32,
    pub output: PathBuf,
}

/// Input for the final composition.
#[derive(Debug, Clone)]
pub struct CompositionRequest {
    pub title: String,
    /// Clips in playback order.
    pub clips: Vec<PathBuf>,
    pub output: PathBuf,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
}

#[async_trait]
pub trait ScriptParser: Send + Sync {
    async fn parse(&self, script: &Path, progress: ProgressSender) -> Result<Script>;
}

#[async_trait]
pub trait CharacterReferenceAgent: Send + Sync {
    /// Produce reference images for `characters`, deriving them from
    /// `base_image` when one is given.
    async fn generate(
        &self,
        characters: &[Character],
        base_image: Option<&Path>,
        output_dir: &Path,
        progress: ProgressSender,
    ) -> Result<ReferenceSet>;
}

#[async_trait]
pub trait ImageAgent: Send + Sync {
    async fn generate(&self, request: ImageRequest, progress: ProgressSender) -> Result<PathBuf>;
}

#[async_trait]
pub trait VideoAgent: Send + Sync {
    async fn generate(&self, request: VideoRequest, progress: ProgressSender) -> Result<PathBuf>;
}

#[async_trait]
pub trait Composer: Send + Sync {
    async fn compose(&self, request: CompositionRequest, progress: ProgressSender) -> Result<PathBuf>;
}

/// The full set of collaborators a coordinator drives.
#[derive(Clone)]
pub struct Agents {
    pub parser: Arc<dyn ScriptParser>,
    pub references: Arc<dyn CharacterReferenceAgent>,
    pub images: Arc<dyn ImageAgent>,
    pub videos: Arc<dyn VideoAgent>,
    pub composer: Arc<dyn Composer>,
}

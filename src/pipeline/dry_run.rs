//! Collaborators that plan outputs without calling generative services.
//!
//! The parser is real: it reads a JSON script, or a plain-text script where
//! `# ` starts the title, `@ Name: description` declares a character, and
//! every other blank-line separated block is a scene. The other agents log
//! what they would produce and return the planned paths.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reelforge_common::{Error, Result};
use reelforge_exec::ProgressSender;
use tracing::info;

use super::agents::{
    Agents, CharacterReferenceAgent, Composer, CompositionRequest, ImageAgent, ImageRequest,
    ScriptParser, VideoAgent, VideoRequest,
};
use super::types::{
    Character, CharacterReference, ReferenceProvenance, ReferenceSet, Scene, Script,
};

/// All collaborators in dry-run form.
pub fn dry_run_agents() -> Agents {
    Agents {
        parser: Arc::new(TextScriptParser),
        references: Arc::new(DryRunReferences),
        images: Arc::new(DryRunImages),
        videos: Arc::new(DryRunVideos),
        composer: Arc::new(DryRunComposer),
    }
}

pub struct TextScriptParser;

#[async_trait]
impl ScriptParser for TextScriptParser {
    async fn parse(&self, script: &Path, progress: ProgressSender) -> Result<Script> {
        let content = tokio::fs::read_to_string(script).await.map_err(|e| {
            Error::Validation(format!("cannot read script {}: {e}", script.display()))
        })?;
        progress.send(50.0, "Script loaded");

        let parsed = if script.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content)?
        } else {
            parse_text(&content, &default_title(script))
        };
        progress.send(100.0, "Script parsed");
        Ok(parsed)
    }
}

fn default_title(script: &Path) -> String {
    script
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "untitled".to_string())
}

/// Parse the plain-text script format.
pub fn parse_text(content: &str, default_title: &str) -> Script {
    let mut title = None;
    let mut characters = Vec::new();
    let mut blocks: Vec<Vec<&str>> = vec![Vec::new()];

    for line in content.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("# ") {
            title.get_or_insert_with(|| rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix('@') {
            let (name, description) = rest.split_once(':').unwrap_or((rest, ""));
            characters.push(Character {
                name: name.trim().to_string(),
                description: description.trim().to_string(),
            });
        } else if line.is_empty() {
            if blocks.last().is_some_and(|b| !b.is_empty()) {
                blocks.push(Vec::new());
            }
        } else if let Some(block) = blocks.last_mut() {
            block.push(line);
        }
    }

    let scenes = blocks
        .into_iter()
        .filter(|block| !block.is_empty())
        .enumerate()
        .map(|(n, block)| {
            let description = block.join(" ");
            let in_scene = characters
                .iter()
                .filter(|c| description.contains(c.name.as_str()))
                .map(|c| c.name.clone())
                .collect();
            Scene {
                id: format!("scene-{:02}", n + 1),
                description,
                prompt: None,
                duration_secs: None,
                characters: in_scene,
            }
        })
        .collect();

    Script {
        title: title.unwrap_or_else(|| default_title.to_string()),
        scenes,
        characters,
    }
}

pub struct DryRunReferences;

#[async_trait]
impl CharacterReferenceAgent for DryRunReferences {
    async fn generate(
        &self,
        characters: &[Character],
        base_image: Option<&Path>,
        output_dir: &Path,
        progress: ProgressSender,
    ) -> Result<ReferenceSet> {
        let provenance = if base_image.is_some() {
            ReferenceProvenance::CustomBase
        } else {
            ReferenceProvenance::Generated
        };

        let mut references = Vec::with_capacity(characters.len());
        for (n, character) in characters.iter().enumerate() {
            let image_path = output_dir.join(format!("{}.png", slug(&character.name)));
            info!(character = %character.name, path = %image_path.display(), "[DRY RUN] Would generate reference");
            references.push(CharacterReference {
                character: character.name.clone(),
                image_path,
                provenance,
            });
            progress.send(
                (n + 1) as f64 / characters.len() as f64 * 100.0,
                &format!("Reference for {}", character.name),
            );
        }
        Ok(ReferenceSet { references })
    }
}

pub struct DryRunImages;

#[async_trait]
impl ImageAgent for DryRunImages {
    async fn generate(&self, request: ImageRequest, progress: ProgressSender) -> Result<PathBuf> {
        info!(
            scene = %request.scene.id,
            references = request.references.len(),
            size = %format!("{}x{}", request.width, request.height),
            path = %request.output.display(),
            "[DRY RUN] Would generate scene image"
        );
        progress.send(100.0, &format!("Image for {}", request.scene.id));
        Ok(request.output)
    }
}

pub struct DryRunVideos;

#[async_trait]
impl VideoAgent for DryRunVideos {
    async fn generate(&self, request: VideoRequest, progress: ProgressSender) -> Result<PathBuf> {
        info!(
            scene = %request.scene_id,
            image = %request.image.display(),
            duration_secs = request.duration_secs,
            path = %request.output.display(),
            "[DRY RUN] Would generate scene clip"
        );
        progress.send(100.0, &format!("Clip for {}", request.scene_id));
        Ok(request.output)
    }
}

pub struct DryRunComposer;

#[async_trait]
impl Composer for DryRunComposer {
    async fn compose(&self, request: CompositionRequest, progress: ProgressSender) -> Result<PathBuf> {
        info!(
            title = %request.title,
            clips = request.clips.len(),
            fps = request.fps,
            path = %request.output.display(),
            "[DRY RUN] Would compose final video"
        );
        progress.send(100.0, "Composition planned");
        Ok(request.output)
    }
}

fn slug(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect()
}

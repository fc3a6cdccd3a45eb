//! Data carried between pipeline stages.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A parsed script: an ordered list of scenes plus the characters in them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub title: String,
    pub scenes: Vec<Scene>,
    #[serde(default)]
    pub characters: Vec<Character>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    pub description: String,
    /// Generation prompt; falls back to `description` when absent.
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    /// Names of characters appearing in this scene.
    #[serde(default)]
    pub characters: Vec<String>,
}

impl Scene {
    pub fn prompt(&self) -> &str {
        self.prompt.as_deref().unwrap_or(&self.description)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Where a character reference image came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceProvenance {
    /// Handed in by the caller.
    Supplied,
    /// Derived from a caller-provided base image.
    CustomBase,
    /// Generated from the character description alone.
    Generated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterReference {
    pub character: String,
    pub image_path: PathBuf,
    pub provenance: ReferenceProvenance,
}

/// Reference images keyed by character. Empty means text-only prompting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceSet {
    pub references: Vec<CharacterReference>,
}

impl ReferenceSet {
    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    /// References for the characters appearing in `scene`.
    pub fn for_scene(&self, scene: &Scene) -> Vec<CharacterReference> {
        self.references
            .iter()
            .filter(|r| scene.characters.iter().any(|name| *name == r.character))
            .cloned()
            .collect()
    }

    pub fn count(&self, provenance: ReferenceProvenance) -> usize {
        self.references
            .iter()
            .filter(|r| r.provenance == provenance)
            .count()
    }
}

/// How a scene's still image was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    /// The caller supplied the image; no agent call was made.
    Provided,
    /// Generated from a custom base image.
    CustomBase,
    /// Generated from the prompt.
    Generated,
}

/// Result of one per-scene unit (image or video).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneOutcome {
    pub scene_id: String,
    pub success: bool,
    pub output: Option<PathBuf>,
    /// Set on image outcomes.
    #[serde(default)]
    pub source: Option<ImageSource>,
    pub error: Option<String>,
}

impl SceneOutcome {
    pub fn succeeded(scene_id: impl Into<String>, output: PathBuf, source: Option<ImageSource>) -> Self {
        Self {
            scene_id: scene_id.into(),
            success: true,
            output: Some(output),
            source,
            error: None,
        }
    }

    pub fn failed(scene_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            scene_id: scene_id.into(),
            success: false,
            output: None,
            source: None,
            error: Some(error.into()),
        }
    }
}

/// One scene of the quick variant: a ready image plus its video parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickScene {
    pub scene_id: String,
    pub image: PathBuf,
    pub prompt: String,
    #[serde(default)]
    pub duration_secs: Option<f64>,
}

/// Payload of the `image_generation` checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageStageSnapshot {
    pub references: ReferenceSet,
    pub images: Vec<SceneOutcome>,
}

/// Payload of the `video_generation` checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoStageSnapshot {
    pub videos: Vec<SceneOutcome>,
}

/// Payload of the `composition` checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionSnapshot {
    pub output_video: PathBuf,
}

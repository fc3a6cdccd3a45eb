use reelforge_exec::{CheckpointStage, ProgressBand};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which workflow a run follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// parse -> references -> images -> videos -> composition -> metadata
    Full,
    /// videos -> composition -> metadata, from caller-supplied images
    Quick,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Full => "full",
            Variant::Quick => "quick",
        }
    }

    pub fn stages(&self) -> &'static [PipelineStage] {
        match self {
            Variant::Full => &PipelineStage::ALL,
            Variant::Quick => &[
                PipelineStage::Videos,
                PipelineStage::Composition,
                PipelineStage::Metadata,
            ],
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical stage of a run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Parse,
    CharacterReferences,
    Images,
    Videos,
    Composition,
    Metadata,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 6] = [
        PipelineStage::Parse,
        PipelineStage::CharacterReferences,
        PipelineStage::Images,
        PipelineStage::Videos,
        PipelineStage::Composition,
        PipelineStage::Metadata,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PipelineStage::Parse => "parse",
            PipelineStage::CharacterReferences => "character_references",
            PipelineStage::Images => "images",
            PipelineStage::Videos => "videos",
            PipelineStage::Composition => "composition",
            PipelineStage::Metadata => "metadata",
        }
    }

    /// The slice of the overall `0..100` scale reserved for this stage.
    pub fn band(&self, variant: Variant) -> ProgressBand {
        match (variant, self) {
            (Variant::Quick, PipelineStage::Videos) => ProgressBand::new(0.0, 60.0),
            (Variant::Quick, PipelineStage::Composition) => ProgressBand::new(60.0, 95.0),
            (_, PipelineStage::Parse) => ProgressBand::new(0.0, 5.0),
            (_, PipelineStage::CharacterReferences) => ProgressBand::new(5.0, 15.0),
            (_, PipelineStage::Images) => ProgressBand::new(15.0, 45.0),
            (_, PipelineStage::Videos) => ProgressBand::new(45.0, 75.0),
            (_, PipelineStage::Composition) => ProgressBand::new(75.0, 95.0),
            (_, PipelineStage::Metadata) => ProgressBand::new(95.0, 100.0),
        }
    }

    /// The checkpoint written when this stage finishes, if any.
    ///
    /// Character references have no checkpoint of their own; they are
    /// saved with the image stage.
    pub fn checkpoint(&self) -> Option<CheckpointStage> {
        match self {
            PipelineStage::Parse => Some(CheckpointStage::Parsing),
            PipelineStage::Images => Some(CheckpointStage::ImageGeneration),
            PipelineStage::Videos => Some(CheckpointStage::VideoGeneration),
            PipelineStage::Composition => Some(CheckpointStage::Composition),
            PipelineStage::CharacterReferences | PipelineStage::Metadata => None,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

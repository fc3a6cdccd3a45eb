pub mod agents;
pub mod coordinator;
pub mod dry_run;
pub mod manifest;
pub mod report;
pub mod stage;
pub mod types;

pub use agents::{
    Agents, CharacterReferenceAgent, Composer, CompositionRequest, ImageAgent, ImageRequest,
    ScriptParser, VideoAgent, VideoRequest,
};
pub use coordinator::{Coordinator, QuickRunRequest, RunOutcome, RunRequest};
pub use manifest::RunManifest;
pub use report::EventBusObserver;
pub use stage::{PipelineStage, Variant};
pub use types::*;

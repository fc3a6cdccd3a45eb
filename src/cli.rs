use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "reelforge")]
#[command(author, version, about = "Staged AI video generation with resumable checkpoints")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a script through the full generation pipeline (dry-run collaborators)
    Run {
        /// Script file (.json or plain text)
        #[arg(required = true)]
        script: PathBuf,

        /// Task id for this run (generated if omitted)
        #[arg(long)]
        task_id: Option<String>,

        /// Resume the run from its checkpoints (requires --task-id)
        #[arg(long, requires = "task_id")]
        resume: bool,

        /// Directory of ready scene images named <scene-id>.<ext>
        #[arg(long)]
        images: Option<PathBuf>,

        /// Directory of character reference images named <character>.<ext>
        #[arg(long)]
        references: Option<PathBuf>,

        /// Base image to derive character references and scene images from
        #[arg(long)]
        base_image: Option<PathBuf>,
    },

    /// Inspect and manage stage checkpoints
    Checkpoints {
        #[command(subcommand)]
        command: CheckpointCommands,
    },

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

#[derive(Subcommand)]
pub enum CheckpointCommands {
    /// List the checkpoints of a task
    List {
        task_id: String,
    },

    /// List every task that has checkpoints
    Tasks,

    /// Show where a task would resume
    ResumeStage {
        task_id: String,
    },

    /// Delete a task's checkpoints
    Clear {
        task_id: String,

        /// Only delete this stage
        #[arg(long)]
        stage: Option<String>,
    },

    /// Move a task's checkpoints to the archive directory
    Archive {
        task_id: String,
    },

    /// Move a task's checkpoints back from the archive directory
    Restore {
        task_id: String,
    },

    /// Delete checkpoints older than the retention period
    Cleanup {
        /// Override the configured retention in days
        #[arg(long)]
        max_age_days: Option<u64>,
    },
}

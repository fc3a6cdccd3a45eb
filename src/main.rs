mod cli;

use reelforge::config;
use reelforge::pipeline::{dry_run, Coordinator, RunRequest};
use reelforge_common::events::{Event, EventBus, EventPayload};
use reelforge_common::TaskId;
use reelforge_exec::{CheckpointStage, CheckpointStore};

use anyhow::{Context, Result};
use clap::Parser;
use cli::{CheckpointCommands, Cli, Commands};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "reelforge=trace,reelforge_exec=debug,reelforge_common=debug".to_string()
        } else {
            "reelforge=info,reelforge_exec=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            script,
            task_id,
            resume,
            images,
            references,
            base_image,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_script(
                &script,
                cli.config.as_deref(),
                task_id,
                resume,
                images,
                references,
                base_image,
            ))
        }
        Commands::Checkpoints { command } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(manage_checkpoints(command, cli.config.as_deref()))
        }
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("reelforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run_script(
    script: &Path,
    config_path: Option<&Path>,
    task_id: Option<String>,
    resume: bool,
    images: Option<PathBuf>,
    references: Option<PathBuf>,
    base_image: Option<PathBuf>,
) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;

    if !script.exists() {
        anyhow::bail!("Script does not exist: {:?}", script);
    }
    if let Some(base) = &base_image {
        if !base.exists() {
            anyhow::bail!("Base image does not exist: {:?}", base);
        }
    }

    let provided_images = match images {
        Some(dir) => collect_images(&dir).await?,
        None => HashMap::new(),
    };
    let provided_references = match references {
        Some(dir) => collect_images(&dir).await?,
        None => HashMap::new(),
    };

    let events = Arc::new(EventBus::default());
    let renderer = tokio::spawn(render_events(events.subscribe()));

    let coordinator = Coordinator::new(config, dry_run::dry_run_agents(), events);
    let request = RunRequest {
        script: script.to_path_buf(),
        task_id: task_id.map(TaskId::from),
        resume,
        provided_images,
        provided_references,
        base_image,
        output_name: None,
    };

    let result = coordinator.run(request).await;
    coordinator.shutdown().await;
    if let Err(e) = renderer.await {
        tracing::debug!("Console renderer ended abnormally: {}", e);
    }

    let outcome = result?;
    println!();
    println!("Run complete: {}", outcome.task_id);
    println!("Output: {}", outcome.output_video.display());
    if let Some(path) = &outcome.manifest_path {
        println!("Manifest: {}", path.display());
    }
    for warning in &outcome.warnings {
        println!("Warning: {}", warning);
    }

    Ok(())
}

/// Map `<name>.<ext>` image files in `dir` to their stems (scene ids or
/// character names).
async fn collect_images(dir: &Path) -> Result<HashMap<String, PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read image directory: {:?}", dir))?;

    let mut images = HashMap::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if !is_image {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            images.insert(stem.to_string(), path.clone());
        }
    }

    tracing::info!("Found {} provided images in {:?}", images.len(), dir);
    Ok(images)
}

/// Print run events to the console until the run ends.
async fn render_events(mut rx: broadcast::Receiver<Event>) {
    loop {
        match rx.recv().await {
            Ok(event) => match event.payload {
                EventPayload::RunStarted { variant } => {
                    println!("Run {} started ({} pipeline)", event.task_id, variant);
                }
                EventPayload::StageStarted { stage } => println!("==> {}", stage),
                EventPayload::StageCompleted { .. } => {}
                EventPayload::Progress {
                    percent, message, ..
                } => println!("[{:5.1}%] {}", percent, message),
                EventPayload::Warning { message } => println!("warning: {}", message),
                EventPayload::RunCompleted { .. } | EventPayload::RunFailed { .. } => break,
            },
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!("Console renderer skipped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn manage_checkpoints(command: CheckpointCommands, config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let store = CheckpointStore::new(&config.checkpoints.dir);

    match command {
        CheckpointCommands::List { task_id } => {
            let stages = store.list_stages(&task_id).await;
            if stages.is_empty() {
                println!("No checkpoints for {}", task_id);
            }
            for summary in stages {
                println!(
                    "{:<18} {}  {}",
                    summary.stage,
                    summary.timestamp.to_rfc3339(),
                    summary.path.display()
                );
            }
        }
        CheckpointCommands::Tasks => {
            let tasks = store.list_tasks().await;
            if tasks.is_empty() {
                println!("No checkpointed tasks in {:?}", store.dir());
            }
            for task in tasks {
                println!("{}", task);
            }
        }
        CheckpointCommands::ResumeStage { task_id } => {
            println!("{}", store.resume_stage(&task_id).await);
        }
        CheckpointCommands::Clear { task_id, stage } => {
            let stage = stage
                .map(|s| s.parse::<CheckpointStage>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let removed = store.clear(&task_id, stage).await?;
            println!("Removed {} checkpoint(s) for {}", removed, task_id);
        }
        CheckpointCommands::Archive { task_id } => {
            let moved = store
                .archive(&task_id, &config.checkpoints.archive_dir)
                .await?;
            println!(
                "Archived {} checkpoint(s) to {:?}",
                moved, config.checkpoints.archive_dir
            );
        }
        CheckpointCommands::Restore { task_id } => {
            let moved = store
                .restore(&task_id, &config.checkpoints.archive_dir)
                .await?;
            println!("Restored {} checkpoint(s) for {}", moved, task_id);
        }
        CheckpointCommands::Cleanup { max_age_days } => {
            let days = max_age_days.unwrap_or(config.checkpoints.retention_days);
            let removed = store
                .cleanup_older_than(Duration::from_secs(days * 24 * 60 * 60))
                .await?;
            println!("Removed {} checkpoint(s) older than {} day(s)", removed, days);
        }
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            config::Config::default()
        }
    };

    println!(
        "  Queue: {} workers (priority ordering {})",
        config.queue.workers,
        if config.queue.priority { "on" } else { "off" }
    );
    println!(
        "  Checkpoints: {} ({:?})",
        if config.checkpoints.enabled { "enabled" } else { "disabled" },
        config.checkpoints.dir
    );
    println!("  Output: {:?}", config.pipeline.output_dir);
    println!(
        "  Video: {}x{} @ {} fps",
        config.video.width, config.video.height, config.video.fps
    );

    Ok(())
}

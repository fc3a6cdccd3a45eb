mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = [
        "./reelforge.toml",
        "./config.toml",
        "~/.config/reelforge/config.toml",
        "/etc/reelforge/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            tracing::debug!("Using config file {:?}", path);
            return load_config(path);
        }
    }

    Ok(Config::default())
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.queue.workers == 0 {
        anyhow::bail!("Queue workers must be at least 1");
    }

    if config.video.fps == 0 {
        anyhow::bail!("Video fps cannot be 0");
    }

    if config.video.width == 0 || config.video.height == 0 {
        anyhow::bail!(
            "Video dimensions must be non-zero (got {}x{})",
            config.video.width,
            config.video.height
        );
    }

    if !(config.video.default_scene_secs > 0.0) {
        anyhow::bail!(
            "Default scene duration must be positive (got {})",
            config.video.default_scene_secs
        );
    }

    if config.checkpoints.enabled && !config.checkpoints.dir.exists() {
        tracing::warn!(
            "Checkpoint directory does not exist yet: {:?}",
            config.checkpoints.dir
        );
    }

    Ok(())
}

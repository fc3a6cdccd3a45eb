//! CLI end-to-end tests
//!
//! Tests for the reelforge command-line interface. Runs use the dry-run
//! collaborators, so no models or encoders are needed.

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::{tempdir, TempDir};

/// Get a command for the reelforge binary, run from `dir`
#[allow(deprecated)]
fn reelforge_cmd(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("reelforge").unwrap();
    cmd.current_dir(dir).env_remove("RUST_LOG");
    cmd
}

const SCRIPT: &str = "# Harbor Lights

@ Ada: a retired sea captain with a grey beard

Ada walks along the pier at dusk.

Lanterns flicker on the fishing boats.

Ada lights the lighthouse lamp.
";

/// A temp workspace holding a config that keeps every path inside it.
fn workspace() -> (TempDir, PathBuf) {
    let dir = tempdir().unwrap();
    let root = dir.path().display().to_string().replace('\\', "/");
    let config = format!(
        r#"
[queue]
workers = 2
poll_interval_ms = 10

[checkpoints]
dir = "{root}/checkpoints"
archive_dir = "{root}/archive"

[pipeline]
output_dir = "{root}/output"
"#
    );
    let config_path = dir.path().join("reelforge.toml");
    fs::write(&config_path, config).unwrap();
    fs::write(dir.path().join("harbor.txt"), SCRIPT).unwrap();
    (dir, config_path)
}

fn run_demo(dir: &Path, config: &Path, task_id: &str) {
    reelforge_cmd(dir)
        .arg("--config")
        .arg(config)
        .args(["run", "harbor.txt", "--task-id", task_id])
        .assert()
        .success();
}

#[test]
fn test_cli_no_args_shows_help() {
    let dir = tempdir().unwrap();
    reelforge_cmd(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_cli_help_flag() {
    let dir = tempdir().unwrap();
    reelforge_cmd(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("reelforge"))
        .stdout(predicate::str::contains("checkpoints"));
}

#[test]
fn test_cli_version_flag() {
    let dir = tempdir().unwrap();
    reelforge_cmd(dir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("reelforge"));
}

#[test]
fn test_cli_version_command() {
    let dir = tempdir().unwrap();
    reelforge_cmd(dir.path())
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_cli_validate_default_config() {
    let dir = tempdir().unwrap();
    reelforge_cmd(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("using defaults"))
        .stdout(predicate::str::contains("4 workers"));
}

#[test]
fn test_cli_validate_valid_config() {
    let (dir, config) = workspace();
    reelforge_cmd(dir.path())
        .arg("validate")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"))
        .stdout(predicate::str::contains("2 workers"));
}

#[test]
fn test_cli_validate_rejects_zero_workers() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("bad.toml");
    fs::write(&config, "[queue]\nworkers = 0\n").unwrap();

    reelforge_cmd(dir.path())
        .arg("validate")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("workers"));
}

#[test]
fn test_cli_validate_rejects_malformed_toml() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("broken.toml");
    fs::write(&config, "[video\nfps = ").unwrap();

    reelforge_cmd(dir.path())
        .arg("validate")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse config file"));
}

#[test]
fn test_cli_run_writes_manifest() {
    let (dir, config) = workspace();

    reelforge_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["run", "harbor.txt", "--task-id", "harbor"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Run complete: harbor"))
        .stdout(predicate::str::contains("harbor.mp4"))
        .stdout(predicate::str::contains("Manifest:"));

    let manifest_path = dir.path().join("output").join("harbor.json");
    let manifest: serde_json::Value =
        serde_json::from_slice(&fs::read(manifest_path).unwrap()).unwrap();
    assert_eq!(manifest["title"], "Harbor Lights");
    assert_eq!(manifest["scene_count"], 3);
    assert_eq!(manifest["character_count"], 1);
    assert_eq!(manifest["variant"], "full");
}

#[test]
fn test_cli_run_with_supplied_references() {
    let (dir, config) = workspace();
    let refs = dir.path().join("refs");
    fs::create_dir_all(&refs).unwrap();
    fs::write(refs.join("Ada.png"), b"png").unwrap();

    reelforge_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["run", "harbor.txt", "--task-id", "refs", "--references"])
        .arg(&refs)
        .assert()
        .success();

    let manifest: serde_json::Value =
        serde_json::from_slice(&fs::read(dir.path().join("output").join("refs.json")).unwrap())
            .unwrap();
    assert_eq!(manifest["references"]["supplied"], 1);
    assert_eq!(manifest["references"]["generated"], 0);
}

#[test]
fn test_cli_run_rejects_path_like_task_id() {
    let (dir, config) = workspace();
    reelforge_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["run", "harbor.txt", "--task-id", "../escape"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid task id"));
    assert!(!dir.path().join("escape.mp4").exists());
}

#[test]
fn test_cli_run_missing_script_fails() {
    let (dir, config) = workspace();
    reelforge_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["run", "nowhere.txt"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Script does not exist"));
}

#[test]
fn test_cli_resume_requires_task_id() {
    let (dir, config) = workspace();
    reelforge_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["run", "harbor.txt", "--resume"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--task-id"));
}

#[test]
fn test_cli_resume_completed_run() {
    let (dir, config) = workspace();
    run_demo(dir.path(), &config, "again");

    reelforge_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["run", "harbor.txt", "--task-id", "again", "--resume"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Run complete: again"));
}

#[test]
fn test_cli_checkpoints_after_run() {
    let (dir, config) = workspace();
    run_demo(dir.path(), &config, "harbor");

    reelforge_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["checkpoints", "tasks"])
        .assert()
        .success()
        .stdout(predicate::str::contains("harbor"));

    reelforge_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["checkpoints", "list", "harbor"])
        .assert()
        .success()
        .stdout(predicate::str::contains("parsing"))
        .stdout(predicate::str::contains("image_generation"))
        .stdout(predicate::str::contains("video_generation"))
        .stdout(predicate::str::contains("composition"));

    reelforge_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["checkpoints", "resume-stage", "harbor"])
        .assert()
        .success()
        .stdout(predicate::str::contains("completed"));
}

#[test]
fn test_cli_checkpoints_clear_single_stage() {
    let (dir, config) = workspace();
    run_demo(dir.path(), &config, "harbor");

    reelforge_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["checkpoints", "clear", "harbor", "--stage", "composition"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 1 checkpoint(s)"));

    reelforge_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["checkpoints", "resume-stage", "harbor"])
        .assert()
        .success()
        .stdout(predicate::str::contains("composition"));
}

#[test]
fn test_cli_checkpoints_clear_unknown_stage_fails() {
    let (dir, config) = workspace();
    reelforge_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["checkpoints", "clear", "harbor", "--stage", "mastering"])
        .assert()
        .failure();
}

#[test]
fn test_cli_checkpoints_archive_and_restore() {
    let (dir, config) = workspace();
    run_demo(dir.path(), &config, "harbor");

    reelforge_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["checkpoints", "archive", "harbor"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Archived 4 checkpoint(s)"));

    reelforge_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["checkpoints", "list", "harbor"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No checkpoints for harbor"));

    reelforge_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["checkpoints", "restore", "harbor"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Restored 4 checkpoint(s)"));
}

#[test]
fn test_cli_checkpoints_cleanup_keeps_recent() {
    let (dir, config) = workspace();
    run_demo(dir.path(), &config, "harbor");

    reelforge_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["checkpoints", "cleanup", "--max-age-days", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 0 checkpoint(s)"));
}

#[test]
fn test_cli_checkpoints_tasks_empty() {
    let (dir, config) = workspace();
    reelforge_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["checkpoints", "tasks"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No checkpointed tasks"));
}

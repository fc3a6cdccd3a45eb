//! File-backed checkpoint storage.
//!
//! Each record lives in `<dir>/<task_id>_<stage>.json`. Writes go through a
//! temporary sibling that is renamed into place, so a record is either the
//! previous version or the new one. Write failures are returned to the
//! caller; read failures (missing or corrupt files) degrade to "not found".

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use reelforge_common::{validate_task_id, Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tracing::{debug, info, warn};

use super::{CheckpointRecord, CheckpointStage, CheckpointSummary, ResumePoint};

const RECORD_EXTENSION: &str = "json";

/// Checkpoint store rooted at one directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Create a store rooted at `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist `data` as the `stage` checkpoint of `task_id`, replacing any
    /// earlier record for the same pair. Returns the record's path.
    pub async fn save<T: Serialize + ?Sized>(
        &self,
        task_id: &str,
        stage: CheckpointStage,
        data: &T,
        metadata: Option<serde_json::Value>,
    ) -> Result<PathBuf> {
        validate_task_id(task_id)?;

        let record = CheckpointRecord {
            task_id: task_id.to_string(),
            stage: stage.as_str().to_string(),
            timestamp: Utc::now(),
            data: serde_json::to_value(data)?,
            metadata,
        };
        let json = serde_json::to_string_pretty(&record)?;

        fs::create_dir_all(&self.dir).await.map_err(|e| {
            Error::Checkpoint(format!("failed to create {}: {e}", self.dir.display()))
        })?;

        let path = self.record_path(task_id, stage.as_str());
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .await
            .map_err(|e| Error::Checkpoint(format!("failed to write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &path).await.map_err(|e| {
            Error::Checkpoint(format!("failed to move checkpoint into {}: {e}", path.display()))
        })?;

        info!(task_id, stage = %stage, path = %path.display(), "Checkpoint saved");
        Ok(path)
    }

    /// Load the `stage` record of `task_id`, or its most recent record when
    /// `stage` is `None`.
    pub async fn load(
        &self,
        task_id: &str,
        stage: Option<CheckpointStage>,
    ) -> Option<CheckpointRecord> {
        if validate_task_id(task_id).is_err() {
            return None;
        }
        match stage {
            Some(stage) => {
                let record = read_record(&self.record_path(task_id, stage.as_str())).await?;
                (record.task_id == task_id).then_some(record)
            }
            None => self
                .records_for(task_id)
                .await
                .pop()
                .map(|(_, record)| record),
        }
    }

    /// Load and deserialize the payload of the `stage` record of `task_id`.
    pub async fn load_data<T: DeserializeOwned>(
        &self,
        task_id: &str,
        stage: CheckpointStage,
    ) -> Option<T> {
        let record = self.load(task_id, Some(stage)).await?;
        match serde_json::from_value(record.data) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(task_id, stage = %stage, error = %e, "Checkpoint payload unreadable");
                None
            }
        }
    }

    /// All records of `task_id`, oldest first.
    pub async fn list_stages(&self, task_id: &str) -> Vec<CheckpointSummary> {
        if validate_task_id(task_id).is_err() {
            return Vec::new();
        }
        self.records_for(task_id)
            .await
            .into_iter()
            .map(|(path, record)| CheckpointSummary {
                stage: record.stage,
                timestamp: record.timestamp,
                path,
            })
            .collect()
    }

    /// Whether a record exists for `task_id` (and `stage`, if given).
    pub async fn exists(&self, task_id: &str, stage: Option<CheckpointStage>) -> bool {
        if validate_task_id(task_id).is_err() {
            return false;
        }
        match stage {
            Some(stage) => fs::try_exists(self.record_path(task_id, stage.as_str()))
                .await
                .unwrap_or(false),
            None => !self.records_for(task_id).await.is_empty(),
        }
    }

    /// Delete the `stage` record of `task_id`, or all of its records.
    /// Returns the number of records removed.
    pub async fn clear(&self, task_id: &str, stage: Option<CheckpointStage>) -> Result<usize> {
        validate_task_id(task_id)?;

        let paths: Vec<PathBuf> = match stage {
            Some(stage) => {
                let path = self.record_path(task_id, stage.as_str());
                if fs::try_exists(&path).await.unwrap_or(false) {
                    vec![path]
                } else {
                    Vec::new()
                }
            }
            None => self
                .records_for(task_id)
                .await
                .into_iter()
                .map(|(path, _)| path)
                .collect(),
        };

        for path in &paths {
            fs::remove_file(path).await?;
        }
        debug!(task_id, removed = paths.len(), "Checkpoints cleared");
        Ok(paths.len())
    }

    /// Work out which stage an interrupted run of `task_id` should run next.
    pub async fn resume_stage(&self, task_id: &str) -> ResumePoint {
        let Some(latest) = self.load(task_id, None).await else {
            return ResumePoint::Fresh;
        };

        match latest.stage.parse::<CheckpointStage>() {
            Ok(stage) => match stage.next() {
                Some(next) => ResumePoint::Next(next),
                None => ResumePoint::Completed,
            },
            Err(_) => {
                warn!(task_id, stage = %latest.stage, "Latest checkpoint has an unknown stage");
                ResumePoint::Unknown(latest.stage)
            }
        }
    }

    /// Distinct task ids that have at least one readable record.
    pub async fn list_tasks(&self) -> Vec<String> {
        let mut tasks: Vec<String> = Vec::new();
        for path in self.record_files().await {
            if let Some(record) = read_record(&path).await {
                if !tasks.contains(&record.task_id) {
                    tasks.push(record.task_id);
                }
            }
        }
        tasks.sort();
        tasks
    }

    /// Move every record of `task_id` into `archive_dir`, unchanged.
    pub async fn archive(&self, task_id: &str, archive_dir: &Path) -> Result<usize> {
        validate_task_id(task_id)?;
        let moved = relocate_all(self, task_id, archive_dir).await?;
        info!(task_id, moved, archive = %archive_dir.display(), "Checkpoints archived");
        Ok(moved)
    }

    /// Move every record of `task_id` back from `archive_dir` into this store.
    pub async fn restore(&self, task_id: &str, archive_dir: &Path) -> Result<usize> {
        validate_task_id(task_id)?;
        let archive = CheckpointStore::new(archive_dir);
        let moved = relocate_all(&archive, task_id, &self.dir).await?;
        info!(task_id, moved, archive = %archive_dir.display(), "Checkpoints restored");
        Ok(moved)
    }

    /// Delete records of any task whose file is at least `max_age` old.
    pub async fn cleanup_older_than(&self, max_age: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;

        for path in self.record_files().await {
            let modified = match fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot read checkpoint age");
                    continue;
                }
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age >= max_age {
                fs::remove_file(&path).await?;
                removed += 1;
            }
        }

        info!(removed, max_age_secs = max_age.as_secs(), "Checkpoint retention sweep finished");
        Ok(removed)
    }

    fn record_path(&self, task_id: &str, stage: &str) -> PathBuf {
        self.dir
            .join(format!("{task_id}_{stage}.{RECORD_EXTENSION}"))
    }

    /// All record files in the store directory (any task).
    async fn record_files(&self) -> Vec<PathBuf> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut files = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION) {
                files.push(path);
            }
        }
        files
    }

    /// Every file belonging to `task_id`, readable or not. Readable records
    /// must name the task; unreadable ones must be named `<task_id>_<stage>`
    /// for a vocabulary stage.
    async fn task_files(&self, task_id: &str) -> Vec<PathBuf> {
        let prefix = format!("{task_id}_");
        let suffix = format!(".{RECORD_EXTENSION}");
        let mut files = Vec::new();

        for path in self.record_files().await {
            let Some(stage) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(&prefix))
                .and_then(|rest| rest.strip_suffix(&suffix))
                .map(str::to_string)
            else {
                continue;
            };
            let owned = match read_record(&path).await {
                Some(record) => record.task_id == task_id,
                None => stage.parse::<CheckpointStage>().is_ok(),
            };
            if owned {
                files.push(path);
            }
        }
        files
    }

    /// Readable records of `task_id`, oldest first. Ties on the timestamp
    /// are broken by vocabulary order so the later stage sorts last.
    async fn records_for(&self, task_id: &str) -> Vec<(PathBuf, CheckpointRecord)> {
        let prefix = format!("{task_id}_");
        let mut records = Vec::new();

        for path in self.record_files().await {
            let matches_prefix = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix));
            if !matches_prefix {
                continue;
            }
            if let Some(record) = read_record(&path).await {
                if record.task_id == task_id {
                    records.push((path, record));
                }
            }
        }

        records.sort_by(|(_, a), (_, b)| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| stage_rank(&a.stage).cmp(&stage_rank(&b.stage)))
        });
        records
    }
}

fn stage_rank(stage: &str) -> i64 {
    stage
        .parse::<CheckpointStage>()
        .map(|s| s.index() as i64)
        .unwrap_or(-1)
}

async fn read_record(path: &Path) -> Option<CheckpointRecord> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read checkpoint");
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt checkpoint ignored");
            None
        }
    }
}

async fn relocate_all(source: &CheckpointStore, task_id: &str, dest_dir: &Path) -> Result<usize> {
    let files = source.task_files(task_id).await;
    if files.is_empty() {
        return Ok(0);
    }

    fs::create_dir_all(dest_dir).await.map_err(|e| {
        Error::Checkpoint(format!("failed to create {}: {e}", dest_dir.display()))
    })?;

    for path in &files {
        let Some(name) = path.file_name() else {
            continue;
        };
        let dest = dest_dir.join(name);
        if fs::rename(path, &dest).await.is_err() {
            // Different filesystems: copy the bytes, then drop the source.
            fs::copy(path, &dest).await.map_err(|e| {
                Error::Checkpoint(format!("failed to copy {}: {e}", path.display()))
            })?;
            fs::remove_file(path).await?;
        }
    }
    Ok(files.len())
}

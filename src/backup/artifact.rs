// pgsync/src/backup/artifact.rs
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use regex::Regex;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

use crate::errors::SyncError;

/// An artifact younger than this suppresses a new fetch.
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Label stamped into new artifact names, in local time.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

const ARTIFACT_SUFFIX: &str = ".sql.gz";

/// One compressed dump of one database, as found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub database: String,
    /// Timestamp label taken from the file name.
    pub label: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

impl BackupArtifact {
    /// Reads size and modification time of an artifact file.
    pub fn from_path(database: &str, label: &str, path: &Path) -> Result<Self> {
        let metadata = fs::metadata(path)
            .with_context(|| format!("Failed to read metadata of {}", path.display()))?;
        Ok(BackupArtifact {
            database: database.to_string(),
            label: label.to_string(),
            path: path.to_path_buf(),
            size: metadata.len(),
            modified: metadata
                .modified()
                .with_context(|| format!("No modification time for {}", path.display()))?,
        })
    }

    /// Age relative to `now`. Timestamps in the future count as age zero.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.modified).unwrap_or_default()
    }
}

pub fn artifact_file_name(database: &str, label: &str) -> String {
    format!("{database}_{label}{ARTIFACT_SUFFIX}")
}

pub fn artifact_path(backup_dir: &Path, database: &str, label: &str) -> PathBuf {
    backup_dir.join(artifact_file_name(database, label))
}

/// `<database>_<label>.sql.gz` where the label is digits and underscores.
/// The label has to start with a digit, so `app` never claims the artifacts
/// of `app_users`.
fn artifact_name_pattern(database: &str) -> Result<Regex> {
    let pattern = format!(r"^{}_(\d[\d_]*)\.sql\.gz$", regex::escape(database));
    Regex::new(&pattern).with_context(|| format!("Invalid artifact pattern for {database}"))
}

/// All non-empty artifacts of `database` directly inside `backup_dir`.
/// A missing directory has no artifacts.
pub fn list_artifacts(backup_dir: &Path, database: &str) -> Result<Vec<BackupArtifact>> {
    if !backup_dir.is_dir() {
        return Ok(Vec::new());
    }
    let pattern = artifact_name_pattern(database)?;

    let mut artifacts = Vec::new();
    for entry in WalkDir::new(backup_dir).min_depth(1).max_depth(1) {
        let entry = entry
            .with_context(|| format!("Failed to scan backup directory: {}", backup_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        let Some(captures) = pattern.captures(name) else {
            continue;
        };

        let artifact = BackupArtifact::from_path(database, &captures[1], entry.path())?;
        // zero bytes means the fetch failed
        if artifact.size > 0 {
            artifacts.push(artifact);
        }
    }
    Ok(artifacts)
}

/// The artifact with the latest modification time. Ties go to the later label.
pub fn latest_artifact(backup_dir: &Path, database: &str) -> Result<Option<BackupArtifact>> {
    Ok(list_artifacts(backup_dir, database)?
        .into_iter()
        .max_by(|a, b| {
            a.modified
                .cmp(&b.modified)
                .then_with(|| a.label.cmp(&b.label))
        }))
}

/// The latest artifact if it is still inside the freshness window.
pub fn fresh_artifact(
    backup_dir: &Path,
    database: &str,
    now: SystemTime,
) -> Result<Option<BackupArtifact>> {
    Ok(latest_artifact(backup_dir, database)?
        .filter(|artifact| artifact.age(now) < FRESHNESS_WINDOW))
}

/// Checks that a fetched file is a usable dump: non-empty, a complete gzip
/// stream, and not an empty payload (what `gzip` emits when the dump on the
/// other end of the pipe produced nothing). Returns the decompressed size.
pub fn verify_artifact(database: &str, path: &Path) -> Result<u64> {
    let size = fs::metadata(path)
        .with_context(|| format!("Failed to read metadata of {}", path.display()))?
        .len();
    let empty = || SyncError::EmptyArtifact {
        database: database.to_string(),
        path: path.to_path_buf(),
    };
    if size == 0 {
        return Err(empty().into());
    }

    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut decoder = GzDecoder::new(BufReader::new(file));
    let payload = io::copy(&mut decoder, &mut io::sink()).map_err(|e| SyncError::RemoteFetch {
        database: database.to_string(),
        reason: format!("{} is not a valid gzip stream: {e}", path.display()),
    })?;
    if payload == 0 {
        return Err(empty().into());
    }
    Ok(payload)
}

/// What a bulk clean removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanSummary {
    pub existed: bool,
    pub files: u64,
    pub bytes: u64,
}

/// Deletes the whole backup directory tree. An absent directory is already
/// clean.
pub fn remove_backup_dir(backup_dir: &Path) -> Result<CleanSummary> {
    if !backup_dir.exists() {
        return Ok(CleanSummary::default());
    }

    let mut summary = CleanSummary {
        existed: true,
        ..CleanSummary::default()
    };
    for entry in WalkDir::new(backup_dir).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            summary.files += 1;
            summary.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }

    fs::remove_dir_all(backup_dir).with_context(|| {
        format!("Failed to remove backup directory: {}", backup_dir.display())
    })?;
    Ok(summary)
}

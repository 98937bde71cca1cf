// pgsync/src/backup/logic.rs
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

use super::artifact::{self, BackupArtifact};
use super::remote;
use crate::config::RunConfig;
use crate::errors::SyncError;
use crate::utils::command::{CommandRunner, CommandSpec, ignore_outcome, shell_quote};

/// What the fetcher did for one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A fresh artifact already existed.
    Reused(BackupArtifact),
    /// A new artifact was downloaded and verified.
    Fetched(BackupArtifact),
    /// Dry run: the artifact a real run would have written and the command
    /// line that was printed instead of running.
    Planned { artifact: PathBuf, command: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub database: String,
    pub outcome: FetchOutcome,
}

/// Fetches every configured database in order, reusing fresh artifacts.
/// Stops at the first failure: a failed or empty fetch aborts the run.
pub async fn perform_fetch_orchestration<R: CommandRunner>(
    config: &RunConfig,
    runner: &R,
    run_label: &str,
) -> Result<Vec<FetchReport>> {
    let now = SystemTime::now();
    let mut reports = Vec::with_capacity(config.databases.len());

    for database in &config.databases {
        if let Some(existing) = artifact::fresh_artifact(&config.backup_dir, database, now)? {
            info!(
                "Skipping fetch of {}: {} is less than 24 hours old",
                database,
                existing.path.display()
            );
            reports.push(FetchReport {
                database: database.clone(),
                outcome: FetchOutcome::Reused(existing),
            });
            continue;
        }

        let target = artifact::artifact_path(&config.backup_dir, database, run_label);
        let cmd = remote::fetch_command(config, database);

        if config.dry_run {
            let command = format!("{} > {}", cmd, shell_quote(&target.to_string_lossy()));
            info!("[dry-run] {}", command);
            reports.push(FetchReport {
                database: database.clone(),
                outcome: FetchOutcome::Planned {
                    artifact: target,
                    command,
                },
            });
            continue;
        }

        info!("Fetching {} from {}@{}", database, config.remote_user, config.remote_host);
        let fetched = fetch_database(runner, database, run_label, &cmd, &target).await?;
        info!(
            "✓ Backup of {} written to {} ({} bytes)",
            database,
            fetched.path.display(),
            fetched.size
        );
        reports.push(FetchReport {
            database: database.clone(),
            outcome: FetchOutcome::Fetched(fetched),
        });
    }

    Ok(reports)
}

/// Streams one remote dump into a staged file next to `target`, verifies it
/// and only then renames it into place.
async fn fetch_database<R: CommandRunner>(
    runner: &R,
    database: &str,
    run_label: &str,
    cmd: &CommandSpec,
    target: &Path,
) -> Result<BackupArtifact> {
    let backup_dir = target
        .parent()
        .context("artifact path has no parent directory")?;
    let staged = tempfile::Builder::new()
        .prefix(&format!(".{database}_"))
        .suffix(".partial")
        .tempfile_in(backup_dir)
        .with_context(|| format!("Failed to create a staging file in {}", backup_dir.display()))?;

    let mut sink = tokio::fs::File::from_std(
        staged
            .reopen()
            .context("Failed to open the staging file for writing")?,
    );
    let streamed = runner.stream_stdout(cmd, &mut sink).await;
    drop(sink);

    let streamed = match streamed {
        Ok(streamed) => streamed,
        Err(e) => {
            ignore_outcome("removal of staged artifact", staged.close());
            return Err(e.context(SyncError::RemoteFetch {
                database: database.to_string(),
                reason: "remote command could not be run".to_string(),
            }));
        }
    };

    if !streamed.output.success() {
        ignore_outcome("removal of staged artifact", staged.close());
        return Err(SyncError::RemoteFetch {
            database: database.to_string(),
            reason: format!(
                "ssh exited with {}: {}",
                streamed.output.status_text(),
                streamed.output.stderr.trim()
            ),
        }
        .into());
    }
    if !streamed.output.stderr.trim().is_empty() {
        warn!("Remote stderr for {}: {}", database, streamed.output.stderr.trim());
    }

    let staged_path = staged.path().to_path_buf();
    let owned_database = database.to_string();
    let verified = tokio::task::spawn_blocking(move || {
        artifact::verify_artifact(&owned_database, &staged_path)
    })
    .await
    .context("artifact verification task panicked")?;
    if let Err(e) = verified {
        ignore_outcome("removal of staged artifact", staged.close());
        // report the final artifact name, not the staging name
        return Err(match e.downcast::<SyncError>() {
            Ok(SyncError::EmptyArtifact { database, .. }) => SyncError::EmptyArtifact {
                database,
                path: target.to_path_buf(),
            }
            .into(),
            Ok(other) => other.into(),
            Err(other) => other,
        });
    }

    staged
        .persist(target)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to move the staged dump to {}", target.display()))?;

    BackupArtifact::from_path(database, run_label, target)
}

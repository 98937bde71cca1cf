// pgsync/src/sync/logic.rs
use anyhow::{Context, Result};
use chrono::Local;
use std::fs;
use tracing::{error, info};

use crate::backup::{self, FetchOutcome, artifact};
use crate::config::RunConfig;
use crate::errors::SyncError;
use crate::restore::{self, RestoreOutcome, RestoreReport};
use crate::utils::command::CommandRunner;

/// Orchestrates one sync run:
/// 1. Stamps the run timestamp used for every new artifact.
/// 2. Makes sure the backup directory exists.
/// 3. Fetches (or reuses) a backup for every database. Any failure stops here.
/// 4. Restores every database, each one isolated from the others.
/// 5. Fails the run if any database could not be restored.
pub async fn perform_sync_orchestration<R: CommandRunner>(
    config: &RunConfig,
    runner: &R,
) -> Result<Vec<RestoreReport>> {
    let run_label = Local::now().format(artifact::TIMESTAMP_FORMAT).to_string();
    info!(
        "⚙️ Starting sync run {} for databases [{}] from {}@{}{}",
        run_label,
        config.databases.join(" "),
        config.remote_user,
        config.remote_host,
        if config.dry_run { " (dry run)" } else { "" }
    );

    if !config.backup_dir.is_dir() {
        if config.dry_run {
            info!("[dry-run] mkdir -p {}", config.backup_dir.display());
        } else {
            fs::create_dir_all(&config.backup_dir).with_context(|| {
                format!(
                    "Failed to create backup directory: {}",
                    config.backup_dir.display()
                )
            })?;
            info!("📂 Created backup directory {}", config.backup_dir.display());
        }
    }

    let fetched = backup::run_backup_flow(config, runner, &run_label).await?;
    for report in &fetched {
        match &report.outcome {
            FetchOutcome::Reused(a) => info!("{}: reused {}", report.database, a.path.display()),
            FetchOutcome::Fetched(a) => info!("{}: fetched {}", report.database, a.path.display()),
            FetchOutcome::Planned { artifact, .. } => {
                info!("{}: would fetch {}", report.database, artifact.display())
            }
        }
    }

    let restored = restore::run_restore_flow(config, runner, &fetched).await;
    let failed: Vec<&str> = restored
        .iter()
        .filter(|r| r.is_failure())
        .map(|r| r.database.as_str())
        .collect();
    for report in &restored {
        match &report.outcome {
            RestoreOutcome::Restored { tables: Some(n), .. } => {
                info!("{}: restored ({} tables)", report.database, n)
            }
            RestoreOutcome::Restored { tables: None, .. } => info!("{}: restored", report.database),
            RestoreOutcome::Planned { .. } => info!("{}: restore planned", report.database),
            RestoreOutcome::Failed { reason } => error!("{}: FAILED: {}", report.database, reason),
        }
    }

    if !failed.is_empty() {
        return Err(SyncError::RestoreSummary {
            failed: failed.len(),
            total: restored.len(),
        }
        .into());
    }

    info!("✅ Sync run {} completed", run_label);
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testing::sample_config;
    use crate::utils::command::testing::{Call, FakeRunner, StreamReply};
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn gz(payload: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn test_full_run_fetches_then_restores() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = sample_config(dir.path().join("backups"));
        let runner = FakeRunner::new();
        runner.reply_stream(StreamReply::Bytes(gz(b"-- orders\n")));
        runner.reply_stream(StreamReply::Bytes(gz(b"-- customers\n")));

        let reports = perform_sync_orchestration(&config, &runner).await?;

        assert!(config.backup_dir.is_dir());
        assert_eq!(reports.len(), 2);
        let calls = runner.calls();
        let first_feed = calls.iter().position(|c| matches!(c, Call::Feed(..))).unwrap();
        let last_stream = calls.iter().rposition(|c| matches!(c, Call::Stream(_))).unwrap();
        assert!(last_stream < first_feed, "all fetches happen before any restore");
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_backup_never_reaches_restore() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = sample_config(dir.path().to_path_buf());
        let runner = FakeRunner::new();
        runner.reply_stream(StreamReply::Bytes(Vec::new()));

        let err = perform_sync_orchestration(&config, &runner).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::EmptyArtifact { .. })
        ));
        assert!(runner.calls().iter().all(|c| matches!(c, Call::Stream(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_skip_restore_touches_no_store() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = sample_config(dir.path().to_path_buf());
        config.skip_restore = true;
        let runner = FakeRunner::new();
        runner.reply_stream(StreamReply::Bytes(gz(b"-- orders\n")));
        runner.reply_stream(StreamReply::Bytes(gz(b"-- customers\n")));

        let reports = perform_sync_orchestration(&config, &runner).await?;

        assert!(reports.is_empty());
        assert!(runner.calls().iter().all(|c| matches!(c, Call::Stream(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_runs_nothing_and_writes_nothing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = sample_config(dir.path().join("backups"));
        config.dry_run = true;
        let runner = FakeRunner::new();

        let reports = perform_sync_orchestration(&config, &runner).await?;

        assert!(runner.calls().is_empty());
        assert!(!config.backup_dir.exists());
        for report in &reports {
            match &report.outcome {
                RestoreOutcome::Planned { artifact, commands } => {
                    let name = artifact.file_name().unwrap().to_string_lossy();
                    assert!(name.starts_with(&format!("{}_", report.database)));
                    assert!(commands.last().unwrap().starts_with("gunzip -c "));
                    assert!(commands.last().unwrap().contains(name.as_ref()));
                }
                other => panic!("expected a planned restore, got {other:?}"),
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_failure_fails_the_run_after_all_databases() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = sample_config(dir.path().to_path_buf());
        let runner = FakeRunner::new();
        runner.reply_stream(StreamReply::Bytes(gz(b"-- orders\n")));
        runner.reply_stream(StreamReply::Bytes(gz(b"-- customers\n")));
        runner.reply_feed(3, "ERROR: boom");

        let err = perform_sync_orchestration(&config, &runner).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::RestoreSummary { failed: 1, total: 2 })
        ));
        let feeds = runner
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Feed(..)))
            .count();
        assert_eq!(feeds, 2);
        Ok(())
    }
}

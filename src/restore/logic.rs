// pgsync/src/restore/logic.rs
use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use super::db_restore;
use super::verification;
use crate::backup::artifact;
use crate::backup::{FetchOutcome, FetchReport};
use crate::config::RunConfig;
use crate::errors::SyncError;
use crate::utils::command::{CommandRunner, shell_quote};

/// What happened to one database during the restore step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored {
        artifact: PathBuf,
        /// Tables in `public` after the load, when the count succeeded.
        tables: Option<u64>,
    },
    /// Dry run: the commands were logged, nothing ran.
    Planned {
        artifact: PathBuf,
        commands: Vec<String>,
    },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub database: String,
    pub outcome: RestoreOutcome,
}

impl RestoreReport {
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, RestoreOutcome::Failed { .. })
    }
}

/// Restores every configured database in order. Failures are logged and
/// recorded per database; the next database is still attempted.
pub async fn perform_restore_orchestration<R: CommandRunner>(
    config: &RunConfig,
    runner: &R,
    fetched: &[FetchReport],
) -> Vec<RestoreReport> {
    let mut reports = Vec::with_capacity(config.databases.len());

    for database in &config.databases {
        info!("🔄 Restoring database: {}", database);
        let outcome = match restore_database(config, runner, database, fetched).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Restore of '{}' failed: {:#}", database, e);
                RestoreOutcome::Failed {
                    reason: format!("{e:#}"),
                }
            }
        };
        if let RestoreOutcome::Restored { artifact, .. } = &outcome {
            info!("✓ Restore of '{}' completed from {}", database, artifact.display());
        }
        reports.push(RestoreReport {
            database: database.clone(),
            outcome,
        });
    }

    reports
}

async fn restore_database<R: CommandRunner>(
    config: &RunConfig,
    runner: &R,
    database: &str,
    fetched: &[FetchReport],
) -> Result<RestoreOutcome> {
    // a planned fetch replaces whatever stale artifact is on disk
    let artifact = match planned_artifact(config, database, fetched) {
        Some(planned) => planned,
        None => match artifact::latest_artifact(&config.backup_dir, database)? {
            Some(found) => found.path,
            None => return Err(SyncError::RestoreLookup(database.to_string()).into()),
        },
    };
    info!("Using artifact {}", artifact.display());

    if config.dry_run {
        let commands = planned_commands(config, database, &artifact);
        for command in &commands {
            info!("[dry-run] {}", command);
        }
        return Ok(RestoreOutcome::Planned { artifact, commands });
    }

    db_restore::recreate_database(runner, config, database).await?;
    db_restore::load_artifact(runner, config, database, &artifact).await?;

    let tables = match verification::verify_restore(runner, config, database).await {
        Ok(tables) => Some(tables),
        Err(e) => {
            warn!("Could not verify restored database '{}': {:#}", database, e);
            None
        }
    };
    Ok(RestoreOutcome::Restored { artifact, tables })
}

/// In a dry run nothing was written, so the fetcher's planned path stands in
/// for the artifact a real run would restore.
fn planned_artifact(config: &RunConfig, database: &str, fetched: &[FetchReport]) -> Option<PathBuf> {
    if !config.dry_run {
        return None;
    }
    fetched.iter().find_map(|report| match &report.outcome {
        FetchOutcome::Planned { artifact, .. } if report.database == database => {
            Some(artifact.clone())
        }
        _ => None,
    })
}

/// The store commands a real restore of `database` from `artifact` would run.
fn planned_commands(config: &RunConfig, database: &str, artifact: &Path) -> Vec<String> {
    vec![
        db_restore::exists_command(config, database).to_string(),
        format!(
            "{}  # if it exists",
            db_restore::terminate_sessions_command(config, database)
        ),
        format!("{}  # if it exists", db_restore::drop_command(config, database)),
        db_restore::create_command(config, database).to_string(),
        format!(
            "gunzip -c {} | {}",
            shell_quote(&artifact.to_string_lossy()),
            db_restore::load_command(config, database)
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testing::sample_config;
    use crate::utils::command::testing::{Call, FakeRunner};
    use std::fs;
    use std::time::{Duration, SystemTime};

    fn feeds(calls: &[Call]) -> Vec<PathBuf> {
        calls
            .iter()
            .filter_map(|c| match c {
                Call::Feed(_, path) => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_restores_latest_artifact() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = sample_config(dir.path().to_path_buf());
        config.databases = vec!["db".into()];
        let older = dir.path().join("db_20240101_0000.sql.gz");
        let newer = dir.path().join("db_20240601_0000.sql.gz");
        fs::write(&older, b"gz")?;
        fs::write(&newer, b"gz")?;
        let hour_ago = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options().write(true).open(&older)?.set_modified(hour_ago - Duration::from_secs(3600))?;
        fs::File::options().write(true).open(&newer)?.set_modified(hour_ago)?;

        let runner = FakeRunner::new();
        runner.reply_capture(0, "", ""); // does not exist yet
        runner.reply_capture(0, "", ""); // create
        runner.reply_capture(0, "4\n", ""); // table count

        let reports = perform_restore_orchestration(&config, &runner, &[]).await;

        assert_eq!(feeds(&runner.calls()), vec![newer.clone()]);
        assert_eq!(
            reports[0].outcome,
            RestoreOutcome::Restored {
                artifact: newer,
                tables: Some(4)
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_artifact_does_not_block_next_database() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = sample_config(dir.path().to_path_buf());
        fs::write(dir.path().join("customers_20240601_000000.sql.gz"), b"gz")?;

        let runner = FakeRunner::new();
        let reports = perform_restore_orchestration(&config, &runner, &[]).await;

        assert!(reports[0].is_failure());
        assert!(matches!(
            &reports[0].outcome,
            RestoreOutcome::Failed { reason } if reason.contains("No backup artifact found for database 'orders'")
        ));
        assert!(!reports[1].is_failure());
        assert_eq!(feeds(&runner.calls()).len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_load_failure_is_isolated() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = sample_config(dir.path().to_path_buf());
        fs::write(dir.path().join("orders_20240601_000000.sql.gz"), b"gz")?;
        fs::write(dir.path().join("customers_20240601_000000.sql.gz"), b"gz")?;

        let runner = FakeRunner::new();
        runner.reply_feed(3, "ERROR: syntax error");

        let reports = perform_restore_orchestration(&config, &runner, &[]).await;

        assert!(reports[0].is_failure());
        assert!(!reports[1].is_failure());
        assert_eq!(feeds(&runner.calls()).len(), 2);
        Ok(())
    }

    fn planned_fetch(database: &str, artifact: &Path) -> FetchReport {
        FetchReport {
            database: database.into(),
            outcome: FetchOutcome::Planned {
                artifact: artifact.to_path_buf(),
                command: String::new(),
            },
        }
    }

    #[tokio::test]
    async fn test_dry_run_uses_planned_artifact_and_runs_nothing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = sample_config(dir.path().to_path_buf());
        config.dry_run = true;
        config.databases = vec!["orders".into()];
        let planned = dir.path().join("orders_20240601_120000.sql.gz");
        let fetched = vec![planned_fetch("orders", &planned)];

        let runner = FakeRunner::new();
        let reports = perform_restore_orchestration(&config, &runner, &fetched).await;

        assert!(runner.calls().is_empty());
        match &reports[0].outcome {
            RestoreOutcome::Planned { artifact, commands } => {
                assert_eq!(artifact, &planned);
                assert_eq!(commands.len(), 5);
                assert_eq!(
                    commands[3],
                    "docker exec pg-local psql -X -U postgres -d postgres -v ON_ERROR_STOP=1 -tA \
                     -c 'CREATE DATABASE \"orders\"'"
                );
                assert_eq!(
                    commands[4],
                    format!(
                        "gunzip -c {} | docker exec -i pg-local psql -X -U postgres -d orders \
                         -q -v ON_ERROR_STOP=1 -v VERBOSITY=verbose",
                        shell_quote(&planned.to_string_lossy())
                    )
                );
            }
            other => panic!("expected a planned restore, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_prefers_planned_fetch_over_stale_artifact() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = sample_config(dir.path().to_path_buf());
        config.dry_run = true;
        config.databases = vec!["orders".into()];
        let stale = dir.path().join("orders_20240101_000000.sql.gz");
        fs::write(&stale, b"gz")?;
        fs::File::options()
            .write(true)
            .open(&stale)?
            .set_modified(SystemTime::now() - Duration::from_secs(30 * 3600))?;
        let planned = dir.path().join("orders_20240601_120000.sql.gz");
        let fetched = vec![planned_fetch("orders", &planned)];

        let runner = FakeRunner::new();
        let reports = perform_restore_orchestration(&config, &runner, &fetched).await;

        match &reports[0].outcome {
            RestoreOutcome::Planned { artifact, commands } => {
                assert_eq!(artifact, &planned);
                assert!(commands[4].contains("orders_20240601_120000.sql.gz"));
                assert!(!commands.iter().any(|c| c.contains("orders_20240101_000000")));
            }
            other => panic!("expected a planned restore, got {other:?}"),
        }
        Ok(())
    }
}

// pgsync/src/restore/db_restore.rs
use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, info};

use crate::config::RunConfig;
use crate::errors::SyncError;
use crate::utils::command::{CommandRunner, CommandSpec};

/// `docker exec [-i] <local container> psql -X -U <user> -d <database>`.
fn psql(config: &RunConfig, database: &str, interactive: bool) -> CommandSpec {
    let mut cmd = CommandSpec::new("docker").arg("exec");
    if interactive {
        cmd = cmd.arg("-i");
    }
    cmd.arg(&config.local_container)
        .args(["psql", "-X", "-U"])
        .arg(&config.local_db_user)
        .arg("-d")
        .arg(database)
}

/// Runs one SQL statement against the maintenance database, unaligned and
/// without headers.
fn admin_query(config: &RunConfig, sql: &str) -> CommandSpec {
    psql(config, "postgres", false)
        .args(["-v", "ON_ERROR_STOP=1", "-tA", "-c"])
        .arg(sql)
}

/// Database names are restricted to `[A-Za-z0-9_-]` by the config resolver,
/// so they can sit inside quoted literals and identifiers as is.
pub fn exists_command(config: &RunConfig, database: &str) -> CommandSpec {
    admin_query(
        config,
        &format!("SELECT 1 FROM pg_database WHERE datname = '{database}'"),
    )
}

pub fn terminate_sessions_command(config: &RunConfig, database: &str) -> CommandSpec {
    admin_query(
        config,
        &format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = '{database}' AND pid <> pg_backend_pid()"
        ),
    )
}

pub fn drop_command(config: &RunConfig, database: &str) -> CommandSpec {
    admin_query(config, &format!(r#"DROP DATABASE IF EXISTS "{database}""#))
}

pub fn create_command(config: &RunConfig, database: &str) -> CommandSpec {
    admin_query(config, &format!(r#"CREATE DATABASE "{database}""#))
}

/// Loads SQL from stdin, stopping at the first failing statement, with
/// verbose error context.
pub fn load_command(config: &RunConfig, database: &str) -> CommandSpec {
    psql(config, database, true).args([
        "-q",
        "-v",
        "ON_ERROR_STOP=1",
        "-v",
        "VERBOSITY=verbose",
    ])
}

pub fn count_tables_command(config: &RunConfig, database: &str) -> CommandSpec {
    psql(config, database, false).args([
        "-tA",
        "-c",
        "SELECT count(*) FROM pg_catalog.pg_tables WHERE schemaname = 'public'",
    ])
}

/// Asks the local store whether `database` exists. A failed query is an
/// error, never a "no".
pub async fn database_exists<R: CommandRunner>(
    runner: &R,
    config: &RunConfig,
    database: &str,
) -> Result<bool> {
    let cmd = exists_command(config, database);
    let output = runner
        .capture(&cmd)
        .await?
        .ensure_success(&cmd)
        .with_context(|| format!("Failed to check existence of database '{database}'"))?;
    Ok(output.stdout.lines().any(|line| line.trim() == "1"))
}

/// Drops `database` if present, then creates it empty.
pub async fn recreate_database<R: CommandRunner>(
    runner: &R,
    config: &RunConfig,
    database: &str,
) -> Result<()> {
    if database_exists(runner, config, database).await? {
        info!("Database '{}' exists locally, dropping it", database);
        let terminate = terminate_sessions_command(config, database);
        runner
            .capture(&terminate)
            .await?
            .ensure_success(&terminate)
            .with_context(|| format!("Failed to terminate sessions on '{database}'"))?;

        let drop = drop_command(config, database);
        runner
            .capture(&drop)
            .await?
            .ensure_success(&drop)
            .with_context(|| format!("Failed to drop database '{database}'"))?;
        info!("✓ Database '{}' dropped", database);
    }

    let create = create_command(config, database);
    runner
        .capture(&create)
        .await?
        .ensure_success(&create)
        .with_context(|| format!("Failed to create database '{database}'"))?;
    info!("✓ Database '{}' created", database);
    Ok(())
}

/// Streams the decompressed artifact into `database`.
pub async fn load_artifact<R: CommandRunner>(
    runner: &R,
    config: &RunConfig,
    database: &str,
    artifact: &Path,
) -> Result<()> {
    let cmd = load_command(config, database);
    info!("Loading {} into '{}'", artifact.display(), database);
    let output = runner.feed_gzip(&cmd, artifact).await.map_err(|e| {
        e.context(SyncError::RestoreLoad {
            database: database.to_string(),
            reason: format!("could not stream {}", artifact.display()),
        })
    })?;

    if !output.success() {
        return Err(SyncError::RestoreLoad {
            database: database.to_string(),
            reason: format!(
                "psql exited with {} while loading {}: {}",
                output.status_text(),
                artifact.display(),
                output.stderr.trim()
            ),
        }
        .into());
    }
    if !output.stderr.trim().is_empty() {
        debug!("psql messages for '{}': {}", database, output.stderr.trim());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testing::sample_config;
    use crate::utils::command::testing::{Call, FakeRunner};
    use std::path::PathBuf;

    fn captured_sql(calls: &[Call]) -> Vec<String> {
        calls
            .iter()
            .filter_map(|c| match c {
                Call::Capture(cmd) => cmd.args.last().cloned(),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_load_command_stops_on_error() {
        let config = sample_config(PathBuf::from("/backups"));
        assert_eq!(
            load_command(&config, "orders").to_string(),
            "docker exec -i pg-local psql -X -U postgres -d orders -q -v ON_ERROR_STOP=1 -v VERBOSITY=verbose"
        );
    }

    #[tokio::test]
    async fn test_recreate_drops_existing_database() -> anyhow::Result<()> {
        let config = sample_config(PathBuf::from("/backups"));
        let runner = FakeRunner::new();
        runner.reply_capture(0, "1\n", "");

        recreate_database(&runner, &config, "orders").await?;

        let sql = captured_sql(&runner.calls());
        assert_eq!(sql.len(), 4);
        assert!(sql[0].starts_with("SELECT 1 FROM pg_database"));
        assert!(sql[1].starts_with("SELECT pg_terminate_backend"));
        assert_eq!(sql[2], r#"DROP DATABASE IF EXISTS "orders""#);
        assert_eq!(sql[3], r#"CREATE DATABASE "orders""#);
        Ok(())
    }

    #[tokio::test]
    async fn test_recreate_skips_drop_for_missing_database() -> anyhow::Result<()> {
        let config = sample_config(PathBuf::from("/backups"));
        let runner = FakeRunner::new();
        runner.reply_capture(0, "", "");

        recreate_database(&runner, &config, "orders").await?;

        let sql = captured_sql(&runner.calls());
        assert_eq!(sql.len(), 2);
        assert_eq!(sql[1], r#"CREATE DATABASE "orders""#);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_existence_check_is_an_error() {
        let config = sample_config(PathBuf::from("/backups"));
        let runner = FakeRunner::new();
        runner.reply_capture(1, "", "Error response from daemon: No such container: pg-local");

        let err = recreate_database(&runner, &config, "orders")
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("No such container"));
        // nothing was created after the failed check
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_load_failure_carries_psql_stderr() {
        let config = sample_config(PathBuf::from("/backups"));
        let runner = FakeRunner::new();
        runner.reply_feed(3, "ERROR:  42P01: relation \"missing\" does not exist");

        let err = load_artifact(&runner, &config, "orders", Path::new("/backups/o.sql.gz"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::RestoreLoad { .. })
        ));
        assert!(err.to_string().contains("42P01"));
    }
}

// pgsync/src/restore/verification.rs
use anyhow::{Context, Result};
use tracing::{info, warn};

use super::db_restore::count_tables_command;
use crate::config::RunConfig;
use crate::utils::command::CommandRunner;

/// Counts the tables in the `public` schema of a freshly restored database
/// and logs the result. An empty schema is worth a warning but is not an
/// error: the source may well be empty.
pub async fn verify_restore<R: CommandRunner>(
    runner: &R,
    config: &RunConfig,
    database: &str,
) -> Result<u64> {
    let cmd = count_tables_command(config, database);
    let output = runner.capture(&cmd).await?.ensure_success(&cmd)?;
    let tables: u64 = output
        .stdout
        .trim()
        .parse()
        .with_context(|| format!("Unexpected table count output: {:?}", output.stdout.trim()))?;

    if tables == 0 {
        warn!("No tables found in the public schema of restored database '{}'", database);
    } else {
        info!("Restored database '{}' has {} tables in public schema", database, tables);
    }
    Ok(tables)
}

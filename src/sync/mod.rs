// pgsync/src/sync/mod.rs
pub(crate) mod logic;

use anyhow::Result;
use std::path::Path;
use tracing::info;

use crate::backup::artifact;
use crate::config::RunConfig;
use crate::utils::command::CommandRunner;

/// Public entry point for a sync run: fetch, then restore.
pub async fn run_sync_flow<R: CommandRunner>(config: &RunConfig, runner: &R) -> Result<()> {
    logic::perform_sync_orchestration(config, runner).await?;
    Ok(())
}

/// `--clean`: removes every artifact by deleting the backup directory.
pub fn run_clean(backup_dir: &Path) -> Result<()> {
    let summary = artifact::remove_backup_dir(backup_dir)?;
    if summary.existed {
        info!(
            "🧹 Removed {} ({} files, {} bytes)",
            backup_dir.display(),
            summary.files,
            summary.bytes
        );
    } else {
        info!("Nothing to clean: {} does not exist", backup_dir.display());
    }
    Ok(())
}

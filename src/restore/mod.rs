mod logic;
pub(crate) mod db_restore; // local store commands: exists, drop, create, load
pub(crate) mod verification; // post-load table count

use crate::backup::FetchReport;
use crate::config::RunConfig;
use crate::utils::command::CommandRunner;
use tracing::info;

pub use logic::{RestoreOutcome, RestoreReport};

/// Public entry point for the restore step. Returns one report per database,
/// or none at all when restore is disabled.
pub async fn run_restore_flow<R: CommandRunner>(
    config: &RunConfig,
    runner: &R,
    fetched: &[FetchReport],
) -> Vec<RestoreReport> {
    if config.skip_restore {
        info!("Restore skipped (--skip-restore)");
        return Vec::new();
    }
    logic::perform_restore_orchestration(config, runner, fetched).await
}

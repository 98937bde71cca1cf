mod logic;
pub(crate) mod artifact; // artifact naming, lookup, verification, clean
pub(crate) mod remote; // ssh + pg_dump command construction

use anyhow::Result;
use crate::config::RunConfig;
use crate::utils::command::CommandRunner;

pub use logic::{FetchOutcome, FetchReport};

/// Public entry point for the fetch step: one report per configured
/// database, in order. Any error is fatal for the run.
pub async fn run_backup_flow<R: CommandRunner>(
    config: &RunConfig,
    runner: &R,
    run_label: &str,
) -> Result<Vec<FetchReport>> {
    logic::perform_fetch_orchestration(config, runner, run_label).await
}

//! PostgreSQL sync tool
//!
//! Fetches gzip-compressed dumps from a remote Docker-hosted PostgreSQL over
//! SSH and restores them into a local Docker-hosted PostgreSQL.

// pgsync/src/main.rs
mod backup;
mod config;
mod errors;
mod restore;
mod sync;
mod utils;

use anyhow::Result;
use clap::Parser;
use clap::error::ErrorKind;
use config::{Cli, Resolution};
use errors::exit_code_for;
use std::process::ExitCode;
use tracing::{debug, error, warn};
use utils::command::SystemRunner;

/// Main entry point for the sync tool
#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            eprint!("❌ {}", e.render());
            println!("{}", config::usage());
            return ExitCode::from(2);
        }
    };

    match run_app(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if tracing::dispatcher::has_been_set() {
                error!("{:#}", e);
            } else {
                eprintln!("❌ Error: {:#}", e);
            }
            ExitCode::from(exit_code_for(&e))
        }
    }
}

async fn run_app(cli: Cli) -> Result<()> {
    match config::resolve(&cli)? {
        Resolution::Clean {
            backup_dir,
            log_file,
        } => {
            utils::logging::init(&log_file)?;
            sync::run_clean(&backup_dir)
        }
        Resolution::Run {
            config,
            ignored_keys,
        } => {
            utils::logging::init(&config.log_file)?;
            for key in &ignored_keys {
                warn!("Ignoring unknown config key {}", key);
            }

            if !config.dry_run {
                let ssh = utils::find_executable("ssh")?;
                debug!("Found ssh executable at: {}", ssh.display());
                if !config.skip_restore {
                    let docker = utils::find_executable("docker")?;
                    debug!("Found docker executable at: {}", docker.display());
                }
            }

            let runner = SystemRunner::new(config.command_timeout);
            sync::run_sync_flow(&config, &runner).await
        }
    }
}

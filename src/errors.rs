use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Remote fetch failed for database '{database}': {reason}")]
    RemoteFetch { database: String, reason: String },

    #[error("Backup artifact for database '{database}' is empty: {}", .path.display())]
    EmptyArtifact { database: String, path: PathBuf },

    #[error("No backup artifact found for database '{0}'")]
    RestoreLookup(String),

    #[error("Restore of database '{database}' failed: {reason}")]
    RestoreLoad { database: String, reason: String },

    #[error("Command `{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Command `{command}` timed out after {secs} seconds")]
    Timeout { command: String, secs: u64 },

    #[error("{failed} of {total} database(s) failed to restore")]
    RestoreSummary { failed: usize, total: usize },
}

impl SyncError {
    /// Process exit code for this error kind.
    pub fn exit_code(&self) -> u8 {
        match self {
            SyncError::Config(_) => 2,
            _ => 1,
        }
    }
}

/// Exit code for an error coming out of the run, looking through any context
/// layers for a typed `SyncError`.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<SyncError>()
        .map_or(1, SyncError::exit_code)
}

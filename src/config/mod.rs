// pgsync/src/config/mod.rs
use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::SyncError;

const DEFAULT_REMOTE_USER: &str = "root";
const DEFAULT_CONTAINER: &str = "postgres";
const DEFAULT_DB_USER: &str = "postgres";
const DEFAULT_BACKUP_DIR: &str = "./backups";
const DEFAULT_LOG_FILE: &str = "./pgsync.log";

/// Keys understood in the config file.
const CONFIG_KEYS: &[&str] = &[
    "REMOTE_USER",
    "REMOTE_HOST",
    "REMOTE_CONTAINER",
    "REMOTE_DB_USER",
    "LOCAL_CONTAINER",
    "LOCAL_DB_USER",
    "DATABASES",
    "BACKUP_DIR",
    "SSH_KEY",
    "SSH_PORT",
    "LOG_FILE",
    "COMMAND_TIMEOUT_SECS",
    "SKIP_RESTORE",
    "DRY_RUN",
];

/// Command-line flags. Every value flag is optional so that unset flags leave
/// the config-file or default value in place.
#[derive(Debug, Default, Parser)]
#[command(
    name = "pgsync",
    version,
    about = "Fetch PostgreSQL dumps from a remote Docker host over SSH and restore them into a local container",
    args_override_self = true
)]
pub struct Cli {
    /// SSH user on the remote host
    #[arg(long, value_name = "USER")]
    pub remote_user: Option<String>,

    /// Remote host running the source database container
    #[arg(long, value_name = "HOST")]
    pub remote_host: Option<String>,

    /// Name of the remote database container
    #[arg(long, value_name = "NAME")]
    pub remote_container: Option<String>,

    /// Database user for pg_dump inside the remote container
    #[arg(long, value_name = "USER")]
    pub remote_db_user: Option<String>,

    /// Space-separated list of databases, e.g. "app billing"
    #[arg(long, value_name = "LIST")]
    pub databases: Option<String>,

    /// Name of the local database container
    #[arg(long, value_name = "NAME")]
    pub local_container: Option<String>,

    /// Database user for psql inside the local container
    #[arg(long, value_name = "USER")]
    pub local_db_user: Option<String>,

    /// Directory holding the <db>_<timestamp>.sql.gz artifacts
    #[arg(long, value_name = "DIR")]
    pub backup_dir: Option<PathBuf>,

    /// KEY=value file overriding the built-in defaults
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Fetch only, do not touch the local database store
    #[arg(long)]
    pub skip_restore: bool,

    /// Print the commands that would run without executing them
    #[arg(long)]
    pub dry_run: bool,

    /// Delete the whole backup directory and exit
    #[arg(long)]
    pub clean: bool,

    /// Private key used for the SSH connection
    #[arg(long, value_name = "PATH")]
    pub ssh_key: Option<PathBuf>,

    /// SSH port on the remote host
    #[arg(long, value_name = "PORT")]
    pub ssh_port: Option<u16>,

    /// File the run log is appended to
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Upper bound in seconds for every external command (none by default)
    #[arg(long = "timeout", value_name = "SECS")]
    pub timeout_secs: Option<u64>,
}

/// Usage text printed when the command line cannot be parsed.
pub fn usage() -> String {
    Cli::command().render_help().to_string()
}

/// Fully resolved configuration for one run. Built once, then only borrowed.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub remote_user: String,
    pub remote_host: String,
    pub remote_container: String,
    pub remote_db_user: String,
    pub local_container: String,
    pub local_db_user: String,
    pub databases: Vec<String>,
    pub backup_dir: PathBuf,
    pub ssh_key: Option<PathBuf>,
    pub ssh_port: Option<u16>,
    pub log_file: PathBuf,
    pub command_timeout: Option<Duration>,
    pub dry_run: bool,
    pub skip_restore: bool,
}

/// What the resolver decided the process should do.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// `--clean`: remove the backup directory and stop.
    Clean { backup_dir: PathBuf, log_file: PathBuf },
    Run {
        config: RunConfig,
        /// Config-file keys that matched no setting.
        ignored_keys: Vec<String>,
    },
}

/// Layered settings before validation.
#[derive(Debug, Clone)]
struct Settings {
    remote_user: String,
    remote_host: Option<String>,
    remote_container: String,
    remote_db_user: String,
    local_container: String,
    local_db_user: String,
    databases: Vec<String>,
    backup_dir: PathBuf,
    ssh_key: Option<PathBuf>,
    ssh_port: Option<u16>,
    log_file: PathBuf,
    timeout_secs: Option<u64>,
    dry_run: bool,
    skip_restore: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            remote_user: DEFAULT_REMOTE_USER.to_string(),
            remote_host: None,
            remote_container: DEFAULT_CONTAINER.to_string(),
            remote_db_user: DEFAULT_DB_USER.to_string(),
            local_container: DEFAULT_CONTAINER.to_string(),
            local_db_user: DEFAULT_DB_USER.to_string(),
            databases: Vec::new(),
            backup_dir: PathBuf::from(DEFAULT_BACKUP_DIR),
            ssh_key: None,
            ssh_port: None,
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            timeout_secs: None,
            dry_run: false,
            skip_restore: false,
        }
    }
}

impl Settings {
    /// Applies one KEY=value assignment. Returns `false` for unknown keys.
    /// An empty value keeps whatever the earlier layer set.
    fn apply_key(&mut self, key: &str, value: &str) -> Result<bool> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(CONFIG_KEYS.contains(&key));
        }

        match key {
            "REMOTE_USER" => self.remote_user = value.to_string(),
            "REMOTE_HOST" => self.remote_host = Some(value.to_string()),
            "REMOTE_CONTAINER" => self.remote_container = value.to_string(),
            "REMOTE_DB_USER" => self.remote_db_user = value.to_string(),
            "LOCAL_CONTAINER" => self.local_container = value.to_string(),
            "LOCAL_DB_USER" => self.local_db_user = value.to_string(),
            "DATABASES" => self.databases = split_database_list(value),
            "BACKUP_DIR" => self.backup_dir = PathBuf::from(value),
            "SSH_KEY" => self.ssh_key = Some(PathBuf::from(value)),
            "LOG_FILE" => self.log_file = PathBuf::from(value),
            "SSH_PORT" => {
                let port = value.parse::<u16>().map_err(|_| {
                    SyncError::Config(format!("SSH_PORT must be a port number, got '{value}'"))
                })?;
                self.ssh_port = Some(port);
            }
            "COMMAND_TIMEOUT_SECS" => {
                let secs = value.parse::<u64>().map_err(|_| {
                    SyncError::Config(format!(
                        "COMMAND_TIMEOUT_SECS must be a whole number of seconds, got '{value}'"
                    ))
                })?;
                self.timeout_secs = Some(secs);
            }
            "SKIP_RESTORE" => self.skip_restore = parse_flag(key, value)?,
            "DRY_RUN" => self.dry_run = parse_flag(key, value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Reads a KEY=value file. The file is parsed, never executed.
    fn apply_file(&mut self, path: &Path) -> Result<Vec<String>> {
        if !path.is_file() {
            return Err(SyncError::Config(format!(
                "config file not found: {}",
                path.display()
            ))
            .into());
        }

        let entries = read_entries(path)
            .map_err(|e| SyncError::Config(format!("cannot read {}: {e}", path.display())))?;

        let mut ignored = Vec::new();
        for entry in entries {
            let (key, value) = entry.map_err(|e| {
                SyncError::Config(format!("malformed line in {}: {e}", path.display()))
            })?;
            if !self.apply_key(&key, &value)? {
                ignored.push(key);
            }
        }
        Ok(ignored)
    }

    /// Lenient read for `--clean`: only the backup directory and log file are
    /// taken from the file. An unreadable file or line is skipped.
    fn apply_clean_paths(&mut self, path: &Path) {
        let Ok(entries) = read_entries(path) else {
            return;
        };
        for (key, value) in entries.flatten() {
            if matches!(key.as_str(), "BACKUP_DIR" | "LOG_FILE") {
                ignore_key_error(self.apply_key(&key, &value));
            }
        }
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(v) = &cli.remote_user {
            self.remote_user = v.clone();
        }
        if let Some(v) = &cli.remote_host {
            self.remote_host = Some(v.clone());
        }
        if let Some(v) = &cli.remote_container {
            self.remote_container = v.clone();
        }
        if let Some(v) = &cli.remote_db_user {
            self.remote_db_user = v.clone();
        }
        if let Some(v) = &cli.databases {
            self.databases = split_database_list(v);
        }
        if let Some(v) = &cli.local_container {
            self.local_container = v.clone();
        }
        if let Some(v) = &cli.local_db_user {
            self.local_db_user = v.clone();
        }
        if let Some(v) = &cli.backup_dir {
            self.backup_dir = v.clone();
        }
        if let Some(v) = &cli.ssh_key {
            self.ssh_key = Some(v.clone());
        }
        if let Some(v) = cli.ssh_port {
            self.ssh_port = Some(v);
        }
        if let Some(v) = &cli.log_file {
            self.log_file = v.clone();
        }
        if let Some(v) = cli.timeout_secs {
            self.timeout_secs = Some(v);
        }
        self.dry_run |= cli.dry_run;
        self.skip_restore |= cli.skip_restore;
    }

    fn into_run_config(self) -> Result<RunConfig> {
        let remote_host = self
            .remote_host
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| {
                SyncError::Config("remote host is required (--remote-host or REMOTE_HOST)".into())
            })?;

        for (what, value) in [
            ("remote user", &self.remote_user),
            ("remote host", &remote_host),
            ("remote container", &self.remote_container),
            ("remote database user", &self.remote_db_user),
            ("local container", &self.local_container),
            ("local database user", &self.local_db_user),
        ] {
            if value.trim().is_empty() || value.starts_with('-') {
                return Err(SyncError::Config(format!(
                    "invalid {what} '{value}': must be non-empty and cannot start with '-'"
                ))
                .into());
            }
        }

        if self.databases.is_empty() {
            return Err(SyncError::Config(
                "no databases given (--databases or DATABASES)".into(),
            )
            .into());
        }
        if let Some(bad) = self.databases.iter().find(|db| !is_valid_database_name(db)) {
            return Err(SyncError::Config(format!(
                "invalid database name '{bad}': only letters, digits, '_' and '-' are allowed"
            ))
            .into());
        }
        if self.backup_dir.as_os_str().is_empty() {
            return Err(SyncError::Config("backup directory cannot be empty".into()).into());
        }
        if self.timeout_secs == Some(0) {
            return Err(SyncError::Config("timeout must be at least one second".into()).into());
        }

        Ok(RunConfig {
            remote_user: self.remote_user,
            remote_host,
            remote_container: self.remote_container,
            remote_db_user: self.remote_db_user,
            local_container: self.local_container,
            local_db_user: self.local_db_user,
            databases: self.databases,
            backup_dir: self.backup_dir,
            ssh_key: self.ssh_key,
            ssh_port: self.ssh_port,
            log_file: self.log_file,
            command_timeout: self.timeout_secs.map(Duration::from_secs),
            dry_run: self.dry_run,
            skip_restore: self.skip_restore,
        })
    }
}

/// Merges defaults, the optional config file and the command line.
pub fn resolve(cli: &Cli) -> Result<Resolution> {
    let mut settings = Settings::default();

    // --clean never fails on configuration
    if cli.clean {
        if let Some(path) = &cli.config {
            settings.apply_clean_paths(path);
        }
        settings.apply_cli(cli);
        return Ok(Resolution::Clean {
            backup_dir: settings.backup_dir,
            log_file: settings.log_file,
        });
    }

    let ignored_keys = match &cli.config {
        Some(path) => settings
            .apply_file(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => Vec::new(),
    };
    settings.apply_cli(cli);

    Ok(Resolution::Run {
        config: settings.into_run_config()?,
        ignored_keys,
    })
}

/// Splits the whitespace-separated database list, keeping order and dropping
/// repeated names.
pub fn split_database_list(raw: &str) -> Vec<String> {
    let mut databases: Vec<String> = Vec::new();
    for name in raw.split_whitespace() {
        if !databases.iter().any(|d| d == name) {
            databases.push(name.to_string());
        }
    }
    databases
}

// from_path_iter is deprecated in dotenv 0.15 but is the only reader that leaves the process environment alone
#[allow(deprecated)]
fn read_entries(
    path: &Path,
) -> dotenv::Result<impl Iterator<Item = dotenv::Result<(String, String)>>> {
    dotenv::from_path_iter(path)
}

fn ignore_key_error(result: Result<bool>) {
    if let Err(e) = result {
        tracing::debug!("Ignoring config value during clean: {:#}", e);
    }
}

fn is_valid_database_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SyncError::Config(format!("{key} must be true or false, got '{value}'")).into()),
    }
}

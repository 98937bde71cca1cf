// pgsync/src/backup/remote.rs
use crate::config::RunConfig;
use crate::utils::command::{CommandSpec, shell_quote};

/// Shell command run on the remote host: a plain SQL dump without ownership
/// or ACL statements, compressed before it crosses the network.
pub fn remote_dump_command(config: &RunConfig, database: &str) -> String {
    format!(
        "docker exec {} pg_dump --no-owner --no-acl -U {} {} | gzip",
        shell_quote(&config.remote_container),
        shell_quote(&config.remote_db_user),
        shell_quote(database),
    )
}

/// Wraps `remote_command` in a non-interactive ssh invocation. BatchMode
/// turns every prompt into a failure; unknown host keys are pinned on first
/// use and a changed key is refused.
pub fn ssh_command(config: &RunConfig, remote_command: &str) -> CommandSpec {
    let mut cmd = CommandSpec::new("ssh").args([
        "-o",
        "BatchMode=yes",
        "-o",
        "StrictHostKeyChecking=accept-new",
    ]);
    if let Some(key) = &config.ssh_key {
        cmd = cmd
            .args(["-o", "IdentitiesOnly=yes", "-i"])
            .arg(key.to_string_lossy());
    }
    if let Some(port) = config.ssh_port {
        cmd = cmd.arg("-p").arg(port.to_string());
    }
    cmd.arg(format!("{}@{}", config.remote_user, config.remote_host))
        .arg(remote_command)
}

/// The full fetch command for one database.
pub fn fetch_command(config: &RunConfig, database: &str) -> CommandSpec {
    ssh_command(config, &remote_dump_command(config, database))
}

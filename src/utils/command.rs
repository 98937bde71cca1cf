// pgsync/src/utils/command.rs
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fmt;
use std::fs::File;
use std::future::Future;
use std::io::{BufReader, Write};
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::io::SyncIoBridge;
use tracing::debug;

use crate::errors::SyncError;

/// An external command: program plus arguments, passed without a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        CommandSpec {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Renders the command as a line that could be pasted into a POSIX shell.
impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", shell_quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", shell_quote(arg))?;
        }
        Ok(())
    }
}

/// Quotes `word` for a POSIX shell, leaving plain words untouched.
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:@,+%".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Exit code and captured text of a finished command. `code` is `None` when
/// the process was killed by a signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn status_text(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {code}"),
            None => "termination by signal".to_string(),
        }
    }

    /// Turns a non-zero exit into a `SyncError::Command` naming `cmd`.
    pub fn ensure_success(self, cmd: &CommandSpec) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(SyncError::Command {
            command: cmd.to_string(),
            status: self.status_text(),
            stderr: self.stderr.trim().to_string(),
        }
        .into())
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Result of a command whose standard output was streamed elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Streamed {
    /// Exit code and stderr; `stdout` is always empty.
    pub output: CommandOutput,
    pub bytes: u64,
}

/// The seam between the sync workflow and the processes it drives.
#[allow(async_fn_in_trait)]
pub trait CommandRunner {
    /// Runs `cmd` to completion and captures stdout and stderr.
    async fn capture(&self, cmd: &CommandSpec) -> Result<CommandOutput>;

    /// Runs `cmd` to completion, copying its stdout into `sink`.
    async fn stream_stdout<W>(&self, cmd: &CommandSpec, sink: &mut W) -> Result<Streamed>
    where
        W: AsyncWrite + Unpin + Send;

    /// Runs `cmd` with the decompressed contents of the gzip file `input` on
    /// its stdin.
    async fn feed_gzip(&self, cmd: &CommandSpec, input: &Path) -> Result<CommandOutput>;
}

/// Runs commands as real child processes, one at a time.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    timeout: Option<Duration>,
}

impl SystemRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        SystemRunner { timeout }
    }

    fn command(cmd: &CommandSpec) -> Command {
        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args).kill_on_drop(true);
        command
    }

    /// Awaits `work`, bounded by the configured timeout. Dropping the future
    /// on timeout kills the child through `kill_on_drop`.
    async fn bounded<T, F>(&self, cmd: &CommandSpec, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.timeout {
            None => work.await,
            Some(limit) => tokio::time::timeout(limit, work).await.map_err(|_| {
                SyncError::Timeout {
                    command: cmd.to_string(),
                    secs: limit.as_secs(),
                }
            })?,
        }
    }
}

impl CommandRunner for SystemRunner {
    async fn capture(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        debug!("Running: {}", cmd);
        let child = Self::command(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start {}", cmd.program))?;

        let output = self
            .bounded(cmd, async {
                child
                    .wait_with_output()
                    .await
                    .with_context(|| format!("Failed to wait for {}", cmd.program))
            })
            .await?;
        Ok(output.into())
    }

    async fn stream_stdout<W>(&self, cmd: &CommandSpec, sink: &mut W) -> Result<Streamed>
    where
        W: AsyncWrite + Unpin + Send,
    {
        debug!("Running: {}", cmd);
        let mut child = Self::command(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start {}", cmd.program))?;
        let mut stdout = child.stdout.take().context("child stdout was not captured")?;
        let mut stderr = child.stderr.take().context("child stderr was not captured")?;

        self.bounded(cmd, async {
            let mut err_buf = Vec::new();
            let (bytes, _) = tokio::try_join!(
                tokio::io::copy(&mut stdout, &mut *sink),
                stderr.read_to_end(&mut err_buf)
            )
            .with_context(|| format!("Failed to stream output of {}", cmd.program))?;
            sink.flush().await.context("Failed to flush streamed output")?;

            let status = child
                .wait()
                .await
                .with_context(|| format!("Failed to wait for {}", cmd.program))?;
            Ok(Streamed {
                output: CommandOutput {
                    code: status.code(),
                    stdout: String::new(),
                    stderr: String::from_utf8_lossy(&err_buf).into_owned(),
                },
                bytes,
            })
        })
        .await
    }

    async fn feed_gzip(&self, cmd: &CommandSpec, input: &Path) -> Result<CommandOutput> {
        debug!("Running: {} < (gunzip -c {})", cmd, input.display());
        let mut child = Self::command(cmd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start {}", cmd.program))?;
        let stdin = child.stdin.take().context("child stdin was not captured")?;
        let mut stdout = child.stdout.take().context("child stdout was not captured")?;
        let mut stderr = child.stderr.take().context("child stderr was not captured")?;

        // The decoder is blocking, so it drives the async pipe through a bridge
        // on the blocking pool. Dropping the bridge closes the child's stdin.
        let bridge = SyncIoBridge::new(stdin);
        let input = input.to_path_buf();
        let feeder = tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
            let mut writer = bridge;
            let mut decoder = GzDecoder::new(BufReader::new(File::open(&input)?));
            let fed = std::io::copy(&mut decoder, &mut writer)?;
            writer.flush()?;
            Ok(fed)
        });

        self.bounded(cmd, async {
            let mut out_buf = Vec::new();
            let mut err_buf = Vec::new();
            tokio::try_join!(
                stdout.read_to_end(&mut out_buf),
                stderr.read_to_end(&mut err_buf)
            )
            .with_context(|| format!("Failed to read output of {}", cmd.program))?;
            let status = child
                .wait()
                .await
                .with_context(|| format!("Failed to wait for {}", cmd.program))?;
            let fed = feeder.await.context("stdin feeder task panicked")?;

            let output = CommandOutput {
                code: status.code(),
                stdout: String::from_utf8_lossy(&out_buf).into_owned(),
                stderr: String::from_utf8_lossy(&err_buf).into_owned(),
            };
            // A child that stopped early breaks the pipe; its own exit status
            // is the error worth reporting then. A clean exit after a feeder
            // error means the child only saw part of the input.
            if output.success() {
                let fed = fed.context("Failed to stream decompressed input")?;
                debug!("Fed {} decompressed bytes to {}", fed, cmd.program);
            }
            Ok(output)
        })
        .await
    }
}

/// Discards the outcome of a best-effort step, leaving a debug trace when it
/// failed.
pub fn ignore_outcome<T, E: fmt::Display>(what: &str, result: std::result::Result<T, E>) {
    if let Err(e) = result {
        debug!("Ignoring failed {}: {}", what, e);
    }
}

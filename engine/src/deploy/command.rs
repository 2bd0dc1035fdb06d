//! External command execution
//!
//! Every interaction with the container runtime, the migration runner and the
//! registry goes through a [`CommandRunner`]. The [`Executor`] adds the
//! per-deployment concerns on top: default timeout, dry-run and cancellation.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::DeployError;

/// A shell command line with optional stdin and timeout
#[derive(Clone)]
pub struct CommandSpec {
    pub line: String,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            stdin: None,
            timeout: None,
        }
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// stdin may carry registry credentials
impl std::fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSpec")
            .field("line", &self.line)
            .field("stdin", &self.stdin.as_ref().map(|s| format!("<{} bytes>", s.len())))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Captured output of a successful command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn from_stdout(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            (out, "") => out.to_string(),
            ("", err) => err.to_string(),
            (out, err) => format!("{}\n{}", out, err),
        }
    }
}

/// Runs command lines against the OS.
///
/// Implementations return `Ok` only for a zero exit status, `Command` for a
/// non-zero one and `CommandTimeout` when the timeout elapses.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, DeployError>;
}

/// Runs commands through `sh -c`, streaming output lines to the log
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, DeployError> {
        debug!(command = %spec.line, "running command");

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(&spec.line)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let input = spec.stdin.clone();

        let collect = async {
            let write = async move {
                if let (Some(mut pipe), Some(input)) = (stdin, input) {
                    pipe.write_all(input.as_bytes()).await?;
                    pipe.shutdown().await?;
                }
                Ok::<(), std::io::Error>(())
            };
            let (written, out, err) = tokio::join!(
                write,
                stream_lines(stdout, "stdout"),
                stream_lines(stderr, "stderr")
            );
            written?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, out?, err?))
        };

        let (status, stdout, stderr) = match spec.timeout {
            Some(timeout) => tokio::time::timeout(timeout, collect).await.map_err(|_| {
                DeployError::CommandTimeout {
                    command: spec.line.clone(),
                    timeout,
                }
            })??,
            None => collect.await?,
        };

        let output = CommandOutput {
            code: status.code(),
            stdout,
            stderr,
        };

        if status.success() {
            Ok(output)
        } else {
            Err(DeployError::Command {
                command: spec.line.clone(),
                code: status.code(),
                output: output.combined(),
            })
        }
    }
}

async fn stream_lines<R>(reader: Option<R>, stream: &'static str) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut collected = String::new();
    let Some(reader) = reader else {
        return Ok(collected);
    };

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        debug!(stream, "{}", line);
        collected.push_str(&line);
        collected.push('\n');
    }
    Ok(collected)
}

/// Command execution bound to one deployment run
#[derive(Clone)]
pub struct Executor {
    runner: Arc<dyn CommandRunner>,
    default_timeout: Duration,
    dry_run: bool,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(runner: Arc<dyn CommandRunner>, default_timeout: Duration) -> Self {
        Self {
            runner,
            default_timeout,
            dry_run: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Copy bound to a run's dry-run flag and cancellation token
    pub fn for_run(&self, dry_run: bool, cancel: CancellationToken) -> Self {
        Self {
            runner: self.runner.clone(),
            default_timeout: self.default_timeout,
            dry_run,
            cancel,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run a read-only command. Runs in dry-run mode too.
    pub async fn query(&self, spec: CommandSpec) -> Result<CommandOutput, DeployError> {
        self.execute(spec).await
    }

    /// Run a command that changes external state. Logged and skipped in dry-run mode.
    pub async fn mutate(&self, spec: CommandSpec) -> Result<CommandOutput, DeployError> {
        if self.dry_run {
            info!(command = %spec.line, "[dry-run] would run command");
            return Ok(CommandOutput::default());
        }
        self.execute(spec).await
    }

    async fn execute(&self, mut spec: CommandSpec) -> Result<CommandOutput, DeployError> {
        if spec.timeout.is_none() {
            spec.timeout = Some(self.default_timeout);
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DeployError::Cancelled(format!(
                "command `{}` interrupted",
                spec.line
            ))),
            result = self.runner.run(&spec) => result,
        }
    }
}

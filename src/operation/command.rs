//! Command operation: runs a test command as a local child process.
//!
//! Each invocation spawns a fresh process, so concurrent runs never share
//! state. Standard output and standard error are merged line by line into
//! the run's [`OutputBuffer`]. Lines are kept as raw bytes, so output that is
//! not valid UTF-8 reaches the console unchanged.
//!
//! # Example Configuration
//!
//! ```toml
//! [operation]
//! type = "command"
//! name = "tests/login.rs#test_login"
//! command = "cargo test --test login test_login"
//! working_dir = "~/src/app"
//! timeout_secs = 600
//!
//! [operation.env]
//! RUST_LOG = "info"
//! ```
//!
//! When `shell` is set the command is run as `{shell} -c "{command}"`;
//! otherwise it is split into words and executed directly.
//!
//! The child also sees `VOLLEY_RUN_INDEX` and `VOLLEY_ATTEMPT`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, warn};

use super::{Attempt, Failure, Operation, OperationReport, OutputBuffer};
use crate::config::CommandOperationConfig;

/// Number of stderr lines kept for the failure trace.
const STDERR_TAIL_LINES: usize = 20;

enum Line {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Lines of `reader` without their `\n` or `\r\n` terminator.
///
/// Ends at EOF or at the first read error.
fn byte_lines<R: AsyncRead + Unpin>(reader: R) -> impl Stream<Item = Vec<u8>> {
    stream::unfold(BufReader::new(reader), |mut reader| async move {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => None,
            Ok(_) => {
                if line.last() == Some(&b'\n') {
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                }
                Some((line, reader))
            }
            Err(e) => {
                debug!("Stopped reading command output: {}", e);
                None
            }
        }
    })
}

/// Operation that executes a configured test command.
pub struct CommandOperation {
    config: CommandOperationConfig,
    working_dir: Option<PathBuf>,
}

impl CommandOperation {
    /// Creates the operation, expanding `~` in the working directory.
    pub fn new(config: CommandOperationConfig) -> Self {
        let working_dir = config
            .working_dir
            .as_ref()
            .map(|dir| crate::config::expand_path(dir));
        Self {
            config,
            working_dir,
        }
    }

    fn build_command(&self, attempt: &Attempt) -> Result<tokio::process::Command> {
        let mut process = match &self.config.shell {
            Some(shell) => {
                let mut process = tokio::process::Command::new(shell);
                process.arg("-c").arg(&self.config.command);
                process
            }
            None => {
                let argv = shell_words::split(&self.config.command)
                    .with_context(|| format!("Invalid command: {}", self.config.command))?;
                let (program, args) = argv
                    .split_first()
                    .context("Operation command is empty")?;
                let mut process = tokio::process::Command::new(program);
                process.args(args);
                process
            }
        };

        if let Some(dir) = &self.working_dir {
            process.current_dir(dir);
        }
        for (key, value) in &self.config.env {
            process.env(key, value);
        }
        process
            .env("VOLLEY_RUN_INDEX", attempt.run_index.to_string())
            .env("VOLLEY_ATTEMPT", attempt.number.to_string());

        process.stdin(Stdio::null());
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process.kill_on_drop(true);

        Ok(process)
    }
}

#[async_trait]
impl Operation for CommandOperation {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn run(&self, attempt: &Attempt, out: &mut OutputBuffer) -> Result<OperationReport> {
        let mut child = self
            .build_command(attempt)?
            .spawn()
            .with_context(|| format!("Failed to spawn `{}`", self.config.command))?;

        let stdout = child.stdout.take().context("stdout not captured")?;
        let stderr = child.stderr.take().context("stderr not captured")?;

        let stdout_stream = byte_lines(stdout).map(Line::Stdout);
        let stderr_stream = byte_lines(stderr).map(Line::Stderr);
        let mut combined = std::pin::pin!(stream::select(stdout_stream, stderr_stream));

        let mut stderr_tail: VecDeque<Vec<u8>> = VecDeque::with_capacity(STDERR_TAIL_LINES);

        let collect = async {
            while let Some(line) = combined.next().await {
                match line {
                    Line::Stdout(s) => out.line_bytes(&s),
                    Line::Stderr(s) => {
                        out.line_bytes(&s);
                        if stderr_tail.len() == STDERR_TAIL_LINES {
                            stderr_tail.pop_front();
                        }
                        stderr_tail.push_back(s);
                    }
                }
            }
            child.wait().await
        };

        let status = match self.config.timeout_secs {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), collect).await {
                Ok(status) => status?,
                Err(_) => {
                    warn!(
                        "{} run {} timed out after {}s, killing it",
                        self.config.name, attempt.run_index, secs
                    );
                    if let Err(e) = child.kill().await {
                        debug!("Failed to kill timed out command: {}", e);
                    }
                    return Ok(OperationReport::failed(vec![Failure::new(format!(
                        "timed out after {}s",
                        secs
                    ))]));
                }
            },
            None => collect.await?,
        };

        debug!(
            "{} run {} attempt {} exited with {}",
            self.config.name, attempt.run_index, attempt.number, status
        );

        if status.success() {
            Ok(OperationReport::passed())
        } else {
            let mut failure = Failure::new(format!("`{}` exited with {}", self.config.command, status));
            if !stderr_tail.is_empty() {
                let tail = Vec::from(stderr_tail).join(&b'\n');
                failure = failure.with_trace(String::from_utf8_lossy(&tail));
            }
            Ok(OperationReport::failed(vec![failure]))
        }
    }
}

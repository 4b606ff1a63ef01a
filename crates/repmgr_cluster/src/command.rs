//! Local shell command execution.

use async_trait::async_trait;
use repmgr_common::{RepmgrError, RepmgrResult};
use tokio::process::Command;
use tracing::debug;

/// Exit status produced by SIGPIPE when output capture ends early.
const SIGPIPE_STATUS: i32 = 141;

/// Captured result of a shell command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status; -1 when the process was killed by a signal.
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0 || self.status == SIGPIPE_STATUS
    }

    /// Convert a non-zero exit into a `LocalCommand` error.
    pub fn into_result(self, command: &str) -> RepmgrResult<Self> {
        if self.success() {
            return Ok(self);
        }
        let mut err = RepmgrError::local_command(format!(
            "command \"{}\" exited with status {}",
            command, self.status
        ));
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            err.detail = Some(stderr.lines().last().unwrap_or_default().to_string());
        }
        Err(err)
    }
}

/// Runs a command line through `sh -c`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> RepmgrResult<CommandOutput>;
}

/// Production runner.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str) -> RepmgrResult<CommandOutput> {
        debug!("executing:\n  {}", command);
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| {
                RepmgrError::local_command(format!("unable to execute \"{}\"", command))
                    .with_detail(e.to_string())
            })?;
        let result = CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!("command exited with status {}", result.status);
        Ok(result)
    }
}

/// Quote `s` for inclusion in a POSIX shell command line.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

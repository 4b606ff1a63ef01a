//! Remote execution over SSH.
//!
//! Peer-side work is always a self-invocation of `repmgr` on the peer. The
//! command runs in batch mode so a missing key never blocks on a password
//! prompt. Stdout is captured directly; stderr goes to a temporary file under
//! `TMPDIR` and is appended after stdout once the command has finished.

use std::sync::Arc;

use async_trait::async_trait;
use repmgr_common::config::RepmgrConfig;
use tracing::{debug, warn};

use crate::command::{shell_quote, CommandRunner};

/// Outcome of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutput {
    pub success: bool,
    /// Stdout followed by stderr.
    pub output: String,
}

impl RemoteOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failed() -> Self {
        Self::default()
    }

    /// A peer that printed nothing at all is treated as unreachable.
    pub fn is_empty(&self) -> bool {
        self.output.trim().is_empty()
    }
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(&self, host: &str, user: Option<&str>, command: &str) -> RemoteOutput;
}

/// Build the full `ssh` invocation.
pub fn build_ssh_command(
    ssh_options: &str,
    host: &str,
    user: Option<&str>,
    command: &str,
    stderr_path: Option<&str>,
) -> String {
    let target = match user {
        Some(u) if !u.is_empty() => format!("{}@{}", u, host),
        _ => host.to_string(),
    };
    let mut cmd = String::from("ssh -o Batchmode=yes");
    if !ssh_options.trim().is_empty() {
        cmd.push(' ');
        cmd.push_str(ssh_options.trim());
    }
    cmd.push(' ');
    cmd.push_str(&shell_quote(&target));
    cmd.push(' ');
    cmd.push_str(&shell_quote(command));
    if let Some(p) = stderr_path {
        cmd.push_str(" 2>");
        cmd.push_str(&shell_quote(p));
    }
    cmd
}

/// Production executor: `ssh` through the local command runner.
pub struct SshExecutor {
    ssh_options: String,
    runner: Arc<dyn CommandRunner>,
}

impl SshExecutor {
    pub fn new(ssh_options: &str, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            ssh_options: ssh_options.to_string(),
            runner,
        }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, host: &str, user: Option<&str>, command: &str) -> RemoteOutput {
        let stderr_file = match tempfile::Builder::new()
            .prefix("repmgr_ssh.")
            .tempfile_in(std::env::temp_dir())
        {
            Ok(f) => Some(f),
            Err(e) => {
                warn!("unable to create temporary file for ssh stderr: {}", e);
                None
            }
        };
        let stderr_path = stderr_file
            .as_ref()
            .map(|f| f.path().to_string_lossy().into_owned());
        let ssh = build_ssh_command(&self.ssh_options, host, user, command, stderr_path.as_deref());
        debug!("remote command: {}", ssh);

        let out = match self.runner.run(&ssh).await {
            Ok(o) => o,
            Err(e) => {
                warn!("unable to execute ssh: {}", e);
                return RemoteOutput::failed();
            }
        };
        let mut output = out.stdout.clone();
        if let Some(path) = &stderr_path {
            if let Ok(err_text) = std::fs::read_to_string(path) {
                output.push_str(&err_text);
            }
        }
        // The temporary file is removed when `stderr_file` drops.
        drop(stderr_file);
        RemoteOutput {
            success: out.success(),
            output,
        }
    }
}

/// Builds self-invocations of `repmgr` for peers.
#[derive(Debug, Clone)]
pub struct RemoteRepmgr {
    binary: String,
    config_file: Option<String>,
    log_level: String,
}

impl RemoteRepmgr {
    pub fn new(config: &RepmgrConfig, remote_config_file: Option<&str>) -> Self {
        Self {
            binary: config.binaries.repmgr_binary(),
            config_file: remote_config_file.map(|s| s.to_string()),
            log_level: "info".to_string(),
        }
    }

    pub fn with_log_level(mut self, level: &str) -> Self {
        self.log_level = level.to_string();
        self
    }

    /// `repmgr [-f file] [-d conninfo] -L level {args}`
    pub fn command(&self, conninfo: Option<&str>, args: &str) -> String {
        let mut cmd = self.binary.clone();
        if let Some(f) = &self.config_file {
            cmd.push_str(" -f ");
            cmd.push_str(&shell_quote(f));
        }
        if let Some(c) = conninfo {
            cmd.push_str(" -d ");
            cmd.push_str(&shell_quote(c));
        }
        cmd.push_str(" -L ");
        cmd.push_str(&self.log_level);
        cmd.push(' ');
        cmd.push_str(args);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use parking_lot::Mutex;
    use repmgr_common::RepmgrResult;

    #[test]
    fn test_build_ssh_command() {
        let cmd = build_ssh_command("-q -o ConnectTimeout=10", "node2", Some("postgres"), "repmgr cluster show --csv", None);
        assert_eq!(
            cmd,
            "ssh -o Batchmode=yes -q -o ConnectTimeout=10 postgres@node2 'repmgr cluster show --csv'"
        );
        let cmd = build_ssh_command("", "node3", None, "/bin/true", Some("/tmp/x"));
        assert_eq!(cmd, "ssh -o Batchmode=yes node3 /bin/true 2>/tmp/x");
    }

    #[test]
    fn test_remote_repmgr_command() {
        let cfg = RepmgrConfig::for_node(1, "node1", "host=node1", "/data");
        let r = RemoteRepmgr::new(&cfg, Some("/etc/repmgr.toml")).with_log_level("error");
        assert_eq!(
            r.command(Some("host=node2 dbname=repmgr"), "cluster show --csv --terse"),
            "repmgr -f /etc/repmgr.toml -d 'host=node2 dbname=repmgr' -L error cluster show --csv --terse"
        );
    }

    struct RecordingRunner {
        seen: Mutex<Vec<String>>,
        reply: CommandOutput,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, command: &str) -> RepmgrResult<CommandOutput> {
            self.seen.lock().push(command.to_string());
            Ok(self.reply.clone())
        }
    }

    #[tokio::test]
    async fn test_ssh_executor_reports_status() {
        let runner = Arc::new(RecordingRunner {
            seen: Mutex::new(Vec::new()),
            reply: CommandOutput::ok("1,0,0\n"),
        });
        let ssh = SshExecutor::new("", runner.clone());
        let out = ssh.run("node2", None, "repmgr cluster show --csv").await;
        assert!(out.success);
        assert_eq!(out.output, "1,0,0\n");
        let seen = runner.seen.lock();
        assert!(seen[0].starts_with("ssh -o Batchmode=yes node2 "));
        assert!(seen[0].contains(" 2>"));
    }

    #[tokio::test]
    async fn test_ssh_executor_failure_is_empty() {
        let runner = Arc::new(RecordingRunner {
            seen: Mutex::new(Vec::new()),
            reply: CommandOutput::failed(255, ""),
        });
        let ssh = SshExecutor::new("", runner);
        let out = ssh.run("node9", None, "/bin/true").await;
        assert!(!out.success);
        assert!(out.is_empty());
    }
}

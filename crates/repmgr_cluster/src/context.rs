//! Per-invocation context passed through every phase.

use std::sync::Arc;
use std::time::Duration;

use repmgr_common::config::RepmgrConfig;
use repmgr_common::interrupt::InterruptSignal;
use repmgr_common::RepmgrError;
use tokio::time::Instant;

use crate::command::{CommandRunner, ShellRunner};
use crate::db::pg::PgConnector;
use crate::db::Connector;
use crate::remote::{RemoteExecutor, RemoteRepmgr, SshExecutor};

/// Options common to every command.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    pub dry_run: bool,
    pub force: bool,
    /// Superuser to substitute for privileged operations.
    pub superuser: Option<String>,
    /// User for SSH connections to peers.
    pub remote_user: Option<String>,
    /// Configuration file path on peers.
    pub remote_config_file: Option<String>,
}

/// Configuration plus the external collaborators of one invocation.
#[derive(Clone)]
pub struct ClusterContext {
    pub config: RepmgrConfig,
    pub options: RuntimeOptions,
    pub connector: Arc<dyn Connector>,
    pub runner: Arc<dyn CommandRunner>,
    pub remote: Arc<dyn RemoteExecutor>,
    pub interrupt: InterruptSignal,
}

impl ClusterContext {
    /// Context backed by PostgreSQL, `sh` and `ssh`.
    pub fn production(config: RepmgrConfig, options: RuntimeOptions, interrupt: InterruptSignal) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner);
        let remote = Arc::new(SshExecutor::new(&config.ssh.options, runner.clone()));
        let connector = Arc::new(PgConnector::new(config.timeouts.connect_timeout));
        Self {
            config,
            options,
            connector,
            runner,
            remote,
            interrupt,
        }
    }

    pub fn remote_repmgr(&self) -> RemoteRepmgr {
        RemoteRepmgr::new(&self.config, self.options.remote_config_file.as_deref())
    }

    pub fn remote_user(&self) -> Option<&str> {
        self.options.remote_user.as_deref()
    }
}

/// Outcome of one wait in a bounded polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollWait {
    Again,
    TimedOut,
    Interrupted,
}

/// Deadline-bounded poller honouring the interrupt signal.
pub struct Poller {
    interval: Duration,
    deadline: Instant,
    interrupt: InterruptSignal,
}

impl Poller {
    pub fn new(interval_secs: u64, timeout_secs: u64, interrupt: &InterruptSignal) -> Self {
        Self {
            interval: Duration::from_secs(interval_secs.max(1)),
            deadline: Instant::now() + Duration::from_secs(timeout_secs),
            interrupt: interrupt.clone(),
        }
    }

    /// Sleep one interval unless the deadline has passed.
    pub async fn wait(&mut self) -> PollWait {
        if self.interrupt.is_interrupted() {
            return PollWait::Interrupted;
        }
        let now = Instant::now();
        if now >= self.deadline {
            return PollWait::TimedOut;
        }
        let nap = self.interval.min(self.deadline - now);
        if self.interrupt.sleep(nap).await {
            return PollWait::Interrupted;
        }
        PollWait::Again
    }
}

/// Error for a loop abandoned because of SIGINT/SIGTERM.
pub fn interrupted(step: &str) -> RepmgrError {
    RepmgrError::internal(format!("interrupted while {}", step))
        .with_hint("steps completed before the interruption have not been reverted")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_poller_times_out() {
        let signal = InterruptSignal::new();
        let mut p = Poller::new(1, 3, &signal);
        let mut waits = 0;
        loop {
            match p.wait().await {
                PollWait::Again => waits += 1,
                PollWait::TimedOut => break,
                PollWait::Interrupted => panic!("not interrupted"),
            }
        }
        assert_eq!(waits, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_interrupted() {
        let signal = InterruptSignal::new();
        let mut p = Poller::new(1, 60, &signal);
        signal.interrupt();
        assert_eq!(p.wait().await, PollWait::Interrupted);
    }
}

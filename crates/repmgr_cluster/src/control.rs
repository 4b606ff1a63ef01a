//! Local control-file reader and server-state probe.
//!
//! `global/pg_control` is read directly so the state of a stopped server can
//! be determined without a database connection. Layout offsets are those of
//! control-file version 1201 and later.

use std::path::Path;

use repmgr_common::types::{Lsn, TimelineId};
use repmgr_common::{RepmgrError, RepmgrResult};

use crate::db::Connector;

const CONTROL_FILE: &str = "global/pg_control";
const MIN_CONTROL_VERSION: u32 = 1201;

const OFF_SYSTEM_IDENTIFIER: usize = 0;
const OFF_CONTROL_VERSION: usize = 8;
const OFF_STATE: usize = 16;
const OFF_CHECKPOINT: usize = 32;
const OFF_REDO: usize = 40;
const OFF_TIMELINE: usize = 48;
const OFF_MIN_RECOVERY_POINT: usize = 136;
const OFF_MIN_RECOVERY_TLI: usize = 144;
const OFF_XLOG_SEG_SIZE: usize = 228;
const MIN_LEN: usize = OFF_XLOG_SEG_SIZE + 4;

/// Database cluster state as recorded in the control file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    Startup,
    Shutdowned,
    ShutdownedInRecovery,
    ShuttingDown,
    InCrashRecovery,
    InArchiveRecovery,
    InProduction,
    Unknown(i32),
}

impl DbState {
    pub fn from_raw(v: i32) -> Self {
        match v {
            0 => Self::Startup,
            1 => Self::Shutdowned,
            2 => Self::ShutdownedInRecovery,
            3 => Self::ShuttingDown,
            4 => Self::InCrashRecovery,
            5 => Self::InArchiveRecovery,
            6 => Self::InProduction,
            other => Self::Unknown(other),
        }
    }

    pub fn is_clean_shutdown(self) -> bool {
        matches!(self, Self::Shutdowned | Self::ShutdownedInRecovery)
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Startup => "starting up",
            Self::Shutdowned => "shut down",
            Self::ShutdownedInRecovery => "shut down in recovery",
            Self::ShuttingDown => "shutting down",
            Self::InCrashRecovery => "in crash recovery",
            Self::InArchiveRecovery => "in archive recovery",
            Self::InProduction => "in production",
            Self::Unknown(_) => "unrecognized status code",
        }
    }
}

/// Read-only snapshot of `pg_control`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFileInfo {
    pub system_identifier: u64,
    pub control_version: u32,
    pub state: DbState,
    pub checkpoint_lsn: Lsn,
    pub redo_lsn: Lsn,
    pub timeline: TimelineId,
    pub min_recovery_end_lsn: Lsn,
    pub min_recovery_end_timeline: TimelineId,
    pub wal_segment_size: u32,
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_ne_bytes(b)
}

fn u64_at(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_ne_bytes(b)
}

/// Decode the leading bytes of a control file.
pub fn parse_control_file(buf: &[u8]) -> RepmgrResult<ControlFileInfo> {
    if buf.len() < MIN_LEN {
        return Err(RepmgrError::internal(format!(
            "control file too short ({} bytes)",
            buf.len()
        )));
    }
    let control_version = u32_at(buf, OFF_CONTROL_VERSION);
    if control_version < MIN_CONTROL_VERSION {
        return Err(RepmgrError::internal(format!(
            "unsupported control file version {}",
            control_version
        )));
    }
    Ok(ControlFileInfo {
        system_identifier: u64_at(buf, OFF_SYSTEM_IDENTIFIER),
        control_version,
        state: DbState::from_raw(u32_at(buf, OFF_STATE) as i32),
        checkpoint_lsn: Lsn(u64_at(buf, OFF_CHECKPOINT)),
        redo_lsn: Lsn(u64_at(buf, OFF_REDO)),
        timeline: u32_at(buf, OFF_TIMELINE),
        min_recovery_end_lsn: Lsn(u64_at(buf, OFF_MIN_RECOVERY_POINT)),
        min_recovery_end_timeline: u32_at(buf, OFF_MIN_RECOVERY_TLI),
        wal_segment_size: u32_at(buf, OFF_XLOG_SEG_SIZE),
    })
}

pub fn read_control_file(data_dir: &Path) -> RepmgrResult<ControlFileInfo> {
    let path = data_dir.join(CONTROL_FILE);
    let buf = std::fs::read(&path).map_err(|e| {
        RepmgrError::internal(format!("unable to read control file \"{}\"", path.display()))
            .with_detail(e.to_string())
    })?;
    parse_control_file(&buf)
}

// ---------------------------------------------------------------------------
// Server status probe
// ---------------------------------------------------------------------------

/// Answer of `node status --is-shutdown-cleanly`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Running,
    ShuttingDown,
    Shutdown { checkpoint_lsn: Lsn },
    UncleanShutdown,
    Unknown,
}

impl ServerStatus {
    pub fn render(&self) -> String {
        match self {
            Self::Running => "--state=RUNNING".to_string(),
            Self::ShuttingDown => "--state=SHUTTING_DOWN".to_string(),
            Self::Shutdown { checkpoint_lsn } => {
                format!("--state=SHUTDOWN --last-checkpoint-lsn={}", checkpoint_lsn)
            }
            Self::UncleanShutdown => "--state=UNCLEAN_SHUTDOWN".to_string(),
            Self::Unknown => "--state=UNKNOWN".to_string(),
        }
    }

    /// Parse probe output from a peer. Anything unrecognised is `Unknown`.
    pub fn parse(output: &str) -> Self {
        let line = output
            .lines()
            .map(str::trim)
            .find(|l| l.starts_with("--state="))
            .unwrap_or("");
        let mut state = "";
        let mut lsn = None;
        for tok in line.split_whitespace() {
            if let Some(v) = tok.strip_prefix("--state=") {
                state = v;
            } else if let Some(v) = tok.strip_prefix("--last-checkpoint-lsn=") {
                lsn = v.parse::<Lsn>().ok();
            }
        }
        match (state, lsn) {
            ("RUNNING", _) => Self::Running,
            ("SHUTTING_DOWN", _) => Self::ShuttingDown,
            ("SHUTDOWN", Some(checkpoint_lsn)) => Self::Shutdown { checkpoint_lsn },
            ("UNCLEAN_SHUTDOWN", _) => Self::UncleanShutdown,
            _ => Self::Unknown,
        }
    }
}

/// Combine a ping with the control file: a responding server is running,
/// otherwise the control-file state decides.
pub fn status_from_control(running: bool, rejecting: bool, control: Option<&ControlFileInfo>) -> ServerStatus {
    if rejecting {
        return ServerStatus::ShuttingDown;
    }
    if running {
        return match control.map(|c| c.state) {
            Some(DbState::ShuttingDown) => ServerStatus::ShuttingDown,
            _ => ServerStatus::Running,
        };
    }
    match control {
        Some(c) if c.state.is_clean_shutdown() => ServerStatus::Shutdown {
            checkpoint_lsn: c.checkpoint_lsn,
        },
        Some(c) if c.state == DbState::ShuttingDown => ServerStatus::ShuttingDown,
        Some(_) => ServerStatus::UncleanShutdown,
        None => ServerStatus::Unknown,
    }
}

/// Probe the local server via ping and control file.
pub async fn probe_local_status(
    connector: &dyn Connector,
    conninfo: &str,
    data_dir: &Path,
) -> ServerStatus {
    let ping = connector.ping(conninfo).await;
    let control = read_control_file(data_dir).ok();
    status_from_control(
        ping == crate::db::PingStatus::Ok,
        ping == crate::db::PingStatus::Reject,
        control.as_ref(),
    )
}

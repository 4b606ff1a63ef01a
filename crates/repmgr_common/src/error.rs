use thiserror::Error;

/// Convenience alias for `Result<T, RepmgrError>`.
pub type RepmgrResult<T> = Result<T, RepmgrError>;

/// Process exit codes. These values are stable and consumed by scripts.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const BAD_CONFIG: i32 = 1;
    pub const DB_CONN: i32 = 6;
    pub const DB_QUERY: i32 = 7;
    pub const PROMOTION_FAIL: i32 = 8;
    pub const BAD_SSH: i32 = 12;
    pub const BAD_BASEBACKUP: i32 = 14;
    pub const INTERNAL: i32 = 15;
    pub const SWITCHOVER_FAIL: i32 = 18;
    pub const OUT_OF_MEMORY: i32 = 21;
    pub const SWITCHOVER_INCOMPLETE: i32 = 22;
    pub const FOLLOW_FAIL: i32 = 23;
    pub const REJOIN_FAIL: i32 = 24;
    pub const NODE_STATUS: i32 = 25;
    pub const REPMGRD_PAUSE: i32 = 26;
    pub const REPMGRD_SERVICE: i32 = 27;
    pub const LOCAL_COMMAND: i32 = 28;
}

/// Error classification; each kind maps to exactly one exit code.
///
/// - `BadConfig`   : configuration file or command-line operand invalid
/// - `DbConnection`: a database could not be reached
/// - `DbQuery`     : a query failed or its result could not be parsed
/// - `Ssh`         : a remote command could not be run or produced no output
/// - `NodeStatus`  : observed state violates an invariant
/// - `Internal`    : impossible values and parse errors from our own output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadConfig,
    DbConnection,
    DbQuery,
    PromotionFail,
    Ssh,
    BadBaseBackup,
    Internal,
    SwitchoverFail,
    OutOfMemory,
    SwitchoverIncomplete,
    FollowFail,
    RejoinFail,
    NodeStatus,
    DaemonPause,
    DaemonService,
    LocalCommand,
}

impl ErrorKind {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::BadConfig => exit_code::BAD_CONFIG,
            Self::DbConnection => exit_code::DB_CONN,
            Self::DbQuery => exit_code::DB_QUERY,
            Self::PromotionFail => exit_code::PROMOTION_FAIL,
            Self::Ssh => exit_code::BAD_SSH,
            Self::BadBaseBackup => exit_code::BAD_BASEBACKUP,
            Self::Internal => exit_code::INTERNAL,
            Self::SwitchoverFail => exit_code::SWITCHOVER_FAIL,
            Self::OutOfMemory => exit_code::OUT_OF_MEMORY,
            Self::SwitchoverIncomplete => exit_code::SWITCHOVER_INCOMPLETE,
            Self::FollowFail => exit_code::FOLLOW_FAIL,
            Self::RejoinFail => exit_code::REJOIN_FAIL,
            Self::NodeStatus => exit_code::NODE_STATUS,
            Self::DaemonPause => exit_code::REPMGRD_PAUSE,
            Self::DaemonService => exit_code::REPMGRD_SERVICE,
            Self::LocalCommand => exit_code::LOCAL_COMMAND,
        }
    }
}

/// Top-level error: one message line plus optional detail and hint lines.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct RepmgrError {
    pub kind: ErrorKind,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// The same statement may succeed if run again.
    pub transient: bool,
}

impl RepmgrError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
            hint: None,
            transient: false,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    pub fn bad_config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadConfig, message)
    }

    pub fn db_connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DbConnection, message)
    }

    pub fn db_query(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DbQuery, message)
    }

    pub fn ssh(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Ssh, message)
    }

    pub fn node_status(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NodeStatus, message)
    }

    pub fn rejoin_fail(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RejoinFail, message)
    }

    pub fn local_command(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LocalCommand, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Operations requiring superuser privileges fail with this error.
    pub fn superuser_required(operation: &str) -> Self {
        Self::db_query(format!("{} requires superuser privileges", operation))
            .with_hint("provide a superuser with -S/--superuser")
    }

    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }

    /// Render as the lines printed by the CLI: message, then DETAIL and HINT.
    pub fn report_lines(&self) -> Vec<String> {
        let mut lines = vec![format!("ERROR: {}", self.message)];
        if let Some(d) = &self.detail {
            lines.push(format!("DETAIL: {}", d));
        }
        if let Some(h) = &self.hint {
            lines.push(format!("HINT: {}", h));
        }
        lines
    }
}

impl From<std::io::Error> for RepmgrError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::OutOfMemory {
            return Self::new(ErrorKind::OutOfMemory, e.to_string());
        }
        Self::local_command(e.to_string())
    }
}

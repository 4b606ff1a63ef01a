use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::conninfo::ConnInfo;
use crate::error::{RepmgrError, RepmgrResult};
use crate::types::NodeId;

/// Default configuration file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "repmgr.toml";

/// Files archived around a rewind unless configured otherwise.
pub const DEFAULT_REWIND_CONFIG_FILES: &[&str] = &[
    "postgresql.conf",
    "postgresql.auto.conf",
    "pg_hba.conf",
    "pg_ident.conf",
];

/// Top-level node configuration, one file per node (`repmgr.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepmgrConfig {
    pub node_id: i32,
    pub node_name: String,
    /// Connection string other nodes use to reach this node.
    pub conninfo: String,
    pub data_directory: String,
    /// Replication user; defaults to the conninfo user.
    #[serde(default)]
    pub replication_user: String,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Directory holding postgresql.conf when outside the data directory.
    #[serde(default)]
    pub config_directory: String,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub binaries: BinariesConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub rewind: RewindConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_location() -> String {
    "default".to_string()
}

fn default_priority() -> i32 {
    100
}

/// `[replication]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub use_replication_slots: bool,
    /// Maximum primary/standby LSN distance tolerated before switchover proceeds.
    pub switchover_lag_threshold_bytes: u64,
    /// Seconds of apply lag reported as WARNING by `node check`.
    pub replication_lag_warning: i64,
    /// Seconds of apply lag reported as CRITICAL by `node check`.
    pub replication_lag_critical: i64,
    pub archive_ready_warning: i64,
    pub archive_ready_critical: i64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            use_replication_slots: true,
            switchover_lag_threshold_bytes: 16 * 1024 * 1024,
            replication_lag_warning: 300,
            replication_lag_critical: 600,
            archive_ready_warning: 16,
            archive_ready_critical: 128,
        }
    }
}

/// `[binaries]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BinariesConfig {
    /// Directory containing pg_ctl, pg_basebackup and pg_rewind; empty means PATH.
    pub pg_bindir: String,
    /// Directory containing the repmgr binary on peers; empty means PATH.
    pub repmgr_bindir: String,
    /// Extra options passed to every pg_ctl invocation.
    pub pg_ctl_options: String,
    /// Extra options passed to pg_basebackup.
    pub pg_basebackup_options: String,
}

impl BinariesConfig {
    pub fn pg_binary(&self, name: &str) -> String {
        bin_path(&self.pg_bindir, name)
    }

    pub fn repmgr_binary(&self) -> String {
        bin_path(&self.repmgr_bindir, "repmgr")
    }
}

fn bin_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        Path::new(dir).join(name).to_string_lossy().into_owned()
    }
}

/// `[service]` section: overrides for the pg_ctl defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub start_command: Option<String>,
    pub stop_command: Option<String>,
    pub restart_command: Option<String>,
    pub reload_command: Option<String>,
    pub promote_command: Option<String>,
}

/// `[rewind]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewindConfig {
    /// Full rewind command; empty means `{pg_bindir}/pg_rewind`.
    pub command: String,
    /// Basenames archived from the data directory before a rewind.
    pub config_files: Vec<String>,
    /// Parent of the per-node archive directory; empty means the temp dir.
    pub config_archive_dir: String,
}

impl Default for RewindConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            config_files: DEFAULT_REWIND_CONFIG_FILES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            config_archive_dir: String::new(),
        }
    }
}

/// `[timeouts]` section. All values in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub promote_check_timeout: u64,
    pub promote_check_interval: u64,
    pub primary_notification_timeout: u64,
    pub node_rejoin_timeout: u64,
    pub standby_follow_timeout: u64,
    pub shutdown_check_timeout: u64,
    pub wal_receive_check_timeout: u64,
    pub standby_reconnect_timeout: u64,
    pub replication_lag_timeout: u64,
    /// Interval between polls for every loop other than promote.
    pub check_interval: u64,
    pub connect_timeout: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            promote_check_timeout: 60,
            promote_check_interval: 1,
            primary_notification_timeout: 60,
            node_rejoin_timeout: 60,
            standby_follow_timeout: 30,
            shutdown_check_timeout: 60,
            wal_receive_check_timeout: 30,
            standby_reconnect_timeout: 60,
            replication_lag_timeout: 60,
            check_interval: 1,
            connect_timeout: 2,
        }
    }
}

/// `[ssh]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub options: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            options: "-q -o ConnectTimeout=10".to_string(),
        }
    }
}

/// `[events]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Shell template run after each recorded event; empty disables it.
    pub notification_command: String,
    /// Event names passed to the command; empty means all.
    pub notifications: Vec<String>,
    /// Default for `cluster cleanup --keep-history`.
    pub keep_history_days: u32,
}

/// `[log]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl RepmgrConfig {
    /// Minimal configuration for a node, used by tests and ad-hoc invocations.
    pub fn for_node(node_id: i32, node_name: &str, conninfo: &str, data_directory: &str) -> Self {
        Self {
            node_id,
            node_name: node_name.to_string(),
            conninfo: conninfo.to_string(),
            data_directory: data_directory.to_string(),
            replication_user: String::new(),
            location: default_location(),
            priority: default_priority(),
            config_directory: String::new(),
            replication: ReplicationConfig::default(),
            binaries: BinariesConfig::default(),
            service: ServiceConfig::default(),
            rewind: RewindConfig::default(),
            timeouts: TimeoutConfig::default(),
            ssh: SshConfig::default(),
            events: EventsConfig::default(),
            log: LogConfig::default(),
        }
    }

    pub fn from_toml_str(s: &str) -> RepmgrResult<Self> {
        toml::from_str(s).map_err(|e| {
            RepmgrError::bad_config("could not parse the configuration file")
                .with_detail(e.to_string().lines().next().unwrap_or_default().to_string())
        })
    }

    pub fn load(path: &Path) -> RepmgrResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RepmgrError::bad_config(format!(
                "could not read configuration file \"{}\"",
                path.display()
            ))
            .with_detail(e.to_string())
        })?;
        let cfg = Self::from_toml_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn node_id(&self) -> NodeId {
        NodeId(self.node_id)
    }

    /// Replication user: configured value, else the conninfo user.
    pub fn effective_replication_user(&self) -> String {
        if !self.replication_user.is_empty() {
            return self.replication_user.clone();
        }
        ConnInfo::parse(&self.conninfo)
            .ok()
            .and_then(|ci| ci.get("user").map(|u| u.to_string()))
            .unwrap_or_default()
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_directory)
    }

    /// Parent directory for the per-node config archive.
    pub fn config_archive_root(&self) -> PathBuf {
        if self.rewind.config_archive_dir.is_empty() {
            std::env::temp_dir()
        } else {
            PathBuf::from(&self.rewind.config_archive_dir)
        }
    }

    /// Check the configuration; every problem is reported in one error.
    pub fn validate(&self) -> RepmgrResult<()> {
        let mut problems = Vec::new();
        if self.node_id <= 0 {
            problems.push("\"node_id\" must be a positive integer".to_string());
        }
        if self.node_name.is_empty() {
            problems.push("\"node_name\" is required".to_string());
        } else if self.node_name.len() > 63 {
            problems.push("\"node_name\" must be shorter than 64 characters".to_string());
        }
        if self.conninfo.is_empty() {
            problems.push("\"conninfo\" is required".to_string());
        } else if let Err(e) = ConnInfo::parse(&self.conninfo) {
            problems.push(format!("\"conninfo\" is invalid: {}", e));
        }
        if self.data_directory.is_empty() {
            problems.push("\"data_directory\" is required".to_string());
        }
        if self.priority < 0 {
            problems.push("\"priority\" must be zero or greater".to_string());
        }
        let r = &self.replication;
        if r.replication_lag_warning >= r.replication_lag_critical {
            problems.push(
                "\"replication_lag_warning\" must be less than \"replication_lag_critical\""
                    .to_string(),
            );
        }
        if r.archive_ready_warning >= r.archive_ready_critical {
            problems.push(
                "\"archive_ready_warning\" must be less than \"archive_ready_critical\"".to_string(),
            );
        }
        if self.timeouts.promote_check_interval == 0 || self.timeouts.check_interval == 0 {
            problems.push("check intervals must be at least 1 second".to_string());
        }
        if !LOG_LEVELS.contains(&self.log.level.to_lowercase().as_str()) {
            problems.push(format!("\"log.level\" \"{}\" is not valid", self.log.level));
        }
        if problems.is_empty() {
            return Ok(());
        }
        let mut err = RepmgrError::bad_config(format!(
            "{} configuration problem(s) found",
            problems.len()
        ));
        err.detail = Some(problems.join("\n"));
        Err(err)
    }
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// repmgr: PostgreSQL replication cluster manager
#[derive(Debug, Parser)]
#[command(
    name = "repmgr",
    about = "Manage a PostgreSQL streaming replication cluster",
    version
)]
pub struct Args {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Options accepted before or after any verb.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct GlobalArgs {
    /// Path to the configuration file
    #[arg(short = 'f', long = "config-file", env = "REPMGR_CONFIG", global = true)]
    pub config_file: Option<PathBuf>,

    /// Database name or full conninfo string
    #[arg(short = 'd', long = "dbname", global = true)]
    pub dbname: Option<String>,

    /// Database server host
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Database server port
    #[arg(short = 'p', long, global = true)]
    pub port: Option<u16>,

    /// Database user
    #[arg(short = 'U', long = "username", global = true)]
    pub username: Option<String>,

    /// Superuser for privileged operations
    #[arg(short = 'S', long, global = true)]
    pub superuser: Option<String>,

    /// Check prerequisites but perform no actions
    #[arg(long = "dry-run", global = true)]
    pub dry_run: bool,

    /// Force potentially dangerous operations
    #[arg(short = 'F', long, global = true)]
    pub force: bool,

    /// Display additional log output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Don't display detail, hints and other non-critical output
    #[arg(short = 't', long, global = true)]
    pub terse: bool,

    /// Emit output as CSV
    #[arg(long, global = true)]
    pub csv: bool,

    /// Emit output in Nagios format
    #[arg(long, global = true)]
    pub nagios: bool,

    /// Emit output as --key=value pairs
    #[arg(long, global = true)]
    pub optformat: bool,

    /// ID of the node to act on or filter by
    #[arg(long = "node-id", global = true)]
    pub node_id: Option<i32>,

    /// Name of the node to act on or filter by
    #[arg(long = "node-name", global = true)]
    pub node_name: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long = "log-level", global = true)]
    pub log_level: Option<String>,

    /// Write log output to the configured log file
    #[arg(long = "log-to-file", global = true)]
    pub log_to_file: bool,

    /// SSH user for remote nodes
    #[arg(long = "remote-user", global = true)]
    pub remote_user: Option<String>,

    /// Configuration file path on remote nodes
    #[arg(long = "remote-config-file", global = true)]
    pub remote_config_file: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Register or unregister the primary
    #[command(subcommand)]
    Primary(PrimaryCmd),
    /// Standby management
    #[command(subcommand)]
    Standby(StandbyCmd),
    /// Register or unregister a witness
    #[command(subcommand)]
    Witness(WitnessCmd),
    /// Operations on the local node
    #[command(subcommand)]
    Node(NodeCmd),
    /// Cluster-wide views
    #[command(subcommand)]
    Cluster(ClusterCmd),
    /// Control the repmgrd daemons
    #[command(subcommand)]
    Service(ServiceCmd),
}

#[derive(Debug, Subcommand)]
pub enum PrimaryCmd {
    Register,
    Unregister,
}

#[derive(Debug, Subcommand)]
pub enum WitnessCmd {
    Register,
    Unregister,
}

#[derive(Debug, Subcommand)]
pub enum StandbyCmd {
    Register(StandbyRegisterArgs),
    Unregister,
    Clone(StandbyCloneArgs),
    Promote(PromoteArgs),
    Follow(FollowArgs),
    Switchover(SwitchoverArgs),
}

#[derive(Debug, Clone, clap::Args)]
pub struct StandbyRegisterArgs {
    #[arg(long = "upstream-node-id")]
    pub upstream_node_id: Option<i32>,
    /// Wait up to this many seconds for the record to reach the standby
    #[arg(long = "wait-sync", value_name = "SECS", num_args = 0..=1, default_missing_value = "0")]
    pub wait_sync: Option<u64>,
}

#[derive(Debug, Clone, clap::Args)]
pub struct StandbyCloneArgs {
    #[arg(long = "upstream-node-id")]
    pub upstream_node_id: Option<i32>,
    /// Request a fast checkpoint on the source
    #[arg(short = 'c', long = "fast-checkpoint")]
    pub fast_checkpoint: bool,
}

#[derive(Debug, Clone, clap::Args)]
pub struct PromoteArgs {
    #[arg(long = "siblings-follow")]
    pub siblings_follow: bool,
}

#[derive(Debug, Clone, clap::Args)]
pub struct FollowArgs {
    #[arg(long = "upstream-node-id")]
    pub upstream_node_id: Option<i32>,
}

#[derive(Debug, Clone, clap::Args)]
pub struct SwitchoverArgs {
    #[arg(long = "always-promote")]
    pub always_promote: bool,
    #[arg(long = "force-rewind")]
    pub force_rewind: bool,
    #[arg(long = "siblings-follow")]
    pub siblings_follow: bool,
    #[arg(long = "repmgrd-no-pause")]
    pub repmgrd_no_pause: bool,
    #[arg(long = "repmgrd-force-unpause")]
    pub repmgrd_force_unpause: bool,
}

#[derive(Debug, Subcommand)]
pub enum NodeCmd {
    Status(NodeStatusArgs),
    Check(NodeCheckArgs),
    Rejoin(RejoinArgs),
    Service(NodeServiceArgs),
    Control(NodeControlArgs),
}

#[derive(Debug, Clone, clap::Args)]
pub struct NodeStatusArgs {
    /// Print the shutdown state of the local data directory
    #[arg(long = "is-shutdown-cleanly")]
    pub is_shutdown_cleanly: bool,
}

#[derive(Debug, Clone, Default, clap::Args)]
pub struct NodeCheckArgs {
    #[arg(long)]
    pub role: bool,
    #[arg(long = "replication-lag")]
    pub replication_lag: bool,
    #[arg(long = "archive-ready")]
    pub archive_ready: bool,
    #[arg(long)]
    pub downstream: bool,
    #[arg(long)]
    pub upstream: bool,
    #[arg(long)]
    pub slots: bool,
    #[arg(long = "missing-slots")]
    pub missing_slots: bool,
    #[arg(long = "data-directory-config")]
    pub data_directory_config: bool,
    #[arg(long = "replication-connection")]
    pub replication_connection: bool,
    #[arg(long = "remote-node-id")]
    pub remote_node_id: Option<i32>,
    #[arg(long = "db-connection")]
    pub db_connection: bool,
}

#[derive(Debug, Clone, clap::Args)]
pub struct RejoinArgs {
    #[arg(long = "force-rewind")]
    pub force_rewind: bool,
    /// Comma-separated configuration files to preserve across a rewind
    #[arg(long = "config-files")]
    pub config_files: Option<String>,
    /// Parent directory for the configuration file archive
    #[arg(long = "config-archive-dir")]
    pub config_archive_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, clap::Args)]
pub struct NodeServiceArgs {
    /// start, stop, restart, reload or promote
    #[arg(long)]
    pub action: Option<String>,
    /// List the command executed for each action
    #[arg(long = "list-actions")]
    pub list_actions: bool,
    /// Issue a CHECKPOINT before stopping or restarting
    #[arg(long)]
    pub checkpoint: bool,
}

#[derive(Debug, Clone, clap::Args)]
pub struct NodeControlArgs {
    #[arg(long = "disable-wal-receiver", conflicts_with = "enable_wal_receiver")]
    pub disable_wal_receiver: bool,
    #[arg(long = "enable-wal-receiver")]
    pub enable_wal_receiver: bool,
}

#[derive(Debug, Subcommand)]
pub enum ClusterCmd {
    Show,
    Matrix,
    Crosscheck,
    Event(EventArgs),
    Cleanup(CleanupArgs),
}

#[derive(Debug, Clone, clap::Args)]
pub struct EventArgs {
    #[arg(long, default_value_t = 20)]
    pub limit: i64,
    /// Show every event
    #[arg(long, conflicts_with = "limit")]
    pub all: bool,
    #[arg(long)]
    pub event: Option<String>,
    /// Omit the details column
    #[arg(long)]
    pub compact: bool,
}

#[derive(Debug, Clone, clap::Args)]
pub struct CleanupArgs {
    /// Keep this many days of event history; defaults to `[events] keep_history_days`
    #[arg(short = 'k', long = "keep-history")]
    pub keep_history: Option<u32>,
}

#[derive(Debug, Subcommand)]
pub enum ServiceCmd {
    Status,
    Pause,
    Unpause,
}

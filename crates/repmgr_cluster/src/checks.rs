//! `node check`: individual health checks and their output formats.
//!
//! Each check yields a [`CheckResult`] that renders as text, CSV, Nagios
//! (`NAME STATE: message | metric=value;warn;crit`) or optformat
//! (`--status=OK --files=0`). Switchover runs some of these on the current
//! primary over SSH and parses the optformat answer.

use std::fmt;

use repmgr_common::types::{NodeId, NodeRecord, NodeType, RecoveryType};
use repmgr_common::{conninfo, RepmgrError, RepmgrResult};
use tracing::debug;

use crate::context::ClusterContext;
use crate::db::DbSession;
use crate::gateway;
use crate::oracle::{self, NodeAttached};
use crate::slots;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CheckStatus {
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl CheckStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "OK" => Self::Ok,
            "WARNING" => Self::Warning,
            "CRITICAL" => Self::Critical,
            _ => Self::Unknown,
        }
    }

    /// Nagios plugin exit status.
    pub fn nagios_code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Warning => 1,
            Self::Critical => 2,
            Self::Unknown => 3,
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The individual checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    Role,
    ReplicationLag,
    ArchiveReady,
    Downstream,
    Upstream,
    Slots,
    MissingSlots,
    DataDirectoryConfig,
    ReplicationConnection,
    DbConnection,
}

impl CheckKind {
    /// Checks run by a bare `node check`.
    pub const DEFAULT_SET: [CheckKind; 7] = [
        Self::Role,
        Self::ReplicationLag,
        Self::ArchiveReady,
        Self::Downstream,
        Self::Upstream,
        Self::Slots,
        Self::MissingSlots,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Role => "Server role",
            Self::ReplicationLag => "Replication lag",
            Self::ArchiveReady => "WAL archiving",
            Self::Downstream => "Downstream servers",
            Self::Upstream => "Upstream connection",
            Self::Slots => "Replication slots",
            Self::MissingSlots => "Missing physical replication slots",
            Self::DataDirectoryConfig => "Configured data directory",
            Self::ReplicationConnection => "Replication connection",
            Self::DbConnection => "Database connection",
        }
    }

    pub fn nagios_name(self) -> &'static str {
        match self {
            Self::Role => "SERVER_ROLE",
            Self::ReplicationLag => "REPLICATION_LAG",
            Self::ArchiveReady => "WAL_ARCHIVE_READY",
            Self::Downstream => "DOWNSTREAM_SERVERS",
            Self::Upstream => "UPSTREAM_SERVER",
            Self::Slots => "REPLICATION_SLOTS",
            Self::MissingSlots => "MISSING_SLOTS",
            Self::DataDirectoryConfig => "DATA_DIRECTORY_CONFIG",
            Self::ReplicationConnection => "REPLICATION_CONNECTION",
            Self::DbConnection => "DB_CONNECTION",
        }
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub kind: CheckKind,
    pub status: CheckStatus,
    pub message: String,
    /// Extra lines printed under the text output.
    pub details: Vec<String>,
    /// Nagios performance data, e.g. `lag=3;300;600`.
    pub perfdata: Option<String>,
    /// Extra `--key=value` pairs for optformat.
    pub optformat: Vec<(String, String)>,
}

impl CheckResult {
    pub fn new(kind: CheckKind, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            message: message.into(),
            details: Vec::new(),
            perfdata: None,
            optformat: Vec::new(),
        }
    }

    fn with_perfdata(mut self, perfdata: String) -> Self {
        self.perfdata = Some(perfdata);
        self
    }

    fn with_opt(mut self, key: &str, value: impl ToString) -> Self {
        self.optformat.push((key.to_string(), value.to_string()));
        self
    }

    pub fn render_text(&self) -> String {
        let mut out = format!("{}: {} ({})\n", self.kind.label(), self.status, self.message);
        for d in &self.details {
            out.push_str(&format!("    {}\n", d));
        }
        out
    }

    pub fn render_nagios(&self) -> String {
        match &self.perfdata {
            Some(p) => format!(
                "{} {}: {} | {}\n",
                self.kind.nagios_name(),
                self.status,
                self.message,
                p
            ),
            None => format!("{} {}: {}\n", self.kind.nagios_name(), self.status, self.message),
        }
    }

    pub fn render_optformat(&self) -> String {
        let mut out = format!("--status={}", self.status);
        for (k, v) in &self.optformat {
            out.push_str(&format!(" --{}={}", k, v));
        }
        out.push('\n');
        out
    }
}

/// `"label","STATUS"` lines.
pub fn render_csv(results: &[CheckResult]) -> String {
    results
        .iter()
        .map(|r| format!("\"{}\",\"{}\"\n", r.kind.label(), r.status))
        .collect()
}

/// Parse `--key=value` tokens from a peer's optformat output.
pub fn parse_optformat(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .find(|l| l.trim_start().starts_with("--status="))
        .unwrap_or("")
        .split_whitespace()
        .filter_map(|tok| {
            let tok = tok.strip_prefix("--")?;
            let (k, v) = tok.split_once('=')?;
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

/// Status reported in a peer's optformat output; `Unknown` if absent.
pub fn optformat_status(output: &str) -> CheckStatus {
    parse_optformat(output)
        .into_iter()
        .find(|(k, _)| k == "status")
        .map_or(CheckStatus::Unknown, |(_, v)| CheckStatus::parse(&v))
}

// ---------------------------------------------------------------------------
// Replication lag classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LagClass {
    /// Primaries have no replication lag.
    NotApplicable,
    Ok(i64),
    Warning(i64),
    Critical(i64),
    Unknown,
}

impl LagClass {
    pub fn status(self) -> CheckStatus {
        match self {
            Self::NotApplicable | Self::Ok(_) => CheckStatus::Ok,
            Self::Warning(_) => CheckStatus::Warning,
            Self::Critical(_) => CheckStatus::Critical,
            Self::Unknown => CheckStatus::Unknown,
        }
    }
}

pub fn classify_lag(recovery: RecoveryType, lag_seconds: Option<i64>, warning: i64, critical: i64) -> LagClass {
    if recovery == RecoveryType::Primary {
        return LagClass::NotApplicable;
    }
    match lag_seconds {
        None => LagClass::Unknown,
        Some(l) if l >= critical => LagClass::Critical(l),
        Some(l) if l >= warning => LagClass::Warning(l),
        Some(l) => LagClass::Ok(l),
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

pub async fn check_role(conn: &dyn DbSession, record: &NodeRecord) -> RepmgrResult<CheckResult> {
    let rt = conn.recovery_type().await?;
    let expected = match record.node_type {
        NodeType::Standby => RecoveryType::Standby,
        _ => RecoveryType::Primary,
    };
    let result = if rt == expected {
        CheckResult::new(
            CheckKind::Role,
            CheckStatus::Ok,
            format!("node is {}", record.node_type.as_str()),
        )
    } else if rt == RecoveryType::Unknown {
        CheckResult::new(CheckKind::Role, CheckStatus::Unknown, "unable to determine recovery state")
    } else {
        CheckResult::new(
            CheckKind::Role,
            CheckStatus::Critical,
            format!(
                "node is registered as {} but running as {}",
                record.node_type.as_str(),
                rt.as_str()
            ),
        )
    };
    Ok(result.with_opt("role", record.node_type.as_str()))
}

pub async fn check_replication_lag(ctx: &ClusterContext, conn: &dyn DbSession) -> RepmgrResult<CheckResult> {
    let rt = conn.recovery_type().await?;
    let warn = ctx.config.replication.replication_lag_warning;
    let crit = ctx.config.replication.replication_lag_critical;
    let lag = if rt == RecoveryType::Standby {
        oracle::get_replication_lag_seconds(conn).await
    } else {
        None
    };
    let class = classify_lag(rt, lag, warn, crit);
    let result = match class {
        LagClass::NotApplicable => {
            CheckResult::new(CheckKind::ReplicationLag, CheckStatus::Ok, "N/A - node is primary")
        }
        LagClass::Unknown => CheckResult::new(
            CheckKind::ReplicationLag,
            CheckStatus::Unknown,
            "unable to query replication lag",
        ),
        LagClass::Ok(l) | LagClass::Warning(l) | LagClass::Critical(l) => {
            let msg = match class {
                LagClass::Ok(_) => format!("{} seconds", l),
                LagClass::Warning(_) => format!("{} seconds, threshold: {}", l, warn),
                _ => format!("{} seconds, critical threshold: {}", l, crit),
            };
            CheckResult::new(CheckKind::ReplicationLag, class.status(), msg)
                .with_perfdata(format!("lag={};{};{}", l, warn, crit))
                .with_opt("lag", l)
        }
    };
    Ok(result)
}

pub async fn check_archive_ready(ctx: &ClusterContext, conn: &dyn DbSession) -> RepmgrResult<CheckResult> {
    let warn = ctx.config.replication.archive_ready_warning;
    let crit = ctx.config.replication.archive_ready_critical;
    let ready = match conn.ready_archive_files().await {
        Ok(n) => n,
        Err(e) => {
            debug!("unable to count ready archive files: {}", e);
            return Ok(CheckResult::new(
                CheckKind::ArchiveReady,
                CheckStatus::Unknown,
                "unable to check archive_status directory",
            ));
        }
    };
    let status = if ready >= crit {
        CheckStatus::Critical
    } else if ready >= warn {
        CheckStatus::Warning
    } else {
        CheckStatus::Ok
    };
    let msg = match status {
        CheckStatus::Ok => format!("{} pending archive ready files", ready),
        CheckStatus::Warning => format!("{} pending archive ready files, warning threshold: {}", ready, warn),
        _ => format!("{} pending archive ready files, critical threshold: {}", ready, crit),
    };
    Ok(CheckResult::new(CheckKind::ArchiveReady, status, msg)
        .with_perfdata(format!("files={};{};{}", ready, warn, crit))
        .with_opt("files", ready)
        .with_opt("threshold", if status == CheckStatus::Critical { crit } else { warn }))
}

pub async fn check_downstream(conn: &dyn DbSession, record: &NodeRecord) -> RepmgrResult<CheckResult> {
    let expected = conn.get_downstream_node_records(record.node_id).await?;
    if expected.is_empty() {
        return Ok(CheckResult::new(
            CheckKind::Downstream,
            CheckStatus::Ok,
            "this node has no downstream nodes",
        ));
    }
    let mut missing = Vec::new();
    for node in expected.iter().filter(|r| r.node_type.replicates()) {
        match oracle::is_downstream_node_attached(conn, &node.node_name).await {
            NodeAttached::Attached => {}
            _ => missing.push(node.node_name.clone()),
        }
    }
    let total = expected.iter().filter(|r| r.node_type.replicates()).count();
    let attached = total - missing.len();
    let mut result = if missing.is_empty() {
        CheckResult::new(
            CheckKind::Downstream,
            CheckStatus::Ok,
            format!("{} of {} downstream nodes attached", attached, total),
        )
    } else {
        CheckResult::new(
            CheckKind::Downstream,
            CheckStatus::Critical,
            format!(
                "{} of {} downstream nodes not attached; missing: {}",
                missing.len(),
                total,
                missing.join(", ")
            ),
        )
    };
    result.perfdata = Some(format!("attached={};;{}", attached, total));
    result.details = missing;
    Ok(result.with_opt("attached", attached).with_opt("expected", total))
}

pub async fn check_upstream(
    ctx: &ClusterContext,
    conn: &dyn DbSession,
    record: &NodeRecord,
) -> RepmgrResult<CheckResult> {
    if !record.node_type.expects_upstream() {
        return Ok(CheckResult::new(
            CheckKind::Upstream,
            CheckStatus::Ok,
            format!("N/A - node is {}", record.node_type.as_str()),
        ));
    }
    let upstream_id = match record.upstream_node_id {
        Some(id) => id,
        None => {
            return Ok(CheckResult::new(
                CheckKind::Upstream,
                CheckStatus::Critical,
                "no upstream node recorded",
            ))
        }
    };
    let upstream = match conn.get_node_record(upstream_id).await? {
        Some(u) => u,
        None => {
            return Ok(CheckResult::new(
                CheckKind::Upstream,
                CheckStatus::Critical,
                format!("upstream node {} has no record", upstream_id),
            ))
        }
    };
    let up_conn = match gateway::establish_db_connection_quiet(ctx.connector.as_ref(), &upstream.conninfo).await {
        Some(c) => c,
        None => {
            return Ok(CheckResult::new(
                CheckKind::Upstream,
                CheckStatus::Critical,
                format!("unable to connect to upstream node \"{}\"", upstream.node_name),
            ))
        }
    };
    let result = match oracle::is_downstream_node_attached(up_conn.as_ref(), &record.node_name).await {
        NodeAttached::Attached => CheckResult::new(
            CheckKind::Upstream,
            CheckStatus::Ok,
            format!("node \"{}\" is attached to expected upstream node \"{}\"", record.node_name, upstream.node_name),
        ),
        NodeAttached::NotAttached => CheckResult::new(
            CheckKind::Upstream,
            CheckStatus::Critical,
            format!("node \"{}\" is not attached to expected upstream node \"{}\"", record.node_name, upstream.node_name),
        ),
        NodeAttached::Unknown => CheckResult::new(
            CheckKind::Upstream,
            CheckStatus::Unknown,
            format!("unable to query upstream node \"{}\"", upstream.node_name),
        ),
    };
    Ok(result.with_opt("upstream", upstream.node_id))
}

pub async fn check_slots(conn: &dyn DbSession) -> RepmgrResult<CheckResult> {
    let inactive = slots::get_inactive_replication_slots(conn).await?;
    let total = conn.replication_slots().await?.len();
    let mut result = if inactive.is_empty() {
        CheckResult::new(
            CheckKind::Slots,
            CheckStatus::Ok,
            format!("node has {} active replication slots", total),
        )
    } else {
        CheckResult::new(
            CheckKind::Slots,
            CheckStatus::Critical,
            format!("{} of {} replication slots are inactive", inactive.len(), total),
        )
    };
    result.details = inactive
        .iter()
        .map(|s| format!("{}: {}", s.slot_name, s.reason))
        .collect();
    Ok(result.with_opt("inactive", inactive.len()))
}

pub async fn check_missing_slots(
    ctx: &ClusterContext,
    conn: &dyn DbSession,
    record: &NodeRecord,
) -> RepmgrResult<CheckResult> {
    let recon = slots::get_downstream_nodes_with_missing_slot(
        conn,
        record.node_id,
        ctx.config.replication.use_replication_slots,
    )
    .await?;
    let status = if !recon.missing.is_empty() {
        CheckStatus::Critical
    } else if !recon.misconfigured.is_empty() || !recon.extra_inactive.is_empty() {
        CheckStatus::Warning
    } else {
        CheckStatus::Ok
    };
    let msg = if recon.missing.is_empty() {
        "node has no missing physical replication slots".to_string()
    } else {
        format!(
            "{} physical replication slots are missing: {}",
            recon.missing.len(),
            recon
                .missing
                .iter()
                .map(|r| r.slot_name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )
    };
    let mut result = CheckResult::new(CheckKind::MissingSlots, status, msg);
    result.details = recon.warnings();
    Ok(result.with_opt("missing", recon.missing.len()))
}

pub async fn check_data_directory_config(ctx: &ClusterContext, conn: &dyn DbSession) -> RepmgrResult<CheckResult> {
    let configured = &ctx.config.data_directory;
    if configured.is_empty() {
        return Ok(CheckResult::new(
            CheckKind::DataDirectoryConfig,
            CheckStatus::Critical,
            "\"data_directory\" is not configured",
        ));
    }
    match conn.data_directory().await? {
        Some(actual) if actual.trim_end_matches('/') == configured.trim_end_matches('/') => Ok(
            CheckResult::new(
                CheckKind::DataDirectoryConfig,
                CheckStatus::Ok,
                format!("configured \"data_directory\" is \"{}\"", configured),
            ),
        ),
        Some(actual) => Ok(CheckResult::new(
            CheckKind::DataDirectoryConfig,
            CheckStatus::Critical,
            format!(
                "configured \"data_directory\" is \"{}\"; PostgreSQL reports \"{}\"",
                configured, actual
            ),
        )),
        None => {
            // Unprivileged roles cannot read the setting; fall back to the
            // control file being present.
            let control = ctx.config.data_dir().join("global").join("pg_control");
            let status = if control.is_file() {
                CheckStatus::Ok
            } else {
                CheckStatus::Critical
            };
            Ok(CheckResult::new(
                CheckKind::DataDirectoryConfig,
                status,
                format!(
                    "unable to read \"data_directory\" from PostgreSQL; control file {} in \"{}\"",
                    if status == CheckStatus::Ok { "found" } else { "not found" },
                    configured
                ),
            ))
        }
    }
}

/// Whether the local node can open a replication-user connection to
/// `remote_node_id`.
pub async fn check_replication_connection(
    ctx: &ClusterContext,
    conn: &dyn DbSession,
    remote_node_id: NodeId,
) -> RepmgrResult<CheckResult> {
    let remote = conn.get_node_record(remote_node_id).await?.ok_or_else(|| {
        RepmgrError::bad_config(format!("no record found for node {}", remote_node_id))
    })?;
    let local = conn.get_node_record(ctx.config.node_id()).await?;
    let repluser = local
        .map(|r| r.repluser)
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| ctx.config.effective_replication_user());
    let ci = if repluser.is_empty() {
        remote.conninfo.clone()
    } else {
        conninfo::with_param(&remote.conninfo, "user", &repluser)?
    };
    let result = match gateway::establish_db_connection_quiet(ctx.connector.as_ref(), &ci).await {
        Some(_) => CheckResult::new(
            CheckKind::ReplicationConnection,
            CheckStatus::Ok,
            format!("connection to node \"{}\" as \"{}\" succeeded", remote.node_name, repluser),
        ),
        None => CheckResult::new(
            CheckKind::ReplicationConnection,
            CheckStatus::Critical,
            format!("connection to node \"{}\" as \"{}\" failed", remote.node_name, repluser),
        ),
    };
    Ok(result)
}

/// Connection test against the configured conninfo; works without any
/// metadata.
pub async fn check_db_connection(ctx: &ClusterContext, conninfo_str: &str) -> CheckResult {
    match ctx.connector.connect(conninfo_str).await {
        Ok(_) => CheckResult::new(CheckKind::DbConnection, CheckStatus::Ok, "connection succeeded"),
        Err(e) => {
            let mut r = CheckResult::new(CheckKind::DbConnection, CheckStatus::Critical, "connection failed");
            r.details.push(e.detail.unwrap_or(e.message));
            r.details.push(format!("attempted conninfo: \"{}\"", conninfo_str));
            r
        }
    }
}

/// Run one check against the local node.
pub async fn run_check(
    ctx: &ClusterContext,
    conn: &dyn DbSession,
    record: &NodeRecord,
    kind: CheckKind,
    remote_node_id: Option<NodeId>,
) -> RepmgrResult<CheckResult> {
    match kind {
        CheckKind::Role => check_role(conn, record).await,
        CheckKind::ReplicationLag => check_replication_lag(ctx, conn).await,
        CheckKind::ArchiveReady => check_archive_ready(ctx, conn).await,
        CheckKind::Downstream => check_downstream(conn, record).await,
        CheckKind::Upstream => check_upstream(ctx, conn, record).await,
        CheckKind::Slots => check_slots(conn).await,
        CheckKind::MissingSlots => check_missing_slots(ctx, conn, record).await,
        CheckKind::DataDirectoryConfig => check_data_directory_config(ctx, conn).await,
        CheckKind::ReplicationConnection => {
            let id = remote_node_id.ok_or_else(|| {
                RepmgrError::bad_config("--replication-connection requires --remote-node-id")
            })?;
            check_replication_connection(ctx, conn, id).await
        }
        CheckKind::DbConnection => Ok(check_db_connection(ctx, conn.conninfo()).await),
    }
}

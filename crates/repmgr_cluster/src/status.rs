//! `node status`: a one-node summary, and the shutdown-state probe used by
//! switchover.

use repmgr_common::types::{NodeRecord, NodeType, RecoveryType};
use repmgr_common::RepmgrResult;

use crate::context::ClusterContext;
use crate::control::{self, ServerStatus};
use crate::db::DbSession;
use crate::oracle;

/// Ordered label/value pairs plus warnings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStatusReport {
    pub node_name: String,
    pub fields: Vec<(String, String)>,
    pub warnings: Vec<String>,
}

impl NodeStatusReport {
    fn push(&mut self, label: &str, value: impl Into<String>) {
        self.fields.push((label.to_string(), value.into()));
    }

    pub fn get(&self, label: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, v)| v.as_str())
    }

    pub fn render_text(&self) -> String {
        let width = self.fields.iter().map(|(l, _)| l.len()).max().unwrap_or(0);
        let mut out = format!("Node \"{}\":\n", self.node_name);
        for (label, value) in &self.fields {
            out.push_str(&format!("\t{:<width$}: {}\n", label, value, width = width));
        }
        if !self.warnings.is_empty() {
            out.push_str("\nWARNING: following issue(s) were detected:\n");
            for w in &self.warnings {
                out.push_str(&format!("  - {}\n", w));
            }
        }
        out
    }

    pub fn render_csv(&self) -> String {
        self.fields
            .iter()
            .map(|(l, v)| format!("\"{}\",\"{}\"\n", l, v.replace('"', "\"\"")))
            .collect()
    }
}

fn format_version(num: i32) -> String {
    if num >= 100000 {
        format!("{}.{}", num / 10000, num % 10000)
    } else {
        format!("{}.{}.{}", num / 10000, (num / 100) % 100, num % 100)
    }
}

/// Collect the status of the node `conn` points at.
pub async fn collect_node_status(
    ctx: &ClusterContext,
    conn: &dyn DbSession,
    record: &NodeRecord,
) -> RepmgrResult<NodeStatusReport> {
    let mut report = NodeStatusReport {
        node_name: record.node_name.clone(),
        ..Default::default()
    };
    report.push("PostgreSQL version", format_version(conn.server_version_num().await?));
    report.push("Total data size", conn.cluster_size().await?);
    report.push("Conninfo", record.conninfo.clone());

    let rt = conn.recovery_type().await?;
    report.push("Role", record.node_type.as_str());
    let mismatch = matches!(
        (record.node_type, rt),
        (NodeType::Standby, RecoveryType::Primary) | (NodeType::Primary, RecoveryType::Standby)
    );
    if mismatch {
        report.warnings.push(format!(
            "node \"{}\" is registered as {} but running as {}",
            record.node_name,
            record.node_type.as_str(),
            rt.as_str()
        ));
    }

    let archive_mode = conn.pg_setting("archive_mode").await?.unwrap_or_default();
    report.push("WAL archiving", if archive_mode == "off" || archive_mode.is_empty() { "off" } else { "enabled" });
    match conn.ready_archive_files().await {
        Ok(n) => {
            report.push("WALs pending archiving", format!("{} pending files", n));
            if n >= ctx.config.replication.archive_ready_warning {
                report.warnings.push(format!("{} files pending archiving", n));
            }
        }
        Err(_) => report.push("WALs pending archiving", "unknown"),
    }

    let cap = conn.replication_capacity().await?;
    report.push(
        "Replication connections",
        format!("{} (of maximal {})", cap.active_wal_senders, cap.max_wal_senders),
    );
    let slots = conn.replication_slots().await?;
    let inactive = slots.iter().filter(|s| !s.active).count();
    report.push(
        "Replication slots",
        format!(
            "{} physical (of maximal {}; {} missing)",
            slots.len(),
            cap.max_replication_slots,
            inactive
        ),
    );
    if inactive > 0 {
        report
            .warnings
            .push(format!("{} inactive replication slot(s)", inactive));
    }

    if rt == RecoveryType::Standby {
        let upstream = match record.upstream_node_id {
            Some(id) => conn
                .get_node_record(id)
                .await?
                .map(|u| format!("{} (ID: {})", u.node_name, u.node_id))
                .unwrap_or_else(|| format!("(ID: {})", id)),
            None => "(none)".to_string(),
        };
        report.push("Upstream node", upstream);
        let info = conn.replication_info().await?;
        let lag = oracle::get_replication_lag_seconds(conn).await;
        report.push(
            "Replication lag",
            lag.map_or("unknown".to_string(), |l| format!("{} seconds", l)),
        );
        report.push("Last received LSN", info.last_wal_receive_lsn.to_string());
        report.push("Last replayed LSN", info.last_wal_replay_lsn.to_string());
        if info.wal_receiver_pid.is_none() {
            report.warnings.push("WAL receiver is not running".to_string());
        }
    } else {
        report.push("Replication lag", "n/a");
        report.push("Current LSN", conn.current_wal_lsn().await?.to_string());
    }
    Ok(report)
}

/// `node status --is-shutdown-cleanly` for the local data directory.
pub async fn is_shutdown_cleanly(ctx: &ClusterContext) -> ServerStatus {
    control::probe_local_status(ctx.connector.as_ref(), &ctx.config.conninfo, &ctx.config.data_dir()).await
}

//! Daemon control (`service status|pause|unpause`) and event-history
//! maintenance (`cluster event`, `cluster cleanup`).

use repmgr_common::types::{EventRecord, NodeId, NodeRecord};
use repmgr_common::{ErrorKind, RepmgrError, RepmgrResult};
use tracing::{info, warn};

use crate::context::ClusterContext;
use crate::db::{DbSession, EventFilter, NewEvent};
use crate::events::{self, names, EventExtras};
use crate::gateway;

/// One line of `service status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonStatus {
    pub record: NodeRecord,
    pub reachable: bool,
    pub daemon_pid: Option<i32>,
    pub paused: Option<bool>,
}

impl DaemonStatus {
    pub fn status_text(&self) -> &'static str {
        match (self.reachable, self.daemon_pid) {
            (false, _) => "unreachable",
            (true, Some(_)) => "running",
            (true, None) => "not running",
        }
    }
}

pub async fn service_status(
    ctx: &ClusterContext,
    conn: &dyn DbSession,
) -> RepmgrResult<(Vec<DaemonStatus>, Vec<String>)> {
    let mut rows = Vec::new();
    let mut warnings = Vec::new();
    for record in conn.get_all_node_records().await? {
        match gateway::establish_db_connection_quiet(ctx.connector.as_ref(), &record.conninfo).await {
            Some(node_conn) => {
                let pid = node_conn.daemon_pid().await.unwrap_or(None);
                let paused = node_conn.daemon_is_paused().await.ok();
                if pid.is_none() && record.active {
                    warnings.push(format!(
                        "repmgrd not running on node \"{}\" (ID: {})",
                        record.node_name, record.node_id
                    ));
                }
                rows.push(DaemonStatus {
                    record,
                    reachable: true,
                    daemon_pid: pid,
                    paused,
                });
            }
            None => {
                warnings.push(format!(
                    "unable to connect to node \"{}\" (ID: {})",
                    record.node_name, record.node_id
                ));
                rows.push(DaemonStatus {
                    record,
                    reachable: false,
                    daemon_pid: None,
                    paused: None,
                });
            }
        }
    }
    Ok((rows, warnings))
}

/// Nodes whose pause state was or was not changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PauseReport {
    pub changed: Vec<NodeId>,
    pub failed: Vec<(NodeId, String)>,
}

impl PauseReport {
    pub fn into_result(self, pause: bool) -> RepmgrResult<Self> {
        if self.failed.is_empty() {
            return Ok(self);
        }
        let verb = if pause { "pause" } else { "unpause" };
        let detail = self
            .failed
            .iter()
            .map(|(id, why)| format!("node {}: {}", id, why))
            .collect::<Vec<_>>()
            .join("; ");
        Err(RepmgrError::new(ErrorKind::DaemonPause, format!("unable to {} repmgrd on every node", verb))
            .with_detail(detail))
    }
}

/// Set the pause flag on every reachable node; `only` restricts the set.
pub async fn set_paused(
    ctx: &ClusterContext,
    conn: &dyn DbSession,
    pause: bool,
    only: Option<&[NodeId]>,
) -> RepmgrResult<PauseReport> {
    let mut report = PauseReport::default();
    for record in conn.get_all_node_records().await? {
        if only.map_or(false, |ids| !ids.contains(&record.node_id)) {
            continue;
        }
        let node_conn = match gateway::establish_db_connection_quiet(ctx.connector.as_ref(), &record.conninfo).await {
            Some(c) => c,
            None => {
                report
                    .failed
                    .push((record.node_id, "unable to connect".to_string()));
                continue;
            }
        };
        if ctx.options.dry_run {
            info!(
                "would {} repmgrd on node \"{}\"",
                if pause { "pause" } else { "unpause" },
                record.node_name
            );
            continue;
        }
        match node_conn.daemon_pause(pause).await {
            Ok(()) => report.changed.push(record.node_id),
            Err(e) => {
                warn!("unable to set pause state on node \"{}\": {}", record.node_name, e);
                report.failed.push((record.node_id, e.message));
            }
        }
    }
    Ok(report)
}

/// `service pause` / `service unpause` with the matching event.
pub async fn service_pause(ctx: &ClusterContext, conn: &dyn DbSession, pause: bool) -> RepmgrResult<String> {
    let report = set_paused(ctx, conn, pause, None).await?.into_result(pause)?;
    if ctx.options.dry_run {
        return Ok(String::new());
    }
    let event = if pause { names::REPMGRD_PAUSE } else { names::REPMGRD_UNPAUSE };
    let ev = NewEvent::new(
        ctx.config.node_id(),
        event,
        true,
        format!("{} node(s) updated", report.changed.len()),
    );
    events::create_event_notification(ctx, Some(conn), ev, &EventExtras::default()).await;
    Ok(format!(
        "repmgrd {} on {} node(s)\n",
        if pause { "paused" } else { "unpaused" },
        report.changed.len()
    ))
}

// ---------------------------------------------------------------------------
// Event history
// ---------------------------------------------------------------------------

pub async fn cluster_event(conn: &dyn DbSession, filter: &EventFilter) -> RepmgrResult<Vec<EventRecord>> {
    conn.get_events(filter).await
}

/// Purge event rows older than `keep_days` on the primary.
pub async fn cluster_cleanup(
    ctx: &ClusterContext,
    primary_conn: &dyn DbSession,
    keep_days: u32,
) -> RepmgrResult<String> {
    if ctx.options.dry_run {
        return Ok(format!("would delete events older than {} day(s)\n", keep_days));
    }
    let removed = primary_conn.purge_events(keep_days).await?;
    let details = format!("{} event(s) older than {} day(s) deleted", removed, keep_days);
    info!("{}", details);
    let ev = NewEvent::new(ctx.config.node_id(), names::CLUSTER_CLEANUP, true, details.clone());
    events::create_event_notification(ctx, Some(primary_conn), ev, &EventExtras::default()).await;
    Ok(format!("{}\n", details))
}

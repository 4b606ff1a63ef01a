//! `standby switchover`: hand the primary role to the local standby.
//!
//! Runs on the standby being promoted. The current primary is stopped
//! cleanly over SSH, the local node replays up to its shutdown checkpoint,
//! promotes, and the old primary is rejoined as a standby of the new one.
//! The daemon is paused for the duration unless `--repmgrd-no-pause`.

use repmgr_common::types::{Lsn, NodeId, NodeRecord, RecoveryType};
use repmgr_common::{ErrorKind, RepmgrError, RepmgrResult};
use tracing::{error, info, warn};

use super::promote::{commit_promotion, promote_and_wait, siblings_follow};
use super::{local_node_record, run_remote, wait_until_attached};
use crate::checks::{optformat_status, CheckStatus};
use crate::context::{interrupted, ClusterContext, PollWait, Poller};
use crate::control::ServerStatus;
use crate::daemon;
use crate::db::{DbSession, NewEvent};
use crate::events::{self, names, EventExtras};
use crate::gateway;

#[derive(Debug, Clone, Default)]
pub struct SwitchoverOptions {
    /// Promote even if the local node has not replayed the old primary's
    /// shutdown checkpoint.
    pub always_promote: bool,
    /// Pass `--force-rewind` to the rejoin of the old primary.
    pub force_rewind: bool,
    pub siblings_follow: bool,
    pub repmgrd_no_pause: bool,
    /// Unpause every node afterwards, including ones paused beforehand.
    pub repmgrd_force_unpause: bool,
}

fn switchover_fail(message: impl Into<String>) -> RepmgrError {
    RepmgrError::new(ErrorKind::SwitchoverFail, message)
}

/// Remote prerequisite checks run on the primary before it is stopped.
const REMOTE_CHECKS: [(&str, &str); 3] = [
    ("archive-ready", "node check --terse --archive-ready --optformat"),
    ("data-directory-config", "node check --terse --data-directory-config --optformat"),
    ("replication-connection", "node check --terse --replication-connection --optformat"),
];

/// Pause state of the cluster before the switchover touched it.
#[derive(Debug, Default)]
struct PauseGuard {
    active: bool,
    previously_paused: Vec<NodeId>,
    all_nodes: Vec<NodeId>,
}

impl PauseGuard {
    /// Nodes to unpause when the switchover ends.
    fn to_unpause(&self, force_unpause: bool) -> Vec<NodeId> {
        self.all_nodes
            .iter()
            .copied()
            .filter(|id| force_unpause || !self.previously_paused.contains(id))
            .collect()
    }
}

async fn pause_cluster(ctx: &ClusterContext, conn: &dyn DbSession) -> PauseGuard {
    let mut guard = PauseGuard::default();
    let records = match gateway::read_all_node_records(conn).await {
        Ok(r) => r,
        Err(e) => {
            warn!("unable to read node records to pause repmgrd: {}", e);
            return guard;
        }
    };
    for record in &records {
        guard.all_nodes.push(record.node_id);
        if let Some(c) = gateway::establish_db_connection_quiet(ctx.connector.as_ref(), &record.conninfo).await {
            if c.daemon_is_paused().await.unwrap_or(false) {
                guard.previously_paused.push(record.node_id);
            }
        }
    }
    info!("pausing repmgrd on all nodes");
    match daemon::set_paused(ctx, conn, true, None).await {
        Ok(report) => {
            for (id, why) in &report.failed {
                warn!("unable to pause repmgrd on node {}: {}", id, why);
            }
            guard.active = !report.changed.is_empty();
        }
        Err(e) => warn!("unable to pause repmgrd: {}", e),
    }
    guard
}

async fn unpause_cluster(ctx: &ClusterContext, guard: &PauseGuard, force_unpause: bool) {
    if !guard.active {
        return;
    }
    let ids = guard.to_unpause(force_unpause);
    if ids.is_empty() {
        return;
    }
    let Some(conn) = gateway::establish_db_connection_quiet(ctx.connector.as_ref(), &ctx.config.conninfo).await else {
        warn!("unable to connect to the local node; repmgrd must be unpaused manually");
        return;
    };
    match daemon::set_paused(ctx, conn.as_ref(), false, Some(&ids)).await {
        Ok(report) => {
            for (id, why) in &report.failed {
                warn!("unable to unpause repmgrd on node {}: {}", id, why);
            }
        }
        Err(e) => warn!("unable to unpause repmgrd: {}", e),
    }
}

pub async fn standby_switchover(
    ctx: &ClusterContext,
    conn: &dyn DbSession,
    opts: &SwitchoverOptions,
) -> RepmgrResult<String> {
    if gateway::read_recovery_type(conn).await? != RecoveryType::Standby {
        return Err(RepmgrError::bad_config("\"standby switchover\" can only be executed on a standby"));
    }
    let local = local_node_record(ctx, conn).await?;

    let (primary_conn, primary) = match gateway::connect_to_primary(ctx, conn).await {
        Ok(p) => p,
        Err(e) => {
            return Err(switchover_fail("unable to connect to the current primary")
                .with_detail(e.message)
                .with_hint("the primary must be running and reachable from this node"));
        }
    };
    if primary.node_id == local.node_id {
        return Err(RepmgrError::bad_config("the local node is already the recorded primary"));
    }

    check_ssh(ctx, &primary).await?;

    let guard = if opts.repmgrd_no_pause || ctx.options.dry_run {
        PauseGuard::default()
    } else {
        pause_cluster(ctx, conn).await
    };

    let result = run_switchover(ctx, conn, primary_conn, &primary, &local, opts, &guard).await;

    unpause_cluster(ctx, &guard, opts.repmgrd_force_unpause).await;
    result
}

/// Remote-to-local reachability: the old primary must run our commands.
async fn check_ssh(ctx: &ClusterContext, primary: &NodeRecord) -> RepmgrResult<()> {
    let ok = match run_remote(ctx, primary, None, "--version").await {
        Ok(out) => out.success && !out.is_empty(),
        Err(e) => {
            warn!("{}", e);
            false
        }
    };
    if ok {
        return Ok(());
    }
    let err = RepmgrError::ssh(format!(
        "unable to execute repmgr on primary \"{}\" (ID: {}) via SSH",
        primary.node_name, primary.node_id
    ))
    .with_hint("check passwordless SSH access and the remote repmgr binary location");
    if ctx.options.force {
        warn!("{}; continuing because of -F/--force", err.message);
        return Ok(());
    }
    Err(err)
}

async fn run_remote_checks(ctx: &ClusterContext, primary: &NodeRecord, local: &NodeRecord) -> RepmgrResult<()> {
    for (name, args) in REMOTE_CHECKS {
        let args = if name == "replication-connection" {
            format!("{} --remote-node-id={}", args, local.node_id)
        } else {
            args.to_string()
        };
        let out = run_remote(ctx, primary, Some(&primary.conninfo), &args).await?;
        if out.is_empty() {
            return Err(RepmgrError::ssh(format!(
                "no output from remote check \"{}\" on node \"{}\"",
                name, primary.node_name
            )));
        }
        let status = optformat_status(&out.output);
        let failed = match status {
            CheckStatus::Ok => false,
            CheckStatus::Warning if name == "archive-ready" => {
                warn!("primary has pending WAL files to archive: {}", out.output.trim());
                false
            }
            _ => true,
        };
        if failed {
            let err = switchover_fail(format!(
                "prerequisite check \"{}\" on primary \"{}\" returned {}",
                name, primary.node_name, status
            ))
            .with_detail(out.output.trim().to_string());
            if ctx.options.force {
                warn!("{}; continuing because of -F/--force", err.message);
                continue;
            }
            return Err(err);
        }
        info!("remote check \"{}\" passed", name);
    }
    Ok(())
}

async fn await_lag_below_threshold(
    ctx: &ClusterContext,
    conn: &dyn DbSession,
    primary_conn: &dyn DbSession,
) -> RepmgrResult<()> {
    let threshold = ctx.config.replication.switchover_lag_threshold_bytes;
    let mut poller = Poller::new(
        ctx.config.timeouts.check_interval,
        ctx.config.timeouts.replication_lag_timeout,
        &ctx.interrupt,
    );
    loop {
        let primary_lsn = primary_conn.current_wal_lsn().await?;
        let replay = gateway::read_replication_info(conn).await?.last_wal_replay_lsn;
        let diff = primary_lsn.bytes_since(replay);
        if diff == 0 || diff < threshold {
            info!("replication lag is {} bytes", diff);
            return Ok(());
        }
        match poller.wait().await {
            PollWait::Again => continue,
            PollWait::TimedOut => {
                return Err(switchover_fail(format!(
                    "replication lag did not fall below {} bytes within {} seconds",
                    threshold, ctx.config.timeouts.replication_lag_timeout
                ))
                .with_detail(format!("primary is at {}, local replay at {}", primary_lsn, replay)))
            }
            PollWait::Interrupted => return Err(interrupted("waiting for replication lag")),
        }
    }
}

/// Stop the primary with a checkpoint and wait for a clean shutdown.
/// Returns the shutdown checkpoint LSN.
async fn stop_primary(ctx: &ClusterContext, primary: &NodeRecord) -> RepmgrResult<Lsn> {
    info!("stopping current primary \"{}\"", primary.node_name);
    let out = run_remote(ctx, primary, Some(&primary.conninfo), "node service --action=stop --checkpoint").await?;
    if !out.success {
        return Err(switchover_fail(format!("unable to stop primary \"{}\"", primary.node_name))
            .with_detail(out.output.trim().to_string()));
    }

    let timeout = ctx.config.timeouts.shutdown_check_timeout;
    let mut poller = Poller::new(ctx.config.timeouts.check_interval, timeout, &ctx.interrupt);
    loop {
        let probe = run_remote(ctx, primary, Some(&primary.conninfo), "node status --is-shutdown-cleanly").await?;
        match ServerStatus::parse(&probe.output) {
            ServerStatus::Shutdown { checkpoint_lsn } => {
                info!("primary shut down cleanly at {}", checkpoint_lsn);
                return Ok(checkpoint_lsn);
            }
            ServerStatus::UncleanShutdown => {
                return Err(switchover_fail(format!(
                    "primary \"{}\" did not shut down cleanly",
                    primary.node_name
                )))
            }
            other => info!("primary state is {}", other.render()),
        }
        match poller.wait().await {
            PollWait::Again => continue,
            PollWait::TimedOut => {
                return Err(switchover_fail(format!(
                    "primary \"{}\" did not shut down within {} seconds",
                    primary.node_name, timeout
                )))
            }
            PollWait::Interrupted => return Err(interrupted("waiting for the primary to shut down")),
        }
    }
}

/// Wait until the local replay position reaches `target`.
async fn await_local_replay(ctx: &ClusterContext, conn: &dyn DbSession, target: Lsn) -> RepmgrResult<bool> {
    let mut poller = Poller::new(
        ctx.config.timeouts.check_interval,
        ctx.config.timeouts.wal_receive_check_timeout,
        &ctx.interrupt,
    );
    loop {
        let replay = gateway::read_replication_info(conn).await?.last_wal_replay_lsn;
        if replay >= target {
            info!("local node has replayed up to {} (target {})", replay, target);
            return Ok(true);
        }
        match poller.wait().await {
            PollWait::Again => continue,
            PollWait::TimedOut => return Ok(false),
            PollWait::Interrupted => return Err(interrupted("waiting for WAL replay")),
        }
    }
}

/// Steps between stopping the primary and committing the promotion. A
/// failure here leaves the cluster without a primary.
async fn demote_and_promote(
    ctx: &ClusterContext,
    conn: &dyn DbSession,
    primary: &NodeRecord,
    local: &NodeRecord,
    siblings: &[NodeRecord],
    opts: &SwitchoverOptions,
) -> RepmgrResult<Box<dyn DbSession>> {
    let checkpoint = stop_primary(ctx, primary).await?;
    if !await_local_replay(ctx, conn, checkpoint).await? {
        let msg = format!(
            "local node did not replay the primary's shutdown checkpoint {} within {} seconds",
            checkpoint, ctx.config.timeouts.wal_receive_check_timeout
        );
        if !opts.always_promote {
            return Err(switchover_fail(msg));
        }
        warn!("{}; promoting because of --always-promote", msg);
    }
    let new_conn = promote_and_wait(ctx, conn).await?;
    let extra: Vec<NodeId> = if opts.siblings_follow {
        siblings.iter().map(|s| s.node_id).collect()
    } else {
        Vec::new()
    };
    commit_promotion(ctx, new_conn.as_ref(), local, Some(primary), &extra).await?;
    Ok(new_conn)
}

async fn run_switchover(
    ctx: &ClusterContext,
    conn: &dyn DbSession,
    primary_conn: Box<dyn DbSession>,
    primary: &NodeRecord,
    local: &NodeRecord,
    opts: &SwitchoverOptions,
    guard: &PauseGuard,
) -> RepmgrResult<String> {
    run_remote_checks(ctx, primary, local).await?;
    await_lag_below_threshold(ctx, conn, primary_conn.as_ref()).await?;

    let siblings: Vec<NodeRecord> = primary_conn
        .get_downstream_node_records(primary.node_id)
        .await?
        .into_iter()
        .filter(|r| r.node_id != local.node_id)
        .collect();

    if ctx.options.dry_run {
        let mut out = format!(
            "prerequisites for switching over from \"{}\" to \"{}\" are met\n",
            primary.node_name, local.node_name
        );
        out.push_str(&format!(
            "would stop \"{}\", promote \"{}\" and rejoin \"{}\" as a standby\n",
            primary.node_name, local.node_name, primary.node_name
        ));
        return Ok(out);
    }
    drop(primary_conn);

    let new_conn = match demote_and_promote(ctx, conn, primary, local, &siblings, opts).await {
        Ok(c) => c,
        Err(e) => {
            error!("switchover failed after the primary was stopped: {}", e);
            let ev = NewEvent::new(local.node_id, names::STANDBY_SWITCHOVER, false, e.message.clone());
            events::create_event_notification(ctx, None, ev, &EventExtras::default()).await;
            let mut err = switchover_fail(format!("switchover failed: {}", e.message))
                .with_hint("the cluster currently has no primary; promote a standby or restart the old primary manually");
            err.detail = e.detail;
            return Err(err);
        }
    };

    if guard.active {
        let ev = NewEvent::new(
            local.node_id,
            names::REPMGRD_PAUSE,
            true,
            "repmgrd paused for switchover".to_string(),
        );
        events::create_event_notification(ctx, Some(new_conn.as_ref()), ev, &EventExtras::default()).await;
    }

    let mut out = format!(
        "node \"{}\" (ID: {}) promoted to primary; \"{}\" (ID: {}) demoted\n",
        local.node_name, local.node_id, primary.node_name, primary.node_id
    );
    if opts.siblings_follow && !siblings.is_empty() {
        let warnings = siblings_follow(ctx, &siblings, local.node_id).await;
        out.push_str(&format!(
            "{} of {} sibling node(s) now following the new primary\n",
            siblings.len() - warnings.len(),
            siblings.len()
        ));
    } else if !siblings.is_empty() {
        warn!(
            "{} sibling node(s) are still attached to \"{}\"; use \"repmgr standby follow\"",
            siblings.len(),
            primary.node_name
        );
    }

    let ev = NewEvent::new(
        local.node_id,
        names::STANDBY_SWITCHOVER,
        true,
        format!(
            "node \"{}\" (ID: {}) promoted to primary, node \"{}\" (ID: {}) demoted to standby",
            local.node_name, local.node_id, primary.node_name, primary.node_id
        ),
    );
    let extras = EventExtras {
        node_name: Some(local.node_name.clone()),
        peer_node_id: Some(primary.node_id),
        peer_conninfo: Some(primary.conninfo.clone()),
    };
    events::create_event_notification(ctx, Some(new_conn.as_ref()), ev, &extras).await;

    if rejoin_old_primary(ctx, new_conn.as_ref(), primary, local, opts).await {
        out.push_str(&format!(
            "node \"{}\" is now a standby of \"{}\"\n",
            primary.node_name, local.node_name
        ));
    } else {
        let msg = format!(
            "node \"{}\" (ID: {}) must be rejoined manually with \"repmgr node rejoin\"",
            primary.node_name, primary.node_id
        );
        warn!("{}", msg);
        out.push_str(&format!("WARNING: {}\n", msg));
    }
    Ok(out)
}

/// Rejoin the demoted primary over SSH. Returns whether it attached.
async fn rejoin_old_primary(
    ctx: &ClusterContext,
    new_conn: &dyn DbSession,
    primary: &NodeRecord,
    local: &NodeRecord,
    opts: &SwitchoverOptions,
) -> bool {
    let args = if opts.force_rewind {
        "node rejoin --force-rewind"
    } else {
        "node rejoin"
    };
    info!("rejoining \"{}\" to \"{}\"", primary.node_name, local.node_name);
    match run_remote(ctx, primary, Some(&local.conninfo), args).await {
        Ok(out) if out.success => {}
        Ok(out) => {
            warn!("\"node rejoin\" failed on \"{}\": {}", primary.node_name, out.output.trim());
            return false;
        }
        Err(e) => {
            warn!("unable to execute \"node rejoin\" on \"{}\": {}", primary.node_name, e);
            return false;
        }
    }
    match wait_until_attached(ctx, new_conn, &primary.node_name, ctx.config.timeouts.standby_reconnect_timeout).await {
        Ok(attached) => attached,
        Err(e) => {
            warn!("{}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_guard_unpauses_only_nodes_it_paused() {
        let guard = PauseGuard {
            active: true,
            previously_paused: vec![NodeId(3)],
            all_nodes: vec![NodeId(1), NodeId(2), NodeId(3)],
        };
        assert_eq!(guard.to_unpause(false), vec![NodeId(1), NodeId(2)]);
        assert_eq!(guard.to_unpause(true), vec![NodeId(1), NodeId(2), NodeId(3)]);
    }

    #[test]
    fn test_remote_checks_cover_prerequisites() {
        let names: Vec<&str> = REMOTE_CHECKS.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["archive-ready", "data-directory-config", "replication-connection"]);
        assert!(REMOTE_CHECKS.iter().all(|(_, a)| a.ends_with("--optformat")));
    }
}

//! `standby promote`.
//!
//! CHECK_ROLE -> CHECK_UPSTREAM_DOWN -> PROMOTE -> AWAIT_PRIMARY_STATE ->
//! UPDATE_METADATA -> NOTIFY. A node that is already running as primary
//! skips straight to the metadata update, so a repeated promote is a no-op.

use repmgr_common::types::{NodeId, NodeRecord, RecoveryType};
use repmgr_common::{ErrorKind, RepmgrError, RepmgrResult};
use tracing::{info, warn};

use super::follow::fill_missing_slot_name;
use super::{find_running_primary, local_node_record, run_remote, wait_for_recovery_type};
use crate::context::ClusterContext;
use crate::db::{DbSession, NewEvent};
use crate::events::{self, names, EventExtras};
use crate::gateway;
use crate::service;

#[derive(Debug, Clone, Default)]
pub struct PromoteOptions {
    /// Have every sibling standby follow the new primary afterwards.
    pub siblings_follow: bool,
}

fn promotion_fail(message: impl Into<String>) -> RepmgrError {
    RepmgrError::new(ErrorKind::PromotionFail, message)
}

/// Promote the local server and wait for it to leave recovery. Returns a
/// fresh handle to the promoted server.
pub(crate) async fn promote_and_wait(ctx: &ClusterContext, conn: &dyn DbSession) -> RepmgrResult<Box<dyn DbSession>> {
    service::promote_local(ctx, Some(conn)).await?;
    info!(
        "waiting up to {} seconds for promotion to complete",
        ctx.config.timeouts.promote_check_timeout
    );
    wait_for_recovery_type(
        ctx,
        RecoveryType::Primary,
        ctx.config.timeouts.promote_check_timeout,
        ctx.config.timeouts.promote_check_interval,
    )
    .await
}

/// Make the local node the only active primary in the records and record
/// `standby_promote`. Refuses to commit if another node is running as the
/// active primary.
pub(crate) async fn commit_promotion(
    ctx: &ClusterContext,
    conn: &dyn DbSession,
    local: &NodeRecord,
    former_primary: Option<&NodeRecord>,
    extra_standbys: &[NodeId],
) -> RepmgrResult<()> {
    conn.begin_transaction().await?;
    let applied = async {
        let current = conn.get_primary_node_record().await?;
        if current.map_or(false, |c| c.node_id != local.node_id) {
            if let Some((_, running)) = find_running_primary(ctx, conn, local.node_id).await? {
                return Err(RepmgrError::node_status(format!(
                    "node \"{}\" (ID: {}) is also running as active primary",
                    running.node_name, running.node_id
                ))
                .with_hint("resolve the conflicting primary before updating the node records"));
            }
        }
        conn.update_node_record_set_primary(local.node_id).await?;
        let mut promoted = local.clone();
        if fill_missing_slot_name(ctx, &mut promoted) {
            conn.update_node_record_slot_name(promoted.node_id, &promoted.slot_name).await?;
        }
        for id in extra_standbys {
            conn.update_node_record_set_upstream(*id, local.node_id).await?;
        }
        Ok::<(), RepmgrError>(())
    }
    .await;
    if let Err(e) = applied {
        events::rollback_quietly(conn).await;
        return Err(e);
    }

    let details = match former_primary {
        Some(p) => format!(
            "node \"{}\" (ID: {}) promoted to primary; old primary \"{}\" (ID: {}) marked as inactive",
            local.node_name, local.node_id, p.node_name, p.node_id
        ),
        None => format!("node \"{}\" (ID: {}) promoted to primary", local.node_name, local.node_id),
    };
    let ev = NewEvent::new(local.node_id, names::STANDBY_PROMOTE, true, details);
    let extras = EventExtras {
        node_name: Some(local.node_name.clone()),
        peer_node_id: former_primary.map(|p| p.node_id),
        peer_conninfo: former_primary.map(|p| p.conninfo.clone()),
    };
    events::commit_with_event(ctx, conn, ev, &extras).await?;
    Ok(())
}

/// Run `standby follow` on each sibling over SSH. Failures are warnings.
pub(crate) async fn siblings_follow(ctx: &ClusterContext, siblings: &[NodeRecord], new_primary: NodeId) -> Vec<String> {
    let mut warnings = Vec::new();
    for sibling in siblings {
        info!("executing \"standby follow\" on node \"{}\"", sibling.node_name);
        let args = format!("standby follow --upstream-node-id={}", new_primary);
        match run_remote(ctx, sibling, Some(&sibling.conninfo), &args).await {
            Ok(out) if out.success => {}
            Ok(_) => warnings.push(format!(
                "unable to execute \"standby follow\" on node \"{}\" (ID: {})",
                sibling.node_name, sibling.node_id
            )),
            Err(e) => warnings.push(format!("node \"{}\": {}", sibling.node_name, e)),
        }
    }
    for w in &warnings {
        warn!("{}", w);
    }
    warnings
}

pub async fn standby_promote(
    ctx: &ClusterContext,
    conn: &dyn DbSession,
    opts: &PromoteOptions,
) -> RepmgrResult<String> {
    let local = local_node_record(ctx, conn).await?;
    let rt = gateway::read_recovery_type(conn).await?;
    let former_primary = gateway::read_primary_node_record(conn).await?.filter(|p| p.node_id != local.node_id);
    let siblings: Vec<NodeRecord> = match &former_primary {
        Some(p) => conn
            .get_downstream_node_records(p.node_id)
            .await?
            .into_iter()
            .filter(|r| r.node_id != local.node_id)
            .collect(),
        None => Vec::new(),
    };

    let promoted_conn = match rt {
        RecoveryType::Primary => {
            if local.is_active_primary() && former_primary.is_none() {
                info!("node \"{}\" is already primary", local.node_name);
                return Ok(format!("node \"{}\" (ID: {}) is already primary\n", local.node_name, local.node_id));
            }
            info!("node is already running as primary; updating the node records");
            None
        }
        RecoveryType::Standby => {
            if !local.node_type.can_be_promoted() {
                return Err(RepmgrError::bad_config(format!(
                    "node \"{}\" is registered as {} and cannot be promoted",
                    local.node_name, local.node_type
                )));
            }
            if let Some((_, running)) = find_running_primary(ctx, conn, local.node_id).await? {
                if !ctx.options.force {
                    return Err(promotion_fail(format!(
                        "this replication cluster already has an active primary \"{}\" (ID: {})",
                        running.node_name, running.node_id
                    ))
                    .with_hint("use \"repmgr standby switchover\" or -F/--force"));
                }
                warn!("primary \"{}\" is still reachable; promoting anyway", running.node_name);
            }
            let info = gateway::read_replication_info(conn).await?;
            if info.wal_replay_paused && info.last_wal_receive_lsn > info.last_wal_replay_lsn && !ctx.options.force {
                return Err(promotion_fail("WAL replay is paused and WAL is pending replay")
                    .with_detail(format!(
                        "replay is at {}, received up to {}",
                        info.last_wal_replay_lsn, info.last_wal_receive_lsn
                    ))
                    .with_hint("resume replay with pg_wal_replay_resume() before promoting"));
            }
            if ctx.options.dry_run {
                return Ok(format!(
                    "prerequisites for promoting node \"{}\" are met\n",
                    local.node_name
                ));
            }
            info!("promoting standby \"{}\"", local.node_name);
            match promote_and_wait(ctx, conn).await {
                Ok(c) => Some(c),
                Err(e) => {
                    let ev = NewEvent::new(local.node_id, names::STANDBY_PROMOTE, false, e.message.clone());
                    events::create_event_notification(ctx, None, ev, &EventExtras::default()).await;
                    return Err(e);
                }
            }
        }
        RecoveryType::Unknown => {
            return Err(RepmgrError::node_status("unable to determine the recovery state of the local node"))
        }
    };

    if ctx.options.dry_run {
        return Ok(format!("would update the node record of \"{}\" to primary\n", local.node_name));
    }
    let meta_conn: &dyn DbSession = match &promoted_conn {
        Some(c) => c.as_ref(),
        None => conn,
    };
    commit_promotion(ctx, meta_conn, &local, former_primary.as_ref(), &[]).await?;
    let mut out = format!("standby \"{}\" (ID: {}) promoted to primary\n", local.node_name, local.node_id);

    if opts.siblings_follow && !siblings.is_empty() {
        let warnings = siblings_follow(ctx, &siblings, local.node_id).await;
        out.push_str(&format!(
            "{} of {} sibling node(s) now following the new primary\n",
            siblings.len() - warnings.len(),
            siblings.len()
        ));
    } else if !siblings.is_empty() {
        warn!(
            "{} sibling node(s) are still attached to the former primary; use \"repmgr standby follow\"",
            siblings.len()
        );
    }
    Ok(out)
}

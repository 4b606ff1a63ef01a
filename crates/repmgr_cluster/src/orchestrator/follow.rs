//! `standby follow`: attach the local standby to a new upstream.
//!
//! RESOLVE_TARGET -> VERIFY_TARGET_IS_PRIMARY -> VERIFY_ATTACHABLE ->
//! ENSURE_SLOT -> WRITE_RECOVERY_CONFIG -> RESTART_LOCAL -> AWAIT_ATTACHED
//! -> UPDATE_METADATA -> NOTIFY.

use repmgr_common::types::{slot_name_for, NodeId, NodeRecord, RecoveryType};
use repmgr_common::{ErrorKind, RepmgrError, RepmgrResult};
use tracing::{info, warn};

use super::{find_running_primary, local_node_record, wait_until_attached};
use crate::context::ClusterContext;
use crate::db::{DbSession, NewEvent};
use crate::events::{self, names, EventExtras};
use crate::gateway;
use crate::oracle::{self, Attachability, LocalPosition, NodeAttached};
use crate::recovery_conf::{self, StandbyConfig};
use crate::service::{self, ServiceAction};
use crate::slots;

#[derive(Debug, Clone, Default)]
pub struct FollowOptions {
    /// Follow this node instead of the current primary.
    pub upstream_node_id: Option<NodeId>,
}

fn follow_fail(message: impl Into<String>) -> RepmgrError {
    RepmgrError::new(ErrorKind::FollowFail, message)
}

/// With slots in use but no slot name recorded, fill in the default name.
/// Returns whether a name was derived.
pub(crate) fn fill_missing_slot_name(ctx: &ClusterContext, local: &mut NodeRecord) -> bool {
    if !ctx.config.replication.use_replication_slots || local.has_slot() {
        return false;
    }
    local.slot_name = slot_name_for(local.node_id);
    warn!(
        "replication slots are enabled but node \"{}\" (ID: {}) has no slot name recorded; using \"{}\"",
        local.node_name, local.node_id, local.slot_name
    );
    true
}

/// Slot name the local node consumes on its upstream, if slots are in use.
pub(crate) fn local_slot_name(ctx: &ClusterContext, local: &NodeRecord) -> Option<String> {
    if !ctx.config.replication.use_replication_slots {
        return None;
    }
    if local.has_slot() {
        Some(local.slot_name.clone())
    } else {
        Some(slot_name_for(local.node_id))
    }
}

/// ENSURE_SLOT through AWAIT_ATTACHED. `action` is `Restart` for a running
/// standby and `Start` for a stopped one.
///
/// A timeout after the restart is reported as `RejoinFail`: the
/// configuration has changed but attachment was not confirmed.
pub(crate) async fn attach_to_upstream(
    ctx: &ClusterContext,
    target: &NodeRecord,
    target_conn: &dyn DbSession,
    local: &NodeRecord,
    action: ServiceAction,
) -> RepmgrResult<()> {
    let slot_name = local_slot_name(ctx, local);
    if let Some(name) = &slot_name {
        slots::create_replication_slot(target_conn, name).await?;
    }

    let primary_conninfo =
        recovery_conf::build_primary_conninfo(target, &local.node_name, &ctx.config.effective_replication_user())?;
    recovery_conf::write_standby_config(
        &ctx.config.data_dir(),
        &StandbyConfig {
            primary_conninfo,
            primary_slot_name: slot_name,
        },
    )?;

    service::execute_action(ctx, action).await?;

    let timeout = ctx.config.timeouts.node_rejoin_timeout;
    if !wait_until_attached(ctx, target_conn, &local.node_name, timeout).await? {
        return Err(RepmgrError::rejoin_fail(format!(
            "node \"{}\" did not attach to upstream \"{}\" within {} seconds",
            local.node_name, target.node_name, timeout
        ))
        .with_detail("the standby configuration has been changed but attachment was not confirmed")
        .with_hint("check the PostgreSQL log on the local node"));
    }
    Ok(())
}

/// Record `local` as an active standby of `target` and emit `event`. The
/// slot name in use is stored with the record.
pub(crate) async fn commit_follow(
    ctx: &ClusterContext,
    target_conn: &dyn DbSession,
    local: &NodeRecord,
    target: &NodeRecord,
    event: &str,
    details: String,
) -> RepmgrResult<()> {
    target_conn.begin_transaction().await?;
    let applied = async {
        target_conn
            .update_node_record_set_upstream(local.node_id, target.node_id)
            .await?;
        if let Some(slot) = local_slot_name(ctx, local) {
            target_conn.update_node_record_slot_name(local.node_id, &slot).await?;
        }
        Ok::<(), RepmgrError>(())
    }
    .await;
    if let Err(e) = applied {
        events::rollback_quietly(target_conn).await;
        return Err(e);
    }
    let ev = NewEvent::new(local.node_id, event, true, details);
    let extras = EventExtras {
        node_name: Some(local.node_name.clone()),
        peer_node_id: Some(target.node_id),
        peer_conninfo: Some(target.conninfo.clone()),
    };
    events::commit_with_event(ctx, target_conn, ev, &extras).await?;
    Ok(())
}

async fn resolve_target(
    ctx: &ClusterContext,
    conn: &dyn DbSession,
    local_id: NodeId,
    opts: &FollowOptions,
) -> RepmgrResult<(Box<dyn DbSession>, NodeRecord)> {
    match opts.upstream_node_id {
        Some(id) => {
            let record = gateway::read_node_record(conn, id)
                .await?
                .ok_or_else(|| RepmgrError::bad_config(format!("no record found for node {}", id)))?;
            let target_conn = gateway::connect_to_node(ctx, &record).await?;
            Ok((target_conn, record))
        }
        None => find_running_primary(ctx, conn, local_id).await?.ok_or_else(|| {
            follow_fail("unable to find a running primary to follow")
                .with_hint("use --upstream-node-id to name the node to follow")
        }),
    }
}

pub async fn standby_follow(ctx: &ClusterContext, conn: &dyn DbSession, opts: &FollowOptions) -> RepmgrResult<String> {
    if gateway::read_recovery_type(conn).await? != RecoveryType::Standby {
        return Err(RepmgrError::bad_config("\"standby follow\" can only be executed on a standby"));
    }
    let local_id = ctx.config.node_id();
    let (target_conn, target) = resolve_target(ctx, conn, local_id, opts).await?;
    if target.node_id == local_id {
        return Err(RepmgrError::bad_config("a node cannot follow itself"));
    }
    if gateway::read_recovery_type(target_conn.as_ref()).await? != RecoveryType::Primary {
        return Err(follow_fail(format!(
            "node \"{}\" (ID: {}) is not running as primary",
            target.node_name, target.node_id
        )));
    }

    // The primary holds the authoritative copy of the local record.
    let mut local = match gateway::read_node_record(target_conn.as_ref(), local_id).await? {
        Some(r) => r,
        None => local_node_record(ctx, conn).await?,
    };
    fill_missing_slot_name(ctx, &mut local);

    if local.upstream_node_id == Some(target.node_id)
        && local.active
        && oracle::is_downstream_node_attached(target_conn.as_ref(), &local.node_name).await == NodeAttached::Attached
    {
        info!("node \"{}\" is already following \"{}\"", local.node_name, target.node_name);
        return Ok(format!(
            "node \"{}\" is already attached to \"{}\"; nothing to do\n",
            local.node_name, target.node_name
        ));
    }

    let info = gateway::read_replication_info(conn).await?;
    let lsn = if info.last_wal_receive_lsn.is_valid() {
        info.last_wal_receive_lsn
    } else {
        info.last_wal_replay_lsn
    };
    let position = LocalPosition {
        system_identifier: conn.system_identifier().await?,
        timeline: info.timeline,
        lsn,
    };
    if let Attachability::NotAttachable(reason) =
        oracle::check_node_can_attach(&position, target_conn.as_ref(), &target, false).await?
    {
        return Err(follow_fail(format!(
            "this node cannot attach to node \"{}\" (ID: {})",
            target.node_name, target.node_id
        ))
        .with_detail(reason));
    }

    if ctx.options.dry_run {
        return Ok(format!(
            "prerequisites for following node \"{}\" are met\nwould restart the local server after updating the standby configuration\n",
            target.node_name
        ));
    }

    let previous_upstream = local.upstream_node_id.filter(|id| *id != target.node_id);
    attach_to_upstream(ctx, &target, target_conn.as_ref(), &local, ServiceAction::Restart).await?;
    commit_follow(
        ctx,
        target_conn.as_ref(),
        &local,
        &target,
        names::STANDBY_FOLLOW,
        format!(
            "standby attached to upstream node \"{}\" (ID: {})",
            target.node_name, target.node_id
        ),
    )
    .await?;

    if let (Some(old_id), Some(slot)) = (previous_upstream, local_slot_name(ctx, &local)) {
        drop_slot_on_previous_upstream(ctx, target_conn.as_ref(), old_id, &slot).await;
    }
    Ok(format!(
        "node \"{}\" is now attached to node \"{}\" (ID: {})\n",
        local.node_name, target.node_name, target.node_id
    ))
}

async fn drop_slot_on_previous_upstream(ctx: &ClusterContext, conn: &dyn DbSession, old_id: NodeId, slot: &str) {
    let record = match conn.get_node_record(old_id).await {
        Ok(Some(r)) => r,
        _ => return,
    };
    match gateway::establish_db_connection_quiet(ctx.connector.as_ref(), &record.conninfo).await {
        Some(old_conn) => {
            if let Err(e) = slots::drop_replication_slot_if_exists(old_conn.as_ref(), old_id, slot).await {
                warn!("unable to drop slot \"{}\" on node \"{}\": {}", slot, record.node_name, e);
            }
        }
        None => info!(
            "previous upstream \"{}\" not reachable; slot \"{}\" not dropped",
            record.node_name, slot
        ),
    }
}

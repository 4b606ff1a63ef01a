//! Registration and unregistration of primary, standby and witness nodes.

use repmgr_common::config::RepmgrConfig;
use repmgr_common::types::{slot_name_for, NodeId, NodeRecord, NodeType, RecoveryType};
use repmgr_common::{RepmgrError, RepmgrResult};
use tracing::{info, warn};

use crate::context::{interrupted, ClusterContext, PollWait, Poller};
use crate::db::{DbSession, NewEvent};
use crate::events::{self, names, EventExtras};
use crate::gateway;

/// Record describing the local node as configured.
pub fn local_record_from_config(
    config: &RepmgrConfig,
    node_type: NodeType,
    upstream: Option<NodeId>,
) -> NodeRecord {
    let mut record = NodeRecord::new(config.node_id(), &config.node_name, node_type, &config.conninfo);
    record.upstream_node_id = upstream;
    record.repluser = config.effective_replication_user();
    if config.replication.use_replication_slots && node_type.replicates() {
        record.slot_name = slot_name_for(config.node_id());
    }
    record.location = config.location.clone();
    record.priority = config.priority;
    record
}

async fn ensure_schema(conn: &dyn DbSession) -> RepmgrResult<()> {
    if conn.schema_exists().await? {
        return Ok(());
    }
    info!("creating the repmgr metadata schema");
    conn.create_schema().await
}

/// Insert `record`, or overwrite an existing row with `force`.
async fn upsert_record(conn: &dyn DbSession, record: &NodeRecord, force: bool) -> RepmgrResult<()> {
    match conn.get_node_record(record.node_id).await? {
        Some(existing) if !force => Err(RepmgrError::bad_config(format!(
            "node {} is already registered as \"{}\"",
            existing.node_id, existing.node_name
        ))
        .with_hint("use -F/--force to overwrite the existing node record")),
        Some(_) => conn.update_node_record(record).await,
        None => conn.create_node_record(record).await,
    }
}

// ---------------------------------------------------------------------------
// primary
// ---------------------------------------------------------------------------

pub async fn primary_register(ctx: &ClusterContext, conn: &dyn DbSession) -> RepmgrResult<String> {
    if conn.recovery_type().await? != RecoveryType::Primary {
        return Err(RepmgrError::node_status("server is in recovery; cannot register it as primary")
            .with_hint("use \"repmgr standby register\" for a standby"));
    }
    if ctx.options.dry_run {
        return Ok(format!("would register node \"{}\" as primary\n", ctx.config.node_name));
    }
    ensure_schema(conn).await?;

    let local_id = ctx.config.node_id();
    if let Some(other) = conn.get_primary_node_record().await? {
        if other.node_id != local_id {
            if !ctx.options.force {
                return Err(RepmgrError::bad_config(format!(
                    "there is already an active primary node \"{}\" (ID: {})",
                    other.node_name, other.node_id
                ))
                .with_hint("use -F/--force to register this node anyway"));
            }
            warn!("deactivating primary record of node \"{}\"", other.node_name);
        }
    }

    let record = local_record_from_config(&ctx.config, NodeType::Primary, None);
    conn.begin_transaction().await?;
    let applied = async {
        upsert_record(conn, &record, ctx.options.force).await?;
        conn.update_node_record_set_primary(local_id).await
    }
    .await;
    if let Err(e) = applied {
        events::rollback_quietly(conn).await;
        return Err(e);
    }
    let ev = NewEvent::new(local_id, names::PRIMARY_REGISTER, true, "");
    events::commit_with_event(ctx, conn, ev, &EventExtras::default()).await?;
    Ok(format!("primary node record (ID: {}) registered\n", local_id))
}

/// Unregister a primary record. An active primary can only be removed with
/// `force` while it is still running.
pub async fn primary_unregister(
    ctx: &ClusterContext,
    conn: &dyn DbSession,
    target: Option<NodeId>,
) -> RepmgrResult<String> {
    let node_id = target.unwrap_or_else(|| ctx.config.node_id());
    let record = conn
        .get_node_record(node_id)
        .await?
        .ok_or_else(|| RepmgrError::bad_config(format!("node {} is not registered", node_id)))?;
    if record.node_type != NodeType::Primary {
        return Err(RepmgrError::bad_config(format!(
            "node \"{}\" (ID: {}) is a {}, not a primary",
            record.node_name, record.node_id, record.node_type
        )));
    }
    let downstream = conn.get_downstream_node_records(node_id).await?;
    if !downstream.is_empty() {
        return Err(RepmgrError::bad_config(format!(
            "node \"{}\" has {} downstream node(s) attached",
            record.node_name,
            downstream.len()
        ))
        .with_hint("unregister or follow the downstream nodes first"));
    }
    if record.active {
        let running = gateway::establish_db_connection_quiet(ctx.connector.as_ref(), &record.conninfo)
            .await
            .is_some();
        if running && !ctx.options.force {
            return Err(RepmgrError::bad_config(format!(
                "node \"{}\" is an active primary",
                record.node_name
            ))
            .with_hint("use -F/--force to unregister a running primary"));
        }
    }
    if ctx.options.dry_run {
        return Ok(format!("would unregister primary node \"{}\"\n", record.node_name));
    }
    conn.begin_transaction().await?;
    if let Err(e) = conn.delete_node_record(node_id).await {
        events::rollback_quietly(conn).await;
        return Err(e);
    }
    let ev = NewEvent::new(node_id, names::PRIMARY_UNREGISTER, true, "");
    events::commit_with_event(ctx, conn, ev, &EventExtras::default()).await?;
    Ok(format!("primary node \"{}\" (ID: {}) unregistered\n", record.node_name, node_id))
}

// ---------------------------------------------------------------------------
// standby
// ---------------------------------------------------------------------------

/// Options for `standby register`.
#[derive(Debug, Clone, Default)]
pub struct StandbyRegisterOptions {
    pub upstream_node_id: Option<NodeId>,
    /// Seconds to wait for the new record to reach the standby.
    pub wait_sync: Option<u64>,
}

/// Register the local standby. The record is written on the primary; the
/// local node may be down when `force` is given.
pub async fn standby_register(
    ctx: &ClusterContext,
    local_conn: Option<&dyn DbSession>,
    primary_conn: &dyn DbSession,
    opts: &StandbyRegisterOptions,
) -> RepmgrResult<String> {
    match local_conn {
        Some(local) => {
            if local.recovery_type().await? != RecoveryType::Standby {
                return Err(RepmgrError::node_status("this node is not a standby")
                    .with_hint("use \"repmgr primary register\" for a primary"));
            }
        }
        None if !ctx.options.force => {
            return Err(RepmgrError::db_connection("unable to connect to the local node")
                .with_hint("use -F/--force to register a standby which is not running"));
        }
        None => warn!("local node not reachable; registering anyway"),
    }

    let primary_id = primary_conn
        .get_primary_node_id()
        .await?
        .ok_or_else(|| RepmgrError::node_status("unable to determine the primary node"))?;
    let upstream_id = opts.upstream_node_id.unwrap_or(primary_id);
    match primary_conn.get_node_record(upstream_id).await? {
        Some(up) if up.active => {}
        Some(up) if ctx.options.force => {
            warn!("upstream node \"{}\" is marked inactive", up.node_name)
        }
        Some(up) => {
            return Err(RepmgrError::bad_config(format!(
                "upstream node \"{}\" (ID: {}) is marked inactive",
                up.node_name, up.node_id
            )))
        }
        None => {
            return Err(RepmgrError::bad_config(format!(
                "no record found for upstream node {}",
                upstream_id
            )))
        }
    }

    let record = local_record_from_config(&ctx.config, NodeType::Standby, Some(upstream_id));
    if ctx.options.dry_run {
        return Ok(format!(
            "would register standby \"{}\" with upstream node {}\n",
            record.node_name, upstream_id
        ));
    }
    primary_conn.begin_transaction().await?;
    if let Err(e) = upsert_record(primary_conn, &record, ctx.options.force).await {
        events::rollback_quietly(primary_conn).await;
        return Err(e);
    }
    let ev = NewEvent::new(
        record.node_id,
        names::STANDBY_REGISTER,
        true,
        format!("standby registration succeeded; upstream node ID is {}", upstream_id),
    );
    let extras = EventExtras {
        node_name: Some(record.node_name.clone()),
        peer_node_id: Some(upstream_id),
        peer_conninfo: None,
    };
    events::commit_with_event(ctx, primary_conn, ev, &extras).await?;

    if let (Some(secs), Some(local)) = (opts.wait_sync, local_conn) {
        wait_record_synced(ctx, local, &record, secs).await?;
    }
    Ok(format!("standby registration complete (ID: {})\n", record.node_id))
}

async fn wait_record_synced(
    ctx: &ClusterContext,
    local: &dyn DbSession,
    record: &NodeRecord,
    timeout: u64,
) -> RepmgrResult<()> {
    info!("waiting up to {} seconds for the record to reach the standby", timeout);
    let mut poller = Poller::new(1, timeout, &ctx.interrupt);
    loop {
        if let Ok(Some(seen)) = local.get_node_record(record.node_id).await {
            if seen.node_type == record.node_type && seen.upstream_node_id == record.upstream_node_id {
                info!("node record synchronised to the standby");
                return Ok(());
            }
        }
        match poller.wait().await {
            PollWait::Again => continue,
            PollWait::TimedOut => {
                return Err(RepmgrError::node_status(format!(
                    "node record not synchronised after {} seconds",
                    timeout
                )))
            }
            PollWait::Interrupted => return Err(interrupted("waiting for record synchronisation")),
        }
    }
}

pub async fn standby_unregister(
    ctx: &ClusterContext,
    primary_conn: &dyn DbSession,
    target: Option<NodeId>,
) -> RepmgrResult<String> {
    let node_id = target.unwrap_or_else(|| ctx.config.node_id());
    let record = primary_conn
        .get_node_record(node_id)
        .await?
        .ok_or_else(|| RepmgrError::bad_config(format!("node {} is not registered", node_id)))?;
    if record.node_type != NodeType::Standby {
        return Err(RepmgrError::bad_config(format!(
            "node \"{}\" (ID: {}) is a {}, not a standby",
            record.node_name, record.node_id, record.node_type
        )));
    }
    if ctx.options.dry_run {
        return Ok(format!("would unregister standby \"{}\"\n", record.node_name));
    }
    primary_conn.begin_transaction().await?;
    if let Err(e) = primary_conn.delete_node_record(node_id).await {
        events::rollback_quietly(primary_conn).await;
        return Err(e);
    }
    let ev = NewEvent::new(node_id, names::STANDBY_UNREGISTER, true, "");
    events::commit_with_event(ctx, primary_conn, ev, &EventExtras::default()).await?;
    Ok(format!("standby \"{}\" (ID: {}) unregistered\n", record.node_name, node_id))
}

// ---------------------------------------------------------------------------
// witness
// ---------------------------------------------------------------------------

/// Copy every record from the primary into the witness's own store.
async fn copy_records_to_witness(primary_conn: &dyn DbSession, witness_conn: &dyn DbSession) -> RepmgrResult<usize> {
    let records = primary_conn.get_all_node_records().await?;
    witness_conn.begin_transaction().await?;
    let copied = async {
        for existing in witness_conn.get_all_node_records().await? {
            witness_conn.delete_node_record(existing.node_id).await?;
        }
        for r in &records {
            witness_conn.create_node_record(r).await?;
        }
        Ok::<usize, RepmgrError>(records.len())
    }
    .await;
    match copied {
        Ok(n) => {
            witness_conn.commit_transaction().await?;
            Ok(n)
        }
        Err(e) => {
            events::rollback_quietly(witness_conn).await;
            Err(e)
        }
    }
}

pub async fn witness_register(
    ctx: &ClusterContext,
    witness_conn: &dyn DbSession,
    primary_conn: &dyn DbSession,
) -> RepmgrResult<String> {
    if witness_conn.recovery_type().await? != RecoveryType::Primary {
        return Err(RepmgrError::node_status("the witness server must not be in recovery"));
    }
    let primary_id = primary_conn
        .get_primary_node_id()
        .await?
        .ok_or_else(|| RepmgrError::node_status("unable to determine the primary node"))?;
    if witness_conn.system_identifier().await? == primary_conn.system_identifier().await? {
        return Err(RepmgrError::bad_config(
            "witness server has the same system identifier as the primary",
        )
        .with_hint("the witness must run on a separate PostgreSQL instance outside the replication cluster"));
    }
    let record = local_record_from_config(&ctx.config, NodeType::Witness, Some(primary_id));
    if ctx.options.dry_run {
        return Ok(format!("would register witness \"{}\"\n", record.node_name));
    }
    ensure_schema(witness_conn).await?;

    primary_conn.begin_transaction().await?;
    if let Err(e) = upsert_record(primary_conn, &record, ctx.options.force).await {
        events::rollback_quietly(primary_conn).await;
        return Err(e);
    }
    primary_conn.commit_transaction().await?;

    let copied = copy_records_to_witness(primary_conn, witness_conn).await?;
    info!("{} node record(s) copied to the witness", copied);

    let ev = NewEvent::new(record.node_id, names::WITNESS_REGISTER, true, "");
    let extras = EventExtras {
        node_name: Some(record.node_name.clone()),
        peer_node_id: Some(primary_id),
        peer_conninfo: None,
    };
    events::create_event_notification(ctx, Some(primary_conn), ev, &extras).await;
    Ok(format!("witness registration complete (ID: {})\n", record.node_id))
}

pub async fn witness_unregister(
    ctx: &ClusterContext,
    primary_conn: &dyn DbSession,
    witness_conn: Option<&dyn DbSession>,
    target: Option<NodeId>,
) -> RepmgrResult<String> {
    let node_id = target.unwrap_or_else(|| ctx.config.node_id());
    let record = primary_conn
        .get_node_record(node_id)
        .await?
        .ok_or_else(|| RepmgrError::bad_config(format!("node {} is not registered", node_id)))?;
    if record.node_type != NodeType::Witness {
        return Err(RepmgrError::bad_config(format!(
            "node \"{}\" (ID: {}) is a {}, not a witness",
            record.node_name, record.node_id, record.node_type
        )));
    }
    if ctx.options.dry_run {
        return Ok(format!("would unregister witness \"{}\"\n", record.node_name));
    }
    primary_conn.begin_transaction().await?;
    if let Err(e) = primary_conn.delete_node_record(node_id).await {
        events::rollback_quietly(primary_conn).await;
        return Err(e);
    }
    let ev = NewEvent::new(node_id, names::WITNESS_UNREGISTER, true, "");
    events::commit_with_event(ctx, primary_conn, ev, &EventExtras::default()).await?;

    if let Some(w) = witness_conn {
        if let Err(e) = w.delete_node_record(node_id).await {
            warn!("unable to remove the witness's own copy of its record: {}", e);
        }
    }
    Ok(format!("witness \"{}\" (ID: {}) unregistered\n", record.node_name, node_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_record_from_config() {
        let mut cfg = RepmgrConfig::for_node(3, "node3", "host=node3 user=repmgr", "/data");
        cfg.priority = 50;
        let r = local_record_from_config(&cfg, NodeType::Standby, Some(NodeId(1)));
        assert_eq!(r.node_id, NodeId(3));
        assert_eq!(r.slot_name, "repmgr_slot_3");
        assert_eq!(r.repluser, "repmgr");
        assert_eq!(r.upstream_node_id, Some(NodeId(1)));
        assert_eq!(r.priority, 50);

        let w = local_record_from_config(&cfg, NodeType::Witness, Some(NodeId(1)));
        assert!(w.slot_name.is_empty());

        cfg.replication.use_replication_slots = false;
        let r = local_record_from_config(&cfg, NodeType::Standby, Some(NodeId(1)));
        assert!(r.slot_name.is_empty());
    }
}

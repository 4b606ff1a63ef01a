//! Role changes: promote, follow, rejoin and switchover.
//!
//! Each operation is a sequence of steps with checks up front and a single
//! commit point where the node records are updated together with the event
//! row. Live actions (promotion, restart, rewind) happen before the commit;
//! the records only describe what has been confirmed.

pub mod follow;
pub mod promote;
pub mod rejoin;
pub mod switchover;

use repmgr_common::conninfo;
use repmgr_common::types::{NodeId, NodeRecord, RecoveryType};
use repmgr_common::{ErrorKind, RepmgrError, RepmgrResult};
use tracing::{debug, info};

use crate::context::{interrupted, ClusterContext, PollWait, Poller};
use crate::db::DbSession;
use crate::gateway;
use crate::oracle::{self, NodeAttached};
use crate::remote::RemoteOutput;

/// The local node's record, read through `conn`.
pub(crate) async fn local_node_record(ctx: &ClusterContext, conn: &dyn DbSession) -> RepmgrResult<NodeRecord> {
    let id = ctx.config.node_id();
    gateway::read_node_record(conn, id).await?.ok_or_else(|| {
        RepmgrError::bad_config(format!("no record found for the local node (ID: {})", id))
            .with_hint("check the node is registered")
    })
}

/// Find a node currently running as primary, preferring the one the
/// records name. `exclude` is skipped.
pub(crate) async fn find_running_primary(
    ctx: &ClusterContext,
    conn: &dyn DbSession,
    exclude: NodeId,
) -> RepmgrResult<Option<(Box<dyn DbSession>, NodeRecord)>> {
    let mut records = gateway::read_all_node_records(conn).await?;
    records.sort_by_key(|r| !r.is_active_primary());
    for record in records.into_iter().filter(|r| r.node_id != exclude && r.active) {
        let Some(node_conn) =
            gateway::establish_db_connection_quiet(ctx.connector.as_ref(), &record.conninfo).await
        else {
            continue;
        };
        if node_conn.recovery_type().await.ok() == Some(RecoveryType::Primary) {
            debug!("node \"{}\" (ID: {}) is running as primary", record.node_name, record.node_id);
            return Ok(Some((node_conn, record)));
        }
    }
    Ok(None)
}

/// Poll the local server until it reports `expected`, reconnecting each
/// time. Returns a fresh handle on success.
pub(crate) async fn wait_for_recovery_type(
    ctx: &ClusterContext,
    expected: RecoveryType,
    timeout: u64,
    interval: u64,
) -> RepmgrResult<Box<dyn DbSession>> {
    let mut poller = Poller::new(interval, timeout, &ctx.interrupt);
    loop {
        if let Some(conn) = gateway::establish_db_connection_quiet(ctx.connector.as_ref(), &ctx.config.conninfo).await {
            if conn.recovery_type().await.ok() == Some(expected) {
                return Ok(conn);
            }
        }
        match poller.wait().await {
            PollWait::Again => continue,
            PollWait::TimedOut => {
                return Err(RepmgrError::new(
                    ErrorKind::PromotionFail,
                    format!("node did not become {} within {} seconds", expected.as_str(), timeout),
                ))
            }
            PollWait::Interrupted => return Err(interrupted("waiting for the server state to change")),
        }
    }
}

/// Poll `upstream` until `node_name` appears as a streaming standby.
/// Returns `false` on timeout.
pub(crate) async fn wait_until_attached(
    ctx: &ClusterContext,
    upstream: &dyn DbSession,
    node_name: &str,
    timeout: u64,
) -> RepmgrResult<bool> {
    let mut poller = Poller::new(ctx.config.timeouts.check_interval, timeout, &ctx.interrupt);
    loop {
        if oracle::is_downstream_node_attached(upstream, node_name).await == NodeAttached::Attached {
            info!("node \"{}\" is attached to its upstream", node_name);
            return Ok(true);
        }
        match poller.wait().await {
            PollWait::Again => continue,
            PollWait::TimedOut => return Ok(false),
            PollWait::Interrupted => return Err(interrupted("waiting for the node to attach")),
        }
    }
}

/// Run a `repmgr` self-invocation on the host of `record`.
pub(crate) async fn run_remote(
    ctx: &ClusterContext,
    record: &NodeRecord,
    conninfo_arg: Option<&str>,
    args: &str,
) -> RepmgrResult<RemoteOutput> {
    let host = conninfo::host_of(&record.conninfo)?;
    let cmd = ctx.remote_repmgr().command(conninfo_arg, args);
    debug!("executing on node \"{}\": {}", record.node_name, cmd);
    Ok(ctx.remote.run(&host, ctx.remote_user(), &cmd).await)
}

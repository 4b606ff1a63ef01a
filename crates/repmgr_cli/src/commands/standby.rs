use repmgr_cluster::clone::{self, CloneOptions};
use repmgr_cluster::orchestrator::follow::{self, FollowOptions};
use repmgr_cluster::orchestrator::promote::{self, PromoteOptions};
use repmgr_cluster::orchestrator::switchover::{self, SwitchoverOptions};
use repmgr_cluster::register::{self, StandbyRegisterOptions};
use repmgr_cluster::{gateway, DbSession};
use repmgr_common::{NodeId, RepmgrError, RepmgrResult};

use super::{Invocation, Outcome};
use crate::args::StandbyCmd;

pub async fn run(inv: &Invocation<'_>, cmd: &StandbyCmd) -> RepmgrResult<Outcome> {
    let ctx = inv.ctx;
    let out = match cmd {
        StandbyCmd::Register(args) => {
            let opts = StandbyRegisterOptions {
                upstream_node_id: args.upstream_node_id.map(NodeId),
                wait_sync: args.wait_sync,
            };
            let local = if ctx.options.force {
                gateway::establish_db_connection_quiet(ctx.connector.as_ref(), &ctx.config.conninfo).await
            } else {
                Some(inv.connect_configured().await?)
            };
            let primary_conn = primary_for_registration(inv, local.as_deref()).await?;
            register::standby_register(ctx, local.as_deref(), primary_conn.as_ref(), &opts).await?
        }
        StandbyCmd::Unregister => {
            let conn = match inv.cli_conninfo()? {
                Some(ci) => gateway::establish_db_connection(ctx.connector.as_ref(), &ci).await?,
                None => inv.connect_configured().await?,
            };
            let primary_conn = inv.writable(conn).await?;
            register::standby_unregister(ctx, primary_conn.as_ref(), inv.target_node()).await?
        }
        StandbyCmd::Clone(args) => {
            let opts = CloneOptions {
                source_conninfo: inv.required_conninfo("\"standby clone\"")?,
                upstream_node_id: args.upstream_node_id.map(NodeId),
                fast_checkpoint: args.fast_checkpoint,
            };
            clone::standby_clone(ctx, &opts).await?
        }
        StandbyCmd::Promote(args) => {
            let conn = inv.connect_local().await?;
            let opts = PromoteOptions {
                siblings_follow: args.siblings_follow,
            };
            promote::standby_promote(ctx, conn.as_ref(), &opts).await?
        }
        StandbyCmd::Follow(args) => {
            let conn = inv.connect_local().await?;
            let opts = FollowOptions {
                upstream_node_id: args.upstream_node_id.map(NodeId),
            };
            follow::standby_follow(ctx, conn.as_ref(), &opts).await?
        }
        StandbyCmd::Switchover(args) => {
            let conn = inv.connect_local().await?;
            let opts = SwitchoverOptions {
                always_promote: args.always_promote,
                force_rewind: args.force_rewind,
                siblings_follow: args.siblings_follow,
                repmgrd_no_pause: args.repmgrd_no_pause,
                repmgrd_force_unpause: args.repmgrd_force_unpause,
            };
            switchover::standby_switchover(ctx, conn.as_ref(), &opts).await?
        }
    };
    Ok(Outcome::text(out))
}

/// The primary to write the standby's record on: `-d`/`--host` when given,
/// otherwise the primary named in the local node's copy of the records.
async fn primary_for_registration(
    inv: &Invocation<'_>,
    local: Option<&dyn DbSession>,
) -> RepmgrResult<Box<dyn DbSession>> {
    let ctx = inv.ctx;
    if let Some(ci) = inv.cli_conninfo()? {
        let conn = gateway::establish_db_connection(ctx.connector.as_ref(), &ci).await?;
        return inv.writable(conn).await;
    }
    match local {
        Some(conn) => Ok(gateway::connect_to_primary(ctx, conn).await?.0),
        None => Err(RepmgrError::db_connection("unable to connect to the local node")
            .with_hint("provide the primary's connection parameters with -d/--dbname")),
    }
}

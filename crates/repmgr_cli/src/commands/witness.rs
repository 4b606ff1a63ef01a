use repmgr_cluster::{gateway, register};
use repmgr_common::RepmgrResult;

use super::{Invocation, Outcome};
use crate::args::WitnessCmd;

/// `-d`/`--host` name the primary; the witness itself is reached through
/// the configured `conninfo`.
pub async fn run(inv: &Invocation<'_>, cmd: &WitnessCmd) -> RepmgrResult<Outcome> {
    let ctx = inv.ctx;
    let out = match cmd {
        WitnessCmd::Register => {
            let primary_ci = inv.required_conninfo("\"witness register\"")?;
            let witness_conn = inv.connect_configured().await?;
            let primary_conn = gateway::establish_db_connection(ctx.connector.as_ref(), &primary_ci).await?;
            let primary_conn = inv.writable(primary_conn).await?;
            register::witness_register(ctx, witness_conn.as_ref(), primary_conn.as_ref()).await?
        }
        WitnessCmd::Unregister => {
            let witness_conn =
                gateway::establish_db_connection_quiet(ctx.connector.as_ref(), &ctx.config.conninfo).await;
            let primary_conn = match (inv.cli_conninfo()?, &witness_conn) {
                (Some(ci), _) => gateway::establish_db_connection(ctx.connector.as_ref(), &ci).await?,
                (None, Some(w)) => gateway::connect_to_primary(ctx, w.as_ref()).await?.0,
                (None, None) => {
                    return Err(repmgr_common::RepmgrError::db_connection(
                        "unable to connect to the witness server",
                    )
                    .with_hint("provide the primary's connection parameters with -d/--dbname"))
                }
            };
            let primary_conn = inv.writable(primary_conn).await?;
            register::witness_unregister(ctx, primary_conn.as_ref(), witness_conn.as_deref(), inv.target_node())
                .await?
        }
    };
    Ok(Outcome::text(out))
}

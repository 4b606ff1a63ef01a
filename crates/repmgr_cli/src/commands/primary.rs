use repmgr_cluster::register;
use repmgr_common::RepmgrResult;

use super::{Invocation, Outcome};
use crate::args::PrimaryCmd;

pub async fn run(inv: &Invocation<'_>, cmd: &PrimaryCmd) -> RepmgrResult<Outcome> {
    let conn = inv.connect_local().await?;
    let out = match cmd {
        PrimaryCmd::Register => register::primary_register(inv.ctx, conn.as_ref()).await?,
        PrimaryCmd::Unregister => {
            let primary_conn = inv.writable(conn).await?;
            register::primary_unregister(inv.ctx, primary_conn.as_ref(), inv.target_node()).await?
        }
    };
    Ok(Outcome::text(out))
}

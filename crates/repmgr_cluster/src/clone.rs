//! `standby clone`: copy a data directory from an upstream server with
//! `pg_basebackup` and configure it as a standby.

use std::fs;
use std::path::Path;

use repmgr_common::conninfo::{self, ConnInfo};
use repmgr_common::types::{slot_name_for, NodeId, NodeRecord, RecoveryType};
use repmgr_common::{ErrorKind, RepmgrError, RepmgrResult};
use tracing::{info, warn};

use crate::command::shell_quote;
use crate::context::ClusterContext;
use crate::db::{DbSession, NewEvent};
use crate::events::{self, names, EventExtras};
use crate::gateway;
use crate::recovery_conf::{self, StandbyConfig};
use crate::slots;

/// WAL senders used by `pg_basebackup -X stream`.
const BASEBACKUP_WAL_SENDERS: i32 = 2;

#[derive(Debug, Clone, Default)]
pub struct CloneOptions {
    /// Conninfo of the server to copy from.
    pub source_conninfo: String,
    /// Upstream for the new standby; defaults to the source node.
    pub upstream_node_id: Option<NodeId>,
    pub fast_checkpoint: bool,
}

/// Whether `dir` is absent or contains no entries.
pub fn data_directory_is_empty(dir: &Path) -> RepmgrResult<bool> {
    match fs::read_dir(dir) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(RepmgrError::bad_config(format!(
            "unable to read data directory \"{}\"",
            dir.display()
        ))
        .with_detail(e.to_string())),
    }
}

/// The `pg_basebackup` invocation for a clone.
pub fn basebackup_command(
    ctx: &ClusterContext,
    source_conninfo: &str,
    slot_name: Option<&str>,
    fast_checkpoint: bool,
) -> String {
    let bin = &ctx.config.binaries;
    let mut cmd = format!(
        "{} -l \"repmgr base backup\" -D {} -d {} -X stream",
        bin.pg_binary("pg_basebackup"),
        shell_quote(&ctx.config.data_directory),
        shell_quote(source_conninfo)
    );
    if fast_checkpoint {
        cmd.push_str(" -c fast");
    }
    if let Some(slot) = slot_name {
        cmd.push_str(" -S ");
        cmd.push_str(&shell_quote(slot));
    }
    if !bin.pg_basebackup_options.trim().is_empty() {
        cmd.push(' ');
        cmd.push_str(bin.pg_basebackup_options.trim());
    }
    cmd
}

async fn resolve_upstream(
    source_conn: &dyn DbSession,
    opts: &CloneOptions,
) -> RepmgrResult<Option<NodeRecord>> {
    if let Some(id) = opts.upstream_node_id {
        return source_conn
            .get_node_record(id)
            .await?
            .map(Some)
            .ok_or_else(|| RepmgrError::bad_config(format!("no record found for upstream node {}", id)));
    }
    if !source_conn.schema_exists().await? {
        return Ok(None);
    }
    let records = source_conn.get_all_node_records().await?;
    let source_host = conninfo::host_of(source_conn.conninfo())?;
    Ok(records
        .into_iter()
        .find(|r| conninfo::host_of(&r.conninfo).map_or(false, |h| h == source_host)))
}

async fn check_capacity(ctx: &ClusterContext, source_conn: &dyn DbSession) -> RepmgrResult<Vec<String>> {
    let cap = source_conn.replication_capacity().await?;
    let mut problems = Vec::new();
    if cap.free_wal_senders() < BASEBACKUP_WAL_SENDERS {
        problems.push(format!(
            "insufficient free WAL senders: {} required, {} available",
            BASEBACKUP_WAL_SENDERS,
            cap.free_wal_senders()
        ));
    }
    if ctx.config.replication.use_replication_slots && cap.free_replication_slots() < 1 {
        problems.push(format!(
            "no free replication slots ({} of {} in use)",
            cap.used_replication_slots, cap.max_replication_slots
        ));
    }
    Ok(problems)
}

pub async fn standby_clone(ctx: &ClusterContext, opts: &CloneOptions) -> RepmgrResult<String> {
    let data_dir = ctx.config.data_dir();
    if ctx.config.data_directory.is_empty() {
        return Err(RepmgrError::bad_config("\"data_directory\" is not configured"));
    }
    if !data_directory_is_empty(&data_dir)? {
        if !ctx.options.force {
            return Err(RepmgrError::bad_config(format!(
                "target data directory \"{}\" is not empty",
                data_dir.display()
            ))
            .with_hint("use -F/--force to overwrite an existing data directory"));
        }
        warn!("target data directory \"{}\" is not empty and will be overwritten", data_dir.display());
    }

    let source_conn = gateway::establish_db_connection(ctx.connector.as_ref(), &opts.source_conninfo).await?;
    let upstream = resolve_upstream(source_conn.as_ref(), opts).await?;

    let problems = check_capacity(ctx, source_conn.as_ref()).await?;
    if !problems.is_empty() {
        let mut err = RepmgrError::new(ErrorKind::BadBaseBackup, "source server cannot accept another standby");
        err.detail = Some(problems.join("; "));
        return Err(err);
    }

    let slot_name = ctx
        .config
        .replication
        .use_replication_slots
        .then(|| slot_name_for(ctx.config.node_id()));
    let cmd = basebackup_command(ctx, &opts.source_conninfo, slot_name.as_deref(), opts.fast_checkpoint);

    if ctx.options.dry_run {
        let mut out = String::from("all prerequisites for \"standby clone\" are met\n");
        out.push_str(&format!("would execute:\n  {}\n", cmd));
        return Ok(out);
    }

    let slot_created = match &slot_name {
        Some(name) => slots::create_replication_slot(source_conn.as_ref(), name).await?,
        None => false,
    };

    info!("starting backup (using pg_basebackup)");
    let backup = ctx.runner.run(&cmd).await.and_then(|o| o.into_result(&cmd));
    if let Err(e) = backup {
        if slot_created {
            if let Some(name) = &slot_name {
                if let Err(drop_err) = source_conn.drop_replication_slot(name).await {
                    warn!("unable to drop replication slot \"{}\": {}", name, drop_err);
                }
            }
        }
        return Err(RepmgrError::new(ErrorKind::BadBaseBackup, "unable to take a base backup of the source server")
            .with_detail(e.detail.unwrap_or(e.message)));
    }

    let primary_conninfo = match &upstream {
        Some(up) => recovery_conf::build_primary_conninfo(
            up,
            &ctx.config.node_name,
            &ctx.config.effective_replication_user(),
        )?,
        None => {
            let mut ci = ConnInfo::parse(&opts.source_conninfo)?;
            ci.remove("dbname");
            ci.set("application_name", &ctx.config.node_name);
            ci.render()
        }
    };
    recovery_conf::write_standby_config(
        &data_dir,
        &StandbyConfig {
            primary_conninfo,
            primary_slot_name: slot_name.clone(),
        },
    )?;

    let upstream_desc = upstream
        .as_ref()
        .map(|u| format!("node \"{}\" (ID: {})", u.node_name, u.node_id))
        .unwrap_or_else(|| "the source server".to_string());
    let details = format!("cloned from {}", upstream_desc);
    let ev = NewEvent::new(ctx.config.node_id(), names::STANDBY_CLONE, true, details);
    let extras = EventExtras {
        node_name: Some(ctx.config.node_name.clone()),
        peer_node_id: upstream.as_ref().map(|u| u.node_id),
        peer_conninfo: Some(opts.source_conninfo.clone()),
    };
    let writable = source_conn.recovery_type().await.ok() == Some(RecoveryType::Primary);
    let event_conn: Option<&dyn DbSession> = if writable { Some(source_conn.as_ref()) } else { None };
    events::create_event_notification(ctx, event_conn, ev, &extras).await;

    Ok(format!(
        "standby clone (from {}) complete\nstart the server and register it with \"repmgr standby register\"\n",
        upstream_desc
    ))
}

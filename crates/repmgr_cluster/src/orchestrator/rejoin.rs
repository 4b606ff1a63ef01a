//! `node rejoin`: bring a stopped former primary back as a standby.
//!
//! VERIFY_LOCAL_STOPPED -> READ_CONTROL -> RESOLVE_NEW_PRIMARY ->
//! PRE_ATTACH_CHECKS -> OPTIONAL_REWIND -> FOLLOW -> AWAIT_ATTACHED ->
//! CLEAN_SLOTS -> NOTIFY.
//!
//! The rewind overwrites the data directory in place. Everything from
//! archiving the configuration files to restoring them is one critical
//! section: once begun, the marker and archive restores always run.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use repmgr_common::types::{slot_name_for, NodeRecord};
use repmgr_common::{RepmgrError, RepmgrResult};
use tracing::{error, info, warn};

use super::follow::{attach_to_upstream, commit_follow, fill_missing_slot_name};
use crate::archive;
use crate::command::shell_quote;
use crate::context::ClusterContext;
use crate::control::{self, ControlFileInfo};
use crate::db::DbSession;
use crate::events::names;
use crate::gateway;
use crate::oracle::{self, Attachability, LocalPosition};
use crate::recovery_conf::{self, RECOVERY_DONE, STANDBY_SIGNAL};
use crate::service::ServiceAction;
use crate::slots;

/// Control-file version from which the rewind tool recovers an unclean
/// shutdown itself.
const REWIND_CRASH_RECOVERY_CONTROL_VERSION: u32 = 1300;

#[derive(Debug, Clone, Default)]
pub struct RejoinOptions {
    /// Conninfo of any node in the cluster; used to find the primary.
    pub source_conninfo: String,
    pub force_rewind: bool,
    /// Overrides `[rewind] config_files`.
    pub config_files: Option<Vec<String>>,
    /// Overrides `[rewind] config_archive_dir`.
    pub config_archive_dir: Option<PathBuf>,
}

/// The rewind invocation against `source_conninfo`.
pub fn rewind_command(ctx: &ClusterContext, source_conninfo: &str) -> String {
    let base = if ctx.config.rewind.command.trim().is_empty() {
        ctx.config.binaries.pg_binary("pg_rewind")
    } else {
        ctx.config.rewind.command.trim().to_string()
    };
    format!(
        "{} -D {} --source-server={}",
        base,
        shell_quote(&ctx.config.data_directory),
        shell_quote(source_conninfo)
    )
}

async fn verify_local_stopped(ctx: &ClusterContext) -> RepmgrResult<()> {
    let ping = ctx.connector.ping(&ctx.config.conninfo).await;
    let connectable = gateway::establish_db_connection_quiet(ctx.connector.as_ref(), &ctx.config.conninfo)
        .await
        .is_some();
    if ping.server_running() || connectable {
        return Err(RepmgrError::rejoin_fail("the local server is running")
            .with_hint("\"node rejoin\" requires the server to be stopped cleanly"));
    }
    Ok(())
}

fn check_control(ctx: &ClusterContext, opts: &RejoinOptions) -> RepmgrResult<ControlFileInfo> {
    let control = control::read_control_file(&ctx.config.data_dir()).map_err(|e| {
        RepmgrError::rejoin_fail("unable to read the control file").with_detail(e.message)
    })?;
    if control.state.is_clean_shutdown() {
        return Ok(control);
    }
    if opts.force_rewind && control.control_version >= REWIND_CRASH_RECOVERY_CONTROL_VERSION {
        warn!(
            "database was not shut down cleanly (state: {}); the rewind will perform crash recovery",
            control.state.description()
        );
        return Ok(control);
    }
    Err(RepmgrError::rejoin_fail(format!(
        "database is not shut down cleanly (state: {})",
        control.state.description()
    ))
    .with_hint("start and stop the server cleanly, or use --force-rewind"))
}

/// Returns whether the file existed.
fn remove_if_exists(path: &Path) -> RepmgrResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(RepmgrError::rejoin_fail(format!("unable to remove \"{}\"", path.display()))
            .with_detail(e.to_string())),
    }
}

/// Remove the per-slot directories copied from the source server.
fn purge_replication_slot_dirs(data_dir: &Path) -> RepmgrResult<usize> {
    let dir = data_dir.join("pg_replslot");
    let entries = match fs::read_dir(&dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(RepmgrError::from(e)),
    };
    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Steps (a) to (g) of the rewind. (b) and (d), (a) and (e) are paired:
/// once the first of a pair has run the second always runs.
async fn rewind_critical_section(
    ctx: &ClusterContext,
    opts: &RejoinOptions,
    primary: &NodeRecord,
) -> RepmgrResult<()> {
    let data_dir = ctx.config.data_dir();
    let root = opts
        .config_archive_dir
        .clone()
        .unwrap_or_else(|| ctx.config.config_archive_root());
    let archive_path = archive::archive_dir(&root, &ctx.config.node_name);
    let files = opts
        .config_files
        .clone()
        .unwrap_or_else(|| ctx.config.rewind.config_files.clone());

    // (a)
    archive::archive_config_files(&data_dir, &archive_path, &files)?;

    // (b)
    let signal = data_dir.join(STANDBY_SIGNAL);
    let had_signal = match remove_if_exists(&signal) {
        Ok(v) => v,
        Err(e) => {
            restore_archive(&data_dir, &archive_path);
            return Err(e);
        }
    };

    // (c)
    let cmd = rewind_command(ctx, &primary.conninfo);
    info!("executing rewind: {}", cmd);
    let rewind = ctx.runner.run(&cmd).await.and_then(|o| o.into_result(&cmd));

    // (d)
    let mut restore_errors = Vec::new();
    if had_signal {
        if let Err(e) = recovery_conf::write_standby_signal(&data_dir) {
            restore_errors.push(e.to_string());
        }
    }
    // (e)
    if let Err(e) = archive::restore_config_files(&data_dir, &archive_path) {
        restore_errors.push(e.to_string());
    }

    if let Err(e) = rewind {
        error!("rewind failed; the data directory may be in an inconsistent state");
        return Err(RepmgrError::rejoin_fail("unable to execute the rewind")
            .with_detail(e.detail.unwrap_or(e.message))
            .with_hint("the data directory may have been partially rewound; re-clone the standby if rejoin keeps failing"));
    }
    if !restore_errors.is_empty() {
        return Err(RepmgrError::rejoin_fail("rewind succeeded but restoring the configuration failed")
            .with_detail(restore_errors.join("; ")));
    }

    // (f)
    if remove_if_exists(&data_dir.join(RECOVERY_DONE))? {
        info!("removed \"{}\" copied by the rewind", RECOVERY_DONE);
    }
    // (g)
    let purged = purge_replication_slot_dirs(&data_dir)?;
    if purged > 0 {
        info!("{} replication slot directories removed", purged);
    }
    Ok(())
}

fn restore_archive(data_dir: &Path, archive_path: &Path) {
    if let Err(e) = archive::restore_config_files(data_dir, archive_path) {
        warn!("unable to restore archived configuration files: {}", e);
    }
}

/// Slots still owed to active nodes whose upstream is `local`.
pub fn downstream_slot_names(records: &[NodeRecord], local: &NodeRecord) -> BTreeSet<String> {
    records
        .iter()
        .filter(|r| r.active && r.upstream_node_id == Some(local.node_id))
        .map(|r| {
            if r.slot_name.is_empty() {
                slot_name_for(r.node_id)
            } else {
                r.slot_name.clone()
            }
        })
        .collect()
}

/// Drop inactive slots left on the rejoined node from its time as primary.
/// Slots belonging to its own downstream nodes are kept even when inactive.
async fn clean_stale_slots(
    ctx: &ClusterContext,
    primary_conn: &dyn DbSession,
    local: &NodeRecord,
) -> Vec<String> {
    let mut dropped = Vec::new();
    let keep = match gateway::read_all_node_records(primary_conn).await {
        Ok(records) => downstream_slot_names(&records, local),
        Err(e) => {
            warn!("unable to read node records, not dropping any slots: {}", e);
            return dropped;
        }
    };
    let Some(conn) = gateway::establish_db_connection_quiet(ctx.connector.as_ref(), &ctx.config.conninfo).await else {
        warn!("unable to connect to the local node to check for stale replication slots");
        return dropped;
    };
    match slots::get_inactive_replication_slots(conn.as_ref()).await {
        Ok(inactive) => {
            for s in inactive.into_iter().filter(|s| !keep.contains(&s.slot_name)) {
                match slots::drop_replication_slot_if_exists(conn.as_ref(), local.node_id, &s.slot_name).await {
                    Ok(true) => dropped.push(s.slot_name),
                    Ok(false) => {}
                    Err(e) => warn!("unable to drop slot \"{}\": {}", s.slot_name, e),
                }
            }
        }
        Err(e) => warn!("unable to list replication slots: {}", e),
    }
    dropped
}

pub async fn node_rejoin(ctx: &ClusterContext, opts: &RejoinOptions) -> RepmgrResult<String> {
    verify_local_stopped(ctx).await?;
    let control = check_control(ctx, opts)?;

    let source = gateway::establish_db_connection(ctx.connector.as_ref(), &opts.source_conninfo).await?;
    let (primary_conn, primary) = gateway::connect_to_primary(ctx, source.as_ref()).await?;
    drop(source);
    let mut local = gateway::read_node_record(primary_conn.as_ref(), ctx.config.node_id())
        .await?
        .ok_or_else(|| {
            RepmgrError::bad_config(format!(
                "no record found for the local node (ID: {}) on the primary",
                ctx.config.node_id()
            ))
        })?;
    fill_missing_slot_name(ctx, &mut local);

    let position = LocalPosition {
        system_identifier: control.system_identifier,
        timeline: control.timeline,
        lsn: control.checkpoint_lsn,
    };
    if position.system_identifier != primary_conn.system_identifier().await? {
        return Err(RepmgrError::rejoin_fail("the local node is not part of this replication cluster")
            .with_detail(format!(
                "local system identifier {} differs from the primary's",
                position.system_identifier
            )));
    }
    let verdict = oracle::check_node_can_attach(&position, primary_conn.as_ref(), &primary, true).await?;
    let needs_rewind = !verdict.is_attachable() || !control.state.is_clean_shutdown();
    if let Attachability::NotAttachable(reason) = &verdict {
        if !opts.force_rewind {
            return Err(RepmgrError::rejoin_fail(format!(
                "this node cannot attach to rejoin target node \"{}\" (ID: {})",
                primary.node_name, primary.node_id
            ))
            .with_detail(reason.clone())
            .with_hint("use --force-rewind to execute the rewind tool"));
        }
    }

    if ctx.options.dry_run {
        let mut out = format!(
            "prerequisites for rejoining node \"{}\" to \"{}\" are met\n",
            local.node_name, primary.node_name
        );
        if needs_rewind && opts.force_rewind {
            out.push_str(&format!("would execute:\n  {}\n", rewind_command(ctx, &primary.conninfo)));
        }
        return Ok(out);
    }

    if needs_rewind && opts.force_rewind {
        rewind_critical_section(ctx, opts, &primary).await?;
    }

    attach_to_upstream(ctx, &primary, primary_conn.as_ref(), &local, ServiceAction::Start).await?;

    let dropped = clean_stale_slots(ctx, primary_conn.as_ref(), &local).await;
    if !dropped.is_empty() {
        info!("dropped stale replication slots: {}", dropped.join(", "));
    }

    let details = format!(
        "node \"{}\" (ID: {}) is now attached to \"{}\" (ID: {}){}",
        local.node_name,
        local.node_id,
        primary.node_name,
        primary.node_id,
        if needs_rewind && opts.force_rewind { " after rewind" } else { "" }
    );
    commit_follow(ctx, primary_conn.as_ref(), &local, &primary, names::NODE_REJOIN, details.clone()).await?;
    Ok(format!("{}\n", details))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purge_replication_slot_dirs() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(purge_replication_slot_dirs(dir.path()).unwrap(), 0);
        let slots = dir.path().join("pg_replslot");
        fs::create_dir_all(slots.join("repmgr_slot_2")).unwrap();
        fs::create_dir_all(slots.join("repmgr_slot_3")).unwrap();
        assert_eq!(purge_replication_slot_dirs(dir.path()).unwrap(), 2);
        assert!(slots.is_dir());
        assert_eq!(fs::read_dir(&slots).unwrap().count(), 0);
    }

    #[test]
    fn test_downstream_slot_names() {
        use repmgr_common::types::{NodeId, NodeType};
        let local = NodeRecord::new(NodeId(1), "node1", NodeType::Standby, "host=node1");
        let mut cascaded = NodeRecord::new(NodeId(3), "node3", NodeType::Standby, "host=node3");
        cascaded.upstream_node_id = Some(NodeId(1));
        let mut custom = NodeRecord::new(NodeId(4), "node4", NodeType::Standby, "host=node4");
        custom.upstream_node_id = Some(NodeId(1));
        custom.slot_name = "node4_slot".to_string();
        let mut inactive = custom.clone();
        inactive.node_id = NodeId(5);
        inactive.slot_name = "gone".to_string();
        inactive.active = false;
        let mut elsewhere = NodeRecord::new(NodeId(2), "node2", NodeType::Standby, "host=node2");
        elsewhere.upstream_node_id = Some(NodeId(6));

        let keep = downstream_slot_names(&[local.clone(), cascaded, custom, inactive, elsewhere], &local);
        let keep: Vec<&str> = keep.iter().map(String::as_str).collect();
        assert_eq!(keep, vec!["node4_slot", "repmgr_slot_3"]);
    }

    #[test]
    fn test_remove_if_exists() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join(RECOVERY_DONE);
        assert!(!remove_if_exists(&f).unwrap());
        fs::write(&f, b"").unwrap();
        assert!(remove_if_exists(&f).unwrap());
    }
}

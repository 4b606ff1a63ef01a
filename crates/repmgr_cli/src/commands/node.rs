use repmgr_cluster::archive;
use repmgr_cluster::checks::{self, CheckKind, CheckResult, CheckStatus};
use repmgr_cluster::orchestrator::rejoin::{self, RejoinOptions};
use repmgr_cluster::service::{self, ServiceAction};
use repmgr_cluster::{oracle, status};
use repmgr_common::{ErrorKind, NodeId, NodeRecord, RepmgrError, RepmgrResult};

use super::{Invocation, Outcome};
use crate::args::{NodeCheckArgs, NodeCmd, NodeControlArgs, NodeServiceArgs, NodeStatusArgs, RejoinArgs};
use crate::format::OutputMode;

pub async fn run(inv: &Invocation<'_>, cmd: &NodeCmd) -> RepmgrResult<Outcome> {
    match cmd {
        NodeCmd::Status(args) => node_status(inv, args).await,
        NodeCmd::Check(args) => node_check(inv, args).await,
        NodeCmd::Rejoin(args) => node_rejoin(inv, args).await,
        NodeCmd::Service(args) => node_service(inv, args).await,
        NodeCmd::Control(args) => node_control(inv, args).await,
    }
}

async fn node_status(inv: &Invocation<'_>, args: &NodeStatusArgs) -> RepmgrResult<Outcome> {
    if args.is_shutdown_cleanly {
        let state = status::is_shutdown_cleanly(inv.ctx).await;
        return Ok(Outcome::text(format!("{}\n", state.render())));
    }
    let conn = inv.connect_local().await?;
    let record = node_record(inv, conn.as_ref(), inv.target_node()).await?;
    let report = status::collect_node_status(inv.ctx, conn.as_ref(), &record).await?;
    match inv.mode {
        OutputMode::Csv => Ok(Outcome {
            stdout: report.render_csv(),
            warnings: report.warnings,
            ..Default::default()
        }),
        _ => {
            // The text rendering lists the warnings itself.
            let exit_code = (!report.warnings.is_empty()).then(|| ErrorKind::NodeStatus.exit_code());
            Ok(Outcome {
                stdout: report.render_text(),
                exit_code,
                ..Default::default()
            })
        }
    }
}

async fn node_record(
    inv: &Invocation<'_>,
    conn: &dyn repmgr_cluster::DbSession,
    id: Option<NodeId>,
) -> RepmgrResult<NodeRecord> {
    let id = id.unwrap_or_else(|| inv.ctx.config.node_id());
    conn.get_node_record(id).await?.ok_or_else(|| {
        RepmgrError::bad_config(format!("no record found for node {}", id))
            .with_hint("check the node is registered")
    })
}

/// Checks named on the command line, in a fixed order.
pub fn requested_checks(args: &NodeCheckArgs) -> Vec<CheckKind> {
    let flags = [
        (args.role, CheckKind::Role),
        (args.replication_lag, CheckKind::ReplicationLag),
        (args.archive_ready, CheckKind::ArchiveReady),
        (args.downstream, CheckKind::Downstream),
        (args.upstream, CheckKind::Upstream),
        (args.slots, CheckKind::Slots),
        (args.missing_slots, CheckKind::MissingSlots),
        (args.data_directory_config, CheckKind::DataDirectoryConfig),
        (args.replication_connection, CheckKind::ReplicationConnection),
        (args.db_connection, CheckKind::DbConnection),
    ];
    flags.iter().filter(|(on, _)| *on).map(|(_, k)| *k).collect()
}

/// Render check results for `mode`, with the worst status as exit code.
pub fn render_checks(mode: OutputMode, node_name: &str, results: &[CheckResult], summary: bool) -> Outcome {
    let stdout = match mode {
        OutputMode::Nagios => results.iter().map(CheckResult::render_nagios).collect(),
        OutputMode::Optformat => results.iter().map(CheckResult::render_optformat).collect(),
        OutputMode::Csv => checks::render_csv(results),
        OutputMode::Text if summary => {
            let mut out = format!("Node \"{}\":\n", node_name);
            for r in results {
                out.push('\t');
                out.push_str(&r.render_text());
            }
            out
        }
        OutputMode::Text => results.iter().map(CheckResult::render_text).collect(),
    };
    let worst = results.iter().map(|r| r.status).max().unwrap_or(CheckStatus::Ok);
    Outcome {
        stdout,
        exit_code: Some(worst.nagios_code()),
        ..Default::default()
    }
}

async fn node_check(inv: &Invocation<'_>, args: &NodeCheckArgs) -> RepmgrResult<Outcome> {
    let ctx = inv.ctx;
    let requested = requested_checks(args);

    if requested == [CheckKind::DbConnection] {
        let ci = inv.cli_conninfo()?.unwrap_or_else(|| ctx.config.conninfo.clone());
        let result = checks::check_db_connection(ctx, &ci).await;
        return Ok(render_checks(inv.mode, &ctx.config.node_name, &[result], false));
    }

    let summary = requested.is_empty();
    let kinds: Vec<CheckKind> = if summary {
        CheckKind::DEFAULT_SET.to_vec()
    } else {
        requested
    };
    let conn = inv.connect_local().await?;
    let record = node_record(inv, conn.as_ref(), None).await?;
    let remote = args.remote_node_id.map(NodeId);
    let mut results = Vec::with_capacity(kinds.len());
    for kind in kinds {
        results.push(checks::run_check(ctx, conn.as_ref(), &record, kind, remote).await?);
    }
    Ok(render_checks(inv.mode, &record.node_name, &results, summary))
}

async fn node_rejoin(inv: &Invocation<'_>, args: &RejoinArgs) -> RepmgrResult<Outcome> {
    let opts = RejoinOptions {
        source_conninfo: inv.required_conninfo("\"node rejoin\"")?,
        force_rewind: args.force_rewind,
        config_files: args.config_files.as_deref().map(archive::parse_file_list),
        config_archive_dir: args.config_archive_dir.clone(),
    };
    Ok(Outcome::text(rejoin::node_rejoin(inv.ctx, &opts).await?))
}

async fn node_service(inv: &Invocation<'_>, args: &NodeServiceArgs) -> RepmgrResult<Outcome> {
    if args.list_actions {
        return Ok(Outcome::text(service::list_actions(&inv.ctx.config)));
    }
    let action = match &args.action {
        Some(a) => ServiceAction::parse(a)?,
        None => {
            return Err(RepmgrError::bad_config("\"node service\" requires --action or --list-actions"));
        }
    };
    Ok(Outcome::text(
        service::run_node_service(inv.ctx, action, args.checkpoint).await?,
    ))
}

async fn node_control(inv: &Invocation<'_>, args: &NodeControlArgs) -> RepmgrResult<Outcome> {
    let ctx = inv.ctx;
    if !args.disable_wal_receiver && !args.enable_wal_receiver {
        return Err(RepmgrError::bad_config(
            "\"node control\" requires --disable-wal-receiver or --enable-wal-receiver",
        ));
    }
    let conn = inv.connect_local().await?;
    if args.disable_wal_receiver {
        if ctx.options.dry_run {
            return Ok(Outcome::text("would disable the WAL receiver\n"));
        }
        oracle::disable_wal_receiver(conn.as_ref(), &ctx.interrupt).await?;
        return Ok(Outcome::text("WAL receiver disabled\n"));
    }
    if ctx.options.dry_run {
        return Ok(Outcome::text("would enable the WAL receiver\n"));
    }
    let out = match oracle::enable_wal_receiver(conn.as_ref(), true, &ctx.interrupt).await? {
        Some(pid) => format!("WAL receiver enabled (pid {})\n", pid),
        None => "WAL receiver enabled; it has not started yet\n".to_string(),
    };
    Ok(Outcome::text(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_checks_order() {
        let args = NodeCheckArgs {
            slots: true,
            role: true,
            ..Default::default()
        };
        assert_eq!(requested_checks(&args), vec![CheckKind::Role, CheckKind::Slots]);
        assert!(requested_checks(&NodeCheckArgs::default()).is_empty());
    }

    fn results() -> Vec<CheckResult> {
        vec![
            CheckResult::new(CheckKind::Role, CheckStatus::Ok, "node is primary"),
            CheckResult::new(CheckKind::ArchiveReady, CheckStatus::Warning, "20 pending archive ready files"),
        ]
    }

    #[test]
    fn test_render_checks_text_summary() {
        let out = render_checks(OutputMode::Text, "node1", &results(), true);
        assert!(out.stdout.starts_with("Node \"node1\":\n\tServer role: OK (node is primary)\n"));
        assert!(out.stdout.contains("\tWAL archiving: WARNING (20 pending archive ready files)\n"));
        assert_eq!(out.exit_code, Some(1));
    }

    #[test]
    fn test_render_checks_nagios_exit_code() {
        let mut r = results();
        r.push(CheckResult::new(CheckKind::Slots, CheckStatus::Critical, "1 inactive slot"));
        let out = render_checks(OutputMode::Nagios, "node1", &r, false);
        assert_eq!(out.stdout.lines().count(), 3);
        assert!(out.stdout.starts_with("SERVER_ROLE OK: node is primary\n"));
        assert_eq!(out.exit_code, Some(2));
    }

    #[test]
    fn test_render_checks_optformat() {
        let r = vec![CheckResult::new(CheckKind::Role, CheckStatus::Ok, "node is primary")];
        let out = render_checks(OutputMode::Optformat, "node1", &r, false);
        assert_eq!(out.stdout, "--status=OK\n");
        assert_eq!(out.exit_code, Some(0));
    }
}

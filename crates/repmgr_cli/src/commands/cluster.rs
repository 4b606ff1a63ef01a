use repmgr_cluster::crosscheck::{self, cell_glyph, Matrix, MatrixReport, ShowEntry};
use repmgr_cluster::daemon;
use repmgr_cluster::db::EventFilter;
use repmgr_common::types::EventRecord;
use repmgr_common::RepmgrResult;

use super::{Invocation, Outcome};
use crate::args::{CleanupArgs, ClusterCmd, EventArgs};
use crate::csv::csv_line;
use crate::format::{format_table, OutputMode};

pub async fn run(inv: &Invocation<'_>, cmd: &ClusterCmd) -> RepmgrResult<Outcome> {
    match cmd {
        ClusterCmd::Show => show(inv).await,
        ClusterCmd::Matrix => matrix(inv).await,
        ClusterCmd::Crosscheck => crosscheck(inv).await,
        ClusterCmd::Event(args) => event(inv, args).await,
        ClusterCmd::Cleanup(args) => cleanup(inv, args).await,
    }
}

/// `--csv --terse` is how peers invoke `show` and `matrix` over SSH: data
/// only, exit 0. Unreachable nodes are already encoded in the cells.
fn peer_invocation(inv: &Invocation<'_>) -> bool {
    inv.mode == OutputMode::Csv && inv.global.terse
}

async fn show(inv: &Invocation<'_>) -> RepmgrResult<Outcome> {
    let conn = inv.connect_local().await?;
    let report = crosscheck::cluster_show(inv.ctx, conn.as_ref()).await?;
    if peer_invocation(inv) {
        return Ok(Outcome::text(crosscheck::render_show_csv(&report.entries)));
    }
    let stdout = match inv.mode {
        OutputMode::Csv => crosscheck::render_show_csv(&report.entries),
        _ => render_show_table(&report.entries),
    };
    Ok(Outcome {
        stdout,
        warnings: report.warnings,
        ..Default::default()
    })
}

pub fn render_show_table(entries: &[ShowEntry]) -> String {
    let rows: Vec<Vec<String>> = entries
        .iter()
        .map(|e| {
            let r = &e.record;
            vec![
                r.node_id.to_string(),
                r.node_name.clone(),
                r.node_type.as_str().to_string(),
                e.status.clone(),
                r.upstream_node_name.clone().unwrap_or_default(),
                r.location.clone(),
                r.priority.to_string(),
                r.conninfo.clone(),
            ]
        })
        .collect();
    format_table(
        &["ID", "Name", "Role", "Status", "Upstream", "Location", "Priority", "Connection string"],
        &rows,
    )
}

/// Glyph grid: one row per observing node, one column per observed node.
pub fn render_matrix_table(matrix: &Matrix) -> String {
    let ids: Vec<String> = matrix.nodes.iter().map(|(id, _)| id.to_string()).collect();
    let mut headers: Vec<&str> = vec!["Name", "ID"];
    headers.extend(ids.iter().map(String::as_str));
    let rows: Vec<Vec<String>> = matrix
        .nodes
        .iter()
        .zip(matrix.rows())
        .map(|((id, name), cells)| {
            let mut row = vec![name.clone(), id.to_string()];
            row.extend(cells.iter().map(|v| cell_glyph(*v).to_string()));
            row
        })
        .collect();
    format_table(&headers, &rows)
}

fn matrix_outcome(inv: &Invocation<'_>, report: MatrixReport) -> Outcome {
    let stdout = match inv.mode {
        OutputMode::Csv => report.matrix.to_csv(),
        _ => render_matrix_table(&report.matrix),
    };
    Outcome {
        stdout,
        exit_error: report.exit_error(),
        warnings: report.warnings,
        ..Default::default()
    }
}

fn observer(inv: &Invocation<'_>) -> repmgr_common::NodeId {
    inv.target_node().unwrap_or_else(|| inv.ctx.config.node_id())
}

async fn matrix(inv: &Invocation<'_>) -> RepmgrResult<Outcome> {
    let conn = inv.connect_local().await?;
    let report = crosscheck::build_matrix(inv.ctx, conn.as_ref(), observer(inv)).await?;
    if peer_invocation(inv) {
        return Ok(Outcome::text(report.matrix.to_csv()));
    }
    Ok(matrix_outcome(inv, report))
}

async fn crosscheck(inv: &Invocation<'_>) -> RepmgrResult<Outcome> {
    let conn = inv.connect_local().await?;
    let cube = crosscheck::build_cube(inv.ctx, conn.as_ref(), observer(inv)).await?;
    Ok(matrix_outcome(inv, cube.aggregated))
}

pub fn render_events(events: &[EventRecord], mode: OutputMode, compact: bool) -> String {
    let fields = |e: &EventRecord| {
        let mut f = vec![
            e.node_id.to_string(),
            e.node_name.clone(),
            e.event.clone(),
            if e.successful { "t" } else { "f" }.to_string(),
            e.timestamp.clone(),
        ];
        if !compact {
            f.push(e.details.clone());
        }
        f
    };
    match mode {
        OutputMode::Csv => events.iter().map(|e| csv_line(&fields(e))).collect(),
        _ => {
            let mut headers = vec!["Node ID", "Name", "Event", "OK", "Timestamp"];
            if !compact {
                headers.push("Details");
            }
            let rows: Vec<Vec<String>> = events.iter().map(fields).collect();
            format_table(&headers, &rows)
        }
    }
}

async fn event(inv: &Invocation<'_>, args: &EventArgs) -> RepmgrResult<Outcome> {
    let conn = inv.connect_local().await?;
    let filter = EventFilter {
        node_id: inv.target_node(),
        node_name: inv.global.node_name.clone(),
        event: args.event.clone(),
        limit: if args.all { None } else { Some(args.limit) },
    };
    let events = daemon::cluster_event(conn.as_ref(), &filter).await?;
    Ok(Outcome::text(render_events(&events, inv.mode, args.compact)))
}

async fn cleanup(inv: &Invocation<'_>, args: &CleanupArgs) -> RepmgrResult<Outcome> {
    let conn = inv.connect_local().await?;
    let primary_conn = inv.writable(conn).await?;
    let keep = args
        .keep_history
        .unwrap_or(inv.ctx.config.events.keep_history_days);
    Ok(Outcome::text(
        daemon::cluster_cleanup(inv.ctx, primary_conn.as_ref(), keep).await?,
    ))
}

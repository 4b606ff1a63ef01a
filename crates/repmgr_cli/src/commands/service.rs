use repmgr_cluster::daemon::{self, DaemonStatus};
use repmgr_common::RepmgrResult;

use super::{Invocation, Outcome};
use crate::args::ServiceCmd;
use crate::csv::csv_line;
use crate::format::{format_table, OutputMode};

pub async fn run(inv: &Invocation<'_>, cmd: &ServiceCmd) -> RepmgrResult<Outcome> {
    let conn = inv.connect_local().await?;
    match cmd {
        ServiceCmd::Status => {
            let (rows, warnings) = daemon::service_status(inv.ctx, conn.as_ref()).await?;
            Ok(Outcome {
                stdout: render_status(&rows, inv.mode),
                warnings,
                ..Default::default()
            })
        }
        ServiceCmd::Pause => Ok(Outcome::text(daemon::service_pause(inv.ctx, conn.as_ref(), true).await?)),
        ServiceCmd::Unpause => Ok(Outcome::text(daemon::service_pause(inv.ctx, conn.as_ref(), false).await?)),
    }
}

pub fn render_status(rows: &[DaemonStatus], mode: OutputMode) -> String {
    let fields = |d: &DaemonStatus| {
        vec![
            d.record.node_id.to_string(),
            d.record.node_name.clone(),
            d.record.node_type.as_str().to_string(),
            d.status_text().to_string(),
            match d.paused {
                Some(true) => "yes",
                Some(false) => "no",
                None => "n/a",
            }
            .to_string(),
            d.daemon_pid.map_or("n/a".to_string(), |p| p.to_string()),
        ]
    };
    match mode {
        OutputMode::Csv => rows.iter().map(|d| csv_line(&fields(d))).collect(),
        _ => {
            let table: Vec<Vec<String>> = rows.iter().map(fields).collect();
            format_table(&["ID", "Name", "Role", "repmgrd", "Paused?", "PID"], &table)
        }
    }
}

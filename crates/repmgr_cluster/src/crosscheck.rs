//! Cluster connectivity: `cluster show`, `cluster matrix`, `cluster crosscheck`.
//!
//! `show` is one node's view of every node's database. `matrix` adds each
//! peer's view by running `cluster show --csv` on it over SSH, giving an
//! N×N grid. `crosscheck` runs `cluster matrix --csv` on every node and folds
//! the resulting N×N×N cube with `max` per cell: one observer seeing a link
//! up makes it up, otherwise a reported failure beats "unknown".

use repmgr_common::conninfo;
use repmgr_common::types::{NodeId, NodeRecord, NodeType, RecoveryType};
use repmgr_common::{RepmgrError, RepmgrResult};
use tracing::{debug, warn};

use crate::context::ClusterContext;
use crate::db::DbSession;
use crate::gateway;

pub const CELL_UP: i32 = 0;
pub const CELL_DOWN: i32 = -1;
pub const CELL_UNKNOWN: i32 = -2;

/// Glyph printed for a matrix cell.
pub fn cell_glyph(v: i32) -> char {
    match v {
        CELL_UP => '*',
        CELL_DOWN => 'x',
        _ => '?',
    }
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

/// One node as seen from the invoking node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShowEntry {
    pub record: NodeRecord,
    /// `0` reachable, `-1` not.
    pub connection_status: i32,
    pub recovery_type: RecoveryType,
    /// Status column for text output, e.g. `* running`.
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShowReport {
    pub entries: Vec<ShowEntry>,
    pub warnings: Vec<String>,
}

/// Status column and optional warning for one node.
pub fn describe_node_status(
    record: &NodeRecord,
    reachable: bool,
    recovery_type: RecoveryType,
) -> (String, Option<String>) {
    let name = &record.node_name;
    match (record.node_type, reachable) {
        (NodeType::Primary, true) => match (recovery_type, record.active) {
            (RecoveryType::Primary, true) => ("* running".to_string(), None),
            (RecoveryType::Primary, false) => (
                "! running".to_string(),
                Some(format!("node \"{}\" is running but the record is inactive", name)),
            ),
            (RecoveryType::Standby, _) => (
                "! running as standby".to_string(),
                Some(format!("node \"{}\" is registered as primary but running as standby", name)),
            ),
            (RecoveryType::Unknown, _) => (
                "? unknown".to_string(),
                Some(format!("unable to determine the recovery state of node \"{}\"", name)),
            ),
        },
        (NodeType::Standby, true) => match (recovery_type, record.active) {
            (RecoveryType::Standby, true) => ("  running".to_string(), None),
            (RecoveryType::Standby, false) => (
                "! running".to_string(),
                Some(format!("node \"{}\" is running but the record is inactive", name)),
            ),
            (RecoveryType::Primary, _) => (
                "! running as primary".to_string(),
                Some(format!("node \"{}\" is registered as standby but running as primary", name)),
            ),
            (RecoveryType::Unknown, _) => (
                "? unknown".to_string(),
                Some(format!("unable to determine the recovery state of node \"{}\"", name)),
            ),
        },
        (_, true) => {
            if record.active {
                ("* running".to_string(), None)
            } else {
                (
                    "! running".to_string(),
                    Some(format!("node \"{}\" is running but the record is inactive", name)),
                )
            }
        }
        (_, false) => {
            if record.active {
                (
                    "? unreachable".to_string(),
                    Some(format!("unable to connect to node \"{}\" (ID: {})", name, record.node_id)),
                )
            } else {
                ("- failed".to_string(), None)
            }
        }
    }
}

/// Connect briefly to every registered node and classify it.
pub async fn cluster_show(ctx: &ClusterContext, conn: &dyn DbSession) -> RepmgrResult<ShowReport> {
    let records = conn.get_all_node_records_with_upstream().await?;
    let mut report = ShowReport::default();
    for record in records {
        let (reachable, recovery_type) =
            match gateway::establish_db_connection_quiet(ctx.connector.as_ref(), &record.conninfo).await {
                Some(node_conn) => {
                    let rt = node_conn.recovery_type().await.unwrap_or(RecoveryType::Unknown);
                    (true, rt)
                }
                None => (false, RecoveryType::Unknown),
            };
        let (status, warning) = describe_node_status(&record, reachable, recovery_type);
        if let Some(w) = warning {
            report.warnings.push(w);
        }
        report.entries.push(ShowEntry {
            record,
            connection_status: if reachable { CELL_UP } else { CELL_DOWN },
            recovery_type,
            status,
        });
    }
    Ok(report)
}

/// `id,connection_status,recovery_type` per node.
pub fn render_show_csv(entries: &[ShowEntry]) -> String {
    entries
        .iter()
        .map(|e| {
            format!(
                "{},{},{}\n",
                e.record.node_id,
                e.connection_status,
                e.recovery_type.csv_code()
            )
        })
        .collect()
}

fn parse_int_fields(line: &str, n: usize) -> Option<Vec<i32>> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != n {
        return None;
    }
    fields.iter().map(|f| f.parse::<i32>().ok()).collect()
}

/// One parsed `cluster show --csv` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShowCsvRow {
    pub node_id: NodeId,
    pub connection_status: i32,
    pub recovery_type: RecoveryType,
}

/// Strict parse; malformed lines are skipped and reported.
pub fn parse_show_csv(text: &str) -> (Vec<ShowCsvRow>, Vec<String>) {
    let mut rows = Vec::new();
    let mut bad = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match parse_int_fields(line, 3) {
            Some(v) if (v[1] == CELL_UP || v[1] == CELL_DOWN) && (-1..=1).contains(&v[2]) => {
                rows.push(ShowCsvRow {
                    node_id: NodeId(v[0]),
                    connection_status: v[1],
                    recovery_type: RecoveryType::from_csv_code(v[2]),
                })
            }
            _ => bad.push(line.to_string()),
        }
    }
    (rows, bad)
}

// ---------------------------------------------------------------------------
// matrix
// ---------------------------------------------------------------------------

/// N×N reachability grid over registered nodes, in node-id order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    pub nodes: Vec<(NodeId, String)>,
    cells: Vec<Vec<i32>>,
}

impl Matrix {
    pub fn new(nodes: Vec<(NodeId, String)>) -> Self {
        let n = nodes.len();
        Self {
            nodes,
            cells: vec![vec![CELL_UNKNOWN; n]; n],
        }
    }

    pub fn from_records(records: &[NodeRecord]) -> Self {
        Self::new(
            records
                .iter()
                .map(|r| (r.node_id, r.node_name.clone()))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|(n, _)| *n == id)
    }

    pub fn get(&self, row: NodeId, col: NodeId) -> Option<i32> {
        Some(self.cells[self.index_of(row)?][self.index_of(col)?])
    }

    /// Returns `false` when either id is not part of the matrix.
    pub fn set(&mut self, row: NodeId, col: NodeId, value: i32) -> bool {
        match (self.index_of(row), self.index_of(col)) {
            (Some(r), Some(c)) => {
                self.cells[r][c] = value;
                true
            }
            _ => false,
        }
    }

    pub fn rows(&self) -> &[Vec<i32>] {
        &self.cells
    }

    pub fn contains(&self, value: i32) -> bool {
        self.cells.iter().any(|r| r.contains(&value))
    }

    /// `i,j,status` triples in row-major order.
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        for (r, (rid, _)) in self.nodes.iter().enumerate() {
            for (c, (cid, _)) in self.nodes.iter().enumerate() {
                out.push_str(&format!("{},{},{}\n", rid, cid, self.cells[r][c]));
            }
        }
        out
    }

    /// Strict parse of `i,j,status` triples into a matrix shaped like
    /// `self`. Unparseable lines, unknown ids and out-of-range values leave
    /// their cell at -2 and are reported.
    pub fn parse_csv_like(&self, text: &str) -> (Matrix, Vec<String>) {
        let mut m = Matrix::new(self.nodes.clone());
        let mut bad = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match parse_int_fields(line, 3) {
                Some(v) if (CELL_UNKNOWN..=CELL_UP).contains(&v[2]) => {
                    if !m.set(NodeId(v[0]), NodeId(v[1]), v[2]) {
                        bad.push(line.to_string());
                    }
                }
                _ => bad.push(line.to_string()),
            }
        }
        (m, bad)
    }

    /// Cell-wise maximum over a cube of equally shaped matrices.
    pub fn fold_max(template: &Matrix, cube: &[Matrix]) -> Matrix {
        let mut out = Matrix::new(template.nodes.clone());
        for m in cube {
            for (r, row) in m.cells.iter().enumerate() {
                for (c, v) in row.iter().enumerate() {
                    if r < out.len() && c < out.len() && *v > out.cells[r][c] {
                        out.cells[r][c] = *v;
                    }
                }
            }
        }
        out
    }
}

/// Matrix plus the problems met while building it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixReport {
    pub matrix: Matrix,
    pub warnings: Vec<String>,
    pub ssh_failed: bool,
}

impl MatrixReport {
    /// Error the CLI exits with after printing: SSH failures first, then
    /// unreachable nodes.
    pub fn exit_error(&self) -> Option<RepmgrError> {
        if self.ssh_failed {
            return Some(RepmgrError::ssh("one or more nodes could not be reached via SSH"));
        }
        if self.matrix.contains(CELL_DOWN) {
            return Some(RepmgrError::node_status("one or more nodes are unreachable"));
        }
        None
    }
}

async fn run_on_peer(
    ctx: &ClusterContext,
    record: &NodeRecord,
    args: &str,
) -> RepmgrResult<Option<String>> {
    let host = conninfo::host_of(&record.conninfo)?;
    let cmd = ctx
        .remote_repmgr()
        .with_log_level("error")
        .command(Some(&record.conninfo), args);
    let out = ctx.remote.run(&host, ctx.remote_user(), &cmd).await;
    if !out.success || out.is_empty() {
        warn!(
            "node \"{}\" (ID: {}) inaccessible via SSH",
            record.node_name, record.node_id
        );
        return Ok(None);
    }
    Ok(Some(out.output))
}

/// Build the invoking node's N×N view.
pub async fn build_matrix(
    ctx: &ClusterContext,
    conn: &dyn DbSession,
    local_node_id: NodeId,
) -> RepmgrResult<MatrixReport> {
    let records = gateway::read_all_node_records(conn).await?;
    let mut matrix = Matrix::from_records(&records);
    let mut warnings = Vec::new();
    let mut ssh_failed = false;

    for record in &records {
        let up = gateway::establish_db_connection_quiet(ctx.connector.as_ref(), &record.conninfo)
            .await
            .is_some();
        matrix.set(local_node_id, record.node_id, if up { CELL_UP } else { CELL_DOWN });
    }

    for record in records.iter().filter(|r| r.node_id != local_node_id) {
        let output = match run_on_peer(ctx, record, "cluster show --csv --terse").await? {
            Some(o) => o,
            None => {
                ssh_failed = true;
                warnings.push(format!(
                    "node \"{}\" (ID: {}) inaccessible via SSH",
                    record.node_name, record.node_id
                ));
                continue;
            }
        };
        let (rows, bad) = parse_show_csv(&output);
        for line in bad {
            warnings.push(format!(
                "unexpected output from node \"{}\": \"{}\"",
                record.node_name, line
            ));
        }
        for row in rows {
            if !matrix.set(record.node_id, row.node_id, row.connection_status) {
                debug!("node {} reported unknown node {}", record.node_id, row.node_id);
            }
        }
    }

    Ok(MatrixReport {
        matrix,
        warnings,
        ssh_failed,
    })
}

// ---------------------------------------------------------------------------
// crosscheck
// ---------------------------------------------------------------------------

/// Cube of per-executor matrices and their fold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CubeReport {
    /// `cube[k]` is the matrix observed from the k-th node in id order.
    pub cube: Vec<Matrix>,
    pub aggregated: MatrixReport,
}

/// Run `cluster matrix` on every node and fold the results.
pub async fn build_cube(
    ctx: &ClusterContext,
    conn: &dyn DbSession,
    local_node_id: NodeId,
) -> RepmgrResult<CubeReport> {
    let records = gateway::read_all_node_records(conn).await?;
    let template = Matrix::from_records(&records);
    let mut cube = Vec::with_capacity(records.len());
    let mut warnings = Vec::new();
    let mut ssh_failed = false;

    for record in &records {
        if record.node_id == local_node_id {
            let local = build_matrix(ctx, conn, local_node_id).await?;
            warnings.extend(local.warnings);
            ssh_failed |= local.ssh_failed;
            cube.push(local.matrix);
            continue;
        }
        let args = format!("--node-id={} cluster matrix --csv --terse", record.node_id);
        match run_on_peer(ctx, record, &args).await? {
            Some(output) => {
                let (m, bad) = template.parse_csv_like(&output);
                for line in bad {
                    warnings.push(format!(
                        "unexpected output from node \"{}\": \"{}\"",
                        record.node_name, line
                    ));
                }
                cube.push(m);
            }
            None => {
                ssh_failed = true;
                warnings.push(format!(
                    "node \"{}\" (ID: {}) inaccessible via SSH",
                    record.node_name, record.node_id
                ));
                cube.push(Matrix::new(template.nodes.clone()));
            }
        }
    }

    let matrix = Matrix::fold_max(&template, &cube);
    Ok(CubeReport {
        cube,
        aggregated: MatrixReport {
            matrix,
            warnings,
            ssh_failed,
        },
    })
}

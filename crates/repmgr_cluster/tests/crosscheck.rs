mod common;

use common::*;
use repmgr_cluster::crosscheck::{
    build_cube, build_matrix, cluster_show, render_show_csv, CELL_DOWN, CELL_UNKNOWN, CELL_UP,
};

fn row(matrix: &repmgr_cluster::crosscheck::Matrix, id: i32) -> Vec<i32> {
    matrix.rows()[matrix.index_of(NodeId(id)).unwrap()].clone()
}

#[tokio::test(start_paused = true)]
async fn test_crosscheck_healthy_cluster() {
    let cluster = MockCluster::new(3);
    let ctx = cluster.ctx("node1");
    let conn = cluster.connect("node1").await;

    let cube = build_cube(&ctx, conn.as_ref(), NodeId(1)).await.unwrap();
    assert_eq!(cube.cube.len(), 3);
    let m = &cube.aggregated.matrix;
    assert_eq!(m.len(), 3);
    for id in 1..=3 {
        assert_eq!(row(m, id), vec![CELL_UP; 3]);
    }
    assert!(cube.aggregated.exit_error().is_none());
    assert!(cube.aggregated.warnings.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_matrix_with_node_powered_off() {
    let cluster = MockCluster::new(3);
    cluster.power_off("node3");
    let ctx = cluster.ctx("node1");
    let conn = cluster.connect("node1").await;

    let report = build_matrix(&ctx, conn.as_ref(), NodeId(1)).await.unwrap();
    assert_eq!(row(&report.matrix, 1), vec![CELL_UP, CELL_UP, CELL_DOWN]);
    assert_eq!(row(&report.matrix, 2), vec![CELL_UP, CELL_UP, CELL_DOWN]);
    assert_eq!(row(&report.matrix, 3), vec![CELL_UNKNOWN; 3]);
    assert!(report.ssh_failed);
    assert_eq!(report.exit_error().unwrap().kind, ErrorKind::Ssh);
}

#[tokio::test(start_paused = true)]
async fn test_crosscheck_with_node_powered_off() {
    let cluster = MockCluster::new(3);
    cluster.power_off("node3");
    let ctx = cluster.ctx("node1");
    let conn = cluster.connect("node1").await;

    let first = build_cube(&ctx, conn.as_ref(), NodeId(1)).await.unwrap();
    let m = &first.aggregated.matrix;
    assert_eq!(row(m, 1), vec![CELL_UP, CELL_UP, CELL_DOWN]);
    assert_eq!(row(m, 2), vec![CELL_UP, CELL_UP, CELL_DOWN]);
    assert_eq!(row(m, 3), vec![CELL_UNKNOWN; 3]);
    assert_eq!(first.aggregated.exit_error().unwrap().kind, ErrorKind::Ssh);

    let second = build_cube(&ctx, conn.as_ref(), NodeId(1)).await.unwrap();
    assert_eq!(second.aggregated.matrix, first.aggregated.matrix);
}

#[tokio::test(start_paused = true)]
async fn test_crosscheck_from_standby() {
    let cluster = MockCluster::new(3);
    cluster.stop("node3");
    let ctx = cluster.ctx("node2");
    let conn = cluster.connect("node2").await;

    let cube = build_cube(&ctx, conn.as_ref(), NodeId(2)).await.unwrap();
    let m = &cube.aggregated.matrix;
    assert_eq!(row(m, 1), vec![CELL_UP, CELL_UP, CELL_DOWN]);
    assert_eq!(row(m, 2), vec![CELL_UP, CELL_UP, CELL_DOWN]);
    // With its database down node3 cannot report its own view.
    assert_eq!(row(m, 3), vec![CELL_UNKNOWN; 3]);
    assert_eq!(cube.aggregated.exit_error().unwrap().kind, ErrorKind::Ssh);
}

#[tokio::test(start_paused = true)]
async fn test_show_csv_with_stopped_standby() {
    let cluster = MockCluster::new(2);
    cluster.stop("node2");
    let ctx = cluster.ctx("node1");
    let conn = cluster.connect("node1").await;

    let report = cluster_show(&ctx, conn.as_ref()).await.unwrap();
    assert_eq!(render_show_csv(&report.entries), "1,0,0\n2,-1,-1\n");
    assert_eq!(report.entries[1].status, "? unreachable");
    assert_eq!(report.warnings.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_single_node_matrix() {
    let cluster = MockCluster::new(1);
    let ctx = cluster.ctx("node1");
    let conn = cluster.connect("node1").await;

    let report = build_matrix(&ctx, conn.as_ref(), NodeId(1)).await.unwrap();
    assert_eq!(report.matrix.to_csv(), "1,1,0\n");
    assert!(report.exit_error().is_none());
    let (parsed, bad) = report.matrix.parse_csv_like(&report.matrix.to_csv());
    assert!(bad.is_empty());
    assert_eq!(parsed, report.matrix);
}

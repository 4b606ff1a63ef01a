mod common;

use common::*;
use repmgr_cluster::gateway::{connect_to_primary, read_all_node_records, superuser_connection};
use repmgr_common::conninfo::ConnInfo;

#[tokio::test]
async fn test_superuser_substitution_rewrites_user() {
    let cluster = MockCluster::new(2);
    let mut ctx = cluster.ctx("node2");
    ctx.options.superuser = Some("postgres".to_string());
    let conn = cluster.connect("node2").await;

    let su = superuser_connection(&ctx, conn.as_ref()).await.unwrap().unwrap();
    let ci = ConnInfo::parse(su.conninfo()).unwrap();
    assert_eq!(ci.get("user"), Some("postgres"));
    assert_eq!(ci.get("host"), Some("node2"));
}

#[tokio::test]
async fn test_superuser_connection_reuses_conninfo() {
    let cluster = MockCluster::new(2);
    let ctx = cluster.ctx("node2");
    let conn = cluster.connect("node2").await;

    let su = superuser_connection(&ctx, conn.as_ref()).await.unwrap().unwrap();
    assert_eq!(su.conninfo(), conn.conninfo());
}

#[tokio::test]
async fn test_connect_to_primary_from_standby() {
    let cluster = MockCluster::new(3);
    let ctx = cluster.ctx("node3");
    let conn = cluster.connect("node3").await;

    let (_, record) = connect_to_primary(&ctx, conn.as_ref()).await.unwrap();
    assert_eq!(record.node_name, "node1");
}

#[tokio::test(start_paused = true)]
async fn test_record_read_retried_after_serialization_failure() {
    let cluster = MockCluster::new(3);
    cluster.update_server("node1", |s| s.transient_read_failures = 1);
    let conn = cluster.connect("node1").await;

    let records = read_all_node_records(conn.as_ref()).await.unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(cluster.server("node1").transient_read_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_record_read_gives_up_after_three_attempts() {
    let cluster = MockCluster::new(2);
    cluster.update_server("node1", |s| s.transient_read_failures = 5);
    let conn = cluster.connect("node1").await;

    let err = read_all_node_records(conn.as_ref()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::DbQuery);
    assert!(err.transient);
    assert_eq!(cluster.server("node1").transient_read_failures, 2);
}

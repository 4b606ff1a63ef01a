mod common;

use common::*;
use repmgr_cluster::orchestrator::follow::{standby_follow, FollowOptions};
use repmgr_cluster::orchestrator::promote::{standby_promote, PromoteOptions};

async fn fail_over_to_node2(cluster: &MockCluster) {
    cluster.stop("node1");
    let ctx = cluster.ctx("node2");
    let conn = cluster.connect("node2").await;
    standby_promote(&ctx, conn.as_ref(), &PromoteOptions::default())
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_follow_new_primary() {
    let cluster = MockCluster::new(3);
    fail_over_to_node2(&cluster).await;

    let ctx = cluster.ctx("node3");
    let conn = cluster.connect("node3").await;
    let out = standby_follow(&ctx, conn.as_ref(), &FollowOptions::default())
        .await
        .unwrap();
    assert!(out.contains("now attached"));

    assert!(cluster.is_attached("node2", "node3"));
    let rec = cluster.record(3);
    assert_eq!(rec.upstream_node_id, Some(NodeId(2)));
    assert!(rec.active);
    let slot = slot_name_for(NodeId(3));
    assert_eq!(
        cluster.server("node2").slots.iter().filter(|s| **s == slot).count(),
        1
    );
    assert_eq!(cluster.event_names().last().map(String::as_str), Some("standby_follow"));
}

#[tokio::test(start_paused = true)]
async fn test_follow_is_noop_when_already_attached() {
    let cluster = MockCluster::new(3);
    let ctx = cluster.ctx("node3");
    let conn = cluster.connect("node3").await;

    let out = standby_follow(&ctx, conn.as_ref(), &FollowOptions::default())
        .await
        .unwrap();
    assert!(out.contains("nothing to do"));
    assert!(cluster.events().is_empty());
    assert!(cluster.commands_on("node3").is_empty());
    assert!(cluster.is_attached("node1", "node3"));
}

#[tokio::test(start_paused = true)]
async fn test_follow_attach_timeout_reports_rejoin_fail() {
    let cluster = MockCluster::new(3);
    fail_over_to_node2(&cluster).await;
    cluster.update_server("node3", |s| s.attach_blocked = true);

    let ctx = cluster.ctx("node3");
    let conn = cluster.connect("node3").await;
    let err = standby_follow(&ctx, conn.as_ref(), &FollowOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::RejoinFail);
    assert!(err.detail.unwrap_or_default().contains("attachment was not confirmed"));
    // Configuration changed, records untouched.
    assert_eq!(cluster.record(3).upstream_node_id, Some(NodeId(1)));
    assert_eq!(cluster.event_names(), vec!["standby_promote"]);
}

#[tokio::test(start_paused = true)]
async fn test_follow_refuses_standby_target() {
    let cluster = MockCluster::new(3);
    let ctx = cluster.ctx("node2");
    let conn = cluster.connect("node2").await;

    let opts = FollowOptions {
        upstream_node_id: Some(NodeId(3)),
    };
    let err = standby_follow(&ctx, conn.as_ref(), &opts).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::FollowFail);
}

#[tokio::test(start_paused = true)]
async fn test_follow_refuses_diverged_standby() {
    let cluster = MockCluster::new(3);
    fail_over_to_node2(&cluster).await;
    // node3 claims WAL beyond the point where node2 forked off timeline 1.
    cluster.update_server("node3", |s| {
        s.lsn = Lsn(s.lsn.0 + 0x1000);
        s.replay_lsn = s.lsn;
    });

    let ctx = cluster.ctx("node3");
    let conn = cluster.connect("node3").await;
    let err = standby_follow(&ctx, conn.as_ref(), &FollowOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::FollowFail);
    assert!(err.detail.is_some());
    assert_eq!(cluster.record(3).upstream_node_id, Some(NodeId(1)));
}

#[tokio::test(start_paused = true)]
async fn test_follow_stores_derived_slot_name() {
    let cluster = MockCluster::new(3);
    cluster.update_record(3, |r| r.slot_name.clear());
    fail_over_to_node2(&cluster).await;

    let warnings = WarningCapture::default();
    let _guard = warnings.install();
    let ctx = cluster.ctx("node3");
    let conn = cluster.connect("node3").await;
    standby_follow(&ctx, conn.as_ref(), &FollowOptions::default())
        .await
        .unwrap();

    assert!(warnings.contains("has no slot name recorded"));
    let slot = slot_name_for(NodeId(3));
    assert_eq!(cluster.record(3).slot_name, slot);
    assert!(cluster.server("node2").slots.contains(&slot));
    assert!(cluster.is_attached("node2", "node3"));
}

#[tokio::test(start_paused = true)]
async fn test_follow_with_recorded_slot_name_does_not_warn() {
    let cluster = MockCluster::new(3);
    fail_over_to_node2(&cluster).await;

    let warnings = WarningCapture::default();
    let _guard = warnings.install();
    let ctx = cluster.ctx("node3");
    let conn = cluster.connect("node3").await;
    standby_follow(&ctx, conn.as_ref(), &FollowOptions::default())
        .await
        .unwrap();

    assert!(!warnings.contains("has no slot name recorded"));
    assert_eq!(cluster.record(3).slot_name, slot_name_for(NodeId(3)));
}

#[tokio::test(start_paused = true)]
async fn test_follow_survives_transient_read_failure_on_new_primary() {
    let cluster = MockCluster::new(3);
    fail_over_to_node2(&cluster).await;
    cluster.update_server("node2", |s| s.transient_read_failures = 1);

    let ctx = cluster.ctx("node3");
    let conn = cluster.connect("node3").await;
    standby_follow(&ctx, conn.as_ref(), &FollowOptions::default())
        .await
        .unwrap();
    assert!(cluster.is_attached("node2", "node3"));
    assert_eq!(cluster.record(3).upstream_node_id, Some(NodeId(2)));
}

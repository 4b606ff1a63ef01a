mod common;

use common::*;
use repmgr_cluster::orchestrator::switchover::{standby_switchover, SwitchoverOptions};

async fn switchover(cluster: &MockCluster, host: &str, opts: &SwitchoverOptions) -> RepmgrResult<String> {
    let ctx = cluster.ctx(host);
    let conn = cluster.connect(host).await;
    standby_switchover(&ctx, conn.as_ref(), opts).await
}

fn no_daemon_paused(cluster: &MockCluster, hosts: &[&str]) -> bool {
    hosts.iter().all(|h| !cluster.server(h).daemon_paused)
}

#[tokio::test(start_paused = true)]
async fn test_switchover_swaps_roles() {
    let cluster = MockCluster::new(2);

    let out = switchover(&cluster, "node2", &SwitchoverOptions::default()).await.unwrap();
    assert!(out.contains("promoted to primary"));
    assert!(out.contains("is now a standby"));
    assert!(!out.contains("WARNING"));

    assert_eq!(
        cluster.event_names(),
        vec!["standby_promote", "repmgrd_pause", "standby_switchover", "node_rejoin"]
    );

    let new_primary = cluster.record(2);
    assert!(new_primary.is_active_primary());
    let old_primary = cluster.record(1);
    assert_eq!(old_primary.node_type, NodeType::Standby);
    assert_eq!(old_primary.upstream_node_id, Some(NodeId(2)));
    assert!(old_primary.active);

    assert_eq!(cluster.server("node2").recovery, RecoveryType::Primary);
    assert_eq!(cluster.server("node1").recovery, RecoveryType::Standby);
    assert!(cluster.is_attached("node2", "node1"));
    assert!(no_daemon_paused(&cluster, &["node1", "node2"]));
}

#[tokio::test(start_paused = true)]
async fn test_switchover_no_pause_skips_daemon() {
    let cluster = MockCluster::new(2);
    let opts = SwitchoverOptions {
        repmgrd_no_pause: true,
        ..Default::default()
    };
    switchover(&cluster, "node2", &opts).await.unwrap();
    assert_eq!(
        cluster.event_names(),
        vec!["standby_promote", "standby_switchover", "node_rejoin"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_switchover_keeps_previously_paused_nodes_paused() {
    let cluster = MockCluster::new(2);
    cluster.update_server("node1", |s| s.daemon_paused = true);

    switchover(&cluster, "node2", &SwitchoverOptions::default()).await.unwrap();
    assert!(cluster.server("node1").daemon_paused);
    assert!(!cluster.server("node2").daemon_paused);
}

#[tokio::test(start_paused = true)]
async fn test_switchover_dry_run_changes_nothing() {
    let cluster = MockCluster::new(2);
    let mut ctx = cluster.ctx("node2");
    ctx.options.dry_run = true;
    let conn = cluster.connect("node2").await;

    let out = standby_switchover(&ctx, conn.as_ref(), &SwitchoverOptions::default())
        .await
        .unwrap();
    assert!(out.contains("prerequisites"));
    assert!(cluster.server("node1").up);
    assert_eq!(cluster.server("node1").recovery, RecoveryType::Primary);
    assert_eq!(cluster.server("node2").recovery, RecoveryType::Standby);
    assert!(cluster.events().is_empty());
    assert!(no_daemon_paused(&cluster, &["node1", "node2"]));
}

#[tokio::test(start_paused = true)]
async fn test_switchover_aborts_on_failed_remote_check() {
    let cluster = MockCluster::new(2);
    cluster.update_server("node1", |s| {
        s.check_output = Some("--status=CRITICAL --files=200".to_string())
    });

    let err = switchover(&cluster, "node2", &SwitchoverOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::SwitchoverFail);
    assert!(cluster.server("node1").up);
    assert!(cluster.record(1).is_active_primary());
    assert!(cluster.events().is_empty());
    assert!(no_daemon_paused(&cluster, &["node1", "node2"]));
}

#[tokio::test(start_paused = true)]
async fn test_switchover_archive_warning_is_not_fatal() {
    let cluster = MockCluster::new(2);
    cluster.update_server("node1", |s| {
        s.check_output = Some("--status=WARNING --files=20".to_string())
    });

    let err = switchover(&cluster, "node2", &SwitchoverOptions::default())
        .await
        .unwrap_err();
    // The archive check tolerates WARNING; the next check fails on it.
    assert_eq!(err.kind, ErrorKind::SwitchoverFail);
    assert!(err.message.contains("data-directory-config"));
}

#[tokio::test(start_paused = true)]
async fn test_switchover_requires_ssh() {
    let cluster = MockCluster::new(2);
    cluster.update_server("node1", |s| s.ssh_down = true);

    let err = switchover(&cluster, "node2", &SwitchoverOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Ssh);
    assert!(cluster.server("node1").up);
    assert!(cluster.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_switchover_requires_reachable_primary() {
    let cluster = MockCluster::new(2);
    cluster.stop("node1");

    let err = switchover(&cluster, "node2", &SwitchoverOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::SwitchoverFail);
    assert_eq!(cluster.server("node2").recovery, RecoveryType::Standby);
}

#[tokio::test(start_paused = true)]
async fn test_switchover_aborts_when_lag_too_high() {
    let cluster = MockCluster::new(2);
    cluster.update_server("node2", |s| s.replay_lsn = Lsn(0));

    let err = switchover(&cluster, "node2", &SwitchoverOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::SwitchoverFail);
    assert!(err.message.contains("lag"));
    assert!(cluster.server("node1").up);
    assert!(cluster.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_switchover_siblings_follow() {
    let cluster = MockCluster::new(3);
    let opts = SwitchoverOptions {
        siblings_follow: true,
        ..Default::default()
    };

    let out = switchover(&cluster, "node2", &opts).await.unwrap();
    assert!(out.contains("1 of 1 sibling"));
    assert!(cluster.is_attached("node2", "node3"));
    assert!(cluster.is_attached("node2", "node1"));
    assert_eq!(cluster.record(3).upstream_node_id, Some(NodeId(2)));
    let names = cluster.event_names();
    assert_eq!(names.first().map(String::as_str), Some("standby_promote"));
    assert!(names.contains(&"standby_follow".to_string()));
    assert_eq!(names.last().map(String::as_str), Some("node_rejoin"));
}

#[tokio::test(start_paused = true)]
async fn test_switchover_reports_manual_rejoin() {
    let cluster = MockCluster::new(2);
    cluster.update_server("node1", |s| s.attach_blocked = true);

    let out = switchover(&cluster, "node2", &SwitchoverOptions::default()).await.unwrap();
    assert!(out.contains("must be rejoined manually"));
    assert!(cluster.record(2).is_active_primary());
    assert_eq!(cluster.server("node2").recovery, RecoveryType::Primary);
}

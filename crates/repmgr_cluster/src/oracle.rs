//! Attachment, lag and attachability checks, plus WAL-receiver control.

use std::time::Duration;

use repmgr_common::interrupt::InterruptSignal;
use repmgr_common::types::{
    parse_timeline_history, Lsn, NodeRecord, RecoveryType, TimelineHistoryEntry, TimelineId,
};
use repmgr_common::{RepmgrError, RepmgrResult};
use tracing::{debug, info, warn};

use crate::context::{PollWait, Poller};
use crate::db::DbSession;

/// Margin added to `wal_retrieve_retry_interval` to keep the WAL receiver down.
pub const WAL_RECEIVER_DISABLE_MARGIN_MS: i64 = 86_400_000;
const WAL_RECEIVER_KILL_RETRIES: usize = 2;
const WAL_RECEIVER_STARTUP_WAIT_SECS: u64 = 30;
const DEFAULT_WAL_RETRIEVE_RETRY_INTERVAL_MS: i64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAttached {
    Attached,
    NotAttached,
    Unknown,
}

/// Whether `node_name` appears as a streaming standby on the upstream.
pub async fn is_downstream_node_attached(
    upstream: &dyn DbSession,
    node_name: &str,
) -> NodeAttached {
    match upstream.attached_standbys().await {
        Ok(list) => {
            match list.iter().find(|s| s.application_name == node_name) {
                Some(s) if s.state == "streaming" => NodeAttached::Attached,
                Some(s) => {
                    debug!("node \"{}\" present in state \"{}\"", node_name, s.state);
                    NodeAttached::NotAttached
                }
                None => NodeAttached::NotAttached,
            }
        }
        Err(e) => {
            warn!("unable to query upstream replication view: {}", e);
            NodeAttached::Unknown
        }
    }
}

/// Apply delay in seconds; `None` when it cannot be determined.
pub async fn get_replication_lag_seconds(conn: &dyn DbSession) -> Option<i64> {
    match conn.replication_lag_seconds().await {
        Ok(v) => v,
        Err(e) => {
            warn!("unable to determine replication lag: {}", e);
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Attachability
// ---------------------------------------------------------------------------

/// Where the local node's WAL ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalPosition {
    pub system_identifier: u64,
    pub timeline: TimelineId,
    pub lsn: Lsn,
}

/// Upstream state relevant to attachability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamPosition {
    pub system_identifier: u64,
    pub timeline: TimelineId,
    pub current_lsn: Lsn,
    /// History of `timeline`; empty when `timeline` is 1.
    pub history: Vec<TimelineHistoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachability {
    Attachable,
    NotAttachable(String),
}

impl Attachability {
    pub fn is_attachable(&self) -> bool {
        matches!(self, Self::Attachable)
    }
}

/// Decide whether WAL ending at `local` can continue on `upstream`.
///
/// On the same timeline the local end must not be ahead of the upstream.
/// On an older timeline the local end must not be past the point where the
/// upstream forked off that timeline.
pub fn evaluate_attachability(local: &LocalPosition, upstream: &UpstreamPosition) -> Attachability {
    if local.system_identifier != upstream.system_identifier {
        return Attachability::NotAttachable(format!(
            "system identifiers differ (local {}, upstream {})",
            local.system_identifier, upstream.system_identifier
        ));
    }
    if local.timeline > upstream.timeline {
        return Attachability::NotAttachable(format!(
            "local timeline {} is ahead of upstream timeline {}",
            local.timeline, upstream.timeline
        ));
    }
    if local.timeline == upstream.timeline {
        if local.lsn > upstream.current_lsn {
            return Attachability::NotAttachable(format!(
                "local node LSN {} is ahead of upstream LSN {} on timeline {}",
                local.lsn, upstream.current_lsn, local.timeline
            ));
        }
        return Attachability::Attachable;
    }
    match upstream.history.iter().find(|e| e.timeline == local.timeline) {
        None => Attachability::NotAttachable(format!(
            "timeline {} not found in the upstream's timeline history",
            local.timeline
        )),
        Some(entry) if local.lsn > entry.switchpoint => Attachability::NotAttachable(format!(
            "upstream forked off timeline {} at {} but the local node's end of WAL is {}",
            local.timeline, entry.switchpoint, local.lsn
        )),
        Some(_) => Attachability::Attachable,
    }
}

/// Read the upstream's position, including its timeline history.
pub async fn upstream_position(upstream: &dyn DbSession) -> RepmgrResult<UpstreamPosition> {
    let timeline = upstream.timeline().await?;
    let history = if timeline > 1 {
        let text = upstream.timeline_history(timeline).await?;
        parse_timeline_history(&text)?
    } else {
        Vec::new()
    };
    Ok(UpstreamPosition {
        system_identifier: upstream.system_identifier().await?,
        timeline,
        current_lsn: upstream.current_wal_lsn().await?,
        history,
    })
}

/// Check that the local node can attach to `upstream_record`. Logs the
/// reason when it cannot.
pub async fn check_node_can_attach(
    local: &LocalPosition,
    upstream: &dyn DbSession,
    upstream_record: &NodeRecord,
    is_rejoin: bool,
) -> RepmgrResult<Attachability> {
    let pos = upstream_position(upstream).await?;
    let verdict = evaluate_attachability(local, &pos);
    let action = if is_rejoin { "rejoin" } else { "attach to" };
    match &verdict {
        Attachability::Attachable => info!(
            "local node can {} upstream \"{}\" (timeline {}, LSN {})",
            action, upstream_record.node_name, local.timeline, local.lsn
        ),
        Attachability::NotAttachable(reason) => warn!(
            "this node cannot {} upstream \"{}\": {}",
            action, upstream_record.node_name, reason
        ),
    }
    Ok(verdict)
}

// ---------------------------------------------------------------------------
// WAL receiver control
// ---------------------------------------------------------------------------

async fn require_standby(conn: &dyn DbSession) -> RepmgrResult<()> {
    if conn.recovery_type().await? != RecoveryType::Standby {
        return Err(RepmgrError::node_status(
            "WAL receiver control is only possible on a standby",
        ));
    }
    if !conn.is_superuser().await? {
        return Err(RepmgrError::superuser_required("WAL receiver control"));
    }
    Ok(())
}

async fn retry_interval_ms(conn: &dyn DbSession) -> RepmgrResult<i64> {
    let value = conn
        .pg_setting("wal_retrieve_retry_interval")
        .await?
        .ok_or_else(|| RepmgrError::db_query("unable to read \"wal_retrieve_retry_interval\""))?;
    value.trim().parse::<i64>().map_err(|_| {
        RepmgrError::db_query(format!(
            "unexpected value \"{}\" for \"wal_retrieve_retry_interval\"",
            value
        ))
    })
}

/// Stop the WAL receiver and keep it from restarting.
pub async fn disable_wal_receiver(conn: &dyn DbSession, interrupt: &InterruptSignal) -> RepmgrResult<()> {
    require_standby(conn).await?;
    let current = retry_interval_ms(conn).await?;
    if current < WAL_RECEIVER_DISABLE_MARGIN_MS {
        conn.alter_system_int(
            "wal_retrieve_retry_interval",
            current + WAL_RECEIVER_DISABLE_MARGIN_MS,
        )
        .await?;
        conn.reload_conf().await?;
    }

    for attempt in 0..=WAL_RECEIVER_KILL_RETRIES {
        match conn.wal_receiver_pid().await? {
            None => {
                info!("WAL receiver disabled");
                return Ok(());
            }
            Some(pid) if attempt < WAL_RECEIVER_KILL_RETRIES => {
                debug!("terminating WAL receiver with pid {}", pid);
                conn.terminate_backend(pid).await?;
                if interrupt.sleep(Duration::from_secs(1)).await {
                    return Err(crate::context::interrupted("disabling the WAL receiver"));
                }
            }
            Some(pid) => {
                return Err(RepmgrError::node_status(format!(
                    "WAL receiver still running with pid {}",
                    pid
                )));
            }
        }
    }
    Ok(())
}

/// Re-enable the WAL receiver; with `wait_startup`, wait up to 30 seconds for
/// it to appear and return its pid.
pub async fn enable_wal_receiver(
    conn: &dyn DbSession,
    wait_startup: bool,
    interrupt: &InterruptSignal,
) -> RepmgrResult<Option<i32>> {
    require_standby(conn).await?;
    let current = retry_interval_ms(conn).await?;
    if current >= WAL_RECEIVER_DISABLE_MARGIN_MS {
        let restored = current - WAL_RECEIVER_DISABLE_MARGIN_MS;
        let restored = if restored <= 0 {
            DEFAULT_WAL_RETRIEVE_RETRY_INTERVAL_MS
        } else {
            restored
        };
        conn.alter_system_int("wal_retrieve_retry_interval", restored).await?;
        conn.reload_conf().await?;
    }
    if !wait_startup {
        return conn.wal_receiver_pid().await;
    }
    let mut poller = Poller::new(1, WAL_RECEIVER_STARTUP_WAIT_SECS, interrupt);
    loop {
        if let Some(pid) = conn.wal_receiver_pid().await? {
            info!("WAL receiver started with pid {}", pid);
            return Ok(Some(pid));
        }
        match poller.wait().await {
            PollWait::Again => continue,
            PollWait::TimedOut => {
                warn!("WAL receiver did not start within {} seconds", WAL_RECEIVER_STARTUP_WAIT_SECS);
                return Ok(None);
            }
            PollWait::Interrupted => {
                return Err(crate::context::interrupted("waiting for the WAL receiver"))
            }
        }
    }
}

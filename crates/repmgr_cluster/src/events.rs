//! Event rows and the external notification command.

use chrono::Local;
use repmgr_common::config::EventsConfig;
use repmgr_common::types::NodeId;
use repmgr_common::RepmgrResult;
use tracing::{debug, error, info, warn};

use crate::context::ClusterContext;
use crate::db::{DbSession, NewEvent};

/// Event names written by the orchestrator and registration commands.
pub mod names {
    pub const PRIMARY_REGISTER: &str = "primary_register";
    pub const PRIMARY_UNREGISTER: &str = "primary_unregister";
    pub const STANDBY_REGISTER: &str = "standby_register";
    pub const STANDBY_UNREGISTER: &str = "standby_unregister";
    pub const STANDBY_CLONE: &str = "standby_clone";
    pub const STANDBY_PROMOTE: &str = "standby_promote";
    pub const STANDBY_FOLLOW: &str = "standby_follow";
    pub const STANDBY_SWITCHOVER: &str = "standby_switchover";
    pub const WITNESS_REGISTER: &str = "witness_register";
    pub const WITNESS_UNREGISTER: &str = "witness_unregister";
    pub const NODE_REJOIN: &str = "node_rejoin";
    pub const REPMGRD_PAUSE: &str = "repmgrd_pause";
    pub const REPMGRD_UNPAUSE: &str = "repmgrd_unpause";
    pub const CLUSTER_CLEANUP: &str = "cluster_cleanup";
}

/// Optional fields for the notification template.
#[derive(Debug, Clone, Default)]
pub struct EventExtras {
    pub node_name: Option<String>,
    pub peer_node_id: Option<NodeId>,
    pub peer_conninfo: Option<String>,
}

impl NewEvent {
    pub fn new(node_id: NodeId, event: &str, successful: bool, details: impl Into<String>) -> Self {
        Self {
            node_id,
            event: event.to_string(),
            successful,
            details: details.into(),
        }
    }
}

/// Expand `%n %e %s %t %d %a %p %c %%` in `template`.
pub fn render_notification(template: &str, event: &NewEvent, timestamp: &str, extras: &EventExtras) -> String {
    let mut out = String::with_capacity(template.len() + event.details.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push_str(&event.node_id.to_string()),
            Some('e') => out.push_str(&event.event),
            Some('s') => out.push(if event.successful { '1' } else { '0' }),
            Some('t') => out.push_str(timestamp),
            Some('d') => out.push_str(&event.details),
            Some('a') => out.push_str(extras.node_name.as_deref().unwrap_or("")),
            Some('p') => {
                if let Some(p) = extras.peer_node_id {
                    out.push_str(&p.to_string());
                }
            }
            Some('c') => out.push_str(extras.peer_conninfo.as_deref().unwrap_or("")),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

fn wants_notification(cfg: &EventsConfig, event: &str) -> bool {
    !cfg.notification_command.is_empty()
        && (cfg.notifications.is_empty() || cfg.notifications.iter().any(|e| e == event))
}

/// Append the event row inside the caller's transaction.
pub async fn record_event(conn: &dyn DbSession, event: &NewEvent) -> RepmgrResult<String> {
    conn.insert_event(event).await
}

/// Roll back the open transaction, logging rather than propagating failure.
pub async fn rollback_quietly(conn: &dyn DbSession) {
    if let Err(e) = conn.rollback_transaction().await {
        warn!("unable to roll back transaction: {}", e);
    }
}

/// Record `event` in the open transaction, commit, then notify.
pub async fn commit_with_event(
    ctx: &ClusterContext,
    conn: &dyn DbSession,
    event: NewEvent,
    extras: &EventExtras,
) -> RepmgrResult<String> {
    let timestamp = match record_event(conn, &event).await {
        Ok(ts) => ts,
        Err(e) => {
            rollback_quietly(conn).await;
            return Err(e);
        }
    };
    conn.commit_transaction().await?;
    info!(
        "event \"{}\" recorded for node {} (success: {})",
        event.event, event.node_id, event.successful
    );
    notify(ctx, &event, &timestamp, extras).await;
    Ok(timestamp)
}

/// Run the notification command for an already recorded event.
pub async fn notify(ctx: &ClusterContext, event: &NewEvent, timestamp: &str, extras: &EventExtras) {
    if !wants_notification(&ctx.config.events, &event.event) {
        return;
    }
    let cmd = render_notification(&ctx.config.events.notification_command, event, timestamp, extras);
    debug!("executing event notification command:\n  {}", cmd);
    match ctx.runner.run(&cmd).await {
        Ok(out) if out.success() => {}
        Ok(out) => warn!("event notification command exited with status {}", out.status),
        Err(e) => warn!("unable to execute event notification command: {}", e),
    }
}

/// Record an event (when a handle is available) and notify.
///
/// A failed insert is logged and does not fail the caller; the notification
/// still runs with a locally generated timestamp.
pub async fn create_event_notification(
    ctx: &ClusterContext,
    conn: Option<&dyn DbSession>,
    event: NewEvent,
    extras: &EventExtras,
) -> String {
    let timestamp = match conn {
        Some(c) => match record_event(c, &event).await {
            Ok(ts) => ts,
            Err(e) => {
                error!("unable to create event record: {}", e);
                Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
            }
        },
        None => Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
    };
    info!(
        "event \"{}\" recorded for node {} (success: {})",
        event.event, event.node_id, event.successful
    );
    notify(ctx, &event, &timestamp, extras).await;
    timestamp
}

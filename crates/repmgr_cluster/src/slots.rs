//! Physical replication slot lifecycle and reconciliation.
//!
//! A standby S streaming from upstream U expects exactly one physical slot
//! on U named after S (`repmgr_slot_{id}`). Slots are created just before a
//! node starts consuming them and dropped once it has moved elsewhere.

use repmgr_common::types::{NodeId, NodeRecord, ReplicationSlot};
use repmgr_common::{RepmgrError, RepmgrResult};
use tracing::{debug, info, warn};

use crate::db::DbSession;

/// Create `slot_name` on `conn` unless it already exists.
/// Returns `true` if a slot was created.
pub async fn create_replication_slot(conn: &dyn DbSession, slot_name: &str) -> RepmgrResult<bool> {
    let slots = conn.replication_slots().await?;
    if let Some(existing) = slots.iter().find(|s| s.slot_name == slot_name) {
        if existing.slot_type != "physical" {
            return Err(RepmgrError::node_status(format!(
                "slot \"{}\" exists and is not a physical slot",
                slot_name
            )));
        }
        debug!("replication slot \"{}\" already exists", slot_name);
        return Ok(false);
    }
    conn.create_physical_replication_slot(slot_name).await?;
    info!("replication slot \"{}\" created", slot_name);
    Ok(true)
}

/// Drop `slot_name` if present and inactive. An active slot is left in
/// place with a warning since its consumer is still attached.
pub async fn drop_replication_slot_if_exists(
    conn: &dyn DbSession,
    node_id: NodeId,
    slot_name: &str,
) -> RepmgrResult<bool> {
    if slot_name.is_empty() {
        return Ok(false);
    }
    let slots = conn.replication_slots().await?;
    match slots.iter().find(|s| s.slot_name == slot_name) {
        None => {
            debug!("replication slot \"{}\" not found on node {}", slot_name, node_id);
            Ok(false)
        }
        Some(s) if s.active => {
            warn!(
                "replication slot \"{}\" is still active on node {}; not dropping",
                slot_name, node_id
            );
            Ok(false)
        }
        Some(_) => {
            conn.drop_replication_slot(slot_name).await?;
            info!("replication slot \"{}\" dropped on node {}", slot_name, node_id);
            Ok(true)
        }
    }
}

/// An inactive slot with the reason it is worth reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InactiveSlot {
    pub slot_name: String,
    pub reason: String,
}

pub async fn get_inactive_replication_slots(conn: &dyn DbSession) -> RepmgrResult<Vec<InactiveSlot>> {
    Ok(conn
        .replication_slots()
        .await?
        .into_iter()
        .filter(|s| !s.active)
        .map(|s| InactiveSlot {
            reason: format!("{} slot is not in use", s.slot_type),
            slot_name: s.slot_name,
        })
        .collect())
}

/// Comparison of expected and actual slots on one upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotReconciliation {
    /// Downstream nodes whose slot does not exist.
    pub missing: Vec<NodeRecord>,
    /// Downstream nodes with no slot name while slots are in use.
    pub misconfigured: Vec<NodeRecord>,
    /// Inactive slots not owned by any downstream node.
    pub extra_inactive: Vec<String>,
}

impl SlotReconciliation {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.misconfigured.is_empty() && self.extra_inactive.is_empty()
    }

    /// Warnings in stable order: misconfiguration, then extras.
    pub fn warnings(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .misconfigured
            .iter()
            .map(|r| {
                format!(
                    "node \"{}\" (ID: {}) has no slot name although replication slots are in use",
                    r.node_name, r.node_id
                )
            })
            .collect();
        out.extend(
            self.extra_inactive
                .iter()
                .map(|s| format!("inactive replication slot \"{}\" has no owner", s)),
        );
        out
    }
}

/// Pure reconciliation of `downstreams` against `slots`.
pub fn find_missing_slots(
    downstreams: &[NodeRecord],
    slots: &[ReplicationSlot],
    use_replication_slots: bool,
) -> SlotReconciliation {
    let mut result = SlotReconciliation::default();
    for node in downstreams.iter().filter(|r| r.node_type.replicates()) {
        if !node.has_slot() {
            if use_replication_slots {
                result.misconfigured.push(node.clone());
            }
            continue;
        }
        if !slots.iter().any(|s| s.slot_name == node.slot_name) {
            result.missing.push(node.clone());
        }
    }
    result.extra_inactive = slots
        .iter()
        .filter(|s| !s.active && s.slot_type == "physical")
        .filter(|s| !downstreams.iter().any(|r| r.slot_name == s.slot_name))
        .map(|s| s.slot_name.clone())
        .collect();
    result
}

/// Reconcile the slots on `conn` (node `node_id`) with its downstream records.
pub async fn get_downstream_nodes_with_missing_slot(
    conn: &dyn DbSession,
    node_id: NodeId,
    use_replication_slots: bool,
) -> RepmgrResult<SlotReconciliation> {
    let downstreams = conn.get_downstream_node_records(node_id).await?;
    let slots = conn.replication_slots().await?;
    Ok(find_missing_slots(&downstreams, &slots, use_replication_slots))
}

/// Whether the primary has a free slot for one more standby.
pub async fn check_replication_slots_available(
    primary_id: NodeId,
    primary_conn: &dyn DbSession,
) -> RepmgrResult<bool> {
    let cap = primary_conn.replication_capacity().await?;
    if cap.free_replication_slots() <= 0 {
        warn!(
            "no free replication slots on node {} ({} of {} in use)",
            primary_id, cap.used_replication_slots, cap.max_replication_slots
        );
        return Ok(false);
    }
    Ok(true)
}

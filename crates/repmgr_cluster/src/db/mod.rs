//! Database seams.
//!
//! [`Connector`] opens sessions; a [`DbSession`] is both the node-record
//! store ([`NodeRecordStore`]) and the live-server accessor ([`ServerOps`]).
//! The production implementation lives in [`pg`]; tests substitute an
//! in-memory cluster.

pub mod pg;
pub mod schema;

use async_trait::async_trait;
use repmgr_common::types::{
    EventRecord, Lsn, NodeId, NodeRecord, NodeType, RecoveryType, ReplInfo, ReplicationSlot,
    TimelineId,
};
use repmgr_common::{RepmgrError, RepmgrResult};

/// Result of a lightweight reachability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingStatus {
    /// Server accepts connections.
    Ok,
    /// Server is up but rejecting connections (starting up or shutting down).
    Reject,
    /// Nothing answered.
    NoResponse,
}

impl PingStatus {
    /// Anything other than `NoResponse` means a postmaster is running.
    pub fn server_running(self) -> bool {
        !matches!(self, Self::NoResponse)
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, conninfo: &str) -> RepmgrResult<Box<dyn DbSession>>;

    async fn ping(&self, conninfo: &str) -> PingStatus;
}

/// Event row to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub node_id: NodeId,
    pub event: String,
    pub successful: bool,
    pub details: String,
}

/// Filter for `cluster event`.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub node_id: Option<NodeId>,
    pub node_name: Option<String>,
    pub event: Option<String>,
    /// `None` returns every row.
    pub limit: Option<i64>,
}

/// A standby seen in the upstream's `pg_stat_replication`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedStandby {
    pub application_name: String,
    pub state: String,
}

/// WAL sender and slot usage on a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplicationCapacity {
    pub max_wal_senders: i32,
    pub active_wal_senders: i32,
    pub max_replication_slots: i32,
    pub used_replication_slots: i32,
}

impl ReplicationCapacity {
    pub fn free_wal_senders(&self) -> i32 {
        self.max_wal_senders - self.active_wal_senders
    }

    pub fn free_replication_slots(&self) -> i32 {
        self.max_replication_slots - self.used_replication_slots
    }
}

/// Node-record store (`repmgr.nodes`, `repmgr.events`).
///
/// Mutations are only committed once the live action they describe has
/// been confirmed; callers bracket them with `begin_transaction` and
/// `commit_transaction`.
#[async_trait]
pub trait NodeRecordStore: Send + Sync {
    async fn get_node_record(&self, node_id: NodeId) -> RepmgrResult<Option<NodeRecord>>;

    async fn get_node_record_by_name(&self, node_name: &str) -> RepmgrResult<Option<NodeRecord>>;

    /// All records ordered by node id.
    async fn get_all_node_records(&self) -> RepmgrResult<Vec<NodeRecord>>;

    async fn create_node_record(&self, record: &NodeRecord) -> RepmgrResult<()>;

    async fn update_node_record(&self, record: &NodeRecord) -> RepmgrResult<()>;

    /// Returns `false` if no such record existed.
    async fn delete_node_record(&self, node_id: NodeId) -> RepmgrResult<bool>;

    /// Make `node_id` the active primary and deactivate every other primary record.
    async fn update_node_record_set_primary(&self, node_id: NodeId) -> RepmgrResult<()>;

    /// Mark `node_id` as an active standby of `upstream`.
    async fn update_node_record_set_upstream(
        &self,
        node_id: NodeId,
        upstream: NodeId,
    ) -> RepmgrResult<()>;

    async fn update_node_record_set_active(&self, node_id: NodeId, active: bool)
        -> RepmgrResult<()>;

    async fn update_node_record_slot_name(&self, node_id: NodeId, slot_name: &str) -> RepmgrResult<()> {
        let mut record = self
            .get_node_record(node_id)
            .await?
            .ok_or_else(|| RepmgrError::db_query(format!("no record found for node {}", node_id)))?;
        record.slot_name = slot_name.to_string();
        self.update_node_record(&record).await
    }

    async fn begin_transaction(&self) -> RepmgrResult<()>;

    async fn commit_transaction(&self) -> RepmgrResult<()>;

    async fn rollback_transaction(&self) -> RepmgrResult<()>;

    /// Append an event row; returns the stored timestamp as text.
    async fn insert_event(&self, event: &NewEvent) -> RepmgrResult<String>;

    async fn get_events(&self, filter: &EventFilter) -> RepmgrResult<Vec<EventRecord>>;

    /// Delete events older than `keep_days` days; returns the number removed.
    async fn purge_events(&self, keep_days: u32) -> RepmgrResult<u64>;

    async fn schema_exists(&self) -> RepmgrResult<bool>;

    async fn create_schema(&self) -> RepmgrResult<()>;

    /// All records with `upstream_node_name` resolved.
    async fn get_all_node_records_with_upstream(&self) -> RepmgrResult<Vec<NodeRecord>> {
        let mut records = self.get_all_node_records().await?;
        let names: Vec<(NodeId, String)> = records
            .iter()
            .map(|r| (r.node_id, r.node_name.clone()))
            .collect();
        for rec in records.iter_mut() {
            rec.upstream_node_name = rec.upstream_node_id.and_then(|up| {
                names
                    .iter()
                    .find(|(id, _)| *id == up)
                    .map(|(_, n)| n.clone())
            });
        }
        Ok(records)
    }

    /// Active records whose upstream is `upstream`.
    async fn get_downstream_node_records(
        &self,
        upstream: NodeId,
    ) -> RepmgrResult<Vec<NodeRecord>> {
        Ok(self
            .get_all_node_records()
            .await?
            .into_iter()
            .filter(|r| r.upstream_node_id == Some(upstream) && r.active)
            .collect())
    }

    async fn get_primary_node_record(&self) -> RepmgrResult<Option<NodeRecord>> {
        Ok(self
            .get_all_node_records()
            .await?
            .into_iter()
            .find(|r| r.is_active_primary()))
    }

    async fn get_primary_node_id(&self) -> RepmgrResult<Option<NodeId>> {
        Ok(self.get_primary_node_record().await?.map(|r| r.node_id))
    }

    /// Active records of the given type.
    async fn get_node_records_by_type(&self, node_type: NodeType) -> RepmgrResult<Vec<NodeRecord>> {
        Ok(self
            .get_all_node_records()
            .await?
            .into_iter()
            .filter(|r| r.node_type == node_type)
            .collect())
    }
}

/// Live-server accessors and administrative actions.
#[async_trait]
pub trait ServerOps: Send + Sync {
    /// The connection string this session was opened with.
    fn conninfo(&self) -> &str;

    async fn recovery_type(&self) -> RepmgrResult<RecoveryType>;

    async fn server_version_num(&self) -> RepmgrResult<i32>;

    async fn is_superuser(&self) -> RepmgrResult<bool>;

    async fn pg_setting(&self, name: &str) -> RepmgrResult<Option<String>>;

    /// `None` when the role may not read `data_directory`.
    async fn data_directory(&self) -> RepmgrResult<Option<String>>;

    async fn system_identifier(&self) -> RepmgrResult<u64>;

    async fn timeline(&self) -> RepmgrResult<TimelineId>;

    async fn replication_info(&self) -> RepmgrResult<ReplInfo>;

    /// Write location on a primary, receive location on a standby.
    async fn current_wal_lsn(&self) -> RepmgrResult<Lsn>;

    async fn replication_lag_seconds(&self) -> RepmgrResult<Option<i64>>;

    async fn wal_receiver_pid(&self) -> RepmgrResult<Option<i32>>;

    async fn is_wal_replay_paused(&self) -> RepmgrResult<bool>;

    async fn ready_archive_files(&self) -> RepmgrResult<i64>;

    async fn checkpoint(&self) -> RepmgrResult<()>;

    async fn reload_conf(&self) -> RepmgrResult<()>;

    async fn alter_system_int(&self, name: &str, value: i64) -> RepmgrResult<()>;

    async fn terminate_backend(&self, pid: i32) -> RepmgrResult<bool>;

    /// `pg_promote()`; returns whether the server reported success.
    async fn promote(&self, wait: bool) -> RepmgrResult<bool>;

    async fn attached_standbys(&self) -> RepmgrResult<Vec<AttachedStandby>>;

    async fn replication_slots(&self) -> RepmgrResult<Vec<ReplicationSlot>>;

    async fn create_physical_replication_slot(&self, slot_name: &str) -> RepmgrResult<()>;

    async fn drop_replication_slot(&self, slot_name: &str) -> RepmgrResult<()>;

    async fn replication_capacity(&self) -> RepmgrResult<ReplicationCapacity>;

    /// Contents of the history file for `timeline`.
    async fn timeline_history(&self, timeline: TimelineId) -> RepmgrResult<String>;

    /// Human-readable total database size.
    async fn cluster_size(&self) -> RepmgrResult<String>;

    async fn daemon_pause(&self, pause: bool) -> RepmgrResult<()>;

    async fn daemon_is_paused(&self) -> RepmgrResult<bool>;

    async fn daemon_pid(&self) -> RepmgrResult<Option<i32>>;
}

/// A database handle: record store plus server accessors.
pub trait DbSession: NodeRecordStore + ServerOps {}

impl<T: NodeRecordStore + ServerOps> DbSession for T {}

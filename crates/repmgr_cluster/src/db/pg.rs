//! `tokio-postgres` implementation of the database seams.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use repmgr_common::conninfo::ConnInfo;
use repmgr_common::types::{
    EventRecord, Lsn, NodeId, NodeRecord, NodeType, RecoveryType, ReplInfo, ReplicationSlot,
    TimelineId,
};
use repmgr_common::{RepmgrError, RepmgrResult};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::FromSql;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, warn};

use super::schema::{constraint_field, CREATE_SCHEMA_SQL};
use super::{
    AttachedStandby, Connector, DbSession, EventFilter, NewEvent, NodeRecordStore, PingStatus,
    ReplicationCapacity, ServerOps,
};

const NODE_COLUMNS: &str = "node_id, upstream_node_id, active, node_name, type, location, \
     priority, conninfo, repluser, COALESCE(slot_name, ''), config_file";

/// Opens [`PgSession`]s, adding `connect_timeout` when the conninfo lacks one.
#[derive(Debug, Clone)]
pub struct PgConnector {
    connect_timeout: u64,
}

impl PgConnector {
    pub fn new(connect_timeout: u64) -> Self {
        Self { connect_timeout }
    }

    fn effective_conninfo(&self, conninfo: &str) -> RepmgrResult<String> {
        let mut ci = ConnInfo::parse(conninfo)?;
        if ci.get("connect_timeout").is_none() && self.connect_timeout > 0 {
            ci.set("connect_timeout", &self.connect_timeout.to_string());
        }
        Ok(ci.render())
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self, conninfo: &str) -> RepmgrResult<Box<dyn DbSession>> {
        let effective = self.effective_conninfo(conninfo)?;
        debug!("connecting to: \"{}\"", conninfo);

        let (client, connection) = tokio_postgres::connect(&effective, NoTls)
            .await
            .map_err(|e| {
                RepmgrError::db_connection(format!("connection to database failed: \"{}\"", conninfo))
                    .with_detail(e.to_string())
            })?;

        // Spawn the connection driver; it ends when the client is dropped.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("connection error: {}", e);
            }
        });

        Ok(Box::new(PgSession {
            client,
            conninfo: conninfo.to_string(),
        }))
    }

    async fn ping(&self, conninfo: &str) -> PingStatus {
        let effective = match self.effective_conninfo(conninfo) {
            Ok(c) => c,
            Err(_) => return PingStatus::NoResponse,
        };
        match tokio_postgres::connect(&effective, NoTls).await {
            Ok((client, connection)) => {
                drop(client);
                drop(connection);
                PingStatus::Ok
            }
            Err(e) => match e.as_db_error() {
                Some(db) if *db.code() == SqlState::CANNOT_CONNECT_NOW => PingStatus::Reject,
                // Authentication and similar failures still prove the server is up.
                Some(_) => PingStatus::Ok,
                None => PingStatus::NoResponse,
            },
        }
    }
}

/// One live connection.
pub struct PgSession {
    client: Client,
    conninfo: String,
}

/// SQLSTATEs after which the statement can be run again on the same handle.
fn is_transient_state(code: &SqlState) -> bool {
    [
        SqlState::T_R_SERIALIZATION_FAILURE,
        SqlState::T_R_DEADLOCK_DETECTED,
        SqlState::LOCK_NOT_AVAILABLE,
    ]
    .contains(code)
}

fn query_error(context: &str, e: tokio_postgres::Error) -> RepmgrError {
    if let Some(db) = e.as_db_error() {
        if *db.code() == SqlState::UNIQUE_VIOLATION {
            let field = db.constraint().map(constraint_field).unwrap_or("unknown");
            return RepmgrError::db_query(format!(
                "{}: a record with the same \"{}\" already exists",
                context, field
            ))
            .with_detail(db.message().to_string());
        }
        if *db.code() == SqlState::INSUFFICIENT_PRIVILEGE {
            return RepmgrError::db_query(format!("{}: permission denied", context))
                .with_detail(db.message().to_string())
                .with_hint("provide a superuser with -S/--superuser");
        }
        let err = RepmgrError::db_query(context.to_string()).with_detail(db.message().to_string());
        if is_transient_state(db.code()) {
            return err.transient();
        }
        return err;
    }
    if e.is_closed() {
        return RepmgrError::db_connection(format!("{}: connection closed", context));
    }
    RepmgrError::db_query(context.to_string()).with_detail(e.to_string())
}

fn col<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> RepmgrResult<T> {
    row.try_get(idx).map_err(|e| {
        RepmgrError::db_query("unexpected column type in query result").with_detail(e.to_string())
    })
}

fn parse_lsn(text: Option<String>) -> RepmgrResult<Lsn> {
    match text {
        Some(t) => t.parse(),
        None => Ok(Lsn::INVALID),
    }
}

fn node_record_from_row(row: &Row) -> RepmgrResult<NodeRecord> {
    let node_type: String = col(row, 4)?;
    Ok(NodeRecord {
        node_id: NodeId(col(row, 0)?),
        upstream_node_id: col::<Option<i32>>(row, 1)?.map(NodeId),
        active: col(row, 2)?,
        node_name: col(row, 3)?,
        node_type: NodeType::parse(&node_type),
        location: col(row, 5)?,
        priority: col(row, 6)?,
        conninfo: col(row, 7)?,
        repluser: col(row, 8)?,
        slot_name: col(row, 9)?,
        config_file: col(row, 10)?,
        upstream_node_name: None,
    })
}

impl PgSession {
    async fn query_one(
        &self,
        context: &str,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> RepmgrResult<Row> {
        self.client
            .query_one(sql, params)
            .await
            .map_err(|e| query_error(context, e))
    }

    async fn execute(
        &self,
        context: &str,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> RepmgrResult<u64> {
        self.client
            .execute(sql, params)
            .await
            .map_err(|e| query_error(context, e))
    }
}

// ---------------------------------------------------------------------------
// Node-record store
// ---------------------------------------------------------------------------

#[async_trait]
impl NodeRecordStore for PgSession {
    async fn get_node_record(&self, node_id: NodeId) -> RepmgrResult<Option<NodeRecord>> {
        let sql = format!("SELECT {} FROM repmgr.nodes WHERE node_id = $1", NODE_COLUMNS);
        let rows = self
            .client
            .query(&sql, &[&node_id.0])
            .await
            .map_err(|e| query_error("unable to retrieve node record", e))?;
        rows.first().map(node_record_from_row).transpose()
    }

    async fn get_node_record_by_name(&self, node_name: &str) -> RepmgrResult<Option<NodeRecord>> {
        let sql = format!("SELECT {} FROM repmgr.nodes WHERE node_name = $1", NODE_COLUMNS);
        let rows = self
            .client
            .query(&sql, &[&node_name])
            .await
            .map_err(|e| query_error("unable to retrieve node record", e))?;
        rows.first().map(node_record_from_row).transpose()
    }

    async fn get_all_node_records(&self) -> RepmgrResult<Vec<NodeRecord>> {
        let sql = format!("SELECT {} FROM repmgr.nodes ORDER BY node_id", NODE_COLUMNS);
        let rows = self
            .client
            .query(&sql, &[])
            .await
            .map_err(|e| query_error("unable to retrieve node records", e))?;
        rows.iter().map(node_record_from_row).collect()
    }

    async fn create_node_record(&self, r: &NodeRecord) -> RepmgrResult<()> {
        let upstream = r.upstream_node_id.map(|u| u.0);
        self.execute(
            "unable to create node record",
            "INSERT INTO repmgr.nodes \
             (node_id, upstream_node_id, active, node_name, type, location, priority, \
              conninfo, repluser, slot_name, config_file) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NULLIF($10, ''), $11)",
            &[
                &r.node_id.0,
                &upstream,
                &r.active,
                &r.node_name,
                &r.node_type.as_str(),
                &r.location,
                &r.priority,
                &r.conninfo,
                &r.repluser,
                &r.slot_name,
                &r.config_file,
            ],
        )
        .await?;
        Ok(())
    }

    async fn update_node_record(&self, r: &NodeRecord) -> RepmgrResult<()> {
        let upstream = r.upstream_node_id.map(|u| u.0);
        let n = self
            .execute(
                "unable to update node record",
                "UPDATE repmgr.nodes SET upstream_node_id = $2, active = $3, node_name = $4, \
                 type = $5, location = $6, priority = $7, conninfo = $8, repluser = $9, \
                 slot_name = NULLIF($10, ''), config_file = $11 \
                 WHERE node_id = $1",
                &[
                    &r.node_id.0,
                    &upstream,
                    &r.active,
                    &r.node_name,
                    &r.node_type.as_str(),
                    &r.location,
                    &r.priority,
                    &r.conninfo,
                    &r.repluser,
                    &r.slot_name,
                    &r.config_file,
                ],
            )
            .await?;
        if n == 0 {
            return Err(RepmgrError::db_query(format!(
                "no record found for node {}",
                r.node_id
            )));
        }
        Ok(())
    }

    async fn delete_node_record(&self, node_id: NodeId) -> RepmgrResult<bool> {
        let n = self
            .execute(
                "unable to delete node record",
                "DELETE FROM repmgr.nodes WHERE node_id = $1",
                &[&node_id.0],
            )
            .await?;
        Ok(n > 0)
    }

    async fn update_node_record_set_primary(&self, node_id: NodeId) -> RepmgrResult<()> {
        self.execute(
            "unable to deactivate previous primary record",
            "UPDATE repmgr.nodes SET active = FALSE \
             WHERE type = 'primary' AND active IS TRUE AND node_id <> $1",
            &[&node_id.0],
        )
        .await?;
        let n = self
            .execute(
                "unable to set node record as primary",
                "UPDATE repmgr.nodes SET type = 'primary', upstream_node_id = NULL, active = TRUE \
                 WHERE node_id = $1",
                &[&node_id.0],
            )
            .await?;
        if n == 0 {
            return Err(RepmgrError::db_query(format!("no record found for node {}", node_id)));
        }
        Ok(())
    }

    async fn update_node_record_set_upstream(
        &self,
        node_id: NodeId,
        upstream: NodeId,
    ) -> RepmgrResult<()> {
        let n = self
            .execute(
                "unable to set node upstream",
                "UPDATE repmgr.nodes SET type = 'standby', upstream_node_id = $2, active = TRUE \
                 WHERE node_id = $1",
                &[&node_id.0, &upstream.0],
            )
            .await?;
        if n == 0 {
            return Err(RepmgrError::db_query(format!("no record found for node {}", node_id)));
        }
        Ok(())
    }

    async fn update_node_record_slot_name(&self, node_id: NodeId, slot_name: &str) -> RepmgrResult<()> {
        let n = self
            .execute(
                "unable to set slot name",
                "UPDATE repmgr.nodes SET slot_name = NULLIF($2, '') WHERE node_id = $1",
                &[&node_id.0, &slot_name],
            )
            .await?;
        if n == 0 {
            return Err(RepmgrError::db_query(format!("no record found for node {}", node_id)));
        }
        Ok(())
    }

    async fn update_node_record_set_active(
        &self,
        node_id: NodeId,
        active: bool,
    ) -> RepmgrResult<()> {
        self.execute(
            "unable to update node active flag",
            "UPDATE repmgr.nodes SET active = $2 WHERE node_id = $1",
            &[&node_id.0, &active],
        )
        .await?;
        Ok(())
    }

    async fn begin_transaction(&self) -> RepmgrResult<()> {
        self.client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| query_error("unable to begin transaction", e))
    }

    async fn commit_transaction(&self) -> RepmgrResult<()> {
        self.client
            .batch_execute("COMMIT")
            .await
            .map_err(|e| query_error("unable to commit transaction", e))
    }

    async fn rollback_transaction(&self) -> RepmgrResult<()> {
        self.client
            .batch_execute("ROLLBACK")
            .await
            .map_err(|e| query_error("unable to roll back transaction", e))
    }

    async fn insert_event(&self, event: &NewEvent) -> RepmgrResult<String> {
        let row = self
            .query_one(
                "unable to create event record",
                "INSERT INTO repmgr.events (node_id, event, successful, details) \
                 VALUES ($1, $2, $3, $4) RETURNING event_timestamp",
                &[
                    &event.node_id.0,
                    &event.event,
                    &event.successful,
                    &event.details,
                ],
            )
            .await?;
        let ts: DateTime<Local> = col(&row, 0)?;
        Ok(ts.format("%Y-%m-%d %H:%M:%S%.6f%:z").to_string())
    }

    async fn get_events(&self, filter: &EventFilter) -> RepmgrResult<Vec<EventRecord>> {
        let node_id = filter.node_id.map(|n| n.0);
        let rows = self
            .client
            .query(
                "SELECT e.node_id, COALESCE(n.node_name, ''), e.event, e.successful, \
                        e.event_timestamp, COALESCE(e.details, '') \
                   FROM repmgr.events e \
              LEFT JOIN repmgr.nodes n ON e.node_id = n.node_id \
                  WHERE ($1::INT IS NULL OR e.node_id = $1) \
                    AND ($2::TEXT IS NULL OR n.node_name = $2) \
                    AND ($3::TEXT IS NULL OR e.event = $3) \
               ORDER BY e.event_timestamp DESC \
                  LIMIT $4::BIGINT",
                &[&node_id, &filter.node_name, &filter.event, &filter.limit],
            )
            .await
            .map_err(|e| query_error("unable to retrieve events", e))?;
        rows.iter()
            .map(|row| {
                let ts: DateTime<Local> = col(row, 4)?;
                Ok(EventRecord {
                    node_id: NodeId(col(row, 0)?),
                    node_name: col(row, 1)?,
                    event: col(row, 2)?,
                    successful: col(row, 3)?,
                    timestamp: ts.format("%Y-%m-%d %H:%M:%S").to_string(),
                    details: col(row, 5)?,
                })
            })
            .collect()
    }

    async fn purge_events(&self, keep_days: u32) -> RepmgrResult<u64> {
        let days = keep_days as i32;
        self.execute(
            "unable to purge events",
            "DELETE FROM repmgr.events \
             WHERE event_timestamp < CURRENT_TIMESTAMP - pg_catalog.make_interval(days => $1)",
            &[&days],
        )
        .await
    }

    async fn schema_exists(&self) -> RepmgrResult<bool> {
        let row = self
            .query_one(
                "unable to check for repmgr schema",
                "SELECT pg_catalog.to_regclass('repmgr.nodes') IS NOT NULL",
                &[],
            )
            .await?;
        col(&row, 0)
    }

    async fn create_schema(&self) -> RepmgrResult<()> {
        self.client
            .batch_execute(CREATE_SCHEMA_SQL)
            .await
            .map_err(|e| query_error("unable to create repmgr schema", e))
    }
}

// ---------------------------------------------------------------------------
// Server accessors
// ---------------------------------------------------------------------------

fn valid_setting_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_lowercase() || c == '_')
}

#[async_trait]
impl ServerOps for PgSession {
    fn conninfo(&self) -> &str {
        &self.conninfo
    }

    async fn recovery_type(&self) -> RepmgrResult<RecoveryType> {
        let row = self
            .query_one(
                "unable to determine if server is in recovery",
                "SELECT pg_catalog.pg_is_in_recovery()",
                &[],
            )
            .await?;
        let in_recovery: bool = col(&row, 0)?;
        Ok(if in_recovery {
            RecoveryType::Standby
        } else {
            RecoveryType::Primary
        })
    }

    async fn server_version_num(&self) -> RepmgrResult<i32> {
        let row = self
            .query_one(
                "unable to determine server version",
                "SELECT pg_catalog.current_setting('server_version_num')::INT",
                &[],
            )
            .await?;
        col(&row, 0)
    }

    async fn is_superuser(&self) -> RepmgrResult<bool> {
        let row = self
            .query_one(
                "unable to determine role attributes",
                "SELECT rolsuper FROM pg_catalog.pg_roles WHERE rolname = pg_catalog.current_user()",
                &[],
            )
            .await?;
        col(&row, 0)
    }

    async fn pg_setting(&self, name: &str) -> RepmgrResult<Option<String>> {
        let rows = self
            .client
            .query(
                "SELECT setting FROM pg_catalog.pg_settings WHERE name = $1",
                &[&name],
            )
            .await
            .map_err(|e| query_error("unable to read setting", e))?;
        rows.first().map(|r| col(r, 0)).transpose()
    }

    async fn data_directory(&self) -> RepmgrResult<Option<String>> {
        // pg_settings hides data_directory from unprivileged roles.
        let setting = self.pg_setting("data_directory").await?;
        if setting.is_none() {
            debug!("data_directory not visible to this role");
        }
        Ok(setting)
    }

    async fn system_identifier(&self) -> RepmgrResult<u64> {
        let row = self
            .query_one(
                "unable to read system identifier",
                "SELECT system_identifier FROM pg_catalog.pg_control_system()",
                &[],
            )
            .await?;
        let id: i64 = col(&row, 0)?;
        Ok(id as u64)
    }

    async fn timeline(&self) -> RepmgrResult<TimelineId> {
        let row = self
            .query_one(
                "unable to determine timeline",
                "SELECT CASE WHEN pg_catalog.pg_is_in_recovery() \
                   THEN COALESCE((SELECT received_tli FROM pg_catalog.pg_stat_wal_receiver), \
                                 (SELECT timeline_id FROM pg_catalog.pg_control_checkpoint())) \
                   ELSE ('x' || substr(pg_catalog.pg_walfile_name(pg_catalog.pg_current_wal_lsn()), 1, 8))::BIT(32)::INT \
                 END",
                &[],
            )
            .await?;
        let tli: i32 = col(&row, 0)?;
        Ok(tli as TimelineId)
    }

    async fn replication_info(&self) -> RepmgrResult<ReplInfo> {
        let row = self
            .query_one(
                "unable to retrieve replication information",
                "SELECT pg_catalog.pg_is_in_recovery(), \
                        pg_catalog.pg_last_wal_receive_lsn()::TEXT, \
                        pg_catalog.pg_last_wal_replay_lsn()::TEXT, \
                        COALESCE(pg_catalog.pg_wal_lsn_diff(pg_catalog.pg_last_wal_receive_lsn(), \
                                 pg_catalog.pg_last_wal_replay_lsn()), 0)::BIGINT, \
                        CASE WHEN NOT pg_catalog.pg_is_in_recovery() THEN 0 \
                             WHEN pg_catalog.pg_last_wal_receive_lsn() = pg_catalog.pg_last_wal_replay_lsn() THEN 0 \
                             ELSE EXTRACT(epoch FROM (pg_catalog.clock_timestamp() \
                                  - pg_catalog.pg_last_xact_replay_timestamp()))::BIGINT \
                        END, \
                        (SELECT pid FROM pg_catalog.pg_stat_wal_receiver LIMIT 1), \
                        (SELECT status = 'streaming' FROM pg_catalog.pg_stat_wal_receiver LIMIT 1), \
                        CASE WHEN pg_catalog.pg_is_in_recovery() \
                             THEN pg_catalog.pg_is_wal_replay_paused() ELSE FALSE END",
                &[],
            )
            .await?;
        let lag_bytes: i64 = col(&row, 3)?;
        let info = ReplInfo {
            in_recovery: col(&row, 0)?,
            timeline: self.timeline().await?,
            last_wal_receive_lsn: parse_lsn(col(&row, 1)?)?,
            last_wal_replay_lsn: parse_lsn(col(&row, 2)?)?,
            replication_lag_bytes: lag_bytes.max(0) as u64,
            replication_lag_seconds: col(&row, 4)?,
            wal_receiver_pid: col(&row, 5)?,
            upstream_attached: col::<Option<bool>>(&row, 6)?.unwrap_or(false),
            wal_replay_paused: col(&row, 7)?,
        };
        Ok(info)
    }

    async fn current_wal_lsn(&self) -> RepmgrResult<Lsn> {
        let row = self
            .query_one(
                "unable to retrieve current WAL location",
                "SELECT CASE WHEN pg_catalog.pg_is_in_recovery() \
                   THEN COALESCE(pg_catalog.pg_last_wal_receive_lsn(), pg_catalog.pg_last_wal_replay_lsn()) \
                   ELSE pg_catalog.pg_current_wal_lsn() END::TEXT",
                &[],
            )
            .await?;
        parse_lsn(col(&row, 0)?)
    }

    async fn replication_lag_seconds(&self) -> RepmgrResult<Option<i64>> {
        Ok(self.replication_info().await?.replication_lag_seconds)
    }

    async fn wal_receiver_pid(&self) -> RepmgrResult<Option<i32>> {
        let rows = self
            .client
            .query("SELECT pid FROM pg_catalog.pg_stat_wal_receiver", &[])
            .await
            .map_err(|e| query_error("unable to query WAL receiver", e))?;
        rows.first().map(|r| col(r, 0)).transpose()
    }

    async fn is_wal_replay_paused(&self) -> RepmgrResult<bool> {
        let row = self
            .query_one(
                "unable to determine replay state",
                "SELECT CASE WHEN pg_catalog.pg_is_in_recovery() \
                   THEN pg_catalog.pg_is_wal_replay_paused() ELSE FALSE END",
                &[],
            )
            .await?;
        col(&row, 0)
    }

    async fn ready_archive_files(&self) -> RepmgrResult<i64> {
        let row = self
            .query_one(
                "unable to count archive-ready files",
                "SELECT COUNT(*) FROM pg_catalog.pg_ls_archive_statusdir() WHERE name LIKE '%.ready'",
                &[],
            )
            .await?;
        col(&row, 0)
    }

    async fn checkpoint(&self) -> RepmgrResult<()> {
        self.client
            .batch_execute("CHECKPOINT")
            .await
            .map_err(|e| query_error("unable to execute CHECKPOINT", e))
    }

    async fn reload_conf(&self) -> RepmgrResult<()> {
        self.query_one(
            "unable to reload configuration",
            "SELECT pg_catalog.pg_reload_conf()",
            &[],
        )
        .await?;
        Ok(())
    }

    async fn alter_system_int(&self, name: &str, value: i64) -> RepmgrResult<()> {
        if !valid_setting_name(name) {
            return Err(RepmgrError::internal(format!("invalid setting name \"{}\"", name)));
        }
        let sql = format!("ALTER SYSTEM SET {} = {}", name, value);
        self.client
            .batch_execute(&sql)
            .await
            .map_err(|e| query_error(&format!("unable to set \"{}\"", name), e))
    }

    async fn terminate_backend(&self, pid: i32) -> RepmgrResult<bool> {
        let row = self
            .query_one(
                "unable to terminate backend",
                "SELECT pg_catalog.pg_terminate_backend($1)",
                &[&pid],
            )
            .await?;
        col(&row, 0)
    }

    async fn promote(&self, wait: bool) -> RepmgrResult<bool> {
        let row = self
            .query_one(
                "unable to execute pg_promote()",
                "SELECT pg_catalog.pg_promote($1)",
                &[&wait],
            )
            .await?;
        col(&row, 0)
    }

    async fn attached_standbys(&self) -> RepmgrResult<Vec<AttachedStandby>> {
        let rows = self
            .client
            .query(
                "SELECT COALESCE(application_name, ''), COALESCE(state, '') \
                   FROM pg_catalog.pg_stat_replication",
                &[],
            )
            .await
            .map_err(|e| query_error("unable to query pg_stat_replication", e))?;
        rows.iter()
            .map(|r| {
                Ok(AttachedStandby {
                    application_name: col(r, 0)?,
                    state: col(r, 1)?,
                })
            })
            .collect()
    }

    async fn replication_slots(&self) -> RepmgrResult<Vec<ReplicationSlot>> {
        let rows = self
            .client
            .query(
                "SELECT slot_name::TEXT, slot_type, active \
                   FROM pg_catalog.pg_replication_slots ORDER BY slot_name",
                &[],
            )
            .await
            .map_err(|e| query_error("unable to query replication slots", e))?;
        rows.iter()
            .map(|r| {
                Ok(ReplicationSlot {
                    slot_name: col(r, 0)?,
                    slot_type: col(r, 1)?,
                    active: col(r, 2)?,
                })
            })
            .collect()
    }

    async fn create_physical_replication_slot(&self, slot_name: &str) -> RepmgrResult<()> {
        self.query_one(
            &format!("unable to create replication slot \"{}\"", slot_name),
            "SELECT * FROM pg_catalog.pg_create_physical_replication_slot($1::TEXT::NAME, TRUE)",
            &[&slot_name],
        )
        .await?;
        Ok(())
    }

    async fn drop_replication_slot(&self, slot_name: &str) -> RepmgrResult<()> {
        self.query_one(
            &format!("unable to drop replication slot \"{}\"", slot_name),
            "SELECT pg_catalog.pg_drop_replication_slot($1::TEXT::NAME)",
            &[&slot_name],
        )
        .await?;
        Ok(())
    }

    async fn replication_capacity(&self) -> RepmgrResult<ReplicationCapacity> {
        let row = self
            .query_one(
                "unable to read replication capacity",
                "SELECT pg_catalog.current_setting('max_wal_senders')::INT, \
                        (SELECT COUNT(*) FROM pg_catalog.pg_stat_replication)::INT, \
                        pg_catalog.current_setting('max_replication_slots')::INT, \
                        (SELECT COUNT(*) FROM pg_catalog.pg_replication_slots)::INT",
                &[],
            )
            .await?;
        Ok(ReplicationCapacity {
            max_wal_senders: col(&row, 0)?,
            active_wal_senders: col(&row, 1)?,
            max_replication_slots: col(&row, 2)?,
            used_replication_slots: col(&row, 3)?,
        })
    }

    async fn timeline_history(&self, timeline: TimelineId) -> RepmgrResult<String> {
        let path = format!("pg_wal/{:08X}.history", timeline);
        let row = self
            .query_one(
                &format!("unable to read timeline history file \"{}\"", path),
                "SELECT pg_catalog.pg_read_file($1)",
                &[&path],
            )
            .await?;
        col(&row, 0)
    }

    async fn cluster_size(&self) -> RepmgrResult<String> {
        let row = self
            .query_one(
                "unable to determine cluster size",
                "SELECT pg_catalog.pg_size_pretty(SUM(pg_catalog.pg_database_size(oid))::BIGINT) \
                   FROM pg_catalog.pg_database",
                &[],
            )
            .await?;
        col(&row, 0)
    }

    async fn daemon_pause(&self, pause: bool) -> RepmgrResult<()> {
        self.query_one(
            "unable to set repmgrd pause state",
            "SELECT repmgr.repmgrd_pause($1)",
            &[&pause],
        )
        .await?;
        Ok(())
    }

    async fn daemon_is_paused(&self) -> RepmgrResult<bool> {
        let row = self
            .query_one(
                "unable to read repmgrd pause state",
                "SELECT repmgr.repmgrd_is_paused()",
                &[],
            )
            .await?;
        col(&row, 0)
    }

    async fn daemon_pid(&self) -> RepmgrResult<Option<i32>> {
        let row = self
            .query_one(
                "unable to read repmgrd pid",
                "SELECT repmgr.get_repmgrd_pid()",
                &[],
            )
            .await?;
        col(&row, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_states() {
        assert!(is_transient_state(&SqlState::T_R_SERIALIZATION_FAILURE));
        assert!(is_transient_state(&SqlState::T_R_DEADLOCK_DETECTED));
        assert!(!is_transient_state(&SqlState::UNIQUE_VIOLATION));
        assert!(!is_transient_state(&SqlState::INSUFFICIENT_PRIVILEGE));
    }

    #[test]
    fn test_effective_conninfo_adds_timeout() {
        let c = PgConnector::new(2);
        assert_eq!(
            c.effective_conninfo("host=node1 dbname=repmgr").unwrap(),
            "host=node1 dbname=repmgr connect_timeout=2"
        );
        assert_eq!(
            c.effective_conninfo("host=node1 connect_timeout=9").unwrap(),
            "host=node1 connect_timeout=9"
        );
    }

    #[test]
    fn test_valid_setting_name() {
        assert!(valid_setting_name("wal_retrieve_retry_interval"));
        assert!(!valid_setting_name("x; DROP TABLE"));
        assert!(!valid_setting_name(""));
    }

    #[test]
    fn test_parse_lsn_null_is_invalid() {
        assert_eq!(parse_lsn(None).unwrap(), Lsn::INVALID);
        assert_eq!(parse_lsn(Some("0/10".to_string())).unwrap(), Lsn(16));
    }
}

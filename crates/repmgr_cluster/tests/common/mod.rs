#![allow(dead_code, unused_imports)]

//! In-memory replication cluster for orchestrator and crosscheck tests.
//!
//! Hosts are named `node{N}` and their conninfo is
//! `host=node{N} dbname=repmgr user=repmgr`. The node-record store is
//! shared by every server, as it would be after replication. Each node
//! gets a real data directory in a temp dir so that standby configuration,
//! control files and the config archive go through the filesystem.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

pub use repmgr_cluster::command::{CommandOutput, CommandRunner};
pub use repmgr_cluster::context::{ClusterContext, RuntimeOptions};
pub use repmgr_cluster::db::{
    AttachedStandby, Connector, DbSession, EventFilter, NewEvent, NodeRecordStore, PingStatus,
    ReplicationCapacity, ServerOps,
};
use repmgr_cluster::orchestrator::{follow, rejoin};
use repmgr_cluster::oracle::WAL_RECEIVER_DISABLE_MARGIN_MS;
use repmgr_cluster::recovery_conf::{self, StandbyConfig};
use repmgr_cluster::remote::{RemoteExecutor, RemoteOutput};
use repmgr_cluster::service::{self, ServiceAction};
use repmgr_cluster::{crosscheck, status};
pub use repmgr_common::config::RepmgrConfig;
use repmgr_common::conninfo;
use repmgr_common::interrupt::InterruptSignal;
pub use repmgr_common::types::{
    slot_name_for, EventRecord, Lsn, NodeId, NodeRecord, NodeType, RecoveryType, ReplInfo,
    ReplicationSlot, TimelineId,
};
pub use repmgr_common::{ErrorKind, RepmgrError, RepmgrResult};

/// Collects the messages of WARN events emitted on this thread while
/// installed.
#[derive(Clone, Default)]
pub struct WarningCapture {
    messages: Arc<Mutex<Vec<String>>>,
}

impl WarningCapture {
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        use tracing_subscriber::layer::SubscriberExt;
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages.lock().iter().any(|m| m.contains(needle))
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarningCapture {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        if *event.metadata().level() != tracing::Level::WARN {
            return;
        }
        struct Message(String);
        impl tracing::field::Visit for Message {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.0 = format!("{:?}", value);
                }
            }
        }
        let mut m = Message(String::new());
        event.record(&mut m);
        self.messages.lock().push(m.0);
    }
}

pub const SYSTEM_IDENTIFIER: u64 = 7_300_000_000_000_000_001;
pub const START_LSN: Lsn = Lsn(0x3F00_0000);

pub fn conninfo_for(host: &str) -> String {
    format!("host={} dbname=repmgr user=repmgr", host)
}

/// Synthetic `global/pg_control` image with the fields the reader uses.
pub fn control_image(sysid: u64, state: i32, checkpoint: Lsn, tli: u32) -> Vec<u8> {
    let mut buf = vec![0u8; 296];
    buf[0..8].copy_from_slice(&sysid.to_ne_bytes());
    buf[8..12].copy_from_slice(&1300u32.to_ne_bytes());
    buf[16..20].copy_from_slice(&(state as u32).to_ne_bytes());
    buf[32..40].copy_from_slice(&checkpoint.0.to_ne_bytes());
    buf[40..48].copy_from_slice(&checkpoint.0.to_ne_bytes());
    buf[48..52].copy_from_slice(&tli.to_ne_bytes());
    buf[228..232].copy_from_slice(&(16u32 * 1024 * 1024).to_ne_bytes());
    buf
}

pub fn write_control_file(data_dir: &Path, sysid: u64, state: i32, checkpoint: Lsn, tli: u32) {
    let global = data_dir.join("global");
    fs::create_dir_all(&global).unwrap();
    fs::write(global.join("pg_control"), control_image(sysid, state, checkpoint, tli)).unwrap();
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub slot: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MockServer {
    pub node_id: i32,
    pub name: String,
    pub data_dir: PathBuf,
    pub up: bool,
    pub recovery: RecoveryType,
    pub timeline: TimelineId,
    /// Write position on a primary, receive position on a standby.
    pub lsn: Lsn,
    pub replay_lsn: Lsn,
    pub system_identifier: u64,
    pub slots: Vec<String>,
    pub attached: Vec<Attachment>,
    pub daemon_paused: bool,
    pub daemon_pid: Option<i32>,
    pub history: BTreeMap<TimelineId, String>,
    pub ready_files: i64,
    pub replay_paused: bool,
    /// Output of any remote `node check`; defaults to OK.
    pub check_output: Option<String>,
    pub ssh_down: bool,
    /// A (re)started standby never shows up on its upstream.
    pub attach_blocked: bool,
    pub rewind_fails: bool,
    /// Metadata reads that fail with a serialization error before one succeeds.
    pub transient_read_failures: u32,
    pub wal_retrieve_retry_interval_ms: i64,
    /// Terminated and not yet restarted by a reload.
    pub wal_receiver_killed: bool,
    /// A terminated receiver is replaced at once.
    pub wal_receiver_respawns: bool,
    /// The receiver does not come back after being re-enabled.
    pub wal_receiver_start_blocked: bool,
    pub wal_receiver_terminations: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub records: BTreeMap<i32, NodeRecord>,
    pub events: Vec<EventRecord>,
    pub schema: bool,
    seq: u64,
}

/// What the data directory looked like while the rewind tool ran.
#[derive(Debug, Clone)]
pub struct RewindObservation {
    pub host: String,
    pub standby_signal_present: bool,
    pub archived: Vec<String>,
}

#[derive(Default)]
struct State {
    servers: BTreeMap<String, MockServer>,
    configs: BTreeMap<String, RepmgrConfig>,
    meta: Metadata,
    commands: Vec<(String, String)>,
    rewinds: Vec<RewindObservation>,
}

impl State {
    fn server_mut(&mut self, host: &str) -> &mut MockServer {
        self.servers.get_mut(host).unwrap()
    }

    fn detach_everywhere(&mut self, name: &str) {
        for s in self.servers.values_mut() {
            s.attached.retain(|a| a.name != name);
        }
    }

    fn stop_server(&mut self, host: &str) {
        let s = self.server_mut(host);
        if !s.up {
            return;
        }
        if s.recovery == RecoveryType::Primary {
            s.lsn = Lsn(s.lsn.0 + 0x28);
            s.replay_lsn = s.lsn;
        }
        s.up = false;
        let (state, checkpoint) = if s.recovery == RecoveryType::Primary {
            (1, s.lsn)
        } else {
            (2, s.replay_lsn)
        };
        write_control_file(&s.data_dir, s.system_identifier, state, checkpoint, s.timeline);
        let tli = s.timeline;
        let downstream: Vec<String> = s.attached.drain(..).map(|a| a.name).collect();
        for name in downstream {
            if let Some(d) = self.servers.get_mut(&name) {
                if d.timeline == tli {
                    d.lsn = checkpoint;
                    d.replay_lsn = checkpoint;
                }
            }
        }
        self.detach_everywhere(host);
    }

    fn start_server(&mut self, host: &str) {
        let dir = self.server_mut(host).data_dir.clone();
        if !dir.join(recovery_conf::STANDBY_SIGNAL).exists() {
            let s = self.server_mut(host);
            s.up = true;
            s.recovery = RecoveryType::Primary;
            return;
        }
        {
            let s = self.server_mut(host);
            s.up = true;
            s.recovery = RecoveryType::Standby;
        }
        let upstream = recovery_conf::read_primary_conninfo(&dir)
            .ok()
            .flatten()
            .and_then(|ci| conninfo::host_of(&ci).ok());
        let slot = recovery_conf::read_primary_slot_name(&dir).ok().flatten();
        if let Some(up) = upstream {
            self.attach(host, &up, slot);
        }
    }

    fn attach(&mut self, host: &str, upstream: &str, slot: Option<String>) {
        if self.server_mut(host).attach_blocked {
            return;
        }
        let (up_ok, tli, lsn) = match self.servers.get(upstream) {
            Some(u) => {
                let slot_ok = slot.as_ref().map_or(true, |s| u.slots.contains(s));
                (u.up && slot_ok, u.timeline, u.lsn)
            }
            None => (false, 0, Lsn(0)),
        };
        if !up_ok {
            return;
        }
        self.detach_everywhere(host);
        self.server_mut(upstream).attached.push(Attachment {
            name: host.to_string(),
            slot,
        });
        let s = self.server_mut(host);
        s.timeline = tli;
        s.lsn = lsn;
        s.replay_lsn = lsn;
    }

    fn promote(&mut self, host: &str) {
        let s = self.server_mut(host);
        let old = s.timeline;
        let mut hist = s.history.get(&old).cloned().unwrap_or_default();
        hist.push_str(&format!("{}\t{}\tno recovery target specified\n", old, s.replay_lsn));
        s.timeline = old + 1;
        s.history.insert(old + 1, hist);
        s.recovery = RecoveryType::Primary;
        s.lsn = s.replay_lsn;
        let _ = fs::remove_file(s.data_dir.join(recovery_conf::STANDBY_SIGNAL));
        self.detach_everywhere(host);
    }

    fn rewind(&mut self, host: &str, source_host: &str) -> bool {
        let dir = self.server_mut(host).data_dir.clone();
        let archive_root = self.configs[host].config_archive_root();
        let archive = repmgr_cluster::archive::archive_dir(&archive_root, host);
        let mut archived: Vec<String> = fs::read_dir(&archive)
            .map(|d| {
                d.filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        archived.sort();
        self.rewinds.push(RewindObservation {
            host: host.to_string(),
            standby_signal_present: dir.join(recovery_conf::STANDBY_SIGNAL).exists(),
            archived,
        });
        if self.server_mut(host).rewind_fails {
            return false;
        }
        let Some(src) = self.servers.get(source_host).cloned() else {
            return false;
        };
        fs::write(dir.join(recovery_conf::RECOVERY_DONE), b"").unwrap();
        fs::create_dir_all(dir.join("pg_replslot").join("repmgr_slot_9")).unwrap();
        fs::write(dir.join("postgresql.conf"), "# copied from source\n").unwrap();
        fs::write(dir.join(recovery_conf::AUTO_CONF), "# copied from source\n").unwrap();
        write_control_file(&dir, src.system_identifier, 2, src.lsn, src.timeline);
        let s = self.server_mut(host);
        s.timeline = src.timeline;
        s.lsn = src.lsn;
        s.replay_lsn = src.lsn;
        s.history = src.history;
        true
    }
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MockCluster {
    state: Arc<Mutex<State>>,
    _dirs: Arc<Vec<TempDir>>,
}

impl MockCluster {
    /// `node1` primary with `node2..=nodeN` streaming from it.
    pub fn new(n: usize) -> Self {
        let mut state = State::default();
        let mut dirs = Vec::new();
        let primary_record = {
            let mut r = NodeRecord::new(NodeId(1), "node1", NodeType::Primary, &conninfo_for("node1"));
            r.slot_name = slot_name_for(NodeId(1));
            r.repluser = "repmgr".to_string();
            r
        };
        for i in 1..=n {
            let host = format!("node{}", i);
            let data = tempfile::tempdir().unwrap();
            let archive = tempfile::tempdir().unwrap();
            let mut cfg = RepmgrConfig::for_node(
                i as i32,
                &host,
                &conninfo_for(&host),
                &data.path().display().to_string(),
            );
            cfg.replication_user = "repmgr".to_string();
            cfg.rewind.config_archive_dir = archive.path().display().to_string();
            cfg.timeouts.promote_check_timeout = 10;
            cfg.timeouts.node_rejoin_timeout = 10;
            cfg.timeouts.shutdown_check_timeout = 10;
            cfg.timeouts.wal_receive_check_timeout = 10;
            cfg.timeouts.replication_lag_timeout = 10;
            cfg.timeouts.standby_reconnect_timeout = 10;
            cfg.timeouts.check_interval = 1;

            fs::write(data.path().join("postgresql.conf"), "port = 5432\n").unwrap();
            fs::write(data.path().join("pg_hba.conf"), "local all all trust\n").unwrap();

            let is_primary = i == 1;
            let record = if is_primary {
                primary_record.clone()
            } else {
                let mut r = NodeRecord::new(NodeId(i as i32), &host, NodeType::Standby, &conninfo_for(&host));
                r.upstream_node_id = Some(NodeId(1));
                r.slot_name = slot_name_for(NodeId(i as i32));
                r.repluser = "repmgr".to_string();
                r
            };
            if !is_primary {
                let ci = recovery_conf::build_primary_conninfo(&primary_record, &host, "repmgr").unwrap();
                recovery_conf::write_standby_config(
                    data.path(),
                    &StandbyConfig {
                        primary_conninfo: ci,
                        primary_slot_name: Some(record.slot_name.clone()),
                    },
                )
                .unwrap();
            } else {
                fs::write(data.path().join(recovery_conf::AUTO_CONF), "# primary settings\n").unwrap();
            }
            write_control_file(
                data.path(),
                SYSTEM_IDENTIFIER,
                if is_primary { 6 } else { 5 },
                START_LSN,
                1,
            );

            let server = MockServer {
                node_id: i as i32,
                name: host.clone(),
                data_dir: data.path().to_path_buf(),
                up: true,
                recovery: if is_primary { RecoveryType::Primary } else { RecoveryType::Standby },
                timeline: 1,
                lsn: START_LSN,
                replay_lsn: START_LSN,
                system_identifier: SYSTEM_IDENTIFIER,
                slots: if is_primary {
                    (2..=n).map(|j| slot_name_for(NodeId(j as i32))).collect()
                } else {
                    Vec::new()
                },
                attached: Vec::new(),
                daemon_paused: false,
                daemon_pid: Some(1000 + i as i32),
                history: BTreeMap::new(),
                ready_files: 0,
                replay_paused: false,
                check_output: None,
                ssh_down: false,
                attach_blocked: false,
                rewind_fails: false,
                transient_read_failures: 0,
                wal_retrieve_retry_interval_ms: 5000,
                wal_receiver_killed: false,
                wal_receiver_respawns: false,
                wal_receiver_start_blocked: false,
                wal_receiver_terminations: 0,
            };
            state.servers.insert(host.clone(), server);
            state.configs.insert(host.clone(), cfg);
            state.meta.records.insert(i as i32, record);
            dirs.push(data);
            dirs.push(archive);
        }
        state.meta.schema = true;
        for i in 2..=n {
            let host = format!("node{}", i);
            state.server_mut("node1").attached.push(Attachment {
                name: host,
                slot: Some(slot_name_for(NodeId(i as i32))),
            });
        }
        Self {
            state: Arc::new(Mutex::new(state)),
            _dirs: Arc::new(dirs),
        }
    }

    pub fn ctx(&self, host: &str) -> ClusterContext {
        let config = self.config(host);
        ClusterContext {
            config,
            options: RuntimeOptions::default(),
            connector: Arc::new(MockConnector { cluster: self.clone() }),
            runner: Arc::new(MockRunner {
                cluster: self.clone(),
                host: host.to_string(),
            }),
            remote: Arc::new(MockRemote { cluster: self.clone() }),
            interrupt: InterruptSignal::new(),
        }
    }

    pub fn config(&self, host: &str) -> RepmgrConfig {
        self.state.lock().configs[host].clone()
    }

    pub fn update_config(&self, host: &str, f: impl FnOnce(&mut RepmgrConfig)) {
        f(self.state.lock().configs.get_mut(host).unwrap());
    }

    pub async fn connect(&self, host: &str) -> Box<dyn DbSession> {
        MockConnector { cluster: self.clone() }
            .connect(&conninfo_for(host))
            .await
            .unwrap()
    }

    pub fn server(&self, host: &str) -> MockServer {
        self.state.lock().servers[host].clone()
    }

    pub fn update_server(&self, host: &str, f: impl FnOnce(&mut MockServer)) {
        f(self.state.lock().server_mut(host));
    }

    /// Stop the server the way `pg_ctl stop` would.
    pub fn stop(&self, host: &str) {
        self.state.lock().stop_server(host);
    }

    /// Stop the server and make its host unreachable over SSH.
    pub fn power_off(&self, host: &str) {
        let mut st = self.state.lock();
        st.stop_server(host);
        st.server_mut(host).ssh_down = true;
    }

    pub fn record(&self, id: i32) -> NodeRecord {
        self.state.lock().meta.records[&id].clone()
    }

    pub fn update_record(&self, id: i32, f: impl FnOnce(&mut NodeRecord)) {
        f(self.state.lock().meta.records.get_mut(&id).unwrap());
    }

    pub fn remove_record(&self, id: i32) {
        self.state.lock().meta.records.remove(&id);
    }

    /// Events in the order they were recorded.
    pub fn events(&self) -> Vec<EventRecord> {
        self.state.lock().meta.events.clone()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.event).collect()
    }

    pub fn commands_on(&self, host: &str) -> Vec<String> {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn rewinds(&self) -> Vec<RewindObservation> {
        self.state.lock().rewinds.clone()
    }

    pub fn is_attached(&self, upstream: &str, host: &str) -> bool {
        self.state.lock().servers[upstream]
            .attached
            .iter()
            .any(|a| a.name == host)
    }

    /// Advance the primary's write position without replicating it.
    pub fn diverge(&self, host: &str, bytes: u64) {
        let mut st = self.state.lock();
        let s = st.server_mut(host);
        s.lsn = Lsn(s.lsn.0 + bytes);
        s.replay_lsn = s.lsn;
    }
}

// ---------------------------------------------------------------------------
// Connector and session
// ---------------------------------------------------------------------------

pub struct MockConnector {
    cluster: MockCluster,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, ci: &str) -> RepmgrResult<Box<dyn DbSession>> {
        let host = conninfo::host_of(ci)?;
        let up = {
            let st = self.cluster.state.lock();
            st.servers.get(&host).map_or(false, |s| s.up)
        };
        if !up {
            return Err(RepmgrError::db_connection(format!("connection to \"{}\" failed", host))
                .with_detail("could not connect to server: Connection refused"));
        }
        Ok(Box::new(MockSession {
            cluster: self.cluster.clone(),
            host,
            conninfo: ci.to_string(),
            snapshot: Mutex::new(None),
        }))
    }

    async fn ping(&self, ci: &str) -> PingStatus {
        let Ok(host) = conninfo::host_of(ci) else {
            return PingStatus::NoResponse;
        };
        let st = self.cluster.state.lock();
        match st.servers.get(&host) {
            Some(s) if s.up => PingStatus::Ok,
            _ => PingStatus::NoResponse,
        }
    }
}

pub struct MockSession {
    cluster: MockCluster,
    host: String,
    conninfo: String,
    snapshot: Mutex<Option<Metadata>>,
}

impl MockSession {
    fn live<T>(&self, f: impl FnOnce(&mut State) -> T) -> RepmgrResult<T> {
        let mut st = self.cluster.state.lock();
        if !st.servers.get(&self.host).map_or(false, |s| s.up) {
            return Err(RepmgrError::db_query("server closed the connection unexpectedly"));
        }
        Ok(f(&mut st))
    }

    fn server<T>(&self, f: impl FnOnce(&MockServer) -> T) -> RepmgrResult<T> {
        let host = self.host.clone();
        self.live(|st| f(&st.servers[&host]))
    }

    fn server_mut<T>(&self, f: impl FnOnce(&mut MockServer) -> T) -> RepmgrResult<T> {
        let host = self.host.clone();
        self.live(|st| f(st.server_mut(&host)))
    }

    fn read_meta<T>(&self, f: impl FnOnce(&Metadata) -> T) -> RepmgrResult<T> {
        let host = self.host.clone();
        self.live(|st| {
            let s = st.server_mut(&host);
            if s.transient_read_failures > 0 {
                s.transient_read_failures -= 1;
                return Err(RepmgrError::db_query("could not serialize access due to concurrent update").transient());
            }
            Ok(f(&st.meta))
        })?
    }

    fn write_meta<T>(&self, f: impl FnOnce(&mut Metadata) -> RepmgrResult<T>) -> RepmgrResult<T> {
        let host = self.host.clone();
        self.live(|st| {
            if st.servers[&host].recovery != RecoveryType::Primary {
                return Err(RepmgrError::db_query(
                    "cannot execute INSERT in a read-only transaction",
                ));
            }
            f(&mut st.meta)
        })?
    }
}

#[async_trait]
impl NodeRecordStore for MockSession {
    async fn get_node_record(&self, node_id: NodeId) -> RepmgrResult<Option<NodeRecord>> {
        self.read_meta(|m| m.records.get(&node_id.0).cloned())
    }

    async fn get_node_record_by_name(&self, node_name: &str) -> RepmgrResult<Option<NodeRecord>> {
        self.read_meta(|m| m.records.values().find(|r| r.node_name == node_name).cloned())
    }

    async fn get_all_node_records(&self) -> RepmgrResult<Vec<NodeRecord>> {
        self.read_meta(|m| m.records.values().cloned().collect())
    }

    async fn create_node_record(&self, record: &NodeRecord) -> RepmgrResult<()> {
        self.write_meta(|m| {
            if m.records.contains_key(&record.node_id.0) {
                return Err(RepmgrError::db_query("duplicate key value violates unique constraint"));
            }
            m.records.insert(record.node_id.0, record.clone());
            Ok(())
        })
    }

    async fn update_node_record(&self, record: &NodeRecord) -> RepmgrResult<()> {
        self.write_meta(|m| match m.records.get_mut(&record.node_id.0) {
            Some(r) => {
                *r = record.clone();
                Ok(())
            }
            None => Err(RepmgrError::db_query("no record to update")),
        })
    }

    async fn delete_node_record(&self, node_id: NodeId) -> RepmgrResult<bool> {
        self.write_meta(|m| Ok(m.records.remove(&node_id.0).is_some()))
    }

    async fn update_node_record_set_primary(&self, node_id: NodeId) -> RepmgrResult<()> {
        self.write_meta(|m| {
            for r in m.records.values_mut() {
                if r.node_id == node_id {
                    r.node_type = NodeType::Primary;
                    r.upstream_node_id = None;
                    r.active = true;
                } else if r.node_type == NodeType::Primary {
                    r.active = false;
                }
            }
            Ok(())
        })
    }

    async fn update_node_record_set_upstream(&self, node_id: NodeId, upstream: NodeId) -> RepmgrResult<()> {
        self.write_meta(|m| match m.records.get_mut(&node_id.0) {
            Some(r) => {
                r.node_type = NodeType::Standby;
                r.upstream_node_id = Some(upstream);
                r.active = true;
                Ok(())
            }
            None => Err(RepmgrError::db_query("no record to update")),
        })
    }

    async fn update_node_record_set_active(&self, node_id: NodeId, active: bool) -> RepmgrResult<()> {
        self.write_meta(|m| {
            if let Some(r) = m.records.get_mut(&node_id.0) {
                r.active = active;
            }
            Ok(())
        })
    }

    async fn begin_transaction(&self) -> RepmgrResult<()> {
        let snap = self.read_meta(|m| m.clone())?;
        *self.snapshot.lock() = Some(snap);
        Ok(())
    }

    async fn commit_transaction(&self) -> RepmgrResult<()> {
        self.snapshot.lock().take();
        Ok(())
    }

    async fn rollback_transaction(&self) -> RepmgrResult<()> {
        if let Some(snap) = self.snapshot.lock().take() {
            self.cluster.state.lock().meta = snap;
        }
        Ok(())
    }

    async fn insert_event(&self, event: &NewEvent) -> RepmgrResult<String> {
        self.write_meta(|m| {
            m.seq += 1;
            let timestamp = format!("2026-10-19 12:{:02}:{:02}", m.seq / 60, m.seq % 60);
            let node_name = m
                .records
                .get(&event.node_id.0)
                .map(|r| r.node_name.clone())
                .unwrap_or_default();
            m.events.push(EventRecord {
                node_id: event.node_id,
                node_name,
                event: event.event.clone(),
                successful: event.successful,
                timestamp: timestamp.clone(),
                details: event.details.clone(),
            });
            Ok(timestamp)
        })
    }

    async fn get_events(&self, filter: &EventFilter) -> RepmgrResult<Vec<EventRecord>> {
        self.read_meta(|m| {
            let mut out: Vec<EventRecord> = m
                .events
                .iter()
                .rev()
                .filter(|e| filter.node_id.map_or(true, |id| e.node_id == id))
                .filter(|e| filter.node_name.as_ref().map_or(true, |n| &e.node_name == n))
                .filter(|e| filter.event.as_ref().map_or(true, |ev| &e.event == ev))
                .cloned()
                .collect();
            if let Some(limit) = filter.limit {
                out.truncate(limit.max(0) as usize);
            }
            out
        })
    }

    async fn purge_events(&self, _keep_days: u32) -> RepmgrResult<u64> {
        self.write_meta(|_| Ok(0))
    }

    async fn schema_exists(&self) -> RepmgrResult<bool> {
        self.read_meta(|m| m.schema)
    }

    async fn create_schema(&self) -> RepmgrResult<()> {
        self.write_meta(|m| {
            m.schema = true;
            Ok(())
        })
    }
}

#[async_trait]
impl ServerOps for MockSession {
    fn conninfo(&self) -> &str {
        &self.conninfo
    }

    async fn recovery_type(&self) -> RepmgrResult<RecoveryType> {
        self.server(|s| s.recovery)
    }

    async fn server_version_num(&self) -> RepmgrResult<i32> {
        Ok(150004)
    }

    async fn is_superuser(&self) -> RepmgrResult<bool> {
        Ok(true)
    }

    async fn pg_setting(&self, name: &str) -> RepmgrResult<Option<String>> {
        self.server(|s| match name {
            "data_directory" => Some(s.data_dir.display().to_string()),
            "wal_retrieve_retry_interval" => Some(s.wal_retrieve_retry_interval_ms.to_string()),
            "max_wal_senders" | "max_replication_slots" => Some("10".to_string()),
            "wal_level" => Some("replica".to_string()),
            _ => None,
        })
    }

    async fn data_directory(&self) -> RepmgrResult<Option<String>> {
        self.server(|s| Some(s.data_dir.display().to_string()))
    }

    async fn system_identifier(&self) -> RepmgrResult<u64> {
        self.server(|s| s.system_identifier)
    }

    async fn timeline(&self) -> RepmgrResult<TimelineId> {
        self.server(|s| s.timeline)
    }

    async fn replication_info(&self) -> RepmgrResult<ReplInfo> {
        let host = self.host.clone();
        self.live(|st| {
            let s = &st.servers[&host];
            let attached = st
                .servers
                .values()
                .any(|u| u.attached.iter().any(|a| a.name == host));
            let standby = s.recovery == RecoveryType::Standby;
            ReplInfo {
                in_recovery: standby,
                timeline: s.timeline,
                last_wal_receive_lsn: if standby { s.lsn } else { Lsn(0) },
                last_wal_replay_lsn: if standby { s.replay_lsn } else { Lsn(0) },
                replication_lag_bytes: s.lsn.bytes_since(s.replay_lsn),
                replication_lag_seconds: if standby { Some(0) } else { None },
                wal_receiver_pid: (attached && !s.wal_receiver_killed)
                    .then(|| 4000 + s.node_id + s.wal_receiver_terminations as i32),
                upstream_attached: attached,
                wal_replay_paused: s.replay_paused,
            }
        })
    }

    async fn current_wal_lsn(&self) -> RepmgrResult<Lsn> {
        self.server(|s| s.lsn)
    }

    async fn replication_lag_seconds(&self) -> RepmgrResult<Option<i64>> {
        self.server(|s| (s.recovery == RecoveryType::Standby).then_some(0))
    }

    async fn wal_receiver_pid(&self) -> RepmgrResult<Option<i32>> {
        Ok(self.replication_info().await?.wal_receiver_pid)
    }

    async fn is_wal_replay_paused(&self) -> RepmgrResult<bool> {
        self.server(|s| s.replay_paused)
    }

    async fn ready_archive_files(&self) -> RepmgrResult<i64> {
        self.server(|s| s.ready_files)
    }

    async fn checkpoint(&self) -> RepmgrResult<()> {
        self.server(|_| ())
    }

    async fn reload_conf(&self) -> RepmgrResult<()> {
        self.server_mut(|s| {
            if s.wal_retrieve_retry_interval_ms < WAL_RECEIVER_DISABLE_MARGIN_MS && !s.wal_receiver_start_blocked {
                s.wal_receiver_killed = false;
            }
        })
    }

    async fn alter_system_int(&self, name: &str, value: i64) -> RepmgrResult<()> {
        self.server_mut(|s| {
            if name == "wal_retrieve_retry_interval" {
                s.wal_retrieve_retry_interval_ms = value;
            }
        })
    }

    async fn terminate_backend(&self, _pid: i32) -> RepmgrResult<bool> {
        self.server_mut(|s| {
            s.wal_receiver_terminations += 1;
            if !s.wal_receiver_respawns {
                s.wal_receiver_killed = true;
            }
            true
        })
    }

    async fn promote(&self, _wait: bool) -> RepmgrResult<bool> {
        let host = self.host.clone();
        self.live(|st| {
            st.promote(&host);
            true
        })
    }

    async fn attached_standbys(&self) -> RepmgrResult<Vec<AttachedStandby>> {
        self.server(|s| {
            s.attached
                .iter()
                .map(|a| AttachedStandby {
                    application_name: a.name.clone(),
                    state: "streaming".to_string(),
                })
                .collect()
        })
    }

    async fn replication_slots(&self) -> RepmgrResult<Vec<ReplicationSlot>> {
        self.server(|s| {
            let mut slots: Vec<ReplicationSlot> = s
                .slots
                .iter()
                .map(|name| ReplicationSlot {
                    slot_name: name.clone(),
                    slot_type: "physical".to_string(),
                    active: s.attached.iter().any(|a| a.slot.as_deref() == Some(name.as_str())),
                })
                .collect();
            slots.sort_by(|a, b| a.slot_name.cmp(&b.slot_name));
            slots
        })
    }

    async fn create_physical_replication_slot(&self, slot_name: &str) -> RepmgrResult<()> {
        self.server_mut(|s| {
            if s.slots.iter().any(|n| n == slot_name) {
                return Err(RepmgrError::db_query(format!(
                    "replication slot \"{}\" already exists",
                    slot_name
                )));
            }
            s.slots.push(slot_name.to_string());
            Ok(())
        })?
    }

    async fn drop_replication_slot(&self, slot_name: &str) -> RepmgrResult<()> {
        self.server_mut(|s| s.slots.retain(|n| n != slot_name))
    }

    async fn replication_capacity(&self) -> RepmgrResult<ReplicationCapacity> {
        self.server(|s| ReplicationCapacity {
            max_wal_senders: 10,
            active_wal_senders: s.attached.len() as i32,
            max_replication_slots: 10,
            used_replication_slots: s.slots.len() as i32,
        })
    }

    async fn timeline_history(&self, timeline: TimelineId) -> RepmgrResult<String> {
        self.server(|s| s.history.get(&timeline).cloned())?
            .ok_or_else(|| RepmgrError::db_query(format!("history file for timeline {} not found", timeline)))
    }

    async fn cluster_size(&self) -> RepmgrResult<String> {
        Ok("32 MB".to_string())
    }

    async fn daemon_pause(&self, pause: bool) -> RepmgrResult<()> {
        self.server_mut(|s| s.daemon_paused = pause)
    }

    async fn daemon_is_paused(&self) -> RepmgrResult<bool> {
        self.server(|s| s.daemon_paused)
    }

    async fn daemon_pid(&self) -> RepmgrResult<Option<i32>> {
        self.server(|s| s.daemon_pid)
    }
}

// ---------------------------------------------------------------------------
// Local commands
// ---------------------------------------------------------------------------

/// Interprets the pg_ctl and rewind command lines of one host.
pub struct MockRunner {
    cluster: MockCluster,
    host: String,
}

fn source_server_arg(cmd: &str) -> Option<String> {
    let rest = cmd.split("--source-server=").nth(1)?;
    let rest = rest.trim();
    let value = match rest.strip_prefix('\'') {
        Some(r) => r.split('\'').next()?,
        None => rest.split_whitespace().next()?,
    };
    Some(value.to_string())
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, command: &str) -> RepmgrResult<CommandOutput> {
        let mut st = self.cluster.state.lock();
        st.commands.push((self.host.clone(), command.to_string()));
        let cmd = command.trim();
        if cmd.contains("pg_rewind") {
            let source = source_server_arg(cmd).and_then(|ci| conninfo::host_of(&ci).ok());
            let ok = match source {
                Some(src) => st.rewind(&self.host, &src),
                None => false,
            };
            return Ok(if ok {
                CommandOutput::ok("pg_rewind: Done!\n")
            } else {
                CommandOutput::failed(1, "pg_rewind: fatal: could not find common ancestor\n")
            });
        }
        if cmd.ends_with(" restart") {
            st.stop_server(&self.host);
            st.start_server(&self.host);
        } else if cmd.ends_with(" start") {
            st.start_server(&self.host);
        } else if cmd.ends_with(" stop") {
            st.stop_server(&self.host);
        } else if cmd.ends_with(" promote") {
            st.promote(&self.host);
        }
        Ok(CommandOutput::ok(""))
    }
}

// ---------------------------------------------------------------------------
// SSH
// ---------------------------------------------------------------------------

/// Split `repmgr [-f f] [-d 'ci'] -L level args` into the `-d` value and args.
pub fn split_remote_command(command: &str) -> (Option<String>, String) {
    let conninfo = command.find(" -d ").and_then(|i| {
        let rest = &command[i + 4..];
        match rest.strip_prefix('\'') {
            Some(r) => r.split('\'').next().map(str::to_string),
            None => rest.split_whitespace().next().map(str::to_string),
        }
    });
    let args = command
        .find(" -L ")
        .and_then(|i| command[i + 4..].split_once(' ').map(|(_, a)| a.trim().to_string()))
        .unwrap_or_default();
    (conninfo, args)
}

fn failed_with(e: &RepmgrError) -> RemoteOutput {
    RemoteOutput {
        success: false,
        output: e.report_lines().join("\n"),
    }
}

/// Runs `repmgr` self-invocations against the target host's context.
pub struct MockRemote {
    cluster: MockCluster,
}

impl MockRemote {
    async fn own_conn(&self, ctx: &ClusterContext) -> RepmgrResult<Box<dyn DbSession>> {
        ctx.connector.connect(&ctx.config.conninfo).await
    }

    async fn dispatch(&self, host: &str, conninfo_arg: Option<String>, args: &str) -> RemoteOutput {
        let ctx = self.cluster.ctx(host);
        let (node_id, args) = match args.strip_prefix("--node-id=") {
            Some(rest) => {
                let (id, rest) = rest.split_once(' ').unwrap_or((rest, ""));
                (id.parse::<i32>().ok().map(NodeId), rest.to_string())
            }
            None => (None, args.to_string()),
        };
        let args = args.as_str();

        if args == "--version" {
            return RemoteOutput::ok("repmgr 5.4.1\n");
        }
        if args.starts_with("cluster show") {
            let conn = match self.own_conn(&ctx).await {
                Ok(c) => c,
                Err(e) => return failed_with(&e),
            };
            return match crosscheck::cluster_show(&ctx, conn.as_ref()).await {
                Ok(report) => RemoteOutput::ok(crosscheck::render_show_csv(&report.entries)),
                Err(e) => failed_with(&e),
            };
        }
        if args.starts_with("cluster matrix") {
            let conn = match self.own_conn(&ctx).await {
                Ok(c) => c,
                Err(e) => return failed_with(&e),
            };
            let local = node_id.unwrap_or(ctx.config.node_id());
            return match crosscheck::build_matrix(&ctx, conn.as_ref(), local).await {
                Ok(report) => RemoteOutput::ok(report.matrix.to_csv()),
                Err(e) => failed_with(&e),
            };
        }
        if args.starts_with("node check") {
            let out = self
                .cluster
                .server(host)
                .check_output
                .unwrap_or_else(|| "--status=OK --files=0".to_string());
            return RemoteOutput::ok(format!("{}\n", out));
        }
        if args.starts_with("node service") {
            let action = args
                .split_whitespace()
                .find_map(|t| t.strip_prefix("--action="))
                .unwrap_or("");
            let action = match ServiceAction::parse(action) {
                Ok(a) => a,
                Err(e) => return failed_with(&e),
            };
            return match service::run_node_service(&ctx, action, args.contains("--checkpoint")).await {
                Ok(out) => RemoteOutput::ok(format!("{}\nserver {} done\n", out, action.as_str())),
                Err(e) => failed_with(&e),
            };
        }
        if args.starts_with("node status --is-shutdown-cleanly") {
            let state = status::is_shutdown_cleanly(&ctx).await;
            return RemoteOutput::ok(format!("{}\n", state.render()));
        }
        if args.starts_with("node rejoin") {
            let opts = rejoin::RejoinOptions {
                source_conninfo: conninfo_arg.unwrap_or_default(),
                force_rewind: args.contains("--force-rewind"),
                ..Default::default()
            };
            return match rejoin::node_rejoin(&ctx, &opts).await {
                Ok(out) => RemoteOutput::ok(out),
                Err(e) => failed_with(&e),
            };
        }
        if args.starts_with("standby follow") {
            let conn = match self.own_conn(&ctx).await {
                Ok(c) => c,
                Err(e) => return failed_with(&e),
            };
            let upstream_node_id = args
                .split_whitespace()
                .find_map(|t| t.strip_prefix("--upstream-node-id="))
                .and_then(|v| v.parse::<i32>().ok())
                .map(NodeId);
            let opts = follow::FollowOptions { upstream_node_id };
            return match follow::standby_follow(&ctx, conn.as_ref(), &opts).await {
                Ok(out) => RemoteOutput::ok(out),
                Err(e) => failed_with(&e),
            };
        }
        RemoteOutput {
            success: false,
            output: format!("unknown command \"{}\"", args),
        }
    }
}

#[async_trait]
impl RemoteExecutor for MockRemote {
    async fn run(&self, host: &str, _user: Option<&str>, command: &str) -> RemoteOutput {
        let reachable = {
            let mut st = self.cluster.state.lock();
            st.commands.push((host.to_string(), format!("ssh: {}", command)));
            st.servers.get(host).map_or(false, |s| !s.ssh_down)
        };
        if !reachable {
            return RemoteOutput::failed();
        }
        let (conninfo_arg, args) = split_remote_command(command);
        self.dispatch(host, conninfo_arg, &args).await
    }
}

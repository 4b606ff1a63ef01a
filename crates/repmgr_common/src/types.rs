use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RepmgrError, RepmgrResult};

/// Node identifier as stored in `repmgr.nodes.node_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub i32);

impl NodeId {
    /// Sentinel used by the store for "no upstream".
    pub const UNKNOWN: NodeId = NodeId(-1);

    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timeline identifier.
pub type TimelineId = u32;

// ---------------------------------------------------------------------------
// LSN
// ---------------------------------------------------------------------------

/// A WAL location, rendered as `X/Y` with upper-case hex halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Bytes between `self` and an earlier location; zero if `other` is ahead.
    pub fn bytes_since(self, other: Lsn) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = RepmgrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| RepmgrError::internal(format!("invalid LSN \"{}\"", s)))?;
        let hi = u32::from_str_radix(hi, 16)
            .map_err(|_| RepmgrError::internal(format!("invalid LSN \"{}\"", s)))?;
        let lo = u32::from_str_radix(lo, 16)
            .map_err(|_| RepmgrError::internal(format!("invalid LSN \"{}\"", s)))?;
        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }
}

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Role of a node as recorded in the node-record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Primary,
    Standby,
    Witness,
    Bdr,
    Unknown,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Standby => "standby",
            Self::Witness => "witness",
            Self::Bdr => "bdr",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "primary" | "master" => Self::Primary,
            "standby" => Self::Standby,
            "witness" => Self::Witness,
            "bdr" => Self::Bdr,
            _ => Self::Unknown,
        }
    }

    /// Only standbys can be promoted to primary.
    pub fn can_be_promoted(self) -> bool {
        matches!(self, Self::Standby)
    }

    /// Whether a record of this role must carry an upstream node id.
    pub fn expects_upstream(self) -> bool {
        matches!(self, Self::Standby)
    }

    /// Whether the node streams WAL and so participates in slot reconciliation.
    pub fn replicates(self) -> bool {
        matches!(self, Self::Primary | Self::Standby)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recovery state reported by a live server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryType {
    Primary,
    Standby,
    Unknown,
}

impl RecoveryType {
    /// Numeric code used in `cluster show --csv`.
    pub fn csv_code(self) -> i32 {
        match self {
            Self::Unknown => -1,
            Self::Primary => 0,
            Self::Standby => 1,
        }
    }

    pub fn from_csv_code(code: i32) -> Self {
        match code {
            0 => Self::Primary,
            1 => Self::Standby,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Standby => "standby",
            Self::Unknown => "unknown",
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One row of `repmgr.nodes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub node_name: String,
    pub node_type: NodeType,
    pub upstream_node_id: Option<NodeId>,
    pub conninfo: String,
    pub repluser: String,
    pub slot_name: String,
    pub location: String,
    pub priority: i32,
    pub active: bool,
    pub config_file: String,
    /// Resolved from the upstream record; not stored.
    #[serde(skip)]
    pub upstream_node_name: Option<String>,
}

impl NodeRecord {
    pub fn new(node_id: NodeId, node_name: &str, node_type: NodeType, conninfo: &str) -> Self {
        Self {
            node_id,
            node_name: node_name.to_string(),
            node_type,
            upstream_node_id: None,
            conninfo: conninfo.to_string(),
            repluser: String::new(),
            slot_name: String::new(),
            location: "default".to_string(),
            priority: 100,
            active: true,
            config_file: String::new(),
            upstream_node_name: None,
        }
    }

    pub fn is_active_primary(&self) -> bool {
        self.active && self.node_type == NodeType::Primary
    }

    pub fn has_slot(&self) -> bool {
        !self.slot_name.is_empty()
    }
}

/// Deterministic physical slot name for a node.
pub fn slot_name_for(node_id: NodeId) -> String {
    format!("repmgr_slot_{}", node_id.0)
}

/// One row of `repmgr.events`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub node_id: NodeId,
    pub node_name: String,
    pub event: String,
    pub successful: bool,
    pub timestamp: String,
    pub details: String,
}

/// Live replication state of a server; produced per invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplInfo {
    pub in_recovery: bool,
    pub timeline: TimelineId,
    pub last_wal_receive_lsn: Lsn,
    pub last_wal_replay_lsn: Lsn,
    pub replication_lag_bytes: u64,
    /// `None` when the lag cannot be computed.
    pub replication_lag_seconds: Option<i64>,
    pub wal_receiver_pid: Option<i32>,
    pub upstream_attached: bool,
    pub wal_replay_paused: bool,
}

/// Physical replication slot as seen in `pg_replication_slots`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSlot {
    pub slot_name: String,
    pub slot_type: String,
    pub active: bool,
}

/// Lines of a timeline history file: `tli  switchpoint  reason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineHistoryEntry {
    pub timeline: TimelineId,
    pub switchpoint: Lsn,
}

/// Parse the body of a `0000000N.history` file.
pub fn parse_timeline_history(text: &str) -> RepmgrResult<Vec<TimelineHistoryEntry>> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let tli = parts
            .next()
            .and_then(|t| t.parse::<TimelineId>().ok())
            .ok_or_else(|| RepmgrError::internal(format!("invalid timeline history line \"{}\"", line)))?;
        let lsn: Lsn = parts
            .next()
            .ok_or_else(|| RepmgrError::internal(format!("invalid timeline history line \"{}\"", line)))?
            .parse()?;
        entries.push(TimelineHistoryEntry {
            timeline: tli,
            switchpoint: lsn,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_roundtrip() {
        let lsn: Lsn = "0/3F000028".parse().unwrap();
        assert_eq!(lsn.0, 0x3F00_0028);
        assert_eq!(lsn.to_string(), "0/3F000028");
        let hi: Lsn = "1A/b".parse().unwrap();
        assert_eq!(hi.to_string(), "1A/B");
    }

    #[test]
    fn test_lsn_invalid() {
        assert!("3F000028".parse::<Lsn>().is_err());
        assert!("0/zz".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_lsn_bytes_since() {
        let a = Lsn(100);
        let b = Lsn(40);
        assert_eq!(a.bytes_since(b), 60);
        assert_eq!(b.bytes_since(a), 0);
    }

    #[test]
    fn test_node_type_capabilities() {
        assert!(NodeType::Standby.can_be_promoted());
        assert!(!NodeType::Primary.can_be_promoted());
        assert!(!NodeType::Witness.can_be_promoted());
        assert!(NodeType::Standby.expects_upstream());
        assert!(!NodeType::Witness.expects_upstream());
        assert_eq!(NodeType::parse("master"), NodeType::Primary);
        assert_eq!(NodeType::parse("nonsense"), NodeType::Unknown);
    }

    #[test]
    fn test_recovery_type_csv_codes() {
        for rt in [RecoveryType::Primary, RecoveryType::Standby, RecoveryType::Unknown] {
            assert_eq!(RecoveryType::from_csv_code(rt.csv_code()), rt);
        }
    }

    #[test]
    fn test_parse_timeline_history() {
        let text = "1\t0/3000000\tno recovery target specified\n\n2\t0/5000060\tno recovery target specified\n";
        let entries = parse_timeline_history(text).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].timeline, 2);
        assert_eq!(entries[1].switchpoint, "0/5000060".parse().unwrap());
    }

    #[test]
    fn test_slot_name_for() {
        assert_eq!(slot_name_for(NodeId(3)), "repmgr_slot_3");
    }
}

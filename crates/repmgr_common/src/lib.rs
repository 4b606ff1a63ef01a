//! Shared building blocks for the replication manager: node and WAL types,
//! the error taxonomy with its exit codes, the per-node configuration file,
//! connection-string handling and the interrupt signal used by polling loops.

pub mod config;
pub mod conninfo;
pub mod error;
pub mod interrupt;
pub mod types;

pub use error::{ErrorKind, RepmgrError, RepmgrResult};
pub use types::{Lsn, NodeId, NodeRecord, NodeType, RecoveryType, TimelineId};

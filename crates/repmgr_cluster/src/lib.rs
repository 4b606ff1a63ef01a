//! Replication cluster management: the node-record store and database
//! gateway, local server control, SSH execution of peer commands, slots,
//! config archiving, the attachment oracle, the role-change orchestrator
//! (promote, follow, rejoin, switchover) and the crosscheck engine.

pub mod archive;
pub mod checks;
pub mod clone;
pub mod command;
pub mod context;
pub mod control;
pub mod crosscheck;
pub mod daemon;
pub mod db;
pub mod events;
pub mod gateway;
pub mod oracle;
pub mod orchestrator;
pub mod recovery_conf;
pub mod register;
pub mod remote;
pub mod service;
pub mod slots;
pub mod status;

pub use context::{ClusterContext, RuntimeOptions};
pub use db::{Connector, DbSession};

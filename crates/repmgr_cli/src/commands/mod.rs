//! Verb dispatch. Each handler returns an [`Outcome`]; `main` alone turns it
//! into output and an exit code.

pub mod cluster;
pub mod node;
pub mod primary;
pub mod service;
pub mod standby;
pub mod witness;

use repmgr_cluster::{gateway, ClusterContext, DbSession};
use repmgr_common::conninfo::ConnInfo;
use repmgr_common::{NodeId, RecoveryType, RepmgrError, RepmgrResult};

use crate::args::{Command, GlobalArgs};
use crate::format::OutputMode;

/// What a command produced.
#[derive(Debug, Default)]
pub struct Outcome {
    pub stdout: String,
    /// Problems found by read-only checks; non-empty means a non-zero exit.
    pub warnings: Vec<String>,
    /// Reported after `stdout` has been printed.
    pub exit_error: Option<RepmgrError>,
    /// Explicit exit status, used for Nagios-style results.
    pub exit_code: Option<i32>,
}

impl Outcome {
    pub fn text(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }
}

/// Everything a handler needs besides its own arguments.
pub struct Invocation<'a> {
    pub ctx: &'a ClusterContext,
    pub global: &'a GlobalArgs,
    pub mode: OutputMode,
}

impl Invocation<'_> {
    /// `--node-id`, if given.
    pub fn target_node(&self) -> Option<NodeId> {
        self.global.node_id.map(NodeId)
    }

    /// Connection string from `-d`, `--host`, `-p` and `-U`, if any was given.
    pub fn cli_conninfo(&self) -> RepmgrResult<Option<String>> {
        cli_conninfo(self.global)
    }

    /// Connect to this node: the command-line parameters when given,
    /// otherwise the configured `conninfo`.
    pub async fn connect_local(&self) -> RepmgrResult<Box<dyn DbSession>> {
        let ci = self.cli_conninfo()?.unwrap_or_else(|| self.ctx.config.conninfo.clone());
        gateway::establish_db_connection(self.ctx.connector.as_ref(), &ci).await
    }

    /// Connect to the configured `conninfo`, ignoring `-d`.
    pub async fn connect_configured(&self) -> RepmgrResult<Box<dyn DbSession>> {
        gateway::establish_db_connection(self.ctx.connector.as_ref(), &self.ctx.config.conninfo).await
    }

    /// A writable handle: `conn` itself on a primary, otherwise the primary
    /// named in the records.
    pub async fn writable(&self, conn: Box<dyn DbSession>) -> RepmgrResult<Box<dyn DbSession>> {
        if conn.recovery_type().await? == RecoveryType::Primary {
            return Ok(conn);
        }
        let (primary_conn, _) = gateway::connect_to_primary(self.ctx, conn.as_ref()).await?;
        Ok(primary_conn)
    }

    /// `-d`/`--host` naming another server, required by `what`.
    pub fn required_conninfo(&self, what: &str) -> RepmgrResult<String> {
        self.cli_conninfo()?.ok_or_else(|| {
            RepmgrError::bad_config(format!("{} requires connection parameters for the source server", what))
                .with_hint("provide -d/--dbname or --host")
        })
    }
}

pub fn cli_conninfo(global: &GlobalArgs) -> RepmgrResult<Option<String>> {
    if global.dbname.is_none() && global.host.is_none() && global.port.is_none() && global.username.is_none() {
        return Ok(None);
    }
    let mut ci = match &global.dbname {
        Some(d) if d.contains('=') || d.starts_with("postgresql://") || d.starts_with("postgres://") => {
            ConnInfo::parse(d)?
        }
        Some(d) => {
            let mut c = ConnInfo::default();
            c.set("dbname", d);
            c
        }
        None => ConnInfo::default(),
    };
    if let Some(h) = &global.host {
        ci.set("host", h);
    }
    if let Some(p) = global.port {
        ci.set("port", &p.to_string());
    }
    if let Some(u) = &global.username {
        ci.set("user", u);
    }
    Ok(Some(ci.render()))
}

pub async fn dispatch(inv: &Invocation<'_>, command: &Command) -> RepmgrResult<Outcome> {
    match command {
        Command::Primary(cmd) => primary::run(inv, cmd).await,
        Command::Standby(cmd) => standby::run(inv, cmd).await,
        Command::Witness(cmd) => witness::run(inv, cmd).await,
        Command::Node(cmd) => node::run(inv, cmd).await,
        Command::Cluster(cmd) => cluster::run(inv, cmd).await,
        Command::Service(cmd) => service::run(inv, cmd).await,
    }
}

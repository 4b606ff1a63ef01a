//! Local service actions: start, stop, restart, reload and promote.
//!
//! Each action runs the configured service command, falling back to
//! `pg_ctl` against the configured data directory.

use repmgr_common::config::RepmgrConfig;
use repmgr_common::{RepmgrError, RepmgrResult};
use tracing::{info, warn};

use crate::command::{shell_quote, CommandOutput};
use crate::context::ClusterContext;
use crate::db::DbSession;
use crate::gateway;

/// Server version from which `pg_promote()` is available.
const PG_PROMOTE_MIN_VERSION: i32 = 120000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Reload,
    Promote,
}

impl ServiceAction {
    pub const ALL: [ServiceAction; 5] = [
        Self::Start,
        Self::Stop,
        Self::Restart,
        Self::Reload,
        Self::Promote,
    ];

    pub fn parse(s: &str) -> RepmgrResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            "reload" => Ok(Self::Reload),
            "promote" => Ok(Self::Promote),
            other => Err(RepmgrError::bad_config(format!(
                "unknown service action \"{}\"",
                other
            ))
            .with_hint("valid actions are start, stop, restart, reload and promote")),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Reload => "reload",
            Self::Promote => "promote",
        }
    }

    /// Actions after which a checkpoint beforehand shortens recovery.
    pub fn benefits_from_checkpoint(self) -> bool {
        matches!(self, Self::Stop | Self::Restart)
    }
}

/// The command line that `action` runs.
pub fn service_command(config: &RepmgrConfig, action: ServiceAction) -> String {
    let configured = match action {
        ServiceAction::Start => &config.service.start_command,
        ServiceAction::Stop => &config.service.stop_command,
        ServiceAction::Restart => &config.service.restart_command,
        ServiceAction::Reload => &config.service.reload_command,
        ServiceAction::Promote => &config.service.promote_command,
    };
    if let Some(cmd) = configured.as_ref().filter(|c| !c.trim().is_empty()) {
        return cmd.clone();
    }
    let mut cmd = config.binaries.pg_binary("pg_ctl");
    if !config.binaries.pg_ctl_options.is_empty() {
        cmd.push(' ');
        cmd.push_str(&config.binaries.pg_ctl_options);
    }
    cmd.push_str(" -w -D ");
    cmd.push_str(&shell_quote(&config.data_directory));
    match action {
        ServiceAction::Stop | ServiceAction::Restart => {
            cmd.push_str(" -m fast ");
            cmd.push_str(action.as_str());
        }
        _ => {
            cmd.push(' ');
            cmd.push_str(action.as_str());
        }
    }
    cmd
}

/// Text for `node service --list-actions`.
pub fn list_actions(config: &RepmgrConfig) -> String {
    let mut out = String::from("Following commands would be executed for each action:\n\n");
    for action in ServiceAction::ALL {
        out.push_str(&format!(
            "    {:>7}: \"{}\"\n",
            action.as_str(),
            service_command(config, action)
        ));
    }
    out
}

/// Run `action` locally. Non-zero exit becomes a `LocalCommand` error.
pub async fn execute_action(ctx: &ClusterContext, action: ServiceAction) -> RepmgrResult<CommandOutput> {
    let cmd = service_command(&ctx.config, action);
    info!("executing {} command: \"{}\"", action.as_str(), cmd);
    ctx.runner.run(&cmd).await?.into_result(&cmd)
}

/// `node service`: optional checkpoint, then the action (or its dry run).
pub async fn run_node_service(
    ctx: &ClusterContext,
    action: ServiceAction,
    checkpoint: bool,
) -> RepmgrResult<String> {
    let cmd = service_command(&ctx.config, action);

    if checkpoint && action.benefits_from_checkpoint() {
        match gateway::establish_db_connection_quiet(ctx.connector.as_ref(), &ctx.config.conninfo).await {
            Some(conn) => match gateway::superuser_connection(ctx, conn.as_ref()).await? {
                Some(su) => {
                    if ctx.options.dry_run {
                        info!("a CHECKPOINT would be issued here");
                    } else {
                        info!("issuing CHECKPOINT on node \"{}\"", ctx.config.node_name);
                        su.checkpoint().await?;
                    }
                }
                None => warn!("a CHECKPOINT requires superuser privileges; continuing without it"),
            },
            None => warn!("unable to connect to the local node; no CHECKPOINT issued"),
        }
    }

    if ctx.options.dry_run {
        return Ok(format!("would execute server command \"{}\"\n", cmd));
    }
    let out = execute_action(ctx, action).await?;
    Ok(out.stdout)
}

/// Promote the local server, preferring `pg_promote()` when no promote
/// command is configured and the server supports it.
pub async fn promote_local(ctx: &ClusterContext, conn: Option<&dyn DbSession>) -> RepmgrResult<()> {
    let has_command = ctx
        .config
        .service
        .promote_command
        .as_ref()
        .map_or(false, |c| !c.trim().is_empty());
    if !has_command {
        if let Some(conn) = conn {
            if conn.server_version_num().await? >= PG_PROMOTE_MIN_VERSION {
                info!("promoting server \"{}\" using pg_promote()", ctx.config.node_name);
                if conn.promote(false).await? {
                    return Ok(());
                }
                return Err(RepmgrError::new(
                    repmgr_common::ErrorKind::PromotionFail,
                    "pg_promote() reported failure",
                ));
            }
        }
    }
    execute_action(ctx, ServiceAction::Promote).await.map_err(|e| {
        RepmgrError::new(repmgr_common::ErrorKind::PromotionFail, "promote command failed")
            .with_detail(e.detail.unwrap_or(e.message))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RepmgrConfig {
        RepmgrConfig::for_node(1, "node1", "host=node1", "/var/lib/pg/data")
    }

    #[test]
    fn test_default_pg_ctl_commands() {
        let c = cfg();
        assert_eq!(
            service_command(&c, ServiceAction::Stop),
            "pg_ctl -w -D /var/lib/pg/data -m fast stop"
        );
        assert_eq!(
            service_command(&c, ServiceAction::Start),
            "pg_ctl -w -D /var/lib/pg/data start"
        );
        assert_eq!(
            service_command(&c, ServiceAction::Promote),
            "pg_ctl -w -D /var/lib/pg/data promote"
        );
    }

    #[test]
    fn test_configured_command_wins() {
        let mut c = cfg();
        c.service.restart_command = Some("sudo systemctl restart postgresql".to_string());
        c.binaries.pg_bindir = "/usr/pgsql/bin".to_string();
        c.binaries.pg_ctl_options = "-l /tmp/pg.log".to_string();
        assert_eq!(
            service_command(&c, ServiceAction::Restart),
            "sudo systemctl restart postgresql"
        );
        assert_eq!(
            service_command(&c, ServiceAction::Reload),
            "/usr/pgsql/bin/pg_ctl -l /tmp/pg.log -w -D /var/lib/pg/data reload"
        );
    }

    #[test]
    fn test_list_actions_names_every_action() {
        let out = list_actions(&cfg());
        for a in ServiceAction::ALL {
            assert!(out.contains(&format!("{}:", a.as_str())));
        }
    }

    #[test]
    fn test_parse_action() {
        assert_eq!(ServiceAction::parse("STOP").unwrap(), ServiceAction::Stop);
        assert!(ServiceAction::parse("explode").is_err());
    }
}

mod args;
mod commands;
mod csv;
mod format;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::Result;
use clap::Parser;
use repmgr_cluster::{ClusterContext, RuntimeOptions};
use repmgr_common::config::{RepmgrConfig, LOG_LEVELS};
use repmgr_common::interrupt::InterruptSignal;
use repmgr_common::{ErrorKind, RepmgrError};
use repmgr_observability::{init_tracing, LogSettings};
use tracing::debug;

use args::{Args, ClusterCmd, Command, GlobalArgs};
use commands::{Invocation, Outcome};
use format::OutputMode;

/// Searched in order when neither `-f` nor `REPMGR_CONFIG` is given.
const DEFAULT_CONFIG_PATHS: &[&str] = &["repmgr.toml", "/etc/repmgr.toml"];

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let code = match run(&args).await {
        Ok(code) => code,
        Err(e) => {
            report_error(&e, args.global.terse);
            exit_code_of(&e)
        }
    };
    process::exit(flush_output(&mut std::io::stdout(), code));
}

/// Flush buffered output; a failure overrides `code`.
fn flush_output(out: &mut impl Write, code: i32) -> i32 {
    match out.flush() {
        Ok(()) => code,
        Err(e) => {
            eprintln!("ERROR: unable to write output: {}", e);
            ErrorKind::Internal.exit_code()
        }
    }
}

async fn run(args: &Args) -> Result<i32> {
    let global = &args.global;
    let (config, path) = load_config(args, DEFAULT_CONFIG_PATHS)?;

    init_tracing(&log_settings(&config, global)?, &config.log.level)?;
    match &path {
        Some(p) => debug!("using configuration file \"{}\"", p.display()),
        None => debug!("no configuration file, using connection parameters only"),
    }

    let interrupt = InterruptSignal::new();
    interrupt.install_handlers();

    let options = RuntimeOptions {
        dry_run: global.dry_run,
        force: global.force,
        superuser: global.superuser.clone(),
        remote_user: global.remote_user.clone(),
        remote_config_file: global.remote_config_file.clone(),
    };
    let ctx = ClusterContext::production(config, options, interrupt);
    let inv = Invocation {
        ctx: &ctx,
        global,
        mode: OutputMode::from_args(global),
    };
    let outcome = commands::dispatch(&inv, &args.command).await?;
    Ok(emit(outcome, global.terse))
}

fn resolve_config_path(explicit: Option<&Path>, defaults: &[&str]) -> Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    defaults
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
        .ok_or_else(|| {
            RepmgrError::bad_config("no configuration file found")
                .with_detail(format!("searched: {}", defaults.join(", ")))
                .with_hint("provide one with -f/--config-file or REPMGR_CONFIG")
                .into()
        })
}

/// `cluster show` and `cluster matrix` run on peers over SSH, where the
/// configuration file may live anywhere. With connection parameters given
/// they fall back to defaults when no file is found.
fn runs_without_config(args: &Args) -> bool {
    matches!(
        args.command,
        Command::Cluster(ClusterCmd::Show) | Command::Cluster(ClusterCmd::Matrix)
    )
}

fn load_config(args: &Args, defaults: &[&str]) -> Result<(RepmgrConfig, Option<PathBuf>)> {
    let global = &args.global;
    let path = match resolve_config_path(global.config_file.as_deref(), defaults) {
        Ok(p) => p,
        Err(e) => {
            let conninfo = match commands::cli_conninfo(global)? {
                Some(ci) if runs_without_config(args) => ci,
                _ => return Err(e),
            };
            let node_id = global.node_id.unwrap_or_default();
            return Ok((RepmgrConfig::for_node(node_id, "", &conninfo, ""), None));
        }
    };
    Ok((RepmgrConfig::load(&path)?, Some(path)))
}

fn log_settings(config: &RepmgrConfig, global: &GlobalArgs) -> Result<LogSettings> {
    if let Some(level) = &global.log_level {
        if !LOG_LEVELS.contains(&level.to_lowercase().as_str()) {
            return Err(RepmgrError::bad_config(format!("invalid log level \"{}\"", level))
                .with_hint(format!("valid levels are: {}", LOG_LEVELS.join(", ")))
                .into());
        }
    }
    let mut settings = LogSettings::from_config(&config.log, global.log_to_file);
    settings.level_override = global.log_level.clone();
    settings.verbose = global.verbose;
    settings.terse = global.terse;
    Ok(settings)
}

/// Print `outcome` and map it to the process exit status.
fn emit(outcome: Outcome, terse: bool) -> i32 {
    print!("{}", outcome.stdout);
    if !outcome.warnings.is_empty() {
        eprintln!("WARNING: following problems were detected:");
        for w in &outcome.warnings {
            eprintln!("  - {}", w);
        }
    }
    if let Some(e) = &outcome.exit_error {
        print_report(e, terse);
        return e.exit_code();
    }
    if let Some(code) = outcome.exit_code {
        return code;
    }
    if !outcome.warnings.is_empty() {
        return ErrorKind::NodeStatus.exit_code();
    }
    0
}

fn print_report(e: &RepmgrError, terse: bool) {
    let lines = e.report_lines();
    let shown = if terse { &lines[..1] } else { &lines[..] };
    for line in shown {
        eprintln!("{}", line);
    }
}

fn report_error(e: &anyhow::Error, terse: bool) {
    match e.downcast_ref::<RepmgrError>() {
        Some(re) => print_report(re, terse),
        None => eprintln!("ERROR: {:#}", e),
    }
}

fn exit_code_of(e: &anyhow::Error) -> i32 {
    e.downcast_ref::<RepmgrError>()
        .map_or(ErrorKind::Internal.exit_code(), RepmgrError::exit_code)
}

//! Standby configuration in the data directory.
//!
//! Replication settings live in a block of `postgresql.auto.conf` delimited
//! by marker comments, and `standby.signal` puts the server in recovery on
//! the next start.

use std::fs;
use std::path::Path;

use repmgr_common::conninfo::ConnInfo;
use repmgr_common::types::NodeRecord;
use repmgr_common::{RepmgrError, RepmgrResult};
use tracing::debug;

pub const STANDBY_SIGNAL: &str = "standby.signal";
pub const RECOVERY_DONE: &str = "recovery.done";
pub const AUTO_CONF: &str = "postgresql.auto.conf";

const BLOCK_BEGIN: &str = "# repmgr: begin standby configuration";
const BLOCK_END: &str = "# repmgr: end standby configuration";
const MANAGED_KEYS: &[&str] = &[
    "primary_conninfo",
    "primary_slot_name",
    "recovery_target_timeline",
];

/// Settings written for a standby.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandbyConfig {
    pub primary_conninfo: String,
    pub primary_slot_name: Option<String>,
}

/// Conninfo a standby uses to stream from `upstream`.
pub fn build_primary_conninfo(
    upstream: &NodeRecord,
    local_node_name: &str,
    replication_user: &str,
) -> RepmgrResult<String> {
    let mut ci = ConnInfo::parse(&upstream.conninfo)?;
    if !replication_user.is_empty() {
        ci.set("user", replication_user);
    }
    ci.remove("dbname");
    ci.set("application_name", local_node_name);
    Ok(ci.render())
}

fn quote_conf(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

fn unquote_conf(raw: &str) -> String {
    let raw = raw.trim();
    let inner = raw
        .strip_prefix('\'')
        .and_then(|r| r.strip_suffix('\''))
        .unwrap_or(raw);
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' if chars.peek() == Some(&'\'') => {
                chars.next();
                out.push('\'');
            }
            '\\' => {
                if let Some(n) = chars.next() {
                    out.push(n);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn setting_key(line: &str) -> Option<&str> {
    let t = line.trim_start();
    if t.starts_with('#') {
        return None;
    }
    t.split(|c: char| c == '=' || c.is_whitespace()).next()
}

/// Replace the managed block in `existing` with one for `cfg`.
pub fn render_auto_conf(existing: &str, cfg: &StandbyConfig) -> String {
    let mut out = String::new();
    let mut in_block = false;
    for line in existing.lines() {
        if line.trim() == BLOCK_BEGIN {
            in_block = true;
            continue;
        }
        if line.trim() == BLOCK_END {
            in_block = false;
            continue;
        }
        if in_block {
            continue;
        }
        if setting_key(line).map_or(false, |k| MANAGED_KEYS.contains(&k)) {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(BLOCK_BEGIN);
    out.push('\n');
    out.push_str(&format!("primary_conninfo = {}\n", quote_conf(&cfg.primary_conninfo)));
    if let Some(slot) = &cfg.primary_slot_name {
        out.push_str(&format!("primary_slot_name = {}\n", quote_conf(slot)));
    }
    out.push_str("recovery_target_timeline = 'latest'\n");
    out.push_str(BLOCK_END);
    out.push('\n');
    out
}

/// Write the standby settings and create `standby.signal`.
pub fn write_standby_config(data_dir: &Path, cfg: &StandbyConfig) -> RepmgrResult<()> {
    let path = data_dir.join(AUTO_CONF);
    let existing = match fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(RepmgrError::local_command(format!(
                "unable to read \"{}\"",
                path.display()
            ))
            .with_detail(e.to_string()))
        }
    };
    fs::write(&path, render_auto_conf(&existing, cfg)).map_err(|e| {
        RepmgrError::local_command(format!("unable to write \"{}\"", path.display()))
            .with_detail(e.to_string())
    })?;
    write_standby_signal(data_dir)?;
    debug!("standby configuration written to \"{}\"", path.display());
    Ok(())
}

pub fn write_standby_signal(data_dir: &Path) -> RepmgrResult<()> {
    let path = data_dir.join(STANDBY_SIGNAL);
    fs::write(&path, b"").map_err(|e| {
        RepmgrError::local_command(format!("unable to create \"{}\"", path.display()))
            .with_detail(e.to_string())
    })
}

fn read_setting(data_dir: &Path, key: &str) -> RepmgrResult<Option<String>> {
    let path = data_dir.join(AUTO_CONF);
    let text = match fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(RepmgrError::from(e)),
    };
    let mut found = None;
    for line in text.lines() {
        if setting_key(line) == Some(key) {
            if let Some((_, v)) = line.split_once('=') {
                found = Some(unquote_conf(v));
            }
        }
    }
    Ok(found)
}

/// `primary_conninfo` as currently configured, if any.
pub fn read_primary_conninfo(data_dir: &Path) -> RepmgrResult<Option<String>> {
    read_setting(data_dir, "primary_conninfo")
}

pub fn read_primary_slot_name(data_dir: &Path) -> RepmgrResult<Option<String>> {
    read_setting(data_dir, "primary_slot_name")
}

//! Logging setup for the `repmgr` binary.
//!
//! Library crates only emit `tracing` events; the binary installs exactly one
//! subscriber at startup through [`init_tracing`].

use std::fs::OpenOptions;
use std::sync::Mutex;

use repmgr_common::config::LogConfig;
use repmgr_common::{RepmgrError, RepmgrResult};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Resolved logging options.
#[derive(Debug, Clone, Default)]
pub struct LogSettings {
    /// Level from `--log-level`; overrides the configuration file.
    pub level_override: Option<String>,
    /// `--verbose`: force debug output.
    pub verbose: bool,
    /// `--terse`: drop targets and timestamps.
    pub terse: bool,
    /// Write to this file instead of stderr.
    pub file: Option<String>,
}

impl LogSettings {
    pub fn from_config(cfg: &LogConfig, log_to_file: bool) -> Self {
        Self {
            level_override: None,
            verbose: false,
            terse: false,
            file: if log_to_file { cfg.file.clone() } else { None },
        }
    }

    /// Precedence: `--verbose` > `--log-level` > configured level.
    pub fn effective_level(&self, configured: &str) -> String {
        if self.verbose {
            return "debug".to_string();
        }
        self.level_override
            .clone()
            .unwrap_or_else(|| configured.to_string())
            .to_lowercase()
    }
}

/// Install the global subscriber. `RUST_LOG` wins over every other setting.
pub fn init_tracing(settings: &LogSettings, configured_level: &str) -> RepmgrResult<()> {
    let level = settings.effective_level(configured_level);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let result = match &settings.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    RepmgrError::bad_config(format!("unable to open log file \"{}\"", path))
                        .with_detail(e.to_string())
                })?;
            let fmt_layer = fmt::layer()
                .with_ansi(false)
                .with_target(!settings.terse)
                .with_writer(Mutex::new(file));
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()
        }
        None if settings.terse => {
            let fmt_layer = fmt::layer()
                .without_time()
                .with_target(false)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()
        }
        None => {
            let fmt_layer = fmt::layer()
                .with_target(settings.verbose)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()
        }
    };
    result.map_err(|e| RepmgrError::internal(format!("unable to initialise logging: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_level_precedence() {
        let mut s = LogSettings::default();
        assert_eq!(s.effective_level("INFO"), "info");
        s.level_override = Some("warn".to_string());
        assert_eq!(s.effective_level("info"), "warn");
        s.verbose = true;
        assert_eq!(s.effective_level("info"), "debug");
    }

    #[test]
    fn test_from_config_only_uses_file_when_requested() {
        let cfg = LogConfig {
            level: "info".to_string(),
            file: Some("/tmp/repmgr.log".to_string()),
        };
        assert!(LogSettings::from_config(&cfg, false).file.is_none());
        assert_eq!(
            LogSettings::from_config(&cfg, true).file.as_deref(),
            Some("/tmp/repmgr.log")
        );
    }
}

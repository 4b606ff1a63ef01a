//! Configuration-file archive used around a rewind.
//!
//! The rewind tool overwrites the data directory with files from the new
//! primary, including configuration files. Before it runs, the listed files
//! are copied to `{root}/repmgr-config-archive-{node_name}`; afterwards they
//! are copied back with mode 0600 and the archive is removed.

use std::fs;
use std::path::{Path, PathBuf};

use repmgr_common::{RepmgrError, RepmgrResult};
use tracing::{debug, info, warn};

pub fn archive_dir(root: &Path, node_name: &str) -> PathBuf {
    root.join(format!("repmgr-config-archive-{}", node_name))
}

/// Result of an archive pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    pub copied: Vec<String>,
    /// Listed files that did not exist in the data directory.
    pub missing: Vec<String>,
}

/// Split a comma-separated list of basenames.
pub fn parse_file_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn clear_regular_files(dir: &Path) -> RepmgrResult<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Copy `files` out of `data_dir` into the archive directory.
pub fn archive_config_files(
    data_dir: &Path,
    archive: &Path,
    files: &[String],
) -> RepmgrResult<ArchiveReport> {
    let fail = |what: String, e: std::io::Error| {
        RepmgrError::rejoin_fail(what).with_detail(e.to_string())
    };
    if archive.exists() {
        clear_regular_files(archive).map_err(|e| {
            RepmgrError::rejoin_fail(format!(
                "unable to clear archive directory \"{}\"",
                archive.display()
            ))
            .with_detail(e.message)
        })?;
    } else {
        fs::create_dir_all(archive).map_err(|e| {
            fail(
                format!("unable to create archive directory \"{}\"", archive.display()),
                e,
            )
        })?;
    }

    let mut report = ArchiveReport::default();
    for name in files {
        let src = data_dir.join(name);
        if !src.is_file() {
            warn!("configuration file \"{}\" not found in data directory", name);
            report.missing.push(name.clone());
            continue;
        }
        fs::copy(&src, archive.join(name))
            .map_err(|e| fail(format!("unable to archive \"{}\"", src.display()), e))?;
        debug!("archived \"{}\"", src.display());
        report.copied.push(name.clone());
    }
    info!(
        "{} configuration file(s) archived to \"{}\"",
        report.copied.len(),
        archive.display()
    );
    Ok(report)
}

/// Copy every archived file back into `data_dir` with mode 0600, deleting
/// each archived copy and finally the archive directory itself.
pub fn restore_config_files(data_dir: &Path, archive: &Path) -> RepmgrResult<Vec<String>> {
    if !archive.exists() {
        return Ok(Vec::new());
    }
    let fail = |what: String, e: std::io::Error| {
        RepmgrError::rejoin_fail(what).with_detail(e.to_string())
    };
    let mut restored = Vec::new();
    let entries = fs::read_dir(archive)
        .map_err(|e| fail(format!("unable to read \"{}\"", archive.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| fail("unable to read archive entry".to_string(), e))?;
        let is_file = entry
            .file_type()
            .map_err(|e| fail("unable to stat archive entry".to_string(), e))?
            .is_file();
        if !is_file {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let dest = data_dir.join(&name);
        fs::copy(entry.path(), &dest)
            .map_err(|e| fail(format!("unable to restore \"{}\"", dest.display()), e))?;
        set_owner_only(&dest).map_err(|e| fail(format!("unable to chmod \"{}\"", dest.display()), e))?;
        fs::remove_file(entry.path())
            .map_err(|e| fail(format!("unable to remove \"{}\"", entry.path().display()), e))?;
        restored.push(name);
    }
    restored.sort();
    let empty = fs::read_dir(archive)
        .map(|mut d| d.next().is_none())
        .unwrap_or(false);
    if empty {
        if let Err(e) = fs::remove_dir(archive) {
            warn!("unable to remove archive directory \"{}\": {}", archive.display(), e);
        }
    }
    info!("{} configuration file(s) restored", restored.len());
    Ok(restored)
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

//! Atomic whole-file replacement
//!
//! Bytes go to a temp file next to the target, get fsynced, then the temp
//! file is renamed over the target. Temp files are named
//! `.{file_name}.{pid}.{seq}.tmp` so leftovers from an interrupted flush can
//! be found and removed on the next open.

use super::{PersistenceError, Result};
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Writes a target file by staging a temp file and renaming it into place
#[derive(Debug)]
pub struct AtomicWriter {
    target: PathBuf,
    fsync: bool,
}

impl AtomicWriter {
    pub fn new(target: impl Into<PathBuf>, fsync: bool) -> Self {
        Self {
            target: target.into(),
            fsync,
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Replace the target with `bytes`
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        self.stage(bytes)?.commit()
    }

    /// Write `bytes` to a fresh temp file without touching the target
    pub fn stage(&self, bytes: &[u8]) -> Result<StagedFile> {
        let temp_path = temp_path_for(&self.target);

        // From here on the temp file is removed on any early return
        let staged = StagedFile {
            temp_path,
            target: self.target.clone(),
            fsync: self.fsync,
            committed: false,
        };

        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&staged.temp_path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(bytes)?;
        writer.flush()?;
        if self.fsync {
            writer.get_ref().sync_all()?;
        }

        Ok(staged)
    }
}

/// A fully written temp file waiting to be renamed over its target
///
/// Dropping it without calling [`StagedFile::commit`] deletes the temp file.
#[derive(Debug)]
pub struct StagedFile {
    temp_path: PathBuf,
    target: PathBuf,
    fsync: bool,
    committed: bool,
}

impl StagedFile {
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Atomically rename the temp file onto the target
    pub fn commit(mut self) -> Result<()> {
        fs::rename(&self.temp_path, &self.target)?;
        self.committed = true;

        if self.fsync {
            sync_parent_dir(&self.target).map_err(|source| PersistenceError::DirectorySync {
                path: self.target.clone(),
                source,
            })?;
        }

        debug!("Replaced {}", self.target.display());
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = fs::remove_file(&self.temp_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove temp file {}: {}", self.temp_path.display(), e);
                }
            }
        }
    }
}

fn temp_prefix(target: &Path) -> String {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!(".{}.", name)
}

/// Whether `name` is a temp file written for `target`: `{prefix}{pid}.{seq}.tmp`
fn is_temp_name_for(name: &str, prefix: &str) -> bool {
    let Some(rest) = name
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_suffix(".tmp"))
    else {
        return false;
    };

    let is_number = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    match rest.split_once('.') {
        Some((pid, seq)) => is_number(pid) && is_number(seq),
        None => false,
    }
}

fn temp_path_for(target: &Path) -> PathBuf {
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}{}.{}.tmp", temp_prefix(target), std::process::id(), seq);
    target.with_file_name(name)
}

/// Make the rename durable by syncing the containing directory
#[cfg(unix)]
fn sync_parent_dir(target: &Path) -> std::io::Result<()> {
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_target: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Find temp files left behind by interrupted writes of `target`
pub fn find_stale_temp_files(target: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let target = target.as_ref();
    let dir = match target.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => dir,
        None => Path::new("."),
    };

    if !dir.exists() {
        return Ok(Vec::new());
    }

    let prefix = temp_prefix(target);
    let mut stale = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if is_temp_name_for(name, &prefix) && path.is_file() {
                stale.push(path);
            }
        }
    }

    stale.sort();
    Ok(stale)
}

/// Delete temp files left behind by interrupted writes, returns count removed
pub fn cleanup_stale_temp_files(target: impl AsRef<Path>) -> Result<usize> {
    let mut deleted = 0;

    for path in find_stale_temp_files(target)? {
        match fs::remove_file(&path) {
            Ok(_) => {
                debug!("Deleted stale temp file: {}", path.display());
                deleted += 1;
            }
            Err(e) => {
                warn!("Failed to delete stale temp file {}: {}", path.display(), e);
            }
        }
    }

    Ok(deleted)
}

//! Persistence layer for the store
//!
//! Every flush rewrites the whole backing file.
//!
//! ## Architecture
//!
//! - **Format**: header + CRC32-checked bincode payload of the full mapping
//! - **Atomic writer**: temp file in the same directory, fsync, rename over the target
//! - **Flusher**: optional background thread for deferred flushes
//!
//! ## Durability Guarantee
//!
//! A reader opening the backing file sees either the previous or the new
//! contents, never a partial write. In deferred mode a crash loses at most the
//! mutations made since the last completed flush.

pub mod atomic;
pub mod format;
pub mod handle;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::types::StorageValue;

/// When mutations are written to the backing file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// The mutating call writes the file before returning and reports failures
    #[default]
    Immediate,
    /// A background thread writes the file; failures go to the error handler
    Deferred,
}

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Flush strategy (default: immediate)
    pub flush_mode: FlushMode,

    /// Delay before a deferred flush, batching bursts of mutations (default: 0ms)
    pub flush_delay_ms: u64,

    /// fsync the temp file and its directory around the rename (default: true)
    pub fsync: bool,

    /// Create missing parent directories on open (default: true)
    pub create_dirs: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            flush_mode: FlushMode::Immediate,
            flush_delay_ms: 0,
            fsync: true,
            create_dirs: true,
        }
    }
}

impl StoreConfig {
    /// Configuration with background flushing
    pub fn deferred() -> Self {
        Self {
            flush_mode: FlushMode::Deferred,
            ..Default::default()
        }
    }

    pub fn with_flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    pub fn with_flush_delay_ms(mut self, delay_ms: u64) -> Self {
        self.flush_delay_ms = delay_ms;
        self
    }

    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    pub fn with_create_dirs(mut self, create_dirs: bool) -> Self {
        self.create_dirs = create_dirs;
        self
    }

    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }
}

/// Persistence errors
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Invalid magic number: expected {expected:?}, got {actual:?}")]
    InvalidMagic { expected: Vec<u8>, actual: Vec<u8> },

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u32),

    #[error("Checksum mismatch: expected {expected:x}, got {actual:x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Truncated file: expected {expected} bytes, got {actual}")]
    Truncated { expected: u64, actual: u64 },

    #[error("Corrupted file: {0}")]
    CorruptedFile(String),

    /// The new file is in place but the rename may not survive a crash
    #[error("Renamed {path} into place but syncing its directory failed: {source}")]
    DirectorySync {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Read and decode a backing file
///
/// Returns `Ok(None)` when the file does not exist.
pub fn load(path: impl AsRef<Path>) -> Result<Option<BTreeMap<String, StorageValue>>> {
    let bytes = match std::fs::read(path.as_ref()) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    format::decode(&bytes).map(Some)
}

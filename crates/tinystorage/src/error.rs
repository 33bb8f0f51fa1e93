//! Store error types

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::persistence::PersistenceError;
use crate::types::ValueKind;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors returned by store operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// The backing file exists but cannot be decoded
    #[error("Corrupt data in {path}: {source}")]
    CorruptData {
        path: PathBuf,
        #[source]
        source: PersistenceError,
    },

    #[error("Type mismatch for key '{key}': expected {expected}, got {actual}")]
    TypeMismatch {
        key: String,
        expected: ValueKind,
        actual: ValueKind,
    },

    /// The in-memory change was kept but could not be written to disk
    #[error(transparent)]
    Flush(#[from] FlushError),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    /// Returns true if the error left data in memory that is not yet durable
    pub fn is_flush_failure(&self) -> bool {
        matches!(self, StorageError::Flush(_))
    }
}

/// A failed write of the backing file
///
/// Cloneable so it can be kept as the store's last error and handed to a
/// registered handler at the same time.
#[derive(Error, Debug, Clone)]
#[error("Flush of {path} failed: {source}")]
pub struct FlushError {
    pub path: PathBuf,
    #[source]
    pub source: Arc<PersistenceError>,
}

impl FlushError {
    pub(crate) fn new(path: impl Into<PathBuf>, source: PersistenceError) -> Self {
        Self {
            path: path.into(),
            source: Arc::new(source),
        }
    }
}

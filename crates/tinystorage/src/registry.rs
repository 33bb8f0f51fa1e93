//! Process-wide map from backing file to its live store
//!
//! Two stores caching the same file would overwrite each other's flushes, so
//! every open goes through a registry that hands out the existing instance.
//! Entries are weak: a store lives exactly as long as its callers hold it.

use crate::error::{Result, StorageError};
use crate::persistence::StoreConfig;
use crate::store::Store;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Path map shared between a registry and the stores it opened
#[derive(Default)]
pub(crate) struct OpenStores {
    stores: Mutex<HashMap<PathBuf, Weak<Store>>>,
    /// Signalled whenever a dropped store removes its entry
    released: Condvar,
}

impl OpenStores {
    /// Remove the entry of a store that finished its final flush
    pub(crate) fn release(&self, path: &Path) {
        let mut stores = self.stores.lock();
        let dead = stores
            .get(path)
            .map(|weak| weak.strong_count() == 0)
            .unwrap_or(false);
        if dead {
            stores.remove(path);
        }
        drop(stores);
        self.released.notify_all();
    }
}

static GLOBAL: Lazy<StoreRegistry> = Lazy::new(StoreRegistry::new);

/// Registry of open stores keyed by canonical backing file path
#[derive(Default)]
pub struct StoreRegistry {
    open: Arc<OpenStores>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry used by [`Store::open`]
    pub fn global() -> &'static StoreRegistry {
        &GLOBAL
    }

    /// Open `path`, returning the live store if this registry already has one
    pub fn open(&self, path: impl AsRef<Path>, config: StoreConfig) -> Result<Arc<Store>> {
        let path = canonical_path(path.as_ref(), config.create_dirs)?;
        let mut stores = self.open.stores.lock();

        loop {
            match stores.get(&path).map(Weak::upgrade) {
                Some(Some(store)) => {
                    debug!("Reusing open store {}", path.display());
                    return Ok(store);
                }
                // The last reference is gone and the store is finishing its
                // final flush; it removes the entry and signals when done.
                Some(None) => self.open.released.wait(&mut stores),
                None => {
                    let store = Arc::new(Store::load(
                        path.clone(),
                        config,
                        Arc::downgrade(&self.open),
                    )?);
                    stores.insert(path, Arc::downgrade(&store));
                    return Ok(store);
                }
            }
        }
    }

    /// Whether a live store exists for `path`
    pub fn is_open(&self, path: impl AsRef<Path>) -> bool {
        let Ok(path) = canonical_path(path.as_ref(), false) else {
            return false;
        };
        self.open
            .stores
            .lock()
            .get(&path)
            .map(|weak| weak.strong_count() > 0)
            .unwrap_or(false)
    }

    /// Number of live stores
    pub fn open_count(&self) -> usize {
        self.open
            .stores
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

/// Resolve `path` to an absolute path with symlinks and `..` removed
///
/// The file itself may not exist yet, so only its directory is canonicalized.
fn canonical_path(path: &Path, create_dirs: bool) -> Result<PathBuf> {
    let io_error = |source: std::io::Error| StorageError::Io {
        path: path.to_path_buf(),
        source,
    };

    let file_name = path.file_name().ok_or_else(|| {
        io_error(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "path does not name a file",
        ))
    })?;

    let parent = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent.to_path_buf(),
        None => std::env::current_dir().map_err(io_error)?,
    };

    if create_dirs {
        fs::create_dir_all(&parent).map_err(io_error)?;
    }

    let parent = fs::canonicalize(&parent).map_err(io_error)?;
    let joined = parent.join(file_name);

    // Resolve a symlinked backing file to its target
    match fs::canonicalize(&joined) {
        Ok(resolved) => Ok(resolved),
        Err(_) => Ok(joined),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StorageValue;
    use tempfile::TempDir;

    #[test]
    fn test_same_path_shares_instance() {
        let temp_dir = TempDir::new().unwrap();
        let registry = StoreRegistry::new();

        let a = registry
            .open(temp_dir.path().join("shared.tiny"), StoreConfig::default())
            .unwrap();
        let b = registry
            .open(
                temp_dir.path().join(".").join("shared.tiny"),
                StoreConfig::default(),
            )
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        a.set("written_through_a", 1).unwrap();
        assert_eq!(b.get_value("written_through_a"), Some(StorageValue::Int(1)));
        assert_eq!(registry.open_count(), 1);
    }

    #[test]
    fn test_entry_released_with_last_reference() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("released.tiny");
        let registry = StoreRegistry::new();

        let store = registry.open(&path, StoreConfig::default()).unwrap();
        store.set("kept", "on disk").unwrap();
        assert!(registry.is_open(&path));

        drop(store);
        assert!(!registry.is_open(&path));
        assert_eq!(registry.open_count(), 0);

        // A fresh instance reloads from the backing file
        let reopened = registry.open(&path, StoreConfig::default()).unwrap();
        assert_eq!(
            reopened.get_value("kept"),
            Some(StorageValue::String("on disk".to_string()))
        );
    }

    #[test]
    fn test_distinct_paths_are_independent() {
        let temp_dir = TempDir::new().unwrap();
        let registry = StoreRegistry::new();

        let a = registry
            .open(temp_dir.path().join("a.tiny"), StoreConfig::default())
            .unwrap();
        let b = registry
            .open(temp_dir.path().join("b.tiny"), StoreConfig::default())
            .unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.open_count(), 2);
    }

    #[test]
    fn test_missing_directory_without_create_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let registry = StoreRegistry::new();

        let result = registry.open(
            temp_dir.path().join("nope/store.tiny"),
            StoreConfig::default().with_create_dirs(false),
        );
        assert!(matches!(result, Err(StorageError::Io { .. })));
    }

    #[test]
    fn test_failed_open_is_not_registered() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("corrupt.tiny");
        fs::write(&path, b"garbage").unwrap();
        let registry = StoreRegistry::new();

        let result = registry.open(&path, StoreConfig::default());
        assert!(matches!(result, Err(StorageError::CorruptData { .. })));
        assert!(!registry.is_open(&path));
    }
}

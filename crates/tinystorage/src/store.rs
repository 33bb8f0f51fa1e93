//! Single-file store engine
//!
//! The whole mapping lives in memory behind one mutex and is mirrored to the
//! backing file by rewriting it completely on every flush. File writes are
//! serialized by a second per-store lock that is always taken before the
//! mapping lock, so the file only ever moves forward in mutation order.

use crate::error::{FlushError, Result, StorageError};
use crate::persistence::atomic::{cleanup_stale_temp_files, AtomicWriter};
use crate::persistence::handle::FlushHandle;
use crate::persistence::{self, format, FlushMode, PersistenceError, StoreConfig};
use crate::registry::{OpenStores, StoreRegistry};
use crate::types::{validate_key, StorageValue, ValueKind};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Callback receiving flush failures that no caller is waiting on
pub type FlushErrorHandler = Arc<dyn Fn(&FlushError) + Send + Sync>;

/// Persistence state of a loaded store
///
/// A store that failed to open never exists, so there is no unloaded state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    /// Backing file matches memory
    Clean,
    /// Memory has mutations that are not on disk yet
    Dirty,
    /// A flush is writing the backing file
    Flushing,
    /// The last flush failed; memory is intact and the next flush retries
    Failed,
}

struct Inner {
    entries: BTreeMap<String, StorageValue>,
    state: StoreState,
    /// Bumped on every effective mutation
    generation: u64,
    /// Generation captured by the last successful flush
    persisted_generation: u64,
    last_error: Option<FlushError>,
}

impl Inner {
    fn mark_mutated(&mut self) {
        self.generation += 1;
        if self.state != StoreState::Flushing {
            self.state = StoreState::Dirty;
        }
    }

    fn is_persisted(&self) -> bool {
        self.generation == self.persisted_generation
    }
}

/// State shared between a store and its background flusher
pub(crate) struct Shared {
    path: PathBuf,
    config: StoreConfig,
    inner: Mutex<Inner>,
    writer: Mutex<AtomicWriter>,
    error_handler: RwLock<Option<FlushErrorHandler>>,
}

impl Shared {
    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Write the current mapping to disk if it has unflushed mutations
    pub(crate) fn flush_now(&self) -> std::result::Result<(), FlushError> {
        let writer = self.writer.lock();

        let Some((bytes, generation)) = self.begin_flush()? else {
            return Ok(());
        };
        let result = writer.write(&bytes);
        self.finish_flush(generation, bytes.len(), result)
    }

    /// Encode the mapping and enter `Flushing`, `None` if nothing is pending
    ///
    /// Callers hold the writer lock until the matching `finish_flush`.
    fn begin_flush(&self) -> std::result::Result<Option<(Vec<u8>, u64)>, FlushError> {
        let mut inner = self.inner.lock();
        if inner.is_persisted() {
            return Ok(None);
        }

        inner.state = StoreState::Flushing;
        match format::encode(&inner.entries) {
            Ok(bytes) => Ok(Some((bytes, inner.generation))),
            Err(e) => {
                let err = FlushError::new(&self.path, e);
                inner.state = StoreState::Failed;
                inner.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Record the outcome of writing the mapping captured at `generation`
    fn finish_flush(
        &self,
        generation: u64,
        len: usize,
        result: persistence::Result<()>,
    ) -> std::result::Result<(), FlushError> {
        let mut inner = self.inner.lock();
        match result {
            Ok(()) => {
                inner.persisted_generation = generation;
                inner.last_error = None;
                // Mutations made while the file was written still need a flush
                inner.state = if inner.is_persisted() {
                    StoreState::Clean
                } else {
                    StoreState::Dirty
                };
                debug!(
                    "Flushed {} ({} bytes, generation {})",
                    self.path.display(),
                    len,
                    generation
                );
                Ok(())
            }
            Err(e) => {
                let err = FlushError::new(&self.path, e);
                inner.state = StoreState::Failed;
                inner.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Hand a flush failure to the registered handler
    pub(crate) fn report_flush_error(&self, err: &FlushError) {
        error!("{}", err);
        let handler = self.error_handler.read().clone();
        if let Some(handler) = handler {
            handler(err);
        }
    }
}

/// A key-value store backed by a single file
///
/// Obtain one through [`Store::open`] or [`StoreRegistry::open`]; both hand
/// out the same `Arc<Store>` for every alias of a path while it is alive.
pub struct Store {
    shared: Arc<Shared>,
    flusher: Option<FlushHandle>,
    registry: Weak<OpenStores>,
}

impl Store {
    /// Open the store at `path` with the default configuration
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Store>> {
        StoreRegistry::global().open(path, StoreConfig::default())
    }

    /// Open the store at `path`
    ///
    /// If the path is already open in this process the live instance is
    /// returned and `config` is ignored.
    pub fn open_with_config(path: impl AsRef<Path>, config: StoreConfig) -> Result<Arc<Store>> {
        StoreRegistry::global().open(path, config)
    }

    /// Load the backing file at an already canonical `path`
    pub(crate) fn load(
        path: PathBuf,
        config: StoreConfig,
        registry: Weak<OpenStores>,
    ) -> Result<Store> {
        match cleanup_stale_temp_files(&path) {
            Ok(0) => {}
            Ok(n) => info!("Removed {} stale temp file(s) next to {}", n, path.display()),
            Err(e) => warn!("Failed to scan for stale temp files of {}: {}", path.display(), e),
        }

        let entries = match persistence::load(&path) {
            Ok(Some(entries)) => entries,
            Ok(None) => {
                debug!("No backing file at {}, starting empty", path.display());
                BTreeMap::new()
            }
            Err(PersistenceError::Io(source)) => {
                return Err(StorageError::Io { path, source });
            }
            Err(source) => {
                return Err(StorageError::CorruptData { path, source });
            }
        };

        info!("Opened store {} ({} entries)", path.display(), entries.len());

        let shared = Arc::new(Shared {
            writer: Mutex::new(AtomicWriter::new(&path, config.fsync)),
            inner: Mutex::new(Inner {
                entries,
                state: StoreState::Clean,
                generation: 0,
                persisted_generation: 0,
                last_error: None,
            }),
            error_handler: RwLock::new(None),
            path,
            config,
        });

        let flusher = match shared.config.flush_mode {
            FlushMode::Immediate => None,
            FlushMode::Deferred => Some(FlushHandle::new(shared.clone()).map_err(|source| {
                StorageError::Io {
                    path: shared.path.clone(),
                    source,
                }
            })?),
        };

        Ok(Store {
            shared,
            flusher,
            registry,
        })
    }

    // ==================== Reads ====================

    /// Get a value, requiring it to carry the `expected` tag
    ///
    /// Missing keys are `Ok(None)`. A stored value of another kind is a
    /// [`StorageError::TypeMismatch`]; values are never coerced.
    pub fn get(&self, key: &str, expected: ValueKind) -> Result<Option<StorageValue>> {
        let inner = self.shared.inner.lock();
        match inner.entries.get(key) {
            None => Ok(None),
            Some(value) if value.kind() == expected => Ok(Some(value.clone())),
            Some(value) => Err(StorageError::TypeMismatch {
                key: key.to_string(),
                expected,
                actual: value.kind(),
            }),
        }
    }

    /// Get a value of any kind
    pub fn get_value(&self, key: &str) -> Option<StorageValue> {
        self.shared.inner.lock().entries.get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.shared.inner.lock().entries.contains_key(key)
    }

    /// All keys in sorted order
    pub fn keys(&self) -> Vec<String> {
        self.shared.inner.lock().entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.inner.lock().entries.is_empty()
    }

    /// Copy of the whole mapping
    pub fn snapshot(&self) -> BTreeMap<String, StorageValue> {
        self.shared.inner.lock().entries.clone()
    }

    // ==================== Mutations ====================

    /// Insert or overwrite a value
    ///
    /// The in-memory mapping is updated before this returns. With
    /// [`FlushMode::Immediate`] a failed write is returned as
    /// [`StorageError::Flush`] and the new value stays in memory.
    pub fn set(&self, key: impl Into<String>, value: impl Into<StorageValue>) -> Result<()> {
        let key = key.into();
        validate_key(&key)?;
        let value = value.into();

        self.mutate(|entries| {
            entries.insert(key, value);
            ((), true)
        })
    }

    /// Delete a key, returns whether it existed
    pub fn remove(&self, key: &str) -> Result<bool> {
        self.mutate(|entries| {
            let removed = entries.remove(key).is_some();
            (removed, removed)
        })
    }

    /// Delete every entry, returns how many were removed
    pub fn remove_all(&self) -> Result<usize> {
        self.mutate(|entries| {
            let count = entries.len();
            entries.clear();
            (count, count > 0)
        })
    }

    /// Insert several values under one lock acquisition and one flush
    ///
    /// Every key is validated before anything is applied.
    pub fn set_many<K, V, I>(&self, pairs: I) -> Result<()>
    where
        K: Into<String>,
        V: Into<StorageValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        let pairs = pairs
            .into_iter()
            .map(|(key, value)| {
                let key = key.into();
                validate_key(&key).map(|_| (key, value.into()))
            })
            .collect::<Result<Vec<_>>>()?;

        self.mutate(|entries| {
            let changed = !pairs.is_empty();
            entries.extend(pairs);
            ((), changed)
        })
    }

    /// Delete several keys with one flush, returns how many existed
    pub fn remove_many<I>(&self, keys: I) -> Result<usize>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.mutate(|entries| {
            let removed = keys
                .into_iter()
                .filter(|key| entries.remove(key.as_ref()).is_some())
                .count();
            (removed, removed > 0)
        })
    }

    /// Apply a mutation; the closure returns its output and whether anything changed
    fn mutate<T, F>(&self, apply: F) -> Result<T>
    where
        F: FnOnce(&mut BTreeMap<String, StorageValue>) -> (T, bool),
    {
        let (output, changed) = {
            let mut inner = self.shared.inner.lock();
            let (output, changed) = apply(&mut inner.entries);
            if changed {
                inner.mark_mutated();
            }
            (output, changed)
        };

        if changed {
            self.schedule_flush()?;
        }

        Ok(output)
    }

    fn schedule_flush(&self) -> Result<()> {
        match &self.flusher {
            Some(flusher) => {
                flusher.request_flush();
                Ok(())
            }
            None => self.shared.flush_now().map_err(StorageError::from),
        }
    }

    // ==================== Persistence ====================

    /// Write pending mutations now, regardless of flush mode
    pub fn flush(&self) -> Result<()> {
        self.shared.flush_now().map_err(StorageError::from)
    }

    /// Complete any pending flush and report its outcome
    ///
    /// The store stays usable; dropping the last reference performs the same
    /// final flush.
    pub fn close(&self) -> Result<()> {
        debug!("Closing store {}", self.shared.path.display());
        self.flush()
    }

    /// Register the callback for failures of deferred and final flushes
    ///
    /// The final flush failure is reported after the store has left its
    /// registry, so the handler may use the registry freely. A handler running
    /// on the flusher thread while the last reference is being dropped must
    /// not reopen this store's own path.
    pub fn set_flush_error_handler<F>(&self, handler: F)
    where
        F: Fn(&FlushError) + Send + Sync + 'static,
    {
        *self.shared.error_handler.write() = Some(Arc::new(handler));
    }

    pub fn clear_flush_error_handler(&self) {
        *self.shared.error_handler.write() = None;
    }

    pub fn state(&self) -> StoreState {
        self.shared.inner.lock().state
    }

    /// The failure of the most recent flush, cleared by the next successful one
    pub fn last_flush_error(&self) -> Option<FlushError> {
        self.shared.inner.lock().last_error.clone()
    }

    /// Canonical path of the backing file
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn config(&self) -> &StoreConfig {
        self.shared.config()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.shared.path)
            .field("state", &self.state())
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // The registry entry stays in place until the final flush is done, so
        // a concurrent open of this path waits instead of reading a stale file.
        let outcome = match self.flusher.take() {
            Some(flusher) => match flusher.shutdown() {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Flusher thread for {} panicked: {:?}", self.shared.path.display(), e);
                    Ok(())
                }
            },
            None => self.shared.flush_now(),
        };

        if let Some(open_stores) = self.registry.upgrade() {
            open_stores.release(&self.shared.path);
        }

        // No lock is held here, the handler may call back into the registry
        if let Err(e) = outcome {
            self.shared.report_flush_error(&e);
        }

        debug!("Released store {}", self.shared.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use tempfile::TempDir;

    fn open_store(temp_dir: &TempDir, registry: &StoreRegistry) -> Arc<Store> {
        registry
            .open(temp_dir.path().join("settings.tiny"), StoreConfig::default())
            .unwrap()
    }

    #[test]
    fn test_basic_set_get() {
        let temp_dir = TempDir::new().unwrap();
        let registry = StoreRegistry::new();
        let store = open_store(&temp_dir, &registry);

        store.set("greeting", "hello").unwrap();

        let result = store.get("greeting", ValueKind::String).unwrap();
        assert_eq!(result, Some(StorageValue::String("hello".to_string())));
    }

    #[test]
    fn test_get_nonexistent() {
        let temp_dir = TempDir::new().unwrap();
        let registry = StoreRegistry::new();
        let store = open_store(&temp_dir, &registry);

        assert_eq!(store.get("missing", ValueKind::Int).unwrap(), None);
        assert_eq!(store.get_value("missing"), None);
    }

    #[test]
    fn test_type_mismatch_never_coerces() {
        let temp_dir = TempDir::new().unwrap();
        let registry = StoreRegistry::new();
        let store = open_store(&temp_dir, &registry);

        store.set("count", 42).unwrap();

        let result = store.get("count", ValueKind::String);
        assert!(matches!(
            result,
            Err(StorageError::TypeMismatch {
                expected: ValueKind::String,
                actual: ValueKind::Int,
                ..
            })
        ));
        assert_eq!(store.get_value("count"), Some(StorageValue::Int(42)));
    }

    #[test]
    fn test_remove() {
        let temp_dir = TempDir::new().unwrap();
        let registry = StoreRegistry::new();
        let store = open_store(&temp_dir, &registry);

        store.set("to_remove", 1).unwrap();
        assert!(store.contains_key("to_remove"));

        assert!(store.remove("to_remove").unwrap());
        assert!(!store.contains_key("to_remove"));

        // Removing again is a no-op
        assert!(!store.remove("to_remove").unwrap());
        assert_eq!(store.state(), StoreState::Clean);
    }

    #[test]
    fn test_remove_all() {
        let temp_dir = TempDir::new().unwrap();
        let registry = StoreRegistry::new();
        let store = open_store(&temp_dir, &registry);

        store.set("a", 1).unwrap();
        store.set("b", 2).unwrap();

        assert_eq!(store.remove_all().unwrap(), 2);
        assert!(store.is_empty());
        assert_eq!(store.remove_all().unwrap(), 0);
    }

    #[test]
    fn test_batch_operations() {
        let temp_dir = TempDir::new().unwrap();
        let registry = StoreRegistry::new();
        let store = open_store(&temp_dir, &registry);

        store
            .set_many(vec![("k1", 1), ("k2", 2), ("k3", 3)])
            .unwrap();
        assert_eq!(store.keys(), vec!["k1", "k2", "k3"]);

        let removed = store.remove_many(["k1", "k3", "k9"]).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.keys(), vec!["k2"]);
    }

    #[test]
    fn test_set_many_rejects_invalid_key_atomically() {
        let temp_dir = TempDir::new().unwrap();
        let registry = StoreRegistry::new();
        let store = open_store(&temp_dir, &registry);

        let result = store.set_many(vec![("good", 1), ("", 2)]);
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_state_transitions() {
        let temp_dir = TempDir::new().unwrap();
        let registry = StoreRegistry::new();
        let store = registry
            .open(
                temp_dir.path().join("state.tiny"),
                StoreConfig::deferred().with_flush_delay_ms(10_000),
            )
            .unwrap();

        assert_eq!(store.state(), StoreState::Clean);

        store.set("key", true).unwrap();
        assert_eq!(store.state(), StoreState::Dirty);

        store.flush().unwrap();
        assert_eq!(store.state(), StoreState::Clean);
        assert!(store.last_flush_error().is_none());
    }

    #[test]
    fn test_flush_failure_keeps_memory() {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("data");
        let registry = StoreRegistry::new();
        let store = registry
            .open(data_dir.join("prefs.tiny"), StoreConfig::default())
            .unwrap();

        store.set("before", 1).unwrap();
        std::fs::remove_dir_all(&data_dir).unwrap();

        let result = store.set("after", 2);
        assert!(matches!(result, Err(ref e) if e.is_flush_failure()));
        assert_eq!(store.state(), StoreState::Failed);
        assert!(store.last_flush_error().is_some());

        // Nothing accepted into memory is lost
        assert_eq!(store.get_value("before"), Some(StorageValue::Int(1)));
        assert_eq!(store.get_value("after"), Some(StorageValue::Int(2)));

        std::fs::create_dir_all(&data_dir).unwrap();
        store.flush().unwrap();
        assert_eq!(store.state(), StoreState::Clean);
        assert!(store.last_flush_error().is_none());

        let on_disk = persistence::load(store.path()).unwrap().unwrap();
        assert_eq!(on_disk.len(), 2);
    }

    #[test]
    fn test_final_flush_failure_reaches_handler() {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("data");
        let registry = StoreRegistry::new();
        let failures = Arc::new(AtomicUsize::new(0));

        {
            let store = registry
                .open(
                    data_dir.join("prefs.tiny"),
                    StoreConfig::deferred().with_flush_delay_ms(10_000),
                )
                .unwrap();
            let counter = failures.clone();
            store.set_flush_error_handler(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

            store.set("key", "value").unwrap();
            std::fs::remove_dir_all(&data_dir).unwrap();
        }

        assert!(failures.load(Ordering::SeqCst) >= 1);
    }

    /// Drop the store on another thread, failing the test if it never returns
    fn drop_within_deadline(store: Arc<Store>) {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            drop(store);
            let _ = done_tx.send(());
        });
        assert!(
            done_rx.recv_timeout(std::time::Duration::from_secs(5)).is_ok(),
            "drop did not return"
        );
    }

    #[test]
    fn test_final_flush_handler_can_use_registry() {
        for config in [
            StoreConfig::default(),
            StoreConfig::deferred().with_flush_delay_ms(10_000),
        ] {
            let temp_dir = TempDir::new().unwrap();
            let data_dir = temp_dir.path().join("data");
            let path = data_dir.join("prefs.tiny");
            let registry = Arc::new(StoreRegistry::new());
            let seen_open = Arc::new(AtomicUsize::new(usize::MAX));

            let store = registry.open(&path, config).unwrap();
            {
                let registry = registry.clone();
                let seen_open = seen_open.clone();
                let path = path.clone();
                store.set_flush_error_handler(move |_| {
                    assert!(!registry.is_open(&path));
                    seen_open.store(registry.open_count(), Ordering::SeqCst);
                });
            }

            // Leave one mutation unflushed for the final flush
            if store.config().flush_mode == FlushMode::Immediate {
                std::fs::remove_dir_all(&data_dir).unwrap();
                assert!(store.set("key", 1).is_err());
            } else {
                store.set("key", 1).unwrap();
                std::fs::remove_dir_all(&data_dir).unwrap();
            }

            drop_within_deadline(store);
            assert_eq!(seen_open.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn test_reopen_waits_for_final_flush() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("handoff.tiny");
        let registry = Arc::new(StoreRegistry::new());

        for round in 0..20i64 {
            let store = registry
                .open(&path, StoreConfig::deferred().with_flush_delay_ms(10_000))
                .unwrap();
            let previous = if round == 0 { None } else { Some(round - 1) };
            assert_eq!(store.get_int("round").unwrap(), previous);
            store.set("round", round).unwrap();

            let dropper = thread::spawn(move || drop(store));
            let reopened = registry.open(&path, StoreConfig::default()).unwrap();
            dropper.join().unwrap();

            // Either the old instance was still alive or the file was flushed
            assert_eq!(reopened.get_int("round").unwrap(), Some(round));
        }
    }

    #[test]
    fn test_mutation_during_flush_leaves_store_dirty() {
        let temp_dir = TempDir::new().unwrap();
        let registry = StoreRegistry::new();
        let store = registry
            .open(
                temp_dir.path().join("inflight.tiny"),
                StoreConfig::deferred().with_flush_delay_ms(10_000),
            )
            .unwrap();

        store.set("early", 1).unwrap();
        assert_eq!(store.state(), StoreState::Dirty);

        // Run a flush by hand and mutate between encoding and commit
        let writer = store.shared.writer.lock();
        let (bytes, generation) = store.shared.begin_flush().unwrap().unwrap();
        assert_eq!(store.state(), StoreState::Flushing);

        store.set("late", 2).unwrap();
        assert_eq!(store.state(), StoreState::Flushing);

        let result = writer.write(&bytes);
        store.shared.finish_flush(generation, bytes.len(), result).unwrap();
        drop(writer);

        // The file holds "early" only, so the store is still dirty
        assert_eq!(store.state(), StoreState::Dirty);
        let on_disk = persistence::load(store.path()).unwrap().unwrap();
        assert!(on_disk.contains_key("early"));
        assert!(!on_disk.contains_key("late"));

        store.flush().unwrap();
        assert_eq!(store.state(), StoreState::Clean);
        let on_disk = persistence::load(store.path()).unwrap().unwrap();
        assert_eq!(on_disk.get("late"), Some(&StorageValue::Int(2)));
    }

    #[test]
    fn test_concurrent_access() {
        let temp_dir = TempDir::new().unwrap();
        let registry = StoreRegistry::new();
        let store = registry
            .open(
                temp_dir.path().join("concurrent.tiny"),
                StoreConfig::default().with_fsync(false),
            )
            .unwrap();
        let mut handles = vec![];

        // Spawn 8 threads, each writing 25 distinct keys
        for t in 0..8 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for i in 0..25 {
                    store.set(format!("t{}_{}", t, i), i as i64).unwrap();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 200);
        let on_disk = persistence::load(store.path()).unwrap().unwrap();
        assert_eq!(on_disk.len(), 200);
    }
}

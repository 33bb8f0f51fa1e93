//! Small single-file key-value store for application settings
//!
//! # Features
//! - Typed values (bool, i64, f64, strings, bytes, nested lists and maps)
//! - Whole-file persistence through a temp file and an atomic rename
//! - Immediate or deferred (background thread) flushing
//! - One live store per backing file per process, shared through a registry
//!
//! ```no_run
//! use tinystorage::{Store, ValueKind};
//!
//! let store = Store::open("settings.tiny")?;
//! store.set("launch_count", 42)?;
//! assert_eq!(store.get_as::<i64>("launch_count")?, Some(42));
//! assert!(store.get("launch_count", ValueKind::String).is_err());
//! store.close()?;
//! # Ok::<(), tinystorage::StorageError>(())
//! ```

pub mod error;
pub mod persistence;
pub mod registry;
pub mod store;
pub mod typed;
pub mod types;

pub use error::{FlushError, Result, StorageError};
pub use persistence::{FlushMode, PersistenceError, StoreConfig};
pub use registry::StoreRegistry;
pub use store::{FlushErrorHandler, Store, StoreState};
pub use typed::StoreValue;
pub use types::{StorageValue, ValueKind, MAX_KEY_LEN};

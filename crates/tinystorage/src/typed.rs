//! Typed accessors
//!
//! [`StoreValue`] maps Rust types onto [`ValueKind`] tags so reads can be
//! written as `store.get_as::<i64>("count")` instead of matching on
//! [`StorageValue`] by hand.

use crate::error::{Result, StorageError};
use crate::store::Store;
use crate::types::{StorageValue, ValueKind};
use std::collections::BTreeMap;

/// A Rust type that can be read from and written to a store
pub trait StoreValue: Sized {
    /// The tag this type is stored under, `None` if it accepts every tag
    const KIND: Option<ValueKind>;

    /// Extract `Self`, or `None` if `value` carries another tag
    fn from_storage(value: StorageValue) -> Option<Self>;

    fn into_storage(self) -> StorageValue;
}

macro_rules! impl_store_value {
    ($ty:ty, $variant:ident) => {
        impl StoreValue for $ty {
            const KIND: Option<ValueKind> = Some(ValueKind::$variant);

            fn from_storage(value: StorageValue) -> Option<Self> {
                match value {
                    StorageValue::$variant(inner) => Some(inner),
                    _ => None,
                }
            }

            fn into_storage(self) -> StorageValue {
                StorageValue::$variant(self)
            }
        }
    };
}

impl_store_value!(bool, Bool);
impl_store_value!(i64, Int);
impl_store_value!(f64, Float);
impl_store_value!(String, String);
impl_store_value!(Vec<u8>, Bytes);
impl_store_value!(Vec<StorageValue>, List);
impl_store_value!(BTreeMap<String, StorageValue>, Map);

// Narrower integers are stored as Int and refuse values that do not fit
impl StoreValue for i32 {
    const KIND: Option<ValueKind> = Some(ValueKind::Int);

    fn from_storage(value: StorageValue) -> Option<Self> {
        match value {
            StorageValue::Int(inner) => i32::try_from(inner).ok(),
            _ => None,
        }
    }

    fn into_storage(self) -> StorageValue {
        StorageValue::Int(self as i64)
    }
}

impl StoreValue for StorageValue {
    const KIND: Option<ValueKind> = None;

    fn from_storage(value: StorageValue) -> Option<Self> {
        Some(value)
    }

    fn into_storage(self) -> StorageValue {
        self
    }
}

impl Store {
    /// Get a value as `T`
    ///
    /// Returns [`StorageError::TypeMismatch`] when the stored tag is not
    /// `T::KIND`, or when an `Int` does not fit a narrower integer type.
    pub fn get_as<T: StoreValue>(&self, key: &str) -> Result<Option<T>> {
        let value = match T::KIND {
            Some(kind) => self.get(key, kind)?,
            None => self.get_value(key),
        };
        let Some(value) = value else {
            return Ok(None);
        };

        let actual = value.kind();
        T::from_storage(value)
            .map(Some)
            .ok_or_else(|| StorageError::TypeMismatch {
                key: key.to_string(),
                expected: T::KIND.unwrap_or(actual),
                actual,
            })
    }

    /// Get a value as `T`, falling back to `default` when the key is missing
    pub fn get_or<T: StoreValue>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.get_as(key)?.unwrap_or(default))
    }

    /// Store a typed value
    pub fn set_as<T: StoreValue>(&self, key: impl Into<String>, value: T) -> Result<()> {
        self.set(key, value.into_storage())
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        self.get_as(key)
    }

    pub fn get_int(&self, key: &str) -> Result<Option<i64>> {
        self.get_as(key)
    }

    pub fn get_float(&self, key: &str) -> Result<Option<f64>> {
        self.get_as(key)
    }

    pub fn get_string(&self, key: &str) -> Result<Option<String>> {
        self.get_as(key)
    }

    pub fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.get_as(key)
    }
}

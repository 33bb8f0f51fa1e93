//! Store data types
//!
//! Values carry their own tag so a backing file can be decoded without any
//! external schema.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::StorageError;

/// Maximum key length in bytes
pub const MAX_KEY_LEN: usize = 1024;

/// Reject empty keys and keys longer than [`MAX_KEY_LEN`]
pub(crate) fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("empty key not allowed".to_string()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(StorageError::InvalidKey(format!(
            "key too long: {} bytes (max {})",
            key.len(),
            MAX_KEY_LEN
        )));
    }
    Ok(())
}

/// Value types supported by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StorageValue {
    /// Boolean flag
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit floating point
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// Ordered list of values
    List(Vec<StorageValue>),
    /// Nested dictionary
    Map(BTreeMap<String, StorageValue>),
}

impl StorageValue {
    /// The tag of this value
    pub fn kind(&self) -> ValueKind {
        match self {
            StorageValue::Bool(_) => ValueKind::Bool,
            StorageValue::Int(_) => ValueKind::Int,
            StorageValue::Float(_) => ValueKind::Float,
            StorageValue::String(_) => ValueKind::String,
            StorageValue::Bytes(_) => ValueKind::Bytes,
            StorageValue::List(_) => ValueKind::List,
            StorageValue::Map(_) => ValueKind::Map,
        }
    }
}

/// Discriminant of a [`StorageValue`], used for typed reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    String,
    Bytes,
    List,
    Map,
}

impl ValueKind {
    pub const ALL: [ValueKind; 7] = [
        ValueKind::Bool,
        ValueKind::Int,
        ValueKind::Float,
        ValueKind::String,
        ValueKind::Bytes,
        ValueKind::List,
        ValueKind::Map,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::String => "string",
            ValueKind::Bytes => "bytes",
            ValueKind::List => "list",
            ValueKind::Map => "map",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ValueKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ValueKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown value kind: {}", s))
    }
}

impl From<bool> for StorageValue {
    fn from(value: bool) -> Self {
        StorageValue::Bool(value)
    }
}

impl From<i64> for StorageValue {
    fn from(value: i64) -> Self {
        StorageValue::Int(value)
    }
}

impl From<i32> for StorageValue {
    fn from(value: i32) -> Self {
        StorageValue::Int(value as i64)
    }
}

impl From<u32> for StorageValue {
    fn from(value: u32) -> Self {
        StorageValue::Int(value as i64)
    }
}

impl From<f64> for StorageValue {
    fn from(value: f64) -> Self {
        StorageValue::Float(value)
    }
}

impl From<f32> for StorageValue {
    fn from(value: f32) -> Self {
        StorageValue::Float(value as f64)
    }
}

impl From<String> for StorageValue {
    fn from(value: String) -> Self {
        StorageValue::String(value)
    }
}

impl From<&str> for StorageValue {
    fn from(value: &str) -> Self {
        StorageValue::String(value.to_string())
    }
}

impl From<Vec<u8>> for StorageValue {
    fn from(value: Vec<u8>) -> Self {
        StorageValue::Bytes(value)
    }
}

impl From<&[u8]> for StorageValue {
    fn from(value: &[u8]) -> Self {
        StorageValue::Bytes(value.to_vec())
    }
}

impl From<Vec<StorageValue>> for StorageValue {
    fn from(value: Vec<StorageValue>) -> Self {
        StorageValue::List(value)
    }
}

impl From<BTreeMap<String, StorageValue>> for StorageValue {
    fn from(value: BTreeMap<String, StorageValue>) -> Self {
        StorageValue::Map(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(StorageValue::from(true).kind(), ValueKind::Bool);
        assert_eq!(StorageValue::from(7i32).kind(), ValueKind::Int);
        assert_eq!(StorageValue::from(1.5).kind(), ValueKind::Float);
        assert_eq!(StorageValue::from("x").kind(), ValueKind::String);
        assert_eq!(StorageValue::from(vec![1u8, 2]).kind(), ValueKind::Bytes);
        assert_eq!(StorageValue::List(vec![]).kind(), ValueKind::List);
        assert_eq!(StorageValue::Map(BTreeMap::new()).kind(), ValueKind::Map);
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("INT".parse::<ValueKind>().unwrap(), ValueKind::Int);
        assert_eq!("bytes".parse::<ValueKind>().unwrap(), ValueKind::Bytes);
        assert!("decimal".parse::<ValueKind>().is_err());
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("theme").is_ok());
        assert!(matches!(validate_key(""), Err(StorageError::InvalidKey(_))));
        let long = "k".repeat(MAX_KEY_LEN + 1);
        assert!(matches!(validate_key(&long), Err(StorageError::InvalidKey(_))));
    }
}

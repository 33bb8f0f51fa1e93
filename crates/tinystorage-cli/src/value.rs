//! Conversion between command-line text, JSON and store values

use anyhow::{anyhow, bail, Context, Result};
use clap::ValueEnum;
use serde_json::{Map, Number, Value};
use tinystorage::{StorageValue, ValueKind};

/// How a value argument on the command line is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InputKind {
    Bool,
    Int,
    Float,
    String,
    /// Hex-encoded bytes
    Bytes,
    /// Any JSON value; arrays become lists and objects become maps
    Json,
}

impl InputKind {
    /// The stored tag a read with this kind requires, `None` for any
    pub fn value_kind(self) -> Option<ValueKind> {
        match self {
            InputKind::Bool => Some(ValueKind::Bool),
            InputKind::Int => Some(ValueKind::Int),
            InputKind::Float => Some(ValueKind::Float),
            InputKind::String => Some(ValueKind::String),
            InputKind::Bytes => Some(ValueKind::Bytes),
            InputKind::Json => None,
        }
    }
}

pub fn parse_value(raw: &str, kind: InputKind) -> Result<StorageValue> {
    let value = match kind {
        InputKind::Bool => StorageValue::Bool(
            raw.parse()
                .with_context(|| format!("'{}' is not a bool (true/false)", raw))?,
        ),
        InputKind::Int => StorageValue::Int(
            raw.parse()
                .with_context(|| format!("'{}' is not a 64-bit integer", raw))?,
        ),
        InputKind::Float => StorageValue::Float(
            raw.parse()
                .with_context(|| format!("'{}' is not a float", raw))?,
        ),
        InputKind::String => StorageValue::String(raw.to_string()),
        InputKind::Bytes => StorageValue::Bytes(
            hex::decode(raw).with_context(|| format!("'{}' is not valid hex", raw))?,
        ),
        InputKind::Json => {
            let json: Value = serde_json::from_str(raw).context("Invalid JSON")?;
            from_json(json)?
        }
    };
    Ok(value)
}

/// Convert JSON into a store value
///
/// Integers that fit i64 become `Int`, other numbers `Float`. JSON has no
/// null in the store's value model, so `null` is rejected.
pub fn from_json(json: Value) -> Result<StorageValue> {
    match json {
        Value::Null => bail!("null cannot be stored"),
        Value::Bool(b) => Ok(StorageValue::Bool(b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(StorageValue::Int(i)),
            None => n
                .as_f64()
                .map(StorageValue::Float)
                .ok_or_else(|| anyhow!("number {} is out of range", n)),
        },
        Value::String(s) => Ok(StorageValue::String(s)),
        Value::Array(items) => items
            .into_iter()
            .map(from_json)
            .collect::<Result<Vec<_>>>()
            .map(StorageValue::List),
        Value::Object(fields) => fields
            .into_iter()
            .map(|(k, v)| from_json(v).map(|v| (k, v)))
            .collect::<Result<_>>()
            .map(StorageValue::Map),
    }
}

/// Convert a store value into JSON, bytes are rendered as a hex string
pub fn to_json(value: &StorageValue) -> Value {
    match value {
        StorageValue::Bool(b) => Value::Bool(*b),
        StorageValue::Int(i) => Value::Number((*i).into()),
        // NaN and infinities have no JSON form
        StorageValue::Float(f) => Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(f.to_string())),
        StorageValue::String(s) => Value::String(s.clone()),
        StorageValue::Bytes(bytes) => Value::String(hex::encode(bytes)),
        StorageValue::List(items) => Value::Array(items.iter().map(to_json).collect()),
        StorageValue::Map(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), to_json(v)))
                .collect::<Map<_, _>>(),
        ),
    }
}

/// Render a value for `get`: strings unquoted, bytes as hex, the rest as JSON
pub fn display(value: &StorageValue) -> String {
    match value {
        StorageValue::String(s) => s.clone(),
        StorageValue::Bytes(bytes) => hex::encode(bytes),
        other => to_json(other).to_string(),
    }
}

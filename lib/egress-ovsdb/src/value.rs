//! OVSDB value encoding
//!
//! Atoms are plain JSON scalars, except uuids: `["uuid", "<id>"]` and
//! `["named-uuid", "<name>"]`. Sets are `["set", [...]]` (a single-element
//! set may also be sent as the bare atom) and maps `["map", [[k, v], ...]]`.

use crate::{OvsdbError, Result};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub fn uuid(id: &str) -> Value {
    json!(["uuid", id])
}

pub fn named_uuid(name: &str) -> Value {
    json!(["named-uuid", name])
}

pub fn string_set<S: AsRef<str>>(items: &[S]) -> Value {
    let items: Vec<Value> = items.iter().map(|s| Value::from(s.as_ref())).collect();
    json!(["set", items])
}

pub fn uuid_set<S: AsRef<str>>(items: &[S]) -> Value {
    let items: Vec<Value> = items.iter().map(|s| uuid(s.as_ref())).collect();
    json!(["set", items])
}

pub fn map(entries: &BTreeMap<String, String>) -> Value {
    let pairs: Vec<Value> = entries.iter().map(|(k, v)| json!([k, v])).collect();
    json!(["map", pairs])
}

/// `column == value` condition
pub fn eq(column: &str, value: Value) -> Value {
    json!([column, "==", value])
}

/// Condition matching rows whose map column includes every entry of `entries`
pub fn includes(column: &str, entries: &BTreeMap<String, String>) -> Value {
    json!([column, "includes", map(entries)])
}

fn tagged<'a>(value: &'a Value, tag: &str) -> Option<&'a Value> {
    match value.as_array().map(Vec::as_slice) {
        Some([Value::String(t), inner]) if t == tag => Some(inner),
        _ => None,
    }
}

fn atom_string(value: &Value) -> Result<String> {
    if let Some(s) = value.as_str() {
        return Ok(s.to_string());
    }
    match tagged(value, "uuid").and_then(Value::as_str) {
        Some(id) => Ok(id.to_string()),
        None => Err(OvsdbError::Decode(format!("expected a string or uuid atom, got {}", value))),
    }
}

pub fn decode_string(value: &Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| OvsdbError::Decode(format!("expected a string, got {}", value)))
}

/// Decode a uuid atom
pub fn decode_uuid(value: &Value) -> Result<String> {
    tagged(value, "uuid")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| OvsdbError::Decode(format!("expected a uuid, got {}", value)))
}

/// Decode a set of strings or uuids, accepting a bare atom as a
/// single-element set
pub fn decode_strings(value: &Value) -> Result<Vec<String>> {
    match tagged(value, "set") {
        Some(Value::Array(items)) => items.iter().map(atom_string).collect(),
        Some(other) => Err(OvsdbError::Decode(format!("malformed set {}", other))),
        None => Ok(vec![atom_string(value)?]),
    }
}

pub fn decode_map(value: &Value) -> Result<BTreeMap<String, String>> {
    let Some(Value::Array(pairs)) = tagged(value, "map") else {
        return Err(OvsdbError::Decode(format!("expected a map, got {}", value)));
    };
    pairs
        .iter()
        .map(|pair| match pair.as_array().map(Vec::as_slice) {
            Some([k, v]) => Ok((atom_string(k)?, atom_string(v)?)),
            _ => Err(OvsdbError::Decode(format!("malformed map entry {}", pair))),
        })
        .collect()
}

pub fn decode_i64(value: &Value) -> Result<i64> {
    value
        .as_i64()
        .ok_or_else(|| OvsdbError::Decode(format!("expected an integer, got {}", value)))
}

/// Decode an optional integer column, stored as a set of at most one atom
pub fn decode_optional_i64(value: &Value) -> Result<Option<i64>> {
    match tagged(value, "set") {
        Some(Value::Array(items)) => match items.as_slice() {
            [] => Ok(None),
            [item] => decode_i64(item).map(Some),
            _ => Err(OvsdbError::Decode(format!("expected at most one integer, got {}", value))),
        },
        Some(other) => Err(OvsdbError::Decode(format!("malformed set {}", other))),
        None => decode_i64(value).map(Some),
    }
}

/// Column of a selected row
pub fn column<'a>(row: &'a Value, name: &str) -> Result<&'a Value> {
    row.get(name)
        .ok_or_else(|| OvsdbError::Decode(format!("row has no column {}", name)))
}

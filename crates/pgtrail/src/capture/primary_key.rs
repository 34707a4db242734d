//! Primary-key extraction
//!
//! Turns a captured row into the stable string identity stored in
//! `record_id`. Single-column keys stringify directly; composite keys
//! serialize as an ordered JSON object through a tolerant encoder so that
//! oversized integers and pathological nesting never abort capture.

use serde_json::Value as JsonValue;

use crate::config::AuditConfig;
use crate::error::{AuditError, AuditResult};
use crate::record::JsonMap;

/// Largest integer magnitude that round-trips losslessly through an IEEE 754
/// double. Integers beyond it are encoded as decimal strings so downstream
/// JSON consumers cannot corrupt them.
const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Nesting depth at which the encoder stops descending and substitutes the
/// `"[Circular]"` marker.
const MAX_ENCODE_DEPTH: usize = 32;

/// Extract the `record_id` for `row` in `table`.
///
/// Fails with a configuration error when no primary key is configured for
/// the table, and with a capture error when the row is missing (or carries
/// null in) any configured key column.
pub fn extract_record_id(row: &JsonMap, table: &str, config: &AuditConfig) -> AuditResult<String> {
    let pk = config.primary_key(table).ok_or_else(|| {
        AuditError::configuration(format!("primaryKey required for table {table}"))
    })?;

    let keys = pk.columns();

    for key in keys {
        match row.get(key.as_str()) {
            Some(value) if !value.is_null() => {}
            _ => {
                return Err(AuditError::capture(format!(
                    "record missing configured primaryKey field(s) for table {table}"
                )))
            }
        }
    }

    if let [key] = keys {
        return Ok(scalar_to_string(&row[key.as_str()]));
    }

    let pairs: Vec<(&str, &JsonValue)> = keys
        .iter()
        .map(|key| (key.as_str(), &row[key.as_str()]))
        .collect();

    Ok(encode_composite_key(&pairs))
}

/// Stringify a scalar key value the way it reads in SQL.
fn scalar_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        other => encode_composite_value(other, 0),
    }
}

/// Encode an ordered set of key columns as a JSON object string.
///
/// Falls back to a lossy but stable identity when serialization fails.
pub fn encode_composite_key(pairs: &[(&str, &JsonValue)]) -> String {
    let mut object = JsonMap::new();
    for (key, value) in pairs {
        object.insert((*key).to_string(), sanitize_value(value, 0));
    }

    match serde_json::to_string(&JsonValue::Object(object)) {
        Ok(encoded) => encoded,
        Err(_) => fallback_composite_key(pairs),
    }
}

fn encode_composite_value(value: &JsonValue, depth: usize) -> String {
    serde_json::to_string(&sanitize_value(value, depth)).unwrap_or_else(|_| "null".to_string())
}

/// Rewrite a value so the encoder cannot lose integer precision or recurse
/// without bound.
fn sanitize_value(value: &JsonValue, depth: usize) -> JsonValue {
    if depth > MAX_ENCODE_DEPTH {
        return JsonValue::String("[Circular]".to_string());
    }

    match value {
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i.unsigned_abs() > MAX_SAFE_INTEGER {
                    return JsonValue::String(i.to_string());
                }
            } else if let Some(u) = n.as_u64() {
                if u > MAX_SAFE_INTEGER {
                    return JsonValue::String(u.to_string());
                }
            }
            value.clone()
        }
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize_value(v, depth + 1)))
                .collect(),
        ),
        JsonValue::Array(items) => JsonValue::Array(
            items.iter().map(|v| sanitize_value(v, depth + 1)).collect(),
        ),
        _ => value.clone(),
    }
}

/// Stable fallback identity when the composite key cannot be serialized:
/// the sorted key names joined by underscores plus the key count.
pub fn fallback_composite_key(pairs: &[(&str, &JsonValue)]) -> String {
    let mut keys: Vec<&str> = pairs.iter().map(|(k, _)| *k).collect();
    keys.sort_unstable();
    format!("composite_key_{}_{}", keys.join("_"), pairs.len())
}

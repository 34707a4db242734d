//! Row decoding
//!
//! Converts driver rows into ordered JSON objects keyed by column name so
//! the capture pipeline can filter, diff, and serialize them uniformly.
//! Handles the common PostgreSQL types; anything else degrades to its text
//! representation.

use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};

use crate::record::JsonMap;

/// Decode a full row into an ordered column → value map.
pub fn row_to_map(row: &PgRow) -> Result<JsonMap, sqlx::Error> {
    let mut map = JsonMap::new();

    for (idx, column) in row.columns().iter().enumerate() {
        let value = decode_column(row, idx, column.type_info().name())?;
        map.insert(column.name().to_string(), value);
    }

    Ok(map)
}

/// Convert one PostgreSQL value to JSON.
fn decode_column(row: &PgRow, idx: usize, type_name: &str) -> Result<JsonValue, sqlx::Error> {
    if row.try_get_raw(idx)?.is_null() {
        return Ok(JsonValue::Null);
    }

    let value = match type_name {
        "BOOL" => {
            let v: bool = row.try_get(idx)?;
            JsonValue::Bool(v)
        }
        "INT2" => {
            let v: i16 = row.try_get(idx)?;
            JsonValue::Number(v.into())
        }
        "INT4" => {
            let v: i32 = row.try_get(idx)?;
            JsonValue::Number(v.into())
        }
        "INT8" => {
            let v: i64 = row.try_get(idx)?;
            JsonValue::Number(v.into())
        }
        "FLOAT4" => {
            let v: f32 = row.try_get(idx)?;
            serde_json::json!(v)
        }
        "FLOAT8" | "NUMERIC" => {
            let v: f64 = row.try_get(idx)?;
            serde_json::json!(v)
        }
        "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" | "CITEXT" => {
            let v: String = row.try_get(idx)?;
            JsonValue::String(v)
        }
        "UUID" => {
            let v: uuid::Uuid = row.try_get(idx)?;
            JsonValue::String(v.to_string())
        }
        "TIMESTAMPTZ" => {
            let v: chrono::DateTime<chrono::Utc> = row.try_get(idx)?;
            JsonValue::String(v.to_rfc3339())
        }
        "TIMESTAMP" => {
            let v: chrono::NaiveDateTime = row.try_get(idx)?;
            JsonValue::String(v.to_string())
        }
        "DATE" => {
            let v: chrono::NaiveDate = row.try_get(idx)?;
            JsonValue::String(v.to_string())
        }
        "JSON" | "JSONB" => {
            let v: JsonValue = row.try_get(idx)?;
            v
        }
        _ => {
            // Fallback: surface the text form rather than failing capture.
            let v: String = row
                .try_get(idx)
                .unwrap_or_else(|_| format!("<{}>", type_name));
            JsonValue::String(v)
        }
    };

    Ok(value)
}

//! Field filtering and change detection
//!
//! Pure helpers shared by the capture transforms: project a captured row
//! down to its permitted columns and compute which columns actually changed
//! between two states.

use serde_json::Value as JsonValue;

use crate::config::AuditConfig;
use crate::record::JsonMap;

/// Project `row` to the columns permitted for `table`.
///
/// When `fields[table]` is configured, only those columns are kept and the
/// output follows the configured order; otherwise every column passes in row
/// order. Globally excluded columns are always removed.
pub fn filter_fields(row: &JsonMap, table: &str, config: &AuditConfig) -> JsonMap {
    let excluded = |name: &str| config.exclude_fields.iter().any(|f| f == name);

    match config.fields.get(table) {
        Some(allowed) => allowed
            .iter()
            .filter(|name| !excluded(name))
            .filter_map(|name| row.get(name.as_str()).map(|v| (name.clone(), v.clone())))
            .collect(),
        None => row
            .iter()
            .filter(|(name, _)| !excluded(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect(),
    }
}

/// Columns of `after` whose value differs from `before`.
///
/// A column present only in `after` counts as changed. Returns an empty map
/// when nothing changed.
pub fn changed_values(before: &JsonMap, after: &JsonMap) -> JsonMap {
    after
        .iter()
        .filter(|(name, value)| match before.get(name.as_str()) {
            Some(previous) => !values_equal(previous, value),
            None => true,
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Structural equality over JSON values.
///
/// Numbers compare numerically across integer and float representations so
/// a column that round-trips through different driver decodings does not
/// register as a change; everything else compares deeply.
pub fn values_equal(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => {
            if let (Some(xi), Some(yi)) = (x.as_i64(), y.as_i64()) {
                return xi == yi;
            }
            if let (Some(xu), Some(yu)) = (x.as_u64(), y.as_u64()) {
                return xu == yu;
            }
            match (x.as_f64(), y.as_f64()) {
                (Some(xf), Some(yf)) => xf == yf,
                _ => false,
            }
        }
        (JsonValue::Object(x), JsonValue::Object(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
        }
        (JsonValue::Array(x), JsonValue::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(v, w)| values_equal(v, w))
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: serde_json::Value) -> JsonMap {
        match value {
            JsonValue::Object(m) => m,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_filter_keeps_all_columns_without_allowlist() {
        let config = AuditConfig::default();
        let row = map(json!({"id": 1, "email": "a@x", "name": "A"}));

        let filtered = filter_fields(&row, "users", &config);

        assert_eq!(filtered.len(), 3);
        let keys: Vec<&String> = filtered.keys().collect();
        assert_eq!(keys, ["id", "email", "name"]);
    }

    #[test]
    fn test_filter_follows_configured_order() {
        let config = AuditConfig::builder()
            .fields("users", ["name", "email"])
            .build();
        let row = map(json!({"id": 1, "email": "a@x", "name": "A"}));

        let filtered = filter_fields(&row, "users", &config);

        let keys: Vec<&String> = filtered.keys().collect();
        assert_eq!(keys, ["name", "email"]);
    }

    #[test]
    fn test_filter_redacts_excluded_columns() {
        let config = AuditConfig::default();
        let row = map(json!({"id": 1, "password": "hunter2", "token": "t", "name": "A"}));

        let filtered = filter_fields(&row, "users", &config);

        assert!(!filtered.contains_key("password"));
        assert!(!filtered.contains_key("token"));
        assert_eq!(filtered["name"], json!("A"));
    }

    #[test]
    fn test_filter_redacts_even_allowlisted_columns() {
        let config = AuditConfig::builder()
            .fields("users", ["name", "password"])
            .build();
        let row = map(json!({"password": "hunter2", "name": "A"}));

        let filtered = filter_fields(&row, "users", &config);

        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("name"));
    }

    #[test]
    fn test_changed_values_diff() {
        let before = map(json!({"name": "Original", "email": "o@x", "age": 30}));
        let after = map(json!({"name": "Updated", "email": "o@x", "age": 30}));

        let changed = changed_values(&before, &after);

        assert_eq!(changed.len(), 1);
        assert_eq!(changed["name"], json!("Updated"));
    }

    #[test]
    fn test_changed_values_empty_when_identical() {
        let state = map(json!({"name": "Same", "tags": ["a", "b"]}));
        assert!(changed_values(&state, &state.clone()).is_empty());
    }

    #[test]
    fn test_new_key_counts_as_changed() {
        let before = map(json!({"name": "A"}));
        let after = map(json!({"name": "A", "nickname": "Ace"}));

        let changed = changed_values(&before, &after);

        assert_eq!(changed.len(), 1);
        assert_eq!(changed["nickname"], json!("Ace"));
    }

    #[test]
    fn test_nested_values_compare_deeply() {
        let before = map(json!({"prefs": {"theme": "dark", "layout": {"cols": 2}}}));
        let after = map(json!({"prefs": {"theme": "dark", "layout": {"cols": 3}}}));

        let changed = changed_values(&before, &after);

        assert_eq!(changed.len(), 1);
        assert_eq!(changed["prefs"]["layout"]["cols"], json!(3));
    }

    #[test]
    fn test_numbers_compare_numerically() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(values_equal(&json!(9_007_199_254_740_991_i64), &json!(9_007_199_254_740_991_i64)));
        assert!(!values_equal(&json!(1), &json!(2)));
    }
}

//! JSON manipulation utilities for the Waterflow runtime.
//!
//! Guard evaluation reads token payloads through dot-separated paths, and
//! join reducers and external signals fold payloads together with a deep
//! merge. Both live here so the path/merge semantics are defined in exactly
//! one place.

use miette::Diagnostic;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors that can occur during JSON path operations.
#[derive(Debug, Error, Diagnostic)]
pub enum JsonError {
    /// Empty or malformed dot-path.
    #[error("Invalid JSON path: {path}")]
    #[diagnostic(code(waterflow::json::invalid_path))]
    InvalidPath { path: String },

    /// A path segment traverses through a non-object value.
    #[error("Path '{path}' traverses a non-object value at segment '{segment}'")]
    #[diagnostic(
        code(waterflow::json::not_an_object),
        help("set_by_path only creates intermediate objects; it does not overwrite scalars or arrays")
    )]
    NotAnObject { path: String, segment: String },
}

/// Read a value at a dot-separated path, e.g. `"order.total"`.
///
/// Returns `None` when any segment is missing or traverses a non-object.
///
/// # Examples
///
/// ```rust
/// use waterflow::utils::json_ext::get_by_path;
/// use serde_json::json;
///
/// let data = json!({"order": {"total": 42}});
/// assert_eq!(get_by_path(&data, "order.total"), Some(&json!(42)));
/// assert_eq!(get_by_path(&data, "order.missing"), None);
/// ```
pub fn get_by_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            return None;
        }
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Write a value at a dot-separated path, creating intermediate objects.
///
/// Fails if a segment would have to traverse through a scalar or array.
pub fn set_by_path(target: &mut Value, path: &str, new_value: Value) -> Result<(), JsonError> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(JsonError::InvalidPath {
            path: path.to_string(),
        });
    }

    let mut current = target;
    for (i, segment) in segments.iter().enumerate() {
        let obj = match current {
            Value::Object(map) => map,
            _ => {
                return Err(JsonError::NotAnObject {
                    path: path.to_string(),
                    segment: (*segment).to_string(),
                })
            }
        };
        if i == segments.len() - 1 {
            obj.insert((*segment).to_string(), new_value);
            return Ok(());
        }
        current = obj
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    unreachable!("path has at least one segment");
}

/// Deep merge of two JSON values: objects merge recursively, arrays
/// concatenate, and on primitive conflicts the right operand wins.
///
/// # Examples
///
/// ```rust
/// use waterflow::utils::json_ext::deep_merge;
/// use serde_json::json;
///
/// let base = json!({"a": 1, "b": {"x": 10}});
/// let overlay = json!({"b": {"y": 20}, "c": 3});
/// assert_eq!(
///     deep_merge(&base, &overlay),
///     json!({"a": 1, "b": {"x": 10, "y": 20}, "c": 3}),
/// );
/// ```
#[must_use]
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_obj), Value::Object(overlay_obj)) => {
            let mut result = base_obj.clone();
            for (key, overlay_value) in overlay_obj {
                match result.get(key) {
                    Some(base_value) => {
                        let merged = deep_merge(base_value, overlay_value);
                        result.insert(key.clone(), merged);
                    }
                    None => {
                        result.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
            Value::Object(result)
        }
        (Value::Array(base_arr), Value::Array(overlay_arr)) => {
            let mut result = base_arr.clone();
            result.extend(overlay_arr.iter().cloned());
            Value::Array(result)
        }
        (_, overlay_val) => overlay_val.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_by_path_nested() {
        let data = json!({"a": {"b": {"c": true}}});
        assert_eq!(get_by_path(&data, "a.b.c"), Some(&json!(true)));
        assert_eq!(get_by_path(&data, "a.b.d"), None);
        assert_eq!(get_by_path(&data, ""), None);
    }

    #[test]
    fn get_by_path_through_scalar_is_none() {
        let data = json!({"a": 1});
        assert_eq!(get_by_path(&data, "a.b"), None);
    }

    #[test]
    fn set_by_path_creates_intermediates() {
        let mut data = json!({});
        set_by_path(&mut data, "a.b.c", json!(5)).unwrap();
        assert_eq!(data, json!({"a": {"b": {"c": 5}}}));
    }

    #[test]
    fn set_by_path_rejects_scalar_traversal() {
        let mut data = json!({"a": 1});
        let err = set_by_path(&mut data, "a.b", json!(2)).unwrap_err();
        assert!(matches!(err, JsonError::NotAnObject { .. }));
    }

    #[test]
    fn deep_merge_right_wins_on_primitives() {
        let merged = deep_merge(&json!({"x": 1, "y": 2}), &json!({"y": 3}));
        assert_eq!(merged, json!({"x": 1, "y": 3}));
    }

    #[test]
    fn deep_merge_concatenates_arrays() {
        let merged = deep_merge(&json!({"v": [1]}), &json!({"v": [2, 3]}));
        assert_eq!(merged, json!({"v": [1, 2, 3]}));
    }
}

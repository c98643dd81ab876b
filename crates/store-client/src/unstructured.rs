//! Path-based access to untyped records
//!
//! Provider records have a schema the controller does not know at compile
//! time. These helpers read and write fields by a path of field names on the
//! record's JSON body. A missing segment (or an explicit `null`) is reported
//! as `Ok(None)`; only a value of the wrong JSON type is an error.

use serde_json::{Map, Value};
use thiserror::Error;

/// Errors from typed field access
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    /// The field exists but holds a different JSON type
    #[error("field {path} is not a {expected}")]
    TypeMismatch {
        /// Dotted path of the offending field
        path: String,
        /// Expected JSON type
        expected: &'static str,
    },

    /// An intermediate segment of a write path is not an object
    #[error("field {path} is not an object")]
    NotAnObject {
        /// Dotted path of the offending segment
        path: String,
    },

    /// Empty path passed to a setter
    #[error("empty field path")]
    EmptyPath,
}

fn dotted(path: &[&str]) -> String {
    path.join(".")
}

/// Returns the value at `path`, or `None` when any segment is missing or null.
pub fn nested_field<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for segment in path {
        current = current.as_object()?.get(*segment)?;
    }
    if current.is_null() { None } else { Some(current) }
}

/// Reads a boolean field.
pub fn nested_bool(value: &Value, path: &[&str]) -> Result<Option<bool>, FieldError> {
    match nested_field(value, path) {
        None => Ok(None),
        Some(v) => v.as_bool().map(Some).ok_or_else(|| FieldError::TypeMismatch {
            path: dotted(path),
            expected: "bool",
        }),
    }
}

/// Reads a string field.
pub fn nested_string(value: &Value, path: &[&str]) -> Result<Option<String>, FieldError> {
    match nested_field(value, path) {
        None => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| FieldError::TypeMismatch {
                path: dotted(path),
                expected: "string",
            }),
    }
}

/// Reads a list whose elements are all objects, preserving order.
pub fn nested_slice_of_maps(
    value: &Value,
    path: &[&str],
) -> Result<Option<Vec<Map<String, Value>>>, FieldError> {
    let Some(v) = nested_field(value, path) else {
        return Ok(None);
    };
    let items = v.as_array().ok_or_else(|| FieldError::TypeMismatch {
        path: dotted(path),
        expected: "list",
    })?;
    items
        .iter()
        .map(|item| {
            item.as_object().cloned().ok_or_else(|| FieldError::TypeMismatch {
                path: dotted(path),
                expected: "list of objects",
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// Writes `new_value` at `path`, creating intermediate objects as needed.
pub fn set_nested_field(value: &mut Value, path: &[&str], new_value: Value) -> Result<(), FieldError> {
    let Some((last, parents)) = path.split_last() else {
        return Err(FieldError::EmptyPath);
    };
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    let mut current = value;
    for (depth, segment) in parents.iter().enumerate() {
        let map = current.as_object_mut().ok_or_else(|| FieldError::NotAnObject {
            path: dotted(&path[..depth]),
        })?;
        let entry = map
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if entry.is_null() {
            *entry = Value::Object(Map::new());
        }
        current = entry;
    }
    let map = current.as_object_mut().ok_or_else(|| FieldError::NotAnObject {
        path: dotted(parents),
    })?;
    map.insert((*last).to_string(), new_value);
    Ok(())
}

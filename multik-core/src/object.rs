//! Helpers for working with untyped resource maps.
//!
//! multik keeps resources as [`serde_json::Value`] throughout; these
//! accessors cover the metadata paths every caller ends up poking at.
use serde_json::{Map, Value};

/// `metadata.name`
pub fn name(obj: &Value) -> Option<&str> {
    obj.pointer("/metadata/name")?.as_str()
}

/// `metadata.namespace`
pub fn namespace(obj: &Value) -> Option<&str> {
    obj.pointer("/metadata/namespace")?.as_str()
}

/// `metadata.resourceVersion`
pub fn resource_version(obj: &Value) -> Option<&str> {
    obj.pointer("/metadata/resourceVersion")?.as_str()
}

/// `metadata.labels`
pub fn labels(obj: &Value) -> Option<&Map<String, Value>> {
    obj.pointer("/metadata/labels")?.as_object()
}

/// `items` of a list response
pub fn items(list: &Value) -> Option<&Vec<Value>> {
    list.get("items")?.as_array()
}

/// Walk a dot- or slash-separated path into an object.
///
/// Segments index maps by key and arrays by number:
/// `status.containerStatuses.0.ready` or `status/phase`.
pub fn lookup<'a>(obj: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = obj;
    for segment in path.split(['.', '/']).filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

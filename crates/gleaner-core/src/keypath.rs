//! Dotted key paths into JSON values (`offer.images.0.url`).

use serde_json::Value;

/// Resolve `path` against `value`.
///
/// Segments are object keys; a numeric segment indexes into an array.
/// An empty path resolves to `value` itself.
pub fn resolve<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

//! JSON value helpers: deep merge and scope assembly.

use serde_json::{Map, Value};

/// Deep-merge `patch` into `target`.
///
/// Objects merge recursively; any other value in the patch replaces the
/// target wholesale. `null` in the patch removes the key, RFC 7386 style,
/// which makes re-applying the same patch idempotent.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                if patch_value.is_null() {
                    target_map.remove(key);
                } else {
                    merge_patch(
                        target_map.entry(key.clone()).or_insert(Value::Null),
                        patch_value,
                    );
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Merge two values into a new one, `overlay` winning on conflicts.
pub fn merged(base: &Value, overlay: &Value) -> Value {
    let mut out = base.clone();
    merge_patch(&mut out, overlay);
    out
}

/// Coerce a value into an object map, treating `null` as empty.
pub fn as_object(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    }
}

/// Build a template scope from named sections.
pub fn scope(sections: &[(&str, &Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (name, value) in sections {
        map.insert(name.to_string(), (*value).clone());
    }
    map
}

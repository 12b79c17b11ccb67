//! Context-tree helpers.
//!
//! An issue's context is a heterogeneous JSON object. Merging happens on
//! exact-duplicate reopen, embedding merge, and cleanup reconciliation;
//! the incoming side always wins on key collisions, recursing into
//! nested objects so unrelated keys survive.

use serde_json::{Map, Value};

/// Deep-merges `incoming` into `base`. Object values merge recursively;
/// any other collision is resolved in favor of `incoming`.
pub fn deep_merge(base: &mut Map<String, Value>, incoming: Map<String, Value>) {
    for (key, incoming_value) in incoming {
        match (base.get_mut(&key), incoming_value) {
            (Some(Value::Object(base_obj)), Value::Object(incoming_obj)) => {
                deep_merge(base_obj, incoming_obj);
            },
            (_, incoming_value) => {
                base.insert(key, incoming_value);
            },
        }
    }
}

/// Deep-merges two context maps, returning the result. `incoming` wins
/// on collisions.
#[must_use]
pub fn merged(mut base: Map<String, Value>, incoming: Map<String, Value>) -> Map<String, Value> {
    deep_merge(&mut base, incoming);
    base
}

/// Appends `extra` filenames to `screenshots`, skipping duplicates while
/// preserving order. Screenshot lists are append-only across reopens and
/// merges.
pub fn append_screenshots(screenshots: &mut Vec<String>, extra: impl IntoIterator<Item = String>) {
    for name in extra {
        if !screenshots.contains(&name) {
            screenshots.push(name);
        }
    }
}

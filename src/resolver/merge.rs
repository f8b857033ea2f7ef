//! JSON merge helpers used to layer theme and override documents.

use serde_json::{Map, Value};

/// Merge `source` into `target`. Objects merge key by key; any other value
/// in `source` (arrays and `null` included) replaces what `target` holds.
pub fn deep_merge(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, value) in source {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Replace values of keys `target` already declares with the ones `source`
/// defines for the same path. Keys only present in `source` are not added.
pub fn overlay_existing(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, current) in target.iter_mut() {
        let Some(incoming) = source.get(key) else {
            continue;
        };
        match (current, incoming) {
            (Value::Object(existing), Value::Object(incoming)) => {
                overlay_existing(existing, incoming);
            }
            (current, incoming) => *current = incoming.clone(),
        }
    }
}

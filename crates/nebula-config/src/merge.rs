//! Merge primitives over YAML trees
//!
//! Both merges copy from the overlay and never mutate it. They differ only in
//! how two sequences combine: [`deep_merge`] lets the overlay replace the
//! base sequence, [`additive_merge`] appends the overlay's items.

use serde_yaml::Value;

/// Merge `overlay` into `base`, overlay winning.
///
/// Two mappings merge key by key, recursively. Any other pairing is replaced
/// by the overlay value.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Merge `overlay` into `base`, extending what is already there.
///
/// Mappings merge recursively, sequences are concatenated base first, and
/// every other pairing is replaced by the overlay value.
pub fn additive_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => additive_merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (Value::Sequence(base), Value::Sequence(overlay)) => {
            base.extend(overlay.iter().cloned());
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Collapse every sequence stored under `key`, at any depth, to its unique
/// items. The first occurrence of each item keeps its position.
pub fn dedupe_key(value: &mut Value, key: &str) {
    match value {
        Value::Mapping(mapping) => {
            for (k, v) in mapping.iter_mut() {
                if k.as_str() == Some(key) {
                    if let Value::Sequence(items) = v {
                        dedupe_sequence(items);
                    }
                }
                dedupe_key(v, key);
            }
        }
        Value::Sequence(items) => {
            for item in items {
                dedupe_key(item, key);
            }
        }
        Value::Tagged(tagged) => dedupe_key(&mut tagged.value, key),
        _ => {}
    }
}

fn dedupe_sequence(items: &mut Vec<Value>) {
    let mut unique: Vec<Value> = Vec::with_capacity(items.len());
    for item in items.drain(..) {
        if !unique.contains(&item) {
            unique.push(item);
        }
    }
    *items = unique;
}

//! Order-independent structural hashing of JSON values.
//!
//! The hash is a cache lookup key, not a proof of equality: two different
//! values may collide. Callers must only use it to find a previously computed
//! result, never to decide equality on its own.

use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Computes a structural hash of `value`.
///
/// Object keys are visited in sorted order, so `{"a":1,"b":2}` and
/// `{"b":2,"a":1}` hash identically. Array elements are hashed together with
/// their index.
#[must_use]
pub fn structural_hash(value: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    hash_into(value, &mut hasher);
    hasher.finish()
}

fn hash_into(value: &Value, state: &mut DefaultHasher) {
    match value {
        Value::Null => 0u8.hash(state),
        Value::Bool(b) => {
            1u8.hash(state);
            b.hash(state);
        }
        Value::Number(n) => {
            2u8.hash(state);
            // Integral values hash as exact integers so 1 and 1.0 share a key
            // and integers past 2^53 stay distinct.
            if let Some(i) = n.as_i64() {
                i128::from(i).hash(state);
            } else if let Some(u) = n.as_u64() {
                i128::from(u).hash(state);
            } else {
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < 1e38 => (f as i128).hash(state),
                    Some(f) => f.to_bits().hash(state),
                    None => n.to_string().hash(state),
                }
            }
        }
        Value::String(s) => {
            3u8.hash(state);
            s.hash(state);
        }
        Value::Array(items) => {
            4u8.hash(state);
            items.len().hash(state);
            for (i, item) in items.iter().enumerate() {
                i.hash(state);
                hash_into(item, state);
            }
        }
        Value::Object(map) => {
            5u8.hash(state);
            map.len().hash(state);
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                key.hash(state);
                hash_into(&map[key], state);
            }
        }
    }
}

//! Dotted-path access into JSON state.

use serde_json::{Map, Value};

/// Looks up `path` (dot-separated keys; numeric segments index arrays).
pub fn get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |cur, seg| match cur {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Writes `value` at `path`, creating intermediate objects as needed.
///
/// A non-object on the way is replaced by an object. Returns false only
/// when an array index segment is out of range.
pub fn set(root: &mut Value, path: &str, value: Value) -> bool {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };

    let mut cur = root;
    for seg in parents {
        cur = match cur {
            Value::Array(items) => match seg.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(slot) => slot,
                None => return false,
            },
            other => {
                if !other.is_object() {
                    *other = Value::Object(Map::new());
                }
                match other {
                    Value::Object(map) => map
                        .entry(seg.to_string())
                        .or_insert_with(|| Value::Object(Map::new())),
                    _ => return false,
                }
            }
        };
    }

    match cur {
        Value::Array(items) => match last.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        },
        other => {
            if !other.is_object() {
                *other = Value::Object(Map::new());
            }
            match other {
                Value::Object(map) => {
                    map.insert(last.to_string(), value);
                    true
                }
                _ => false,
            }
        }
    }
}

//! Custom comparators that take precedence over generic traversal.

use chrono::DateTime;
use serde_json::Value;

/// A value-specific equality rule.
///
/// When several registered comparators apply to the same pair, the one with
/// the highest [`priority`](Comparator::priority) decides.
pub trait Comparator: Send + Sync {
    /// Short name, used in logs.
    fn name(&self) -> &str;

    /// Higher runs first.
    fn priority(&self) -> i32 {
        0
    }

    /// Whether this comparator knows how to compare `a` and `b`.
    fn applies(&self, a: &Value, b: &Value) -> bool;

    /// Equality under this comparator's rules. Only called when `applies` is true.
    fn equals(&self, a: &Value, b: &Value) -> bool;
}

/// Compares RFC 3339 timestamps by instant, so `2024-01-01T00:00:00Z` equals
/// `2024-01-01T01:00:00+01:00`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DateTimeComparator;

impl Comparator for DateTimeComparator {
    fn name(&self) -> &str {
        "datetime"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn applies(&self, a: &Value, b: &Value) -> bool {
        match (a.as_str(), b.as_str()) {
            (Some(x), Some(y)) => {
                looks_like_timestamp(x)
                    && looks_like_timestamp(y)
                    && DateTime::parse_from_rfc3339(x).is_ok()
                    && DateTime::parse_from_rfc3339(y).is_ok()
            }
            _ => false,
        }
    }

    fn equals(&self, a: &Value, b: &Value) -> bool {
        let parse = |v: &Value| v.as_str().and_then(|s| DateTime::parse_from_rfc3339(s).ok());
        match (parse(a), parse(b)) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        }
    }
}

fn looks_like_timestamp(s: &str) -> bool {
    s.len() >= 20 && s.as_bytes().get(4) == Some(&b'-') && s.contains('T')
}

/// Compares numbers by value, so `1` equals `1.0`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NumericComparator;

impl Comparator for NumericComparator {
    fn name(&self) -> &str {
        "numeric"
    }

    fn applies(&self, a: &Value, b: &Value) -> bool {
        a.is_number() && b.is_number()
    }

    fn equals(&self, a: &Value, b: &Value) -> bool {
        match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ if a.is_u64() && b.is_u64() => a.as_u64() == b.as_u64(),
            _ => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => a == b,
            },
        }
    }
}

/// Treats arrays as unordered collections when both sides are tagged with a
/// `{"$set": [...]}` wrapper.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnorderedSetComparator;

impl UnorderedSetComparator {
    fn members(v: &Value) -> Option<&Vec<Value>> {
        let obj = v.as_object()?;
        if obj.len() != 1 {
            return None;
        }
        obj.get("$set")?.as_array()
    }
}

impl Comparator for UnorderedSetComparator {
    fn name(&self) -> &str {
        "unordered-set"
    }

    fn priority(&self) -> i32 {
        5
    }

    fn applies(&self, a: &Value, b: &Value) -> bool {
        Self::members(a).is_some() && Self::members(b).is_some()
    }

    fn equals(&self, a: &Value, b: &Value) -> bool {
        let (Some(xs), Some(ys)) = (Self::members(a), Self::members(b)) else {
            return false;
        };
        if xs.len() != ys.len() {
            return false;
        }
        let mut used = vec![false; ys.len()];
        xs.iter().all(|x| {
            match ys
                .iter()
                .enumerate()
                .position(|(i, y)| !used[i] && x == y)
            {
                Some(i) => {
                    used[i] = true;
                    true
                }
                None => false,
            }
        })
    }
}

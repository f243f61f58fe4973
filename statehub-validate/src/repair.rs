use crate::schema::{FieldRule, FieldType, ValidationSchema};
use crate::path;
use serde_json::{Map, Number, Value};
use std::sync::Arc;

/// Custom whole-state repair for one category.
pub type RepairStrategy = Arc<dyn Fn(&Value, &ValidationSchema) -> Value + Send + Sync>;

/// Best-effort conversion of `value` to `target`.
pub fn coerce(value: &Value, target: FieldType) -> Option<Value> {
    match (target, value) {
        (FieldType::Number, Value::String(s)) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<i64>() {
                return Some(Value::from(n));
            }
            s.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
        }
        (FieldType::Number, Value::Bool(b)) => Some(Value::from(u8::from(*b))),
        (FieldType::Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
        (FieldType::Integer, Value::Number(n)) => n
            .as_f64()
            .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
            .map(|f| Value::from(f as i64)),
        (FieldType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(Value::Bool(true)),
            "false" | "0" | "no" | "off" => Some(Value::Bool(false)),
            _ => None,
        },
        (FieldType::Boolean, Value::Number(n)) => match n.as_f64() {
            Some(f) if f == 0.0 => Some(Value::Bool(false)),
            Some(f) if f == 1.0 => Some(Value::Bool(true)),
            _ => None,
        },
        (FieldType::String, Value::Number(n)) => Some(Value::String(n.to_string())),
        (FieldType::String, Value::Bool(b)) => Some(Value::String(b.to_string())),
        (FieldType::Array, Value::Null) => None,
        (FieldType::Array, v) if !v.is_array() => Some(Value::Array(vec![v.clone()])),
        _ => None,
    }
}

/// Repair for a value of the wrong type: the field's sanitizer first, then
/// coercion when enabled. A sanitizer result of the wrong type is discarded.
pub fn repair_mismatch(rule: &FieldRule, value: &Value, coerce_types: bool) -> Option<Value> {
    if let Some(sanitizer) = &rule.sanitizer {
        if let Some(fixed) = sanitizer(value).filter(|v| rule.field_type.matches(v)) {
            return Some(fixed);
        }
    }
    if coerce_types {
        coerce(value, rule.field_type)
    } else {
        None
    }
}

/// Default repair: fill required fields and fix types where possible.
pub(crate) fn default_repair(state: &Value, schema: &ValidationSchema, coerce_types: bool) -> Value {
    let mut repaired = if state.is_object() || schema.fields.is_empty() {
        state.clone()
    } else {
        Value::Object(Map::new())
    };
    for rule in &schema.fields {
        let fix = match path::get(&repaired, &rule.path) {
            None | Some(Value::Null) if rule.required => Some(rule.fill_value()),
            Some(v) if !v.is_null() && !rule.field_type.matches(v) => {
                repair_mismatch(rule, v, coerce_types)
            }
            _ => None,
        };
        if let Some(fix) = fix {
            path::set(&mut repaired, &rule.path, fix);
        }
    }
    repaired
}

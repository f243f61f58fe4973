use crate::error::{ValidateError, ValidateResult};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Repairs a value of the wrong type. Returning `None` means "cannot repair".
pub type Sanitizer = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// A free-form predicate on a field value. `Err(message)` fails validation.
pub type CustomCheck = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// A named, versioned rule set for one component category.
#[derive(Debug, Clone)]
pub struct ValidationSchema {
    pub name: String,
    pub version: u32,
    /// Evaluated in declaration order.
    pub fields: Vec<FieldRule>,
}

impl ValidationSchema {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            fields: Vec::new(),
        }
    }

    /// Appends a field rule.
    #[must_use]
    pub fn field(mut self, rule: FieldRule) -> Self {
        self.fields.push(rule);
        self
    }

    /// Returns the rule for a path, if declared.
    pub fn rule(&self, path: &str) -> Option<&FieldRule> {
        self.fields.iter().find(|r| r.path == path)
    }

    /// Returns true if `key` is the first segment of some declared path.
    pub fn declares_top_level(&self, key: &str) -> bool {
        self.fields
            .iter()
            .any(|r| r.path.split('.').next() == Some(key))
    }
}

/// The JSON type a field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Any,
}

impl FieldType {
    /// Returns true if `value` has this type.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }

    /// The zero value used to fill a missing required field.
    pub fn default_value(self) -> Value {
        match self {
            Self::String => Value::String(String::new()),
            Self::Number | Self::Integer => Value::from(0),
            Self::Boolean => Value::Bool(false),
            Self::Array => Value::Array(Vec::new()),
            Self::Object => Value::Object(serde_json::Map::new()),
            Self::Any => Value::Null,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        };
        f.write_str(s)
    }
}

/// Name of the JSON type of `value`, for messages.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A constraint checked once the type matches.
#[derive(Debug, Clone)]
pub enum Constraint {
    /// Inclusive lower bound on a number.
    Min(f64),
    /// Inclusive upper bound on a number.
    Max(f64),
    /// Minimum length of a string (chars) or array.
    MinLength(usize),
    /// Maximum length of a string (chars) or array.
    MaxLength(usize),
    /// Strings must match.
    Pattern(Regex),
    /// Value must equal one of these.
    OneOf(Vec<Value>),
}

impl Constraint {
    /// Checks the constraint. Returns a description of the violation.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        match self {
            Self::Min(min) => match value.as_f64() {
                Some(n) if n < *min => Err(format!("must be >= {min}, got {n}")),
                _ => Ok(()),
            },
            Self::Max(max) => match value.as_f64() {
                Some(n) if n > *max => Err(format!("must be <= {max}, got {n}")),
                _ => Ok(()),
            },
            Self::MinLength(min) => match length(value) {
                Some(len) if len < *min => Err(format!("length must be >= {min}, got {len}")),
                _ => Ok(()),
            },
            Self::MaxLength(max) => match length(value) {
                Some(len) if len > *max => Err(format!("length must be <= {max}, got {len}")),
                _ => Ok(()),
            },
            Self::Pattern(re) => match value.as_str() {
                Some(s) if !re.is_match(s) => Err(format!("must match /{}/", re.as_str())),
                _ => Ok(()),
            },
            Self::OneOf(options) => {
                if options.contains(value) {
                    Ok(())
                } else {
                    Err(format!("must be one of {}", Value::Array(options.clone())))
                }
            }
        }
    }

    /// Short constraint name (`"min"`, `"pattern"`, ...).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Min(_) => "min",
            Self::Max(_) => "max",
            Self::MinLength(_) => "min_length",
            Self::MaxLength(_) => "max_length",
            Self::Pattern(_) => "pattern",
            Self::OneOf(_) => "one_of",
        }
    }
}

fn length(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        _ => None,
    }
}

/// Validation rule for one field.
#[derive(Clone)]
pub struct FieldRule {
    /// Dotted path from the state root (e.g. `"profile.age"`).
    pub path: String,
    pub field_type: FieldType,
    pub required: bool,
    pub constraints: Vec<Constraint>,
    /// Suggested value when the field is required but missing.
    pub default: Option<Value>,
    pub(crate) sanitizer: Option<Sanitizer>,
    pub(crate) custom: Option<CustomCheck>,
}

impl FieldRule {
    pub fn new(path: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            path: path.into(),
            field_type,
            required: false,
            constraints: Vec::new(),
            default: None,
            sanitizer: None,
            custom: None,
        }
    }

    pub fn string(path: impl Into<String>) -> Self {
        Self::new(path, FieldType::String)
    }

    pub fn number(path: impl Into<String>) -> Self {
        Self::new(path, FieldType::Number)
    }

    pub fn integer(path: impl Into<String>) -> Self {
        Self::new(path, FieldType::Integer)
    }

    pub fn boolean(path: impl Into<String>) -> Self {
        Self::new(path, FieldType::Boolean)
    }

    pub fn array(path: impl Into<String>) -> Self {
        Self::new(path, FieldType::Array)
    }

    pub fn object(path: impl Into<String>) -> Self {
        Self::new(path, FieldType::Object)
    }

    pub fn any(path: impl Into<String>) -> Self {
        Self::new(path, FieldType::Any)
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    #[must_use]
    pub fn min(mut self, min: f64) -> Self {
        self.constraints.push(Constraint::Min(min));
        self
    }

    #[must_use]
    pub fn max(mut self, max: f64) -> Self {
        self.constraints.push(Constraint::Max(max));
        self
    }

    #[must_use]
    pub fn min_length(mut self, min: usize) -> Self {
        self.constraints.push(Constraint::MinLength(min));
        self
    }

    #[must_use]
    pub fn max_length(mut self, max: usize) -> Self {
        self.constraints.push(Constraint::MaxLength(max));
        self
    }

    /// Adds a regex constraint. Fails if the pattern does not compile.
    pub fn pattern(mut self, pattern: &str) -> ValidateResult<Self> {
        let re = Regex::new(pattern).map_err(|source| ValidateError::InvalidPattern {
            path: self.path.clone(),
            source,
        })?;
        self.constraints.push(Constraint::Pattern(re));
        Ok(self)
    }

    #[must_use]
    pub fn one_of(mut self, options: Vec<Value>) -> Self {
        self.constraints.push(Constraint::OneOf(options));
        self
    }

    /// Sets the sanitizer used to repair a value of the wrong type.
    #[must_use]
    pub fn sanitizer(
        mut self,
        f: impl Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        self.sanitizer = Some(Arc::new(f));
        self
    }

    /// Sets a custom predicate evaluated after type and constraint checks.
    #[must_use]
    pub fn custom(
        mut self,
        f: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.custom = Some(Arc::new(f));
        self
    }

    /// The value to fill in when this field is required but missing.
    pub fn fill_value(&self) -> Value {
        self.default
            .clone()
            .unwrap_or_else(|| self.field_type.default_value())
    }
}

impl fmt::Debug for FieldRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldRule")
            .field("path", &self.path)
            .field("field_type", &self.field_type)
            .field("required", &self.required)
            .field("constraints", &self.constraints)
            .field("default", &self.default)
            .field("sanitizer", &self.sanitizer.is_some())
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

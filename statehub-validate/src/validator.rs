use crate::cross::CrossRule;
use crate::error::{ValidateError, ValidateResult};
use crate::path;
use crate::repair::{self, RepairStrategy};
use crate::result::{IssueKind, ValidationIssue, ValidationResult};
use crate::schema::{type_name, FieldRule, ValidationSchema};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use statehub_types::{checksum, ComponentId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Validator configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Apply repairs and return the repaired state.
    pub auto_repair: bool,
    /// Allow type coercion as a repair.
    pub coerce_types: bool,
    /// Maximum cached results. Zero disables the cache.
    pub cache_size: usize,
    /// Report top-level fields not declared by the schema as warnings.
    pub warn_unknown_fields: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            auto_repair: true,
            coerce_types: true,
            cache_size: 500,
            warn_unknown_fields: false,
        }
    }
}

type CacheKey = (ComponentId, String, u32, String);

#[derive(Default)]
struct ResultCache {
    entries: HashMap<CacheKey, ValidationResult>,
    order: VecDeque<CacheKey>,
}

impl ResultCache {
    fn insert(&mut self, key: CacheKey, result: ValidationResult, cap: usize) {
        if cap == 0 {
            return;
        }
        if self.entries.insert(key.clone(), result).is_none() {
            self.order.push_back(key);
        }
        while self.entries.len() > cap {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// Schema registry plus validation, repair and cross-component checks.
///
/// Results are cached by component, category, schema version and payload
/// checksum. The checksum is a lookup key: a collision would return the
/// result of a different payload, which SHA-256 makes negligible.
pub struct Validator {
    config: ValidatorConfig,
    schemas: RwLock<HashMap<String, Arc<ValidationSchema>>>,
    repairs: RwLock<HashMap<String, RepairStrategy>>,
    cross_rules: RwLock<HashMap<String, Vec<CrossRule>>>,
    cache: Mutex<ResultCache>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(ValidatorConfig::default())
    }
}

impl Validator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self {
            config,
            schemas: RwLock::new(HashMap::new()),
            repairs: RwLock::new(HashMap::new()),
            cross_rules: RwLock::new(HashMap::new()),
            cache: Mutex::new(ResultCache::default()),
        }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Associates a schema with a category, replacing any previous one.
    pub fn register_schema(&self, category: impl Into<String>, schema: ValidationSchema) {
        let category = category.into();
        debug!(category = %category, schema = %schema.name, version = schema.version, "Registered schema");
        self.schemas.write().insert(category, Arc::new(schema));
        self.cache.lock().clear();
    }

    pub fn has_schema(&self, category: &str) -> bool {
        self.schemas.read().contains_key(category)
    }

    pub fn schema(&self, category: &str) -> Option<Arc<ValidationSchema>> {
        self.schemas.read().get(category).cloned()
    }

    /// Installs a custom whole-state repair for a category.
    pub fn register_repair_strategy(
        &self,
        category: impl Into<String>,
        strategy: impl Fn(&Value, &ValidationSchema) -> Value + Send + Sync + 'static,
    ) {
        self.repairs.write().insert(category.into(), Arc::new(strategy));
    }

    /// Sets the cross-component rules checked for a category.
    pub fn register_cross_rules(&self, category: impl Into<String>, rules: Vec<CrossRule>) {
        self.cross_rules.write().insert(category.into(), rules);
    }

    /// Validates `state` against the category's schema.
    ///
    /// Fails only when no schema is registered for `category`; findings are
    /// reported in the returned result.
    pub fn validate_state(
        &self,
        component_id: &ComponentId,
        category: &str,
        state: &Value,
    ) -> ValidateResult<ValidationResult> {
        let schema = self
            .schema(category)
            .ok_or_else(|| ValidateError::UnknownSchema(category.to_string()))?;

        let key = (
            component_id.clone(),
            category.to_string(),
            schema.version,
            checksum(state),
        );
        if let Some(hit) = self.cache.lock().entries.get(&key) {
            return Ok(hit.clone());
        }

        let result = self.evaluate(&schema, state);
        if !result.valid {
            debug!(
                component = %component_id,
                category,
                errors = result.errors.len(),
                repaired = result.repaired.is_some(),
                "Validation failed"
            );
        }
        self.cache
            .lock()
            .insert(key, result.clone(), self.config.cache_size);
        Ok(result)
    }

    fn evaluate(&self, schema: &ValidationSchema, state: &Value) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if !state.is_object() && !schema.fields.is_empty() {
            errors.push(ValidationIssue::new(
                "$",
                IssueKind::TypeMismatch {
                    expected: "object".into(),
                    found: type_name(state).into(),
                },
                format!("state must be an object, got {}", type_name(state)),
            ));
            return ValidationResult::from_issues(errors, warnings, None);
        }

        let mut repaired = state.clone();
        let mut applied = false;

        for rule in &schema.fields {
            let issue = match path::get(state, &rule.path) {
                None | Some(Value::Null) => {
                    if rule.required {
                        Some(
                            ValidationIssue::new(
                                &rule.path,
                                IssueKind::RequiredMissing,
                                format!("{} is required", rule.path),
                            )
                            .with_repair(Some(rule.fill_value())),
                        )
                    } else {
                        None
                    }
                }
                Some(value) if !rule.field_type.matches(value) => Some(
                    ValidationIssue::new(
                        &rule.path,
                        IssueKind::TypeMismatch {
                            expected: rule.field_type.to_string(),
                            found: type_name(value).into(),
                        },
                        format!(
                            "{} must be {}, got {}",
                            rule.path,
                            rule.field_type,
                            type_name(value)
                        ),
                    )
                    .with_repair(repair::repair_mismatch(rule, value, self.config.coerce_types)),
                ),
                Some(value) => {
                    check_value(rule, value, &mut errors);
                    None
                }
            };

            if let Some(issue) = issue {
                if self.config.auto_repair {
                    if let Some(fix) = &issue.repair {
                        applied |= path::set(&mut repaired, &rule.path, fix.clone());
                    }
                }
                errors.push(issue);
            }
        }

        if self.config.warn_unknown_fields {
            if let Value::Object(map) = state {
                for key in map.keys().filter(|k| !schema.declares_top_level(k)) {
                    warnings.push(ValidationIssue::new(
                        key.as_str(),
                        IssueKind::UnknownField,
                        format!("{key} is not declared by schema {}", schema.name),
                    ));
                }
            }
        }

        ValidationResult::from_issues(errors, warnings, applied.then_some(repaired))
    }

    /// Checks the category's cross-component rules against dependency states.
    ///
    /// `dependencies` maps dependency component ids to their current state.
    /// A rule naming a dependency absent from the map is always an error.
    pub fn validate_cross_component(
        &self,
        component_id: &ComponentId,
        category: &str,
        state: &Value,
        dependencies: &HashMap<String, Value>,
    ) -> ValidationResult {
        let rules = self.cross_rules.read();
        let errors: Vec<ValidationIssue> = rules
            .get(category)
            .map(|rules| {
                rules
                    .iter()
                    .filter_map(|rule| rule.check(state, dependencies))
                    .collect()
            })
            .unwrap_or_default();
        if !errors.is_empty() {
            warn!(component = %component_id, category, failures = errors.len(), "Cross-component validation failed");
        }
        ValidationResult::from_issues(errors, Vec::new(), None)
    }

    /// Repairs `state` with the category's registered strategy, or the
    /// default one (fill required fields, coerce mismatched types).
    pub fn repair_state(&self, category: &str, state: &Value) -> ValidateResult<Value> {
        let schema = self
            .schema(category)
            .ok_or_else(|| ValidateError::UnknownSchema(category.to_string()))?;
        let custom = self.repairs.read().get(category).cloned();
        Ok(match custom {
            Some(strategy) => strategy(state, &schema),
            None => repair::default_repair(state, &schema, self.config.coerce_types),
        })
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().entries.len()
    }
}

fn check_value(rule: &FieldRule, value: &Value, errors: &mut Vec<ValidationIssue>) {
    for constraint in &rule.constraints {
        if let Err(reason) = constraint.check(value) {
            errors.push(ValidationIssue::new(
                &rule.path,
                IssueKind::ConstraintViolation {
                    constraint: constraint.name().into(),
                },
                format!("{} {reason}", rule.path),
            ));
        }
    }
    if let Some(custom) = &rule.custom {
        if let Err(reason) = custom(value) {
            errors.push(ValidationIssue::new(&rule.path, IssueKind::CustomCheck, reason));
        }
    }
}

//! Seam between the queue and whatever applies updates.

use crate::request::UpdateRequest;
use async_trait::async_trait;
use serde_json::Value;
use statehub_registry::{ComponentRegistration, RegistryError, StateRegistry};
use statehub_types::{overlay, ComponentId, OperationKind};
use statehub_validate::Validator;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecuteError {
    /// Transient; the queue retries with backoff.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Permanent; reported without retrying.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Applies one update request.
#[async_trait]
pub trait UpdateExecutor: Send + Sync {
    async fn execute(&self, request: &UpdateRequest) -> Result<(), ExecuteError>;
}

/// Applies requests to a [`StateRegistry`].
///
/// `Create` registers, `Update` replaces, `Patch` overlays top-level fields
/// and `Delete` unregisters. When a validator is attached and has a schema
/// for the component's category, the resulting state is validated first;
/// a repaired state is used when offered, and an invalid one is rejected.
pub struct RegistryExecutor {
    registry: Arc<StateRegistry>,
    validator: Option<Arc<Validator>>,
}

impl RegistryExecutor {
    pub fn new(registry: Arc<StateRegistry>) -> Self {
        Self {
            registry,
            validator: None,
        }
    }

    #[must_use]
    pub fn with_validator(mut self, validator: Arc<Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    fn validated(&self, id: &ComponentId, category: &str, state: Value) -> Result<Value, ExecuteError> {
        let Some(validator) = &self.validator else {
            return Ok(state);
        };
        if !validator.has_schema(category) {
            return Ok(state);
        }
        let check = |state: &Value| {
            validator
                .validate_state(id, category, state)
                .map_err(|e| ExecuteError::Fatal(e.to_string()))
        };

        let result = check(&state)?;
        if result.valid {
            return Ok(state);
        }
        if let Some(repaired) = result.repaired {
            let recheck = check(&repaired)?;
            if recheck.valid {
                debug!(component = %id, "Applying repaired state");
                return Ok(repaired);
            }
        }
        let reasons: Vec<String> = result.errors.iter().map(|e| e.message.clone()).collect();
        Err(ExecuteError::Fatal(format!(
            "invalid state for {id}: {}",
            reasons.join("; ")
        )))
    }

    fn current(&self, id: &ComponentId) -> Result<(String, Arc<Value>), ExecuteError> {
        self.registry
            .get_component(id)
            .map(|view| (view.category, view.state))
            .ok_or_else(|| fatal(RegistryError::UnknownComponent(id.clone())))
    }
}

fn fatal(e: RegistryError) -> ExecuteError {
    ExecuteError::Fatal(e.to_string())
}

#[async_trait]
impl UpdateExecutor for RegistryExecutor {
    async fn execute(&self, request: &UpdateRequest) -> Result<(), ExecuteError> {
        let id = ComponentId::from(request.key.as_str());
        match request.kind {
            OperationKind::Create => {
                let category = request
                    .category
                    .clone()
                    .ok_or_else(|| ExecuteError::Fatal(format!("create of {id} has no category")))?;
                let state = self.validated(&id, &category, request.payload.clone())?;
                self.registry
                    .register(ComponentRegistration::new(id, category, state))
                    .map_err(fatal)
            }
            OperationKind::Update => {
                let (category, _) = self.current(&id)?;
                let state = self.validated(&id, &category, request.payload.clone())?;
                self.registry.update_state(&id, state).map(|_| ()).map_err(fatal)
            }
            OperationKind::Patch => {
                let (category, current) = self.current(&id)?;
                let merged = overlay(&current, &request.payload);
                let state = self.validated(&id, &category, merged)?;
                self.registry.update_state(&id, state).map(|_| ()).map_err(fatal)
            }
            OperationKind::Delete => self.registry.unregister(&id).map_err(fatal),
        }
    }
}

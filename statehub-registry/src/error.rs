use statehub_types::ComponentId;
use thiserror::Error;

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("component already registered: {0}")]
    DuplicateRegistration(ComponentId),

    #[error("unknown component: {0}")]
    UnknownComponent(ComponentId),

    #[error("dependency {from} -> {to} would create a cycle")]
    CyclicDependency { from: ComponentId, to: ComponentId },

    #[error("no snapshot to restore for {0}")]
    NoSnapshot(ComponentId),
}

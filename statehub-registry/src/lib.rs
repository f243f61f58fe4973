//! Component registry for statehub.
//!
//! [`StateRegistry`] tracks every component's state and metadata, keeps the
//! dependency graph acyclic, snapshots prior states for restore, and runs
//! periodic health checks. State changes are dirty-checked through the
//! change detector and, when a bus is attached, announced on
//! `component.<id>.state_changed`.

mod component;
mod error;
mod graph;
mod health;
mod registry;

pub use component::{
    ComponentConfig, ComponentMetadata, ComponentRegistration, ComponentView, ErrorHook,
    HookResult, LifecycleHooks, MountHook, StateChangeHook, UnmountHook, UpdateOutcome,
};
pub use error::{RegistryError, RegistryResult};
pub use graph::{DependencyEdge, DependencyKind};
pub use health::{HealthIssue, HealthIssueKind, HealthReport};
pub use registry::{RegistryConfig, StateRegistry};

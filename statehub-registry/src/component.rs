use serde::{Deserialize, Serialize};
use serde_json::Value;
use statehub_types::ComponentId;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Outcome of a lifecycle hook. `Err` is routed to `on_error`.
pub type HookResult = Result<(), String>;

pub type MountHook = Arc<dyn Fn(&ComponentId, &Value) -> HookResult + Send + Sync>;
pub type UnmountHook = Arc<dyn Fn(&ComponentId) -> HookResult + Send + Sync>;
/// Called with `(new, old)` state.
pub type StateChangeHook = Arc<dyn Fn(&Value, &Value) -> HookResult + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&ComponentId, &str) + Send + Sync>;

/// Callbacks fired by the registry.
///
/// Hooks run while the registry serializes mutations: they may read from the
/// registry but must not register, unregister or update components.
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    pub on_mount: Option<MountHook>,
    pub on_unmount: Option<UnmountHook>,
    pub on_state_change: Option<StateChangeHook>,
    pub on_error: Option<ErrorHook>,
}

impl LifecycleHooks {
    #[must_use]
    pub fn on_mount(
        mut self,
        f: impl Fn(&ComponentId, &Value) -> HookResult + Send + Sync + 'static,
    ) -> Self {
        self.on_mount = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_unmount(mut self, f: impl Fn(&ComponentId) -> HookResult + Send + Sync + 'static) -> Self {
        self.on_unmount = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_state_change(
        mut self,
        f: impl Fn(&Value, &Value) -> HookResult + Send + Sync + 'static,
    ) -> Self {
        self.on_state_change = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&ComponentId, &str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("on_mount", &self.on_mount.is_some())
            .field("on_unmount", &self.on_unmount.is_some())
            .field("on_state_change", &self.on_state_change.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Per-component behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentConfig {
    /// Diff new state against old and skip identical updates.
    pub track_changes: bool,
    /// Snapshots kept for `restore_snapshot`. Zero disables snapshots.
    pub max_snapshots: usize,
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            track_changes: true,
            max_snapshots: 10,
        }
    }
}

/// Everything needed to register a component.
#[derive(Debug, Clone)]
pub struct ComponentRegistration {
    pub id: ComponentId,
    pub name: String,
    pub category: String,
    pub version: u32,
    pub state: Value,
    pub tags: BTreeSet<String>,
    pub parent: Option<ComponentId>,
    pub depends_on: Vec<ComponentId>,
    pub config: ComponentConfig,
    pub hooks: LifecycleHooks,
}

impl ComponentRegistration {
    pub fn new(id: impl Into<ComponentId>, category: impl Into<String>, state: Value) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            category: category.into(),
            version: 1,
            state,
            tags: BTreeSet::new(),
            parent: None,
            depends_on: Vec::new(),
            config: ComponentConfig::default(),
            hooks: LifecycleHooks::default(),
        }
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    #[must_use]
    pub fn parent(mut self, parent: impl Into<ComponentId>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Declares a dependency. An edge is added at registration time if the
    /// target is already registered.
    #[must_use]
    pub fn depends_on(mut self, dependency: impl Into<ComponentId>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    #[must_use]
    pub fn config(mut self, config: ComponentConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.hooks = hooks;
        self
    }
}

/// Bookkeeping maintained by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentMetadata {
    /// Milliseconds since the epoch.
    pub mounted_at: u64,
    pub last_updated: Option<u64>,
    pub update_count: u64,
    pub error_count: u64,
    /// Declared dependencies, including ones not currently registered.
    pub dependencies: Vec<ComponentId>,
    pub children: Vec<ComponentId>,
    pub parent: Option<ComponentId>,
    pub tags: BTreeSet<String>,
}

/// Read-only copy of a registered component.
#[derive(Debug, Clone)]
pub struct ComponentView {
    pub id: ComponentId,
    pub name: String,
    pub category: String,
    pub version: u32,
    pub state: Arc<Value>,
    pub metadata: ComponentMetadata,
}

/// Result of [`crate::StateRegistry::update_state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// New state equals the current one; nothing was recorded.
    Unchanged,
    /// State replaced. Paths are empty when change tracking is off.
    Changed { changed_paths: Vec<String> },
}

impl UpdateOutcome {
    pub fn is_changed(&self) -> bool {
        matches!(self, Self::Changed { .. })
    }
}

use crate::component::{
    ComponentConfig, ComponentMetadata, ComponentRegistration, ComponentView, HookResult,
    LifecycleHooks, UpdateOutcome,
};
use crate::error::{RegistryError, RegistryResult};
use crate::graph::{DependencyEdge, DependencyGraph, DependencyKind};
use crate::health::{HealthIssue, HealthIssueKind, HealthReport};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Value};
use statehub_bus::EventBus;
use statehub_detect::ChangeDetector;
use statehub_types::{Clock, ComponentId, Event, Priority, SystemClock, TaskHandle};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Registry configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Period of the background health check.
    pub health_interval_ms: u64,
    /// Components with more errors than this are flagged.
    pub max_error_count: u64,
    /// Components updated before but idle for longer than this are flagged.
    pub stale_after_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_interval_ms: 30_000,
            max_error_count: 10,
            stale_after_ms: 5 * 60 * 1000,
        }
    }
}

impl RegistryConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }
}

struct Entry {
    name: String,
    category: String,
    version: u32,
    state: Arc<Value>,
    metadata: ComponentMetadata,
    config: ComponentConfig,
    hooks: LifecycleHooks,
    snapshots: VecDeque<Arc<Value>>,
}

impl Entry {
    fn view(&self, id: &ComponentId) -> ComponentView {
        ComponentView {
            id: id.clone(),
            name: self.name.clone(),
            category: self.category.clone(),
            version: self.version,
            state: Arc::clone(&self.state),
            metadata: self.metadata.clone(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    components: HashMap<ComponentId, Entry>,
    graph: DependencyGraph,
}

/// Owns every registered component, its state and the dependency graph.
///
/// Mutations are serialized: each one updates the data, then runs the
/// relevant hooks, before the next mutation starts. Reads never wait for
/// hooks.
pub struct StateRegistry {
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    detector: Arc<ChangeDetector>,
    bus: Option<EventBus>,
    mutation: Mutex<()>,
    data: RwLock<RegistryState>,
}

impl Default for StateRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl StateRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            detector: Arc::new(ChangeDetector::default()),
            bus: None,
            mutation: Mutex::new(()),
            data: RwLock::new(RegistryState::default()),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_detector(mut self, detector: Arc<ChangeDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Publishes lifecycle, state-change and health events on `bus`.
    #[must_use]
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn detector(&self) -> &Arc<ChangeDetector> {
        &self.detector
    }

    // ── Lifecycle ────────────────────────────────────────────────

    pub fn register(&self, registration: ComponentRegistration) -> RegistryResult<()> {
        let _serial = self.mutation.lock();
        let ComponentRegistration {
            id,
            name,
            category,
            version,
            state,
            tags,
            parent,
            depends_on,
            config,
            hooks,
        } = registration;
        let state = Arc::new(state);

        {
            let mut data = self.data.write();
            if data.components.contains_key(&id) {
                return Err(RegistryError::DuplicateRegistration(id));
            }
            if let Some(parent_id) = &parent {
                let parent_entry = data
                    .components
                    .get_mut(parent_id)
                    .ok_or_else(|| RegistryError::UnknownComponent(parent_id.clone()))?;
                parent_entry.metadata.children.push(id.clone());
            }

            // A new node has no incoming edges, so these cannot form a cycle.
            let present: Vec<ComponentId> = depends_on
                .iter()
                .filter(|d| data.components.contains_key(*d))
                .cloned()
                .collect();
            for dep in present {
                data.graph.insert(DependencyEdge {
                    from: id.clone(),
                    to: dep,
                    kind: DependencyKind::Data,
                    required: true,
                });
            }

            let metadata = ComponentMetadata {
                mounted_at: self.clock.now_millis(),
                last_updated: None,
                update_count: 0,
                error_count: 0,
                dependencies: depends_on,
                children: Vec::new(),
                parent,
                tags,
            };
            data.components.insert(
                id.clone(),
                Entry {
                    name,
                    category: category.clone(),
                    version,
                    state: Arc::clone(&state),
                    metadata,
                    config,
                    hooks: hooks.clone(),
                    snapshots: VecDeque::new(),
                },
            );
        }

        if let Some(hook) = &hooks.on_mount {
            let outcome = run_hook(|| hook(&id, &state));
            self.route_hook_failure(&id, "on_mount", outcome);
        }
        info!(component = %id, category = %category, "Component registered");
        self.publish(&id, "mounted", json!({ "category": category }));
        Ok(())
    }

    /// Removes a component, its edges, its snapshots and its family links.
    pub fn unregister(&self, id: &ComponentId) -> RegistryResult<()> {
        let _serial = self.mutation.lock();
        let hooks = self
            .data
            .read()
            .components
            .get(id)
            .map(|e| e.hooks.clone())
            .ok_or_else(|| RegistryError::UnknownComponent(id.clone()))?;

        if let Some(hook) = &hooks.on_unmount {
            let outcome = run_hook(|| hook(id));
            self.route_hook_failure(id, "on_unmount", outcome);
        }

        let edges_removed = {
            let mut data = self.data.write();
            let Some(entry) = data.components.remove(id) else {
                return Err(RegistryError::UnknownComponent(id.clone()));
            };
            if let Some(parent) = &entry.metadata.parent {
                if let Some(p) = data.components.get_mut(parent) {
                    p.metadata.children.retain(|c| c != id);
                }
            }
            for child in &entry.metadata.children {
                if let Some(c) = data.components.get_mut(child) {
                    c.metadata.parent = None;
                }
            }
            data.graph.remove_node(id)
        };

        info!(component = %id, edges_removed, "Component unregistered");
        self.publish(id, "unmounted", Value::Null);
        Ok(())
    }

    // ── State ────────────────────────────────────────────────────

    /// Replaces a component's state.
    ///
    /// With change tracking on, an identical state is a no-op. Otherwise the
    /// previous state is snapshotted, counters advance and `on_state_change`
    /// runs; a failing hook is routed to `on_error` and does not undo the
    /// update.
    pub fn update_state(&self, id: &ComponentId, new_state: Value) -> RegistryResult<UpdateOutcome> {
        let _serial = self.mutation.lock();
        let new_state = Arc::new(new_state);

        let (old_state, hooks, changed_paths, update_count) = {
            let mut data = self.data.write();
            let entry = data
                .components
                .get_mut(id)
                .ok_or_else(|| RegistryError::UnknownComponent(id.clone()))?;

            let changed_paths = if entry.config.track_changes {
                let changes = self.detector.compare(&entry.state, &new_state);
                if changes.equal {
                    debug!(component = %id, "State unchanged, skipping update");
                    return Ok(UpdateOutcome::Unchanged);
                }
                changes.changed_paths
            } else {
                Vec::new()
            };

            let old_state = std::mem::replace(&mut entry.state, Arc::clone(&new_state));
            if entry.config.max_snapshots > 0 {
                entry.snapshots.push_back(Arc::clone(&old_state));
                while entry.snapshots.len() > entry.config.max_snapshots {
                    entry.snapshots.pop_front();
                }
            }
            entry.metadata.last_updated = Some(self.clock.now_millis());
            entry.metadata.update_count += 1;
            (
                old_state,
                entry.hooks.clone(),
                changed_paths,
                entry.metadata.update_count,
            )
        };

        if let Some(hook) = &hooks.on_state_change {
            let outcome = run_hook(|| hook(&new_state, &old_state));
            self.route_hook_failure(id, "on_state_change", outcome);
        }
        debug!(component = %id, update_count, paths = changed_paths.len(), "State updated");
        self.publish(
            id,
            "state_changed",
            json!({ "changed_paths": changed_paths, "update_count": update_count }),
        );
        Ok(UpdateOutcome::Changed { changed_paths })
    }

    /// Pops the most recent snapshot back into the component's state.
    pub fn restore_snapshot(&self, id: &ComponentId) -> RegistryResult<Arc<Value>> {
        let _serial = self.mutation.lock();
        let (restored, replaced, hooks) = {
            let mut data = self.data.write();
            let entry = data
                .components
                .get_mut(id)
                .ok_or_else(|| RegistryError::UnknownComponent(id.clone()))?;
            let snapshot = entry
                .snapshots
                .pop_back()
                .ok_or_else(|| RegistryError::NoSnapshot(id.clone()))?;
            let replaced = std::mem::replace(&mut entry.state, Arc::clone(&snapshot));
            entry.metadata.last_updated = Some(self.clock.now_millis());
            (snapshot, replaced, entry.hooks.clone())
        };

        if let Some(hook) = &hooks.on_state_change {
            let outcome = run_hook(|| hook(&restored, &replaced));
            self.route_hook_failure(id, "on_state_change", outcome);
        }
        info!(component = %id, "Snapshot restored");
        self.publish(id, "state_changed", json!({ "restored": true }));
        Ok(restored)
    }

    pub fn get_state(&self, id: &ComponentId) -> Option<Arc<Value>> {
        self.data
            .read()
            .components
            .get(id)
            .map(|e| Arc::clone(&e.state))
    }

    pub fn get_metadata(&self, id: &ComponentId) -> Option<ComponentMetadata> {
        self.data
            .read()
            .components
            .get(id)
            .map(|e| e.metadata.clone())
    }

    pub fn get_component(&self, id: &ComponentId) -> Option<ComponentView> {
        self.data.read().components.get(id).map(|e| e.view(id))
    }

    pub fn snapshot_count(&self, id: &ComponentId) -> usize {
        self.data
            .read()
            .components
            .get(id)
            .map_or(0, |e| e.snapshots.len())
    }

    /// Counts an error against a component and fires its `on_error` hook.
    pub fn report_error(&self, id: &ComponentId, message: &str) -> RegistryResult<()> {
        let hooks = {
            let mut data = self.data.write();
            let entry = data
                .components
                .get_mut(id)
                .ok_or_else(|| RegistryError::UnknownComponent(id.clone()))?;
            entry.metadata.error_count += 1;
            entry.hooks.clone()
        };
        warn!(component = %id, "{}", message);
        if let Some(on_error) = &hooks.on_error {
            if let Err(panic) = run_hook(|| {
                on_error(id, message);
                Ok(())
            }) {
                warn!(component = %id, "on_error hook failed: {}", panic);
            }
        }
        Ok(())
    }

    fn route_hook_failure(&self, id: &ComponentId, hook: &str, outcome: HookResult) {
        let Err(reason) = outcome else { return };
        let message = format!("{hook} hook failed: {reason}");
        if self.report_error(id, &message).is_err() {
            warn!(component = %id, "{}", message);
        }
    }

    // ── Dependencies ─────────────────────────────────────────────

    /// Adds `from -> to`. Both must exist and the edge must keep the graph
    /// acyclic.
    pub fn add_dependency(
        &self,
        from: &ComponentId,
        to: &ComponentId,
        kind: DependencyKind,
        required: bool,
    ) -> RegistryResult<()> {
        let _serial = self.mutation.lock();
        let mut data = self.data.write();
        for id in [from, to] {
            if !data.components.contains_key(id) {
                return Err(RegistryError::UnknownComponent(id.clone()));
            }
        }
        if data.graph.would_create_cycle(from, to) {
            warn!(from = %from, to = %to, "Rejected cyclic dependency");
            return Err(RegistryError::CyclicDependency {
                from: from.clone(),
                to: to.clone(),
            });
        }
        data.graph.insert(DependencyEdge {
            from: from.clone(),
            to: to.clone(),
            kind,
            required,
        });
        debug_assert!(data.graph.is_acyclic());
        if let Some(entry) = data.components.get_mut(from) {
            if !entry.metadata.dependencies.contains(to) {
                entry.metadata.dependencies.push(to.clone());
            }
        }
        debug!(from = %from, to = %to, kind = ?kind, "Dependency added");
        Ok(())
    }

    /// Removes the edge and the declaration. Returns false if neither existed.
    pub fn remove_dependency(&self, from: &ComponentId, to: &ComponentId) -> bool {
        let _serial = self.mutation.lock();
        let mut data = self.data.write();
        let edge = data.graph.remove(from, to);
        let declared = data.components.get_mut(from).is_some_and(|entry| {
            let before = entry.metadata.dependencies.len();
            entry.metadata.dependencies.retain(|d| d != to);
            before != entry.metadata.dependencies.len()
        });
        edge || declared
    }

    pub fn dependencies_of(&self, id: &ComponentId) -> Vec<DependencyEdge> {
        self.data.read().graph.edges_from(id)
    }

    pub fn dependents_of(&self, id: &ComponentId) -> Vec<ComponentId> {
        self.data.read().graph.dependents_of(id)
    }

    pub fn dependency_count(&self) -> usize {
        self.data.read().graph.edge_count()
    }

    /// Full acyclicity check of the dependency graph.
    pub fn graph_is_acyclic(&self) -> bool {
        self.data.read().graph.is_acyclic()
    }

    // ── Queries ──────────────────────────────────────────────────

    pub fn contains(&self, id: &ComponentId) -> bool {
        self.data.read().components.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.data.read().components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<ComponentId> {
        let mut ids: Vec<_> = self.data.read().components.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn components_by_category(&self, category: &str) -> Vec<ComponentId> {
        self.select(|e| e.category == category)
    }

    pub fn components_by_tag(&self, tag: &str) -> Vec<ComponentId> {
        self.select(|e| e.metadata.tags.contains(tag))
    }

    fn select(&self, pred: impl Fn(&Entry) -> bool) -> Vec<ComponentId> {
        let mut ids: Vec<_> = self
            .data
            .read()
            .components
            .iter()
            .filter(|(_, e)| pred(e))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    // ── Health ───────────────────────────────────────────────────

    /// Flags components with too many errors, stale components and
    /// declared dependencies that are not registered.
    pub fn perform_health_check(&self) -> HealthReport {
        let now = self.clock.now_millis();
        let data = self.data.read();
        let mut issues = Vec::new();

        let mut ids: Vec<&ComponentId> = data.components.keys().collect();
        ids.sort();
        for id in ids {
            let meta = &data.components[id].metadata;
            if meta.error_count > self.config.max_error_count {
                issues.push(HealthIssue {
                    component: id.clone(),
                    kind: HealthIssueKind::ExcessiveErrors {
                        error_count: meta.error_count,
                    },
                });
            }
            if meta.update_count > 0 {
                let idle_ms = now.saturating_sub(meta.last_updated.unwrap_or(meta.mounted_at));
                if idle_ms > self.config.stale_after_ms {
                    issues.push(HealthIssue {
                        component: id.clone(),
                        kind: HealthIssueKind::Stale { idle_ms },
                    });
                }
            }
            let declared: BTreeSet<&ComponentId> = meta.dependencies.iter().collect();
            for dep in declared {
                if !data.components.contains_key(dep) {
                    issues.push(HealthIssue {
                        component: id.clone(),
                        kind: HealthIssueKind::MissingDependency {
                            dependency: dep.clone(),
                        },
                    });
                }
            }
        }
        let report = HealthReport {
            checked_at: now,
            components: data.components.len(),
            issues,
        };
        drop(data);

        if report.is_healthy() {
            debug!(components = report.components, "Health check passed");
        } else {
            warn!(components = report.components, issues = report.issues.len(), "Health check found issues");
            if let Some(bus) = &self.bus {
                let payload = serde_json::to_value(&report).unwrap_or(Value::Null);
                let event = Event::new("registry.health", payload)
                    .with_type("health_report")
                    .with_source("registry")
                    .with_priority(Priority::High);
                if let Err(e) = bus.publish(event) {
                    warn!("Failed to publish health report: {}", e);
                }
            }
        }
        report
    }

    /// Runs [`StateRegistry::perform_health_check`] every configured interval.
    pub fn spawn_health_check(self: &Arc<Self>) -> TaskHandle {
        let registry = Arc::clone(self);
        TaskHandle::periodic("registry-health", self.config.health_interval(), move || {
            let registry = Arc::clone(&registry);
            async move {
                registry.perform_health_check();
            }
        })
    }

    fn publish(&self, id: &ComponentId, what: &str, payload: Value) {
        let Some(bus) = &self.bus else { return };
        let event = Event::new(format!("component.{id}.{what}"), payload)
            .with_type(what)
            .with_source("registry");
        if let Err(e) = bus.publish(event) {
            warn!(component = %id, "Failed to publish {} event: {}", what, e);
        }
    }
}

fn run_hook(f: impl FnOnce() -> HookResult) -> HookResult {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(outcome) => outcome,
        Err(panic) => Err(panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "hook panicked".to_string())),
    }
}

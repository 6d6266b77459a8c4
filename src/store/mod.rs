//! Registry: the central component map
//!
//! The store holds every registered definition in per-kind indexes, tracks
//! which resource registered what (ownership + export visibility), records
//! intentional overrides, and locks at the end of boot. Registration walks
//! the root resource's `register[]` tree depth-first; re-registering the
//! same definition instance deduplicates, two different definitions sharing
//! an id conflict.

mod visibility;

pub use visibility::VisibilityTracker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

use crate::api::{ResourceValue, Scratch};
use crate::def::{
    DependencyRef, ErrorDef, EventDef, Hook, Registrable, Resource, ResourceMiddleware, TagDef,
    Task, TaskMiddleware,
};
use crate::errors::KernelError;
use crate::ident::{ComponentId, Kind};
use crate::system;

// ============================================================================
// RESOURCE STATE
// ============================================================================

/// Lifecycle states of a resource entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Unborn,
    Initializing,
    Ready,
    Disposing,
    Disposed,
    Failed,
    FailedDispose,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Unborn => "unborn",
            ResourceState::Initializing => "initializing",
            ResourceState::Ready => "ready",
            ResourceState::Disposing => "disposing",
            ResourceState::Disposed => "disposed",
            ResourceState::Failed => "failed",
            ResourceState::FailedDispose => "failed-dispose",
        }
    }
}

// ============================================================================
// RUNTIME ENTRIES
// ============================================================================

/// A task definition plus its resolved dependency cache
pub struct TaskEntry {
    pub definition: Task,
    /// Materialized once by the resolver (deferred factories run here)
    pub computed: OnceCell<Vec<DependencyRef>>,
}

impl TaskEntry {
    fn new(definition: Task) -> Arc<Self> {
        Arc::new(TaskEntry {
            definition,
            computed: OnceCell::new(),
        })
    }

    pub fn dependencies(&self) -> &[DependencyRef] {
        self.computed
            .get_or_init(|| self.definition.dependencies.materialize())
    }
}

/// A resource definition plus its lifecycle state and value
pub struct ResourceEntry {
    pub definition: Resource,
    state: RwLock<ResourceState>,
    value: RwLock<Option<ResourceValue>>,
    pub computed: OnceCell<Vec<DependencyRef>>,
    scratch: OnceCell<Scratch>,
}

impl ResourceEntry {
    fn new(definition: Resource) -> Arc<Self> {
        Arc::new(ResourceEntry {
            definition,
            state: RwLock::new(ResourceState::Unborn),
            value: RwLock::new(None),
            computed: OnceCell::new(),
            scratch: OnceCell::new(),
        })
    }

    pub fn dependencies(&self) -> &[DependencyRef] {
        self.computed
            .get_or_init(|| self.definition.dependencies.materialize())
    }

    pub fn state(&self) -> ResourceState {
        *self.state.read()
    }

    pub fn set_state(&self, state: ResourceState) {
        *self.state.write() = state;
    }

    pub fn value(&self) -> Option<ResourceValue> {
        self.value.read().clone()
    }

    pub fn set_value(&self, value: ResourceValue) {
        *self.value.write() = Some(value);
    }

    pub fn clear_value(&self) {
        *self.value.write() = None;
    }

    pub fn config(&self) -> &Value {
        &self.definition.config
    }

    /// The scratch context, created once from `context()` on first use
    pub fn scratch(&self) -> Option<&Scratch> {
        let factory = self.definition.context.as_ref()?;
        Some(self.scratch.get_or_init(|| Scratch::new(factory())))
    }
}

/// A middleware definition plus its resolved dependency cache
pub struct TaskMiddlewareEntry {
    pub definition: TaskMiddleware,
    pub computed: OnceCell<Vec<DependencyRef>>,
}

impl TaskMiddlewareEntry {
    fn new(definition: TaskMiddleware) -> Arc<Self> {
        Arc::new(TaskMiddlewareEntry {
            definition,
            computed: OnceCell::new(),
        })
    }

    pub fn dependencies(&self) -> &[DependencyRef] {
        self.computed
            .get_or_init(|| self.definition.dependencies.materialize())
    }
}

pub struct ResourceMiddlewareEntry {
    pub definition: ResourceMiddleware,
    pub computed: OnceCell<Vec<DependencyRef>>,
}

impl ResourceMiddlewareEntry {
    fn new(definition: ResourceMiddleware) -> Arc<Self> {
        Arc::new(ResourceMiddlewareEntry {
            definition,
            computed: OnceCell::new(),
        })
    }

    pub fn dependencies(&self) -> &[DependencyRef] {
        self.computed
            .get_or_init(|| self.definition.dependencies.materialize())
    }
}

pub struct HookEntry {
    pub definition: Hook,
    pub computed: OnceCell<Vec<DependencyRef>>,
}

impl HookEntry {
    fn new(definition: Hook) -> Arc<Self> {
        Arc::new(HookEntry {
            definition,
            computed: OnceCell::new(),
        })
    }

    pub fn dependencies(&self) -> &[DependencyRef] {
        self.computed
            .get_or_init(|| self.definition.dependencies.materialize())
    }
}

/// Per-kind component counts, logged once after boot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub tasks: usize,
    pub resources: usize,
    pub events: usize,
    pub task_middlewares: usize,
    pub resource_middlewares: usize,
    pub hooks: usize,
    pub tags: usize,
    pub errors: usize,
}

// ============================================================================
// STORE
// ============================================================================

/// Central component registry; mutable until [`Store::lock`]
pub struct Store {
    tasks: RwLock<FxHashMap<ComponentId, Arc<TaskEntry>>>,
    resources: RwLock<FxHashMap<ComponentId, Arc<ResourceEntry>>>,
    task_middlewares: RwLock<FxHashMap<ComponentId, Arc<TaskMiddlewareEntry>>>,
    resource_middlewares: RwLock<FxHashMap<ComponentId, Arc<ResourceMiddlewareEntry>>>,
    events: RwLock<FxHashMap<ComponentId, EventDef>>,
    hooks: RwLock<FxHashMap<ComponentId, Arc<HookEntry>>>,
    tags: RwLock<FxHashMap<ComponentId, TagDef>>,
    errors: RwLock<FxHashMap<ComponentId, ErrorDef>>,
    /// Instance fingerprints per (kind, id); same fingerprint = same instance
    fingerprints: RwLock<FxHashMap<(Kind, ComponentId), u64>>,
    visibility: RwLock<VisibilityTracker>,
    overridden: RwLock<FxHashSet<ComponentId>>,
    /// Overrides collected during the registration walk, applied post-order
    pending_overrides: RwLock<Vec<Registrable>>,
    locked: AtomicBool,
    initialized: AtomicBool,
}

impl Store {
    pub fn new() -> Self {
        Store {
            tasks: RwLock::new(FxHashMap::default()),
            resources: RwLock::new(FxHashMap::default()),
            task_middlewares: RwLock::new(FxHashMap::default()),
            resource_middlewares: RwLock::new(FxHashMap::default()),
            events: RwLock::new(FxHashMap::default()),
            hooks: RwLock::new(FxHashMap::default()),
            tags: RwLock::new(FxHashMap::default()),
            errors: RwLock::new(FxHashMap::default()),
            fingerprints: RwLock::new(FxHashMap::default()),
            visibility: RwLock::new(VisibilityTracker::new()),
            overridden: RwLock::new(FxHashSet::default()),
            pending_overrides: RwLock::new(Vec::new()),
            locked: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
        }
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register the root resource and everything it transitively pulls in
    pub fn register_tree(&self, root: Resource) -> Result<(), KernelError> {
        self.store_item(Registrable::Resource(root), None)
    }

    /// Dispatch one item into the matching index
    ///
    /// `owner` is the resource whose `register[]` contained the item; None
    /// for the root.
    pub fn store_item(
        &self,
        item: Registrable,
        owner: Option<&ComponentId>,
    ) -> Result<(), KernelError> {
        self.ensure_unlocked()?;

        let id = item.id().clone();
        let kind = item.kind();
        id.validate().map_err(|source| KernelError::InvalidId {
            id: id.to_string(),
            source,
        })?;

        // Same-instance re-registration deduplicates silently.
        let fingerprint = fingerprint_of(&item);
        {
            let mut fps = self.fingerprints.write();
            match fps.get(&(kind, id.clone())) {
                Some(existing) if *existing == fingerprint && self.configs_match(&item) => {
                    return Ok(());
                }
                Some(_) => {
                    return Err(KernelError::DuplicateRegistration { kind, id });
                }
                None => {
                    fps.insert((kind, id.clone()), fingerprint);
                }
            }
        }

        self.visibility.write().track(id.clone(), owner);

        match item {
            Registrable::Resource(resource) => self.store_resource(resource, owner),
            Registrable::Task(task) => self.store_task(task),
            Registrable::TaskMiddleware(mw) => {
                self.task_middlewares
                    .write()
                    .insert(id, TaskMiddlewareEntry::new(mw));
                Ok(())
            }
            Registrable::ResourceMiddleware(mw) => {
                self.resource_middlewares
                    .write()
                    .insert(id, ResourceMiddlewareEntry::new(mw));
                Ok(())
            }
            Registrable::Event(event) => {
                self.events.write().insert(id, event);
                Ok(())
            }
            Registrable::Hook(hook) => {
                self.hooks.write().insert(id, HookEntry::new(hook));
                Ok(())
            }
            Registrable::Tag(tag) => {
                self.tags.write().insert(id, tag);
                Ok(())
            }
            Registrable::Error(error) => {
                self.errors.write().insert(id, error);
                Ok(())
            }
        }
    }

    fn store_resource(
        &self,
        resource: Resource,
        _owner: Option<&ComponentId>,
    ) -> Result<(), KernelError> {
        let id = resource.id.clone();

        if let Some(exports) = resource.exports.clone() {
            self.visibility.write().set_exports(&id, exports);
        }
        for event in system::lifecycle_events_for_resource(&id) {
            self.register_system_event(event);
        }

        let children = resource.register.clone();
        let overrides = resource.overrides.clone();
        self.resources
            .write()
            .insert(id.clone(), ResourceEntry::new(resource));

        for child in children {
            self.store_item(child, Some(&id))?;
        }
        // Post-order: outer resources' overrides apply after (and win over)
        // anything declared deeper in the tree.
        self.pending_overrides.write().extend(overrides);
        Ok(())
    }

    fn store_task(&self, task: Task) -> Result<(), KernelError> {
        let id = task.id.clone();
        for event in system::lifecycle_events_for_task(&id) {
            self.register_system_event(event);
        }
        self.tasks.write().insert(id, TaskEntry::new(task));
        Ok(())
    }

    /// Auto-created events bypass dedup (re-registration is expected) and
    /// stay out of the visibility tracker, so they are always listenable.
    fn register_system_event(&self, event: EventDef) {
        self.events.write().entry(event.id.clone()).or_insert(event);
    }

    /// Two bindings of one resource conflict unless their configs agree.
    fn configs_match(&self, item: &Registrable) -> bool {
        match item {
            Registrable::Resource(resource) => self
                .resources
                .read()
                .get(&resource.id)
                .map(|existing| existing.definition.config == resource.config)
                .unwrap_or(true),
            _ => true,
        }
    }

    // ------------------------------------------------------------------
    // Overrides
    // ------------------------------------------------------------------

    /// Apply every override collected during registration, in walk order
    pub fn apply_overrides(&self) -> Result<(), KernelError> {
        self.ensure_unlocked()?;
        let pending = std::mem::take(&mut *self.pending_overrides.write());
        for item in pending {
            self.apply_override(item)?;
        }
        Ok(())
    }

    fn apply_override(&self, item: Registrable) -> Result<(), KernelError> {
        let id = item.id().clone();
        match item {
            Registrable::Task(task) => {
                let mut tasks = self.tasks.write();
                if !tasks.contains_key(&id) {
                    return Err(KernelError::OverrideTargetNotFound { id });
                }
                tasks.insert(id.clone(), TaskEntry::new(task));
            }
            Registrable::Resource(resource) => {
                let mut resources = self.resources.write();
                if !resources.contains_key(&id) {
                    return Err(KernelError::OverrideTargetNotFound { id });
                }
                resources.insert(id.clone(), ResourceEntry::new(resource));
            }
            Registrable::TaskMiddleware(mw) => {
                let mut mws = self.task_middlewares.write();
                if !mws.contains_key(&id) {
                    return Err(KernelError::OverrideTargetNotFound { id });
                }
                mws.insert(id.clone(), TaskMiddlewareEntry::new(mw));
            }
            Registrable::ResourceMiddleware(mw) => {
                let mut mws = self.resource_middlewares.write();
                if !mws.contains_key(&id) {
                    return Err(KernelError::OverrideTargetNotFound { id });
                }
                mws.insert(id.clone(), ResourceMiddlewareEntry::new(mw));
            }
            Registrable::Event(event) => {
                let mut events = self.events.write();
                if !events.contains_key(&id) {
                    return Err(KernelError::OverrideTargetNotFound { id });
                }
                events.insert(id.clone(), event);
            }
            Registrable::Hook(hook) => {
                let mut hooks = self.hooks.write();
                if !hooks.contains_key(&id) {
                    return Err(KernelError::OverrideTargetNotFound { id });
                }
                hooks.insert(id.clone(), HookEntry::new(hook));
            }
            Registrable::Tag(tag) => {
                let mut tags = self.tags.write();
                if !tags.contains_key(&id) {
                    return Err(KernelError::OverrideTargetNotFound { id });
                }
                tags.insert(id.clone(), tag);
            }
            Registrable::Error(error) => {
                let mut errors = self.errors.write();
                if !errors.contains_key(&id) {
                    return Err(KernelError::OverrideTargetNotFound { id });
                }
                errors.insert(id.clone(), error);
            }
        }
        self.overridden.write().insert(id);
        Ok(())
    }

    pub fn is_overridden(&self, id: &ComponentId) -> bool {
        self.overridden.read().contains(id)
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn task(&self, id: &ComponentId) -> Option<Arc<TaskEntry>> {
        self.tasks.read().get(id).cloned()
    }

    pub fn require_task(&self, id: &ComponentId) -> Result<Arc<TaskEntry>, KernelError> {
        self.task(id)
            .ok_or_else(|| KernelError::TaskNotFound { id: id.clone() })
    }

    pub fn resource(&self, id: &ComponentId) -> Option<Arc<ResourceEntry>> {
        self.resources.read().get(id).cloned()
    }

    pub fn require_resource(&self, id: &ComponentId) -> Result<Arc<ResourceEntry>, KernelError> {
        self.resource(id)
            .ok_or_else(|| KernelError::ResourceNotFound { id: id.clone() })
    }

    pub fn task_middleware(&self, id: &ComponentId) -> Option<Arc<TaskMiddlewareEntry>> {
        self.task_middlewares.read().get(id).cloned()
    }

    pub fn resource_middleware(&self, id: &ComponentId) -> Option<Arc<ResourceMiddlewareEntry>> {
        self.resource_middlewares.read().get(id).cloned()
    }

    pub fn event(&self, id: &ComponentId) -> Option<EventDef> {
        self.events.read().get(id).cloned()
    }

    pub fn tag(&self, id: &ComponentId) -> Option<TagDef> {
        self.tags.read().get(id).cloned()
    }

    pub fn error(&self, id: &ComponentId) -> Option<ErrorDef> {
        self.errors.read().get(id).cloned()
    }

    pub fn has(&self, kind: Kind, id: &ComponentId) -> bool {
        match kind {
            Kind::Task => self.tasks.read().contains_key(id),
            Kind::Resource => self.resources.read().contains_key(id),
            Kind::TaskMiddleware => self.task_middlewares.read().contains_key(id),
            Kind::ResourceMiddleware => self.resource_middlewares.read().contains_key(id),
            Kind::Event => self.events.read().contains_key(id),
            Kind::Hook => self.hooks.read().contains_key(id),
            Kind::Tag => self.tags.read().contains_key(id),
            Kind::Error => self.errors.read().contains_key(id),
        }
    }

    pub fn tasks_snapshot(&self) -> Vec<Arc<TaskEntry>> {
        self.tasks.read().values().cloned().collect()
    }

    pub fn resources_snapshot(&self) -> Vec<Arc<ResourceEntry>> {
        self.resources.read().values().cloned().collect()
    }

    pub fn hooks_snapshot(&self) -> Vec<Arc<HookEntry>> {
        self.hooks.read().values().cloned().collect()
    }

    pub fn events_snapshot(&self) -> Vec<EventDef> {
        self.events.read().values().cloned().collect()
    }

    /// Task middlewares flagged `everywhere`
    pub fn global_task_middlewares(&self) -> Vec<Arc<TaskMiddlewareEntry>> {
        self.task_middlewares
            .read()
            .values()
            .filter(|entry| entry.definition.is_global())
            .cloned()
            .collect()
    }

    /// Resource middlewares flagged `everywhere`
    pub fn global_resource_middlewares(&self) -> Vec<Arc<ResourceMiddlewareEntry>> {
        self.resource_middlewares
            .read()
            .values()
            .filter(|entry| entry.definition.is_global())
            .cloned()
            .collect()
    }

    pub fn with_visibility<R>(&self, f: impl FnOnce(&VisibilityTracker) -> R) -> R {
        f(&self.visibility.read())
    }

    pub fn counts(&self) -> StoreCounts {
        StoreCounts {
            tasks: self.tasks.read().len(),
            resources: self.resources.read().len(),
            events: self.events.read().len(),
            task_middlewares: self.task_middlewares.read().len(),
            resource_middlewares: self.resource_middlewares.read().len(),
            hooks: self.hooks.read().len(),
            tags: self.tags.read().len(),
            errors: self.errors.read().len(),
        }
    }

    // ------------------------------------------------------------------
    // Lock discipline
    // ------------------------------------------------------------------

    pub fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    fn ensure_unlocked(&self) -> Result<(), KernelError> {
        if self.is_locked() {
            return Err(KernelError::Locked { what: "store" });
        }
        Ok(())
    }

    /// Flip the one-shot boot flag
    pub fn mark_initialized(&self) -> Result<(), KernelError> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(KernelError::StoreAlreadyInitialized);
        }
        Ok(())
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("counts", &self.counts())
            .field("locked", &self.is_locked())
            .finish()
    }
}

fn fingerprint_of(item: &Registrable) -> u64 {
    match item {
        Registrable::Task(t) => t.fingerprint,
        Registrable::Resource(r) => r.fingerprint,
        Registrable::TaskMiddleware(m) => m.fingerprint,
        Registrable::ResourceMiddleware(m) => m.fingerprint,
        Registrable::Event(e) => e.fingerprint,
        Registrable::Hook(h) => h.fingerprint,
        Registrable::Tag(t) => t.fingerprint,
        Registrable::Error(e) => e.fingerprint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(s: &str) -> ComponentId {
        ComponentId::new(s)
    }

    #[test]
    fn register_tree_walks_children() {
        let store = Store::new();
        let root = Resource::new("app")
            .register(Task::new("app.t1"))
            .register(Resource::new("app.db").register(Task::new("app.db.ping")));

        store.register_tree(root).unwrap();

        assert!(store.task(&id("app.t1")).is_some());
        assert!(store.resource(&id("app.db")).is_some());
        assert!(store.task(&id("app.db.ping")).is_some());

        // Ownership follows the walk.
        store.with_visibility(|vt| {
            assert_eq!(vt.owner_of(&id("app.db.ping")), Some(&id("app.db")));
            assert_eq!(vt.owner_of(&id("app.db")), Some(&id("app")));
            assert_eq!(vt.owner_of(&id("app")), None);
        });
    }

    #[test]
    fn same_instance_twice_deduplicates() {
        let store = Store::new();
        let shared = Task::new("app.shared");
        let root = Resource::new("app")
            .register(shared.clone())
            .register(Resource::new("app.mod").register(shared.clone()));

        store.register_tree(root).unwrap();
        assert!(store.task(&id("app.shared")).is_some());
    }

    #[test]
    fn different_instances_same_id_conflict() {
        let store = Store::new();
        let root = Resource::new("app")
            .register(Task::new("app.t"))
            .register(Task::new("app.t"));

        let err = store.register_tree(root).unwrap_err();
        assert_eq!(err.kind(), "DUPLICATE_REGISTRATION");
    }

    #[test]
    fn same_resource_different_config_conflicts() {
        let store = Store::new();
        let db = Resource::new("app.db");
        let root = Resource::new("app")
            .register(db.clone().with(json!({"pool": 5})))
            .register(db.clone().with(json!({"pool": 9})));

        let err = store.register_tree(root).unwrap_err();
        assert_eq!(err.kind(), "DUPLICATE_REGISTRATION");
    }

    #[test]
    fn invalid_id_is_reported() {
        let store = Store::new();
        let err = store
            .register_tree(Resource::new("has space"))
            .unwrap_err();
        assert_eq!(err.kind(), "INVALID_ID");
    }

    #[test]
    fn lifecycle_events_are_auto_created() {
        let store = Store::new();
        store
            .register_tree(Resource::new("app").register(Task::new("app.t")))
            .unwrap();

        assert!(store.event(&id("app.events.before_init")).is_some());
        assert!(store.event(&id("app.events.after_init")).is_some());
        assert!(store.event(&id("app.t.events.before_run")).is_some());
        assert!(store.event(&id("app.t.events.on_error")).is_some());
    }

    #[test]
    fn overrides_replace_registered_definitions() {
        let store = Store::new();
        let original = Task::new("app.greet");
        let replacement = Task::new("app.greet").listener_order(99);
        let root = Resource::new("app")
            .register(Resource::new("app.mod").register(original))
            .override_with(replacement);

        store.register_tree(root).unwrap();
        store.apply_overrides().unwrap();

        assert!(store.is_overridden(&id("app.greet")));
        assert_eq!(
            store.task(&id("app.greet")).unwrap().definition.listener_order,
            99
        );
    }

    #[test]
    fn override_of_unregistered_target_errors() {
        let store = Store::new();
        let root = Resource::new("app").override_with(Task::new("app.ghost"));
        store.register_tree(root).unwrap();

        let err = store.apply_overrides().unwrap_err();
        assert_eq!(err.kind(), "OVERRIDE_TARGET_NOT_FOUND");
    }

    #[test]
    fn locked_store_rejects_writes() {
        let store = Store::new();
        store.register_tree(Resource::new("app")).unwrap();
        store.lock();

        let err = store
            .store_item(Registrable::Task(Task::new("app.late")), None)
            .unwrap_err();
        assert_eq!(err.kind(), "LOCKED");
        let err = store.apply_overrides().unwrap_err();
        assert_eq!(err.kind(), "LOCKED");
    }

    #[test]
    fn mark_initialized_is_one_shot() {
        let store = Store::new();
        store.mark_initialized().unwrap();
        let err = store.mark_initialized().unwrap_err();
        assert_eq!(err.kind(), "STORE_ALREADY_INITIALIZED");
    }

    #[test]
    fn counts_reflect_registration() {
        let store = Store::new();
        let root = Resource::new("app")
            .register(Task::new("app.t"))
            .register(EventDef::new("app.e"))
            .register(TagDef::new("app.tag"))
            .register(ErrorDef::new("app.err"));
        store.register_tree(root).unwrap();

        let counts = store.counts();
        assert_eq!(counts.tasks, 1);
        assert_eq!(counts.resources, 1);
        assert_eq!(counts.tags, 1);
        assert_eq!(counts.errors, 1);
        // app.e plus auto-created lifecycle events.
        assert!(counts.events > 1);
    }

    #[test]
    fn resource_entry_state_machine() {
        let entry = ResourceEntry::new(Resource::new("app.db"));
        assert_eq!(entry.state(), ResourceState::Unborn);
        entry.set_state(ResourceState::Initializing);
        entry.set_state(ResourceState::Ready);
        entry.set_value(Arc::new("conn".to_string()));
        assert_eq!(entry.state(), ResourceState::Ready);
        let value = entry.value().unwrap();
        assert_eq!(&*crate::api::value_as::<String>(&value).unwrap(), "conn");
    }

    #[test]
    fn scratch_is_created_once_from_context() {
        let entry = ResourceEntry::new(
            Resource::new("app.db").context(|| json!({"attempts": 0})),
        );
        let scratch = entry.scratch().unwrap();
        scratch.update(|v| v["attempts"] = json!(2));
        // Second access returns the same scratch, not a fresh one.
        assert_eq!(entry.scratch().unwrap().snapshot(), json!({"attempts": 2}));
    }

    #[test]
    fn entry_without_context_has_no_scratch() {
        let entry = ResourceEntry::new(Resource::new("app.db"));
        assert!(entry.scratch().is_none());
    }
}

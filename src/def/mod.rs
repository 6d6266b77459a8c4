//! Declarative component definitions
//!
//! Pure descriptors: a definition carries an id, a kind marker, and the
//! closures/metadata the runtime wraps with state. Builders are fluent and
//! cheap to clone (`Arc` internals); nothing here executes until `run()`.

mod app_error;
mod event;
mod hook;
mod middleware;
mod resource;
mod tag;
mod task;

pub use app_error::ErrorDef;
pub use event::EventDef;
pub use hook::Hook;
pub use middleware::{
    EverywhereFlag, MiddlewareUsage, ResourceMiddleware, ResourceMiddlewareRun, TaskMiddleware,
    TaskMiddlewareRun,
};
pub use resource::{Resource, ResourceDisposeFn, ResourceInitFn};
pub use tag::{TagDef, TagUsage};
pub use task::{Task, TaskRun};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::ident::{ComponentId, Kind};

/// Instance fingerprints distinguish "the same definition registered twice"
/// (deduplicated) from "two definitions sharing an id" (a conflict). Clones
/// keep the fingerprint of the definition they were built from.
static FINGERPRINT: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_fingerprint() -> u64 {
    FINGERPRINT.fetch_add(1, Ordering::Relaxed)
}

// ============================================================================
// METADATA
// ============================================================================

/// Free-form descriptive metadata on any definition
#[derive(Debug, Clone, Default)]
pub struct Meta {
    pub title: Option<String>,
    pub description: Option<String>,
}

impl Meta {
    pub fn titled(title: impl Into<String>) -> Self {
        Meta {
            title: Some(title.into()),
            description: None,
        }
    }
}

// ============================================================================
// LISTEN TARGETS
// ============================================================================

/// What a hook or listening task subscribes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenSpec {
    /// One concrete event id
    Event(ComponentId),
    /// Every non-system event (`"*"`)
    Any,
}

// ============================================================================
// DEPENDENCIES
// ============================================================================

/// A named edge from a definition to another component
#[derive(Debug, Clone)]
pub struct DependencyRef {
    pub name: String,
    pub kind: Kind,
    pub id: ComponentId,
}

/// Anything a definition can depend on
pub trait AsDependency {
    fn dependency_kind(&self) -> Kind;
    fn dependency_id(&self) -> &ComponentId;
}

/// Build a named dependency edge, mostly for deferred factories
pub fn dep(name: &str, target: &impl AsDependency) -> DependencyRef {
    DependencyRef {
        name: name.to_string(),
        kind: target.dependency_kind(),
        id: target.dependency_id().clone(),
    }
}

/// Dependency declaration: direct, or deferred behind a factory to break
/// description-time reference cycles. The factory runs exactly once, at
/// resolve time.
#[derive(Clone)]
pub enum DependencySpec {
    Static(Vec<DependencyRef>),
    Deferred(Arc<dyn Fn() -> Vec<DependencyRef> + Send + Sync>),
}

impl DependencySpec {
    pub fn is_empty_static(&self) -> bool {
        matches!(self, DependencySpec::Static(v) if v.is_empty())
    }

    /// Produce the concrete edge list
    pub fn materialize(&self) -> Vec<DependencyRef> {
        match self {
            DependencySpec::Static(refs) => refs.clone(),
            DependencySpec::Deferred(factory) => factory(),
        }
    }

    pub(crate) fn push(&mut self, r: DependencyRef) {
        match self {
            DependencySpec::Static(refs) => refs.push(r),
            DependencySpec::Deferred(_) => {
                // Mixing direct edges into a deferred spec is a description
                // error; the resolver reports it against the definition.
            }
        }
    }
}

impl Default for DependencySpec {
    fn default() -> Self {
        DependencySpec::Static(Vec::new())
    }
}

impl std::fmt::Debug for DependencySpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencySpec::Static(refs) => f.debug_tuple("Static").field(&refs.len()).finish(),
            DependencySpec::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

// ============================================================================
// REGISTRABLE
// ============================================================================

/// Any definition a resource can put in `register[]` / `overrides[]`
#[derive(Clone)]
pub enum Registrable {
    Task(Task),
    Resource(Resource),
    TaskMiddleware(TaskMiddleware),
    ResourceMiddleware(ResourceMiddleware),
    Event(EventDef),
    Hook(Hook),
    Tag(TagDef),
    Error(ErrorDef),
}

impl Registrable {
    pub fn kind(&self) -> Kind {
        match self {
            Registrable::Task(_) => Kind::Task,
            Registrable::Resource(_) => Kind::Resource,
            Registrable::TaskMiddleware(_) => Kind::TaskMiddleware,
            Registrable::ResourceMiddleware(_) => Kind::ResourceMiddleware,
            Registrable::Event(_) => Kind::Event,
            Registrable::Hook(_) => Kind::Hook,
            Registrable::Tag(_) => Kind::Tag,
            Registrable::Error(_) => Kind::Error,
        }
    }

    pub fn id(&self) -> &ComponentId {
        match self {
            Registrable::Task(t) => &t.id,
            Registrable::Resource(r) => &r.id,
            Registrable::TaskMiddleware(m) => &m.id,
            Registrable::ResourceMiddleware(m) => &m.id,
            Registrable::Event(e) => &e.id,
            Registrable::Hook(h) => &h.id,
            Registrable::Tag(t) => &t.id,
            Registrable::Error(e) => &e.id,
        }
    }
}

impl From<Task> for Registrable {
    fn from(v: Task) -> Self {
        Registrable::Task(v)
    }
}
impl From<Resource> for Registrable {
    fn from(v: Resource) -> Self {
        Registrable::Resource(v)
    }
}
impl From<TaskMiddleware> for Registrable {
    fn from(v: TaskMiddleware) -> Self {
        Registrable::TaskMiddleware(v)
    }
}
impl From<ResourceMiddleware> for Registrable {
    fn from(v: ResourceMiddleware) -> Self {
        Registrable::ResourceMiddleware(v)
    }
}
impl From<EventDef> for Registrable {
    fn from(v: EventDef) -> Self {
        Registrable::Event(v)
    }
}
impl From<Hook> for Registrable {
    fn from(v: Hook) -> Self {
        Registrable::Hook(v)
    }
}
impl From<TagDef> for Registrable {
    fn from(v: TagDef) -> Self {
        Registrable::Tag(v)
    }
}
impl From<ErrorDef> for Registrable {
    fn from(v: ErrorDef) -> Self {
        Registrable::Error(v)
    }
}

// ============================================================================
// INDEX
// ============================================================================

/// Bundle several components under one resource
///
/// The returned resource registers every item and resolves to the list of
/// bundled ids as its value, so an index can be depended upon like any other
/// resource.
pub fn index(id: impl Into<ComponentId>, items: Vec<Registrable>) -> Resource {
    let ids: Vec<Value> = items
        .iter()
        .map(|item| Value::String(item.id().to_string()))
        .collect();

    let mut resource = Resource::new(id);
    for item in items {
        resource = resource.register(item);
    }
    resource.init(move |_cfg, _api| {
        let ids = ids.clone();
        async move { Ok(Value::Array(ids)) }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_spec_materializes_static() {
        let task = Task::new("app.t");
        let spec = DependencySpec::Static(vec![dep("t", &task)]);
        let refs = spec.materialize();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "t");
        assert_eq!(refs[0].kind, Kind::Task);
    }

    #[test]
    fn dependency_spec_deferred_runs_factory() {
        let spec = DependencySpec::Deferred(Arc::new(|| {
            vec![dep("late", &Task::new("app.late"))]
        }));
        let refs = spec.materialize();
        assert_eq!(refs[0].id, "app.late");
    }

    #[test]
    fn registrable_reports_kind_and_id() {
        let reg: Registrable = Task::new("app.t").into();
        assert_eq!(reg.kind(), Kind::Task);
        assert_eq!(reg.id().as_str(), "app.t");

        let reg: Registrable = EventDef::new("app.e").into();
        assert_eq!(reg.kind(), Kind::Event);
    }

    #[test]
    fn index_registers_items() {
        let bundle = index(
            "app.bundle",
            vec![Task::new("app.a").into(), Task::new("app.b").into()],
        );
        assert_eq!(bundle.register.len(), 2);
        assert!(bundle.init.is_some());
    }
}

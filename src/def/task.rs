//! Task definitions
//!
//! A task is a named callable unit: a body plus dependencies, middleware,
//! optional schemas and an optional event subscription. Tasks keep no state
//! between invocations.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::api::RunApi;
use crate::def::{
    dep, AsDependency, DependencyRef, DependencySpec, EventDef, ListenSpec, Meta, MiddlewareUsage,
    TagUsage,
};
use crate::ident::{ComponentId, Kind};

use super::ErrorDef;

/// Boxed task body: `(input, api) -> result`
pub type TaskRun =
    Arc<dyn Fn(Value, RunApi) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Declarative task descriptor
#[derive(Clone)]
pub struct Task {
    pub(crate) id: ComponentId,
    pub(crate) dependencies: DependencySpec,
    pub(crate) middleware: Vec<MiddlewareUsage>,
    pub(crate) run: Option<TaskRun>,
    pub(crate) on: Option<ListenSpec>,
    pub(crate) listener_order: i32,
    pub(crate) input_schema: Option<Value>,
    pub(crate) result_schema: Option<Value>,
    pub(crate) tags: Vec<TagUsage>,
    pub(crate) meta: Meta,
    pub(crate) throws: Vec<ComponentId>,
    pub(crate) fingerprint: u64,
}

impl Task {
    pub fn new(id: impl Into<ComponentId>) -> Self {
        Task {
            id: id.into(),
            dependencies: DependencySpec::default(),
            middleware: Vec::new(),
            run: None,
            on: None,
            listener_order: 0,
            input_schema: None,
            result_schema: None,
            tags: Vec::new(),
            meta: Meta::default(),
            throws: Vec::new(),
            fingerprint: crate::def::next_fingerprint(),
        }
    }

    /// Anonymous task with a generated id
    pub fn anonymous() -> Self {
        Task::new(ComponentId::anonymous(Kind::Task))
    }

    /// The task body
    pub fn run<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value, RunApi) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.run = Some(Arc::new(move |input, api| Box::pin(f(input, api))));
        self
    }

    /// Declare a named dependency on another component
    pub fn dependency(mut self, name: &str, target: &impl AsDependency) -> Self {
        self.dependencies.push(dep(name, target));
        self
    }

    /// Declare all dependencies behind a factory, breaking description-time
    /// reference cycles; the factory runs once at resolve time
    pub fn dependencies_deferred<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Vec<DependencyRef> + Send + Sync + 'static,
    {
        self.dependencies = DependencySpec::Deferred(Arc::new(factory));
        self
    }

    /// Attach a middleware usage; layers run left-to-right
    pub fn middleware(mut self, usage: impl Into<MiddlewareUsage>) -> Self {
        self.middleware.push(usage.into());
        self
    }

    /// Also run this task whenever `event` fires, with the emission as input
    pub fn on(mut self, event: &EventDef) -> Self {
        self.on = Some(ListenSpec::Event(event.id.clone()));
        self
    }

    /// Listen to every non-system event
    pub fn on_any(mut self) -> Self {
        self.on = Some(ListenSpec::Any);
        self
    }

    /// Listener ordering; lower runs first, ties by registration order
    pub fn listener_order(mut self, order: i32) -> Self {
        self.listener_order = order;
        self
    }

    /// JSON Schema the input must satisfy before middleware runs
    pub fn input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    /// JSON Schema the result must satisfy before returning to the caller
    pub fn result_schema(mut self, schema: Value) -> Self {
        self.result_schema = Some(schema);
        self
    }

    pub fn tag(mut self, usage: impl Into<TagUsage>) -> Self {
        self.tags.push(usage.into());
        self
    }

    pub fn meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    /// Declare a typed error this task may raise (registry metadata)
    pub fn throws(mut self, error: &ErrorDef) -> Self {
        self.throws.push(error.id.clone());
        self
    }

    pub fn id(&self) -> &ComponentId {
        &self.id
    }

    /// Whether this is a phantom: a remote-only descriptor with no local body
    pub fn is_phantom(&self) -> bool {
        self.run.is_none()
    }

    pub fn tags(&self) -> &[TagUsage] {
        &self.tags
    }
}

impl AsDependency for Task {
    fn dependency_kind(&self) -> Kind {
        Kind::Task
    }

    fn dependency_id(&self) -> &ComponentId {
        &self.id
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("middleware", &self.middleware.len())
            .field("on", &self.on)
            .field("phantom", &self.is_phantom())
            .finish()
    }
}

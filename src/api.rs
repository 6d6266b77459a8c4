//! Execution-time API handed to user closures
//!
//! Every task `run`, resource `init`/`dispose`, hook and middleware receives
//! a [`RunApi`]: the resolved dependencies, the per-invocation [`Journal`],
//! the cooperative cancellation token, and (for resources) the scratch
//! context. Middleware additionally receives a [`TaskExecution`] /
//! [`ResourceExecution`] carrying the continuation into the next layer.

use std::any::Any;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::errors::KernelError;
use crate::ident::ComponentId;
use crate::journal::Journal;

/// What a ready resource holds: an arbitrary live object
pub type ResourceValue = Arc<dyn Any + Send + Sync>;

/// Downcast a resource value to a concrete type
pub fn value_as<T: Send + Sync + 'static>(value: &ResourceValue) -> Option<Arc<T>> {
    Arc::clone(value).downcast::<T>().ok()
}

// ============================================================================
// DEPENDENCY HANDLES
// ============================================================================

/// Callable handle on a registered task
#[derive(Clone)]
pub struct TaskHandle {
    pub(crate) id: ComponentId,
    pub(crate) invoke:
        Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, KernelError>> + Send + Sync>,
}

impl TaskHandle {
    pub fn id(&self) -> &ComponentId {
        &self.id
    }

    /// Invoke the task through its full middleware pipeline
    pub async fn call(&self, input: Value) -> Result<Value, KernelError> {
        (self.invoke)(input).await
    }
}

/// Emit handle on a registered event
#[derive(Clone)]
pub struct EventHandle {
    pub(crate) id: ComponentId,
    pub(crate) emit:
        Arc<dyn Fn(Value) -> BoxFuture<'static, Result<(), KernelError>> + Send + Sync>,
}

impl EventHandle {
    pub fn id(&self) -> &ComponentId {
        &self.id
    }

    pub async fn emit(&self, payload: Value) -> Result<(), KernelError> {
        (self.emit)(payload).await
    }
}

/// A ready resource's value, typed on access
#[derive(Clone)]
pub struct ResourceAccess {
    pub(crate) id: ComponentId,
    pub(crate) value: ResourceValue,
}

impl ResourceAccess {
    pub fn id(&self) -> &ComponentId {
        &self.id
    }

    pub fn raw(&self) -> &ResourceValue {
        &self.value
    }

    /// Downcast to the concrete value type
    pub fn get<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, KernelError> {
        value_as::<T>(&self.value).ok_or_else(|| KernelError::ResourceValueType {
            id: self.id.clone(),
            expected: std::any::type_name::<T>(),
        })
    }
}

/// One resolved dependency slot
#[derive(Clone)]
pub enum DepValue {
    Resource(ResourceAccess),
    Task(TaskHandle),
    Event(EventHandle),
}

/// Resolved dependency map, keyed by the local names the definition chose
#[derive(Clone, Default)]
pub struct Deps {
    entries: Arc<FxHashMap<String, DepValue>>,
}

impl Deps {
    pub(crate) fn from_entries(entries: FxHashMap<String, DepValue>) -> Self {
        Deps {
            entries: Arc::new(entries),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn slot(&self, name: &str) -> Result<&DepValue, KernelError> {
        self.entries
            .get(name)
            .ok_or_else(|| KernelError::runtime(format!("no dependency named '{}'", name)))
    }

    /// Typed resource value under the local name
    pub fn resource<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, KernelError> {
        match self.slot(name)? {
            DepValue::Resource(access) => access.get::<T>(),
            _ => Err(KernelError::runtime(format!(
                "dependency '{}' is not a resource",
                name
            ))),
        }
    }

    /// Untyped resource value under the local name
    pub fn resource_raw(&self, name: &str) -> Result<&ResourceValue, KernelError> {
        match self.slot(name)? {
            DepValue::Resource(access) => Ok(access.raw()),
            _ => Err(KernelError::runtime(format!(
                "dependency '{}' is not a resource",
                name
            ))),
        }
    }

    /// Callable task handle under the local name
    pub fn task(&self, name: &str) -> Result<TaskHandle, KernelError> {
        match self.slot(name)? {
            DepValue::Task(handle) => Ok(handle.clone()),
            _ => Err(KernelError::runtime(format!(
                "dependency '{}' is not a task",
                name
            ))),
        }
    }

    /// Event emit handle under the local name
    pub fn event(&self, name: &str) -> Result<EventHandle, KernelError> {
        match self.slot(name)? {
            DepValue::Event(handle) => Ok(handle.clone()),
            _ => Err(KernelError::runtime(format!(
                "dependency '{}' is not an event",
                name
            ))),
        }
    }
}

// ============================================================================
// SCRATCH CONTEXT
// ============================================================================

/// Per-resource mutable scratch produced by `context()`, shared between
/// `init` and `dispose`
#[derive(Clone)]
pub struct Scratch(Arc<Mutex<Value>>);

impl Scratch {
    pub fn new(initial: Value) -> Self {
        Scratch(Arc::new(Mutex::new(initial)))
    }

    pub fn snapshot(&self) -> Value {
        self.0.lock().clone()
    }

    pub fn set(&self, value: Value) {
        *self.0.lock() = value;
    }

    pub fn update<F: FnOnce(&mut Value)>(&self, f: F) {
        f(&mut self.0.lock());
    }
}

// ============================================================================
// RUN API
// ============================================================================

/// Everything a user closure may touch during one invocation
#[derive(Clone)]
pub struct RunApi {
    pub(crate) target: ComponentId,
    pub(crate) deps: Deps,
    pub(crate) journal: Journal,
    pub(crate) cancel: CancellationToken,
    pub(crate) scratch: Option<Scratch>,
    pub(crate) middleware: Option<Arc<crate::pipeline::MiddlewareManager>>,
}

impl RunApi {
    pub(crate) fn new(target: ComponentId, deps: Deps, journal: Journal, cancel: CancellationToken) -> Self {
        RunApi {
            target,
            deps,
            journal,
            cancel,
            scratch: None,
            middleware: None,
        }
    }

    pub(crate) fn with_scratch(mut self, scratch: Scratch) -> Self {
        self.scratch = Some(scratch);
        self
    }

    pub(crate) fn with_middleware_manager(
        mut self,
        manager: Arc<crate::pipeline::MiddlewareManager>,
    ) -> Self {
        self.middleware = Some(manager);
        self
    }

    fn manager(&self) -> Result<&Arc<crate::pipeline::MiddlewareManager>, KernelError> {
        self.middleware.as_ref().ok_or(KernelError::Locked {
            what: "middleware manager",
        })
    }

    /// Register a global interceptor around every task pipeline; boot-time
    /// only (resource init closures), locked afterwards
    pub fn intercept_tasks(&self, interceptor: TaskInterceptor) -> Result<(), KernelError> {
        self.manager()?.intercept_tasks(interceptor)
    }

    /// Register a global interceptor around every resource init pipeline
    pub fn intercept_resources(&self, interceptor: ResourceInterceptor) -> Result<(), KernelError> {
        self.manager()?.intercept_resources(interceptor)
    }

    /// Wrap one specific task middleware wherever it runs
    pub fn intercept_task_middleware(
        &self,
        middleware: &ComponentId,
        interceptor: TaskInterceptor,
    ) -> Result<(), KernelError> {
        self.manager()?.intercept_task_middleware(middleware, interceptor)
    }

    /// Wrap one specific resource middleware wherever it runs
    pub fn intercept_resource_middleware(
        &self,
        middleware: &ComponentId,
        interceptor: ResourceInterceptor,
    ) -> Result<(), KernelError> {
        self.manager()?
            .intercept_resource_middleware(middleware, interceptor)
    }

    /// Id of the task/resource this invocation belongs to
    pub fn target(&self) -> &ComponentId {
        &self.target
    }

    pub fn deps(&self) -> &Deps {
        &self.deps
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Cooperative cancellation signal for this invocation
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The resource scratch context, when `context()` was declared
    pub fn scratch(&self) -> Option<&Scratch> {
        self.scratch.as_ref()
    }
}

// ============================================================================
// MIDDLEWARE EXECUTIONS
// ============================================================================

pub(crate) type NextTaskFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, KernelError>> + Send + Sync>;
pub(crate) type NextResourceFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<ResourceValue, KernelError>> + Send + Sync>;

/// A task invocation as seen by one middleware layer
///
/// Call [`TaskExecution::next`] to proceed with the current input, or
/// [`TaskExecution::next_with`] to forward a replacement. Not calling either
/// short-circuits the pipeline with whatever the middleware returns; calling
/// it again re-runs the inner layers (how the retry middleware re-attempts).
pub struct TaskExecution {
    pub(crate) task_id: ComponentId,
    pub(crate) input: Value,
    pub(crate) journal: Journal,
    pub(crate) next: NextTaskFn,
}

impl TaskExecution {
    pub fn task_id(&self) -> &ComponentId {
        &self.task_id
    }

    /// The input this layer would forward
    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Invoke the next layer with the current input
    pub async fn next(&self) -> Result<Value, KernelError> {
        (self.next)(self.input.clone()).await
    }

    /// Invoke the next layer with a replacement input
    pub async fn next_with(&self, input: Value) -> Result<Value, KernelError> {
        (self.next)(input).await
    }
}

/// A resource init as seen by one middleware layer
pub struct ResourceExecution {
    pub(crate) resource_id: ComponentId,
    pub(crate) config: Value,
    pub(crate) journal: Journal,
    pub(crate) next: NextResourceFn,
}

impl ResourceExecution {
    pub fn resource_id(&self) -> &ComponentId {
        &self.resource_id
    }

    /// The config this layer would forward
    pub fn config(&self) -> &Value {
        &self.config
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Invoke the next layer with the current config
    pub async fn next(&self) -> Result<ResourceValue, KernelError> {
        (self.next)(self.config.clone()).await
    }

    /// Invoke the next layer with a replacement config
    pub async fn next_with(&self, config: Value) -> Result<ResourceValue, KernelError> {
        (self.next)(config).await
    }
}

/// Interceptor around task pipelines (global) or one task middleware
pub type TaskInterceptor =
    Arc<dyn Fn(TaskExecution) -> BoxFuture<'static, Result<Value, KernelError>> + Send + Sync>;

/// Interceptor around resource pipelines (global) or one resource middleware
pub type ResourceInterceptor = Arc<
    dyn Fn(ResourceExecution) -> BoxFuture<'static, Result<ResourceValue, KernelError>>
        + Send
        + Sync,
>;

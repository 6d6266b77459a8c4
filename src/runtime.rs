//! Runtime facade: `run(root, options)` and the `RunResult` handle
//!
//! Boot phases: register the root tree (plus system events and builtins),
//! apply overrides, index events, resolve init order, attach listeners,
//! install optional guards, initialize resources topologically, expand
//! tunnels, lock every manager, emit `ready`. The returned [`RunResult`]
//! exposes the runtime-time surface: invoke tasks, emit events, read
//! resource values, dispose.

use std::sync::{Arc, Weak};

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::{
    DepValue, Deps, EventHandle, ResourceAccess, ResourceValue, RunApi, TaskHandle,
};
use crate::builtin::{self, ConcurrencyPool};
use crate::def::{DependencyRef, EventDef, Registrable, Resource, Task};
use crate::errors::KernelError;
use crate::events::{self, Emission, EventManager};
use crate::ident::{ComponentId, Kind};
use crate::journal::Journal;
use crate::lifecycle;
use crate::pipeline::MiddlewareManager;
use crate::resolver::{self, ResolvedOrder};
use crate::store::{ResourceState, Store};
use crate::system;
use crate::task_runner;
use crate::tunnel::{self, EventDeliveryMode, TunnelBinding, TunnelRoutes};

// ============================================================================
// OPTIONS
// ============================================================================

/// Verbosity of the built-in tracing subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugLevel {
    Normal,
    Verbose,
}

/// Boot options for [`run`]
#[derive(Clone, Default)]
pub struct RunOptions {
    pub debug: Option<DebugLevel>,
    /// Explicit env-filter directive; overrides `debug`
    pub logs: Option<String>,
    /// Install SIGINT/SIGTERM handlers that dispose gracefully and exit
    pub shutdown_hooks: bool,
    /// Forward process panics into the unhandled-error funnel while booted
    pub error_boundary: bool,
    /// Fail fast when an event is re-emitted on its own call path
    pub runtime_cycle_detection: bool,
    /// Callback invoked for every funneled error
    pub on_unhandled_error: Option<Arc<dyn Fn(&KernelError) + Send + Sync>>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn debug(mut self, level: DebugLevel) -> Self {
        self.debug = Some(level);
        self
    }

    pub fn logs(mut self, filter: impl Into<String>) -> Self {
        self.logs = Some(filter.into());
        self
    }

    pub fn shutdown_hooks(mut self, enabled: bool) -> Self {
        self.shutdown_hooks = enabled;
        self
    }

    pub fn error_boundary(mut self, enabled: bool) -> Self {
        self.error_boundary = enabled;
        self
    }

    pub fn runtime_cycle_detection(mut self, enabled: bool) -> Self {
        self.runtime_cycle_detection = enabled;
        self
    }

    pub fn on_unhandled_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&KernelError) + Send + Sync + 'static,
    {
        self.on_unhandled_error = Some(Arc::new(f));
        self
    }

    fn tracing_filter(&self) -> Option<String> {
        if let Some(logs) = &self.logs {
            return Some(logs.clone());
        }
        match self.debug {
            Some(DebugLevel::Normal) => Some("skein=debug".to_string()),
            Some(DebugLevel::Verbose) => Some("skein=trace".to_string()),
            None => None,
        }
    }

    fn install_tracing(&self) {
        if let Some(filter) = self.tracing_filter() {
            // try_init: tests and nested runtimes may have one installed.
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                .try_init();
        }
    }
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("debug", &self.debug)
            .field("shutdown_hooks", &self.shutdown_hooks)
            .field("error_boundary", &self.error_boundary)
            .field("runtime_cycle_detection", &self.runtime_cycle_detection)
            .finish()
    }
}

// ============================================================================
// KERNEL
// ============================================================================

/// Shared state behind a booted (or booting) runtime
pub(crate) struct Kernel {
    pub(crate) store: Store,
    pub(crate) events: EventManager,
    pub(crate) middleware: Arc<MiddlewareManager>,
    pub(crate) routes: OnceCell<TunnelRoutes>,
    pub(crate) order: OnceCell<ResolvedOrder>,
    pub(crate) options: RunOptions,
    pub(crate) pool: Arc<ConcurrencyPool>,
    pub(crate) cancel_root: CancellationToken,
    dispose_cell: OnceCell<Result<(), KernelError>>,
    dispose_guard: tokio::sync::Mutex<()>,
    signal_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Kernel {
    fn create(options: RunOptions) -> Arc<Self> {
        Arc::new(Kernel {
            store: Store::new(),
            events: EventManager::new(),
            middleware: Arc::new(MiddlewareManager::new()),
            routes: OnceCell::new(),
            order: OnceCell::new(),
            options,
            pool: Arc::new(ConcurrencyPool::new()),
            cancel_root: CancellationToken::new(),
            dispose_cell: OnceCell::new(),
            dispose_guard: tokio::sync::Mutex::new(()),
            signal_task: Mutex::new(None),
        })
    }

    /// Resolve a dependency list into a [`RunApi`] for one invocation
    pub(crate) fn build_api(
        self: &Arc<Self>,
        target: &ComponentId,
        deps: &[DependencyRef],
        journal: &Journal,
        cancel: &CancellationToken,
    ) -> Result<RunApi, KernelError> {
        let mut entries = rustc_hash::FxHashMap::default();
        for dep in deps {
            let value = match dep.kind {
                Kind::Resource => {
                    let entry = self.store.require_resource(&dep.id)?;
                    match (entry.state(), entry.value()) {
                        (ResourceState::Ready, Some(value)) => {
                            DepValue::Resource(ResourceAccess {
                                id: dep.id.clone(),
                                value,
                            })
                        }
                        (state, _) => {
                            return Err(KernelError::ResourceNotReady {
                                id: dep.id.clone(),
                                state: state.as_str(),
                            })
                        }
                    }
                }
                Kind::Task => {
                    let kernel = Arc::clone(self);
                    let task_id = dep.id.clone();
                    DepValue::Task(TaskHandle {
                        id: dep.id.clone(),
                        invoke: Arc::new(move |input| {
                            let kernel = Arc::clone(&kernel);
                            let task_id = task_id.clone();
                            Box::pin(async move {
                                task_runner::invoke(&kernel, &task_id, input).await
                            })
                        }),
                    })
                }
                Kind::Event => {
                    let kernel = Arc::clone(self);
                    let event_id = dep.id.clone();
                    let source = target.clone();
                    DepValue::Event(EventHandle {
                        id: dep.id.clone(),
                        emit: Arc::new(move |payload| {
                            let kernel = Arc::clone(&kernel);
                            let event_id = event_id.clone();
                            let source = source.clone();
                            Box::pin(async move {
                                kernel.emit_event(&event_id, payload, &source).await
                            })
                        }),
                    })
                }
                other => {
                    return Err(KernelError::runtime(format!(
                        "'{}' cannot depend on '{}': kind '{}' is not injectable",
                        target, dep.id, other
                    )))
                }
            };
            entries.insert(dep.name.clone(), value);
        }

        Ok(
            RunApi::new(
                target.clone(),
                Deps::from_entries(entries),
                journal.clone(),
                cancel.clone(),
            )
            .with_middleware_manager(Arc::clone(&self.middleware)),
        )
    }

    /// Emit an event, consulting tunnel routing
    pub(crate) async fn emit_event(
        self: &Arc<Self>,
        event: &ComponentId,
        data: Value,
        source: &ComponentId,
    ) -> Result<(), KernelError> {
        self.emit_event_returning(event, data, source).await?;
        Ok(())
    }

    /// Like [`Kernel::emit_event`] but returns the emission (suppression)
    pub(crate) async fn emit_event_returning(
        self: &Arc<Self>,
        event: &ComponentId,
        data: Value,
        source: &ComponentId,
    ) -> Result<Emission, KernelError> {
        let binding = self
            .routes
            .get()
            .and_then(|routes| routes.event_route(event))
            .cloned();
        let Some(binding) = binding else {
            return self.events.emit(event, data, source).await;
        };

        match binding.runner.event_delivery {
            EventDeliveryMode::LocalFirst => {
                let emission = self.events.emit(event, data, source).await?;
                self.remote_emit(&binding, emission.clone()).await?;
                Ok(emission)
            }
            EventDeliveryMode::Mirror => {
                let emission = Emission::new(event.clone(), data, source.clone());
                let local = self.events.dispatch(&emission);
                let remote = self.remote_emit(&binding, emission.clone());
                let (local_result, remote_result) = futures::join!(local, remote);
                local_result?;
                remote_result?;
                Ok(emission)
            }
            EventDeliveryMode::RemoteFirst => {
                if !self.events.has_event(event) {
                    return Err(KernelError::EventNotFound {
                        listener: source.clone(),
                        event: event.clone(),
                    });
                }
                let emission = Emission::new(event.clone(), data, source.clone());
                self.remote_emit(&binding, emission.clone()).await?;
                Ok(emission)
            }
        }
    }

    async fn remote_emit(
        &self,
        binding: &TunnelBinding,
        emission: Emission,
    ) -> Result<(), KernelError> {
        match binding.runner.emit.clone() {
            Some(remote) => remote(emission)
                .await
                .map_err(|e| tunnel::capture_remote(&binding.tunnel_id, e)),
            None => Ok(()),
        }
    }

    /// Funnel for hook/listener/boundary failures; never throws
    pub(crate) async fn report_unhandled(self: &Arc<Self>, err: KernelError) {
        tracing::error!(error = %err, kind = err.kind(), "unhandled error");
        if let Some(callback) = &self.options.on_unhandled_error {
            callback(&err);
        }

        let unhandled = system::unhandled_error_event().id();
        // Re-entering the funnel from its own listeners would never settle.
        if events::emission_in_progress(unhandled) {
            return;
        }
        if self.events.has_event(unhandled) {
            let data = json!({ "error": err.to_string(), "kind": err.kind() });
            let _ = self
                .events
                .emit(unhandled, data, &system::runtime_source())
                .await;
        }
    }
}

// ============================================================================
// ERROR BOUNDARY (process panics)
// ============================================================================

mod boundary {
    use super::*;
    use std::sync::Once;

    static REGISTRY: Lazy<Mutex<Vec<(usize, Weak<Kernel>)>>> = Lazy::new(|| Mutex::new(Vec::new()));
    static HOOK: Once = Once::new();

    pub(super) fn install(kernel: &Arc<Kernel>) {
        REGISTRY
            .lock()
            .push((Arc::as_ptr(kernel) as usize, Arc::downgrade(kernel)));

        HOOK.call_once(|| {
            let previous = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |info| {
                let message = info.to_string();
                for (_, weak) in REGISTRY.lock().iter() {
                    if let Some(kernel) = weak.upgrade() {
                        let err = KernelError::runtime(format!("panic: {}", message));
                        tracing::error!(error = %err, "panic crossed the error boundary");
                        if let Some(callback) = &kernel.options.on_unhandled_error {
                            callback(&err);
                        }
                    }
                }
                previous(info);
            }));
        });
    }

    pub(super) fn uninstall(kernel: &Arc<Kernel>) {
        let key = Arc::as_ptr(kernel) as usize;
        REGISTRY.lock().retain(|(k, _)| *k != key);
    }
}

// ============================================================================
// SHUTDOWN SIGNALS
// ============================================================================

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn install_shutdown_hooks(kernel: &Arc<Kernel>) {
    let weak = Arc::downgrade(kernel);
    let handle = tokio::spawn(async move {
        shutdown_signal().await;
        if let Some(kernel) = weak.upgrade() {
            info!("shutdown signal received; disposing runtime");
            let _ = lifecycle::dispose_all(&kernel).await;
            kernel.pool.dispose();
            std::process::exit(0);
        }
    });
    *kernel.signal_task.lock() = Some(handle);
}

// ============================================================================
// RUN
// ============================================================================

/// Boot an application from its root resource
pub async fn run(root: Resource, options: RunOptions) -> Result<RunResult, KernelError> {
    options.install_tracing();

    let kernel = Kernel::create(options);
    kernel.store.mark_initialized()?;
    let root_id = root.id().clone();

    // System components first, then the builtins, then the user tree.
    kernel
        .store
        .store_item(Registrable::Event(system::ready_event().clone()), None)?;
    kernel.store.store_item(
        Registrable::Event(system::unhandled_error_event().clone()),
        None,
    )?;
    kernel
        .store
        .store_item(Registrable::Tag(system::system_tag().clone()), None)?;
    kernel
        .store
        .store_item(Registrable::Tag(system::tunnel_tag().clone()), None)?;
    kernel
        .store
        .store_item(Registrable::Tag(system::tunnel_policy_tag().clone()), None)?;
    builtin::register(&kernel.store, &kernel.pool)?;

    kernel.store.register_tree(root)?;
    kernel.store.apply_overrides()?;

    for event in kernel.store.events_snapshot() {
        kernel
            .events
            .register_event(event.id().clone(), system::is_system_event(&event))?;
    }
    kernel
        .events
        .set_cycle_detection(kernel.options.runtime_cycle_detection);
    {
        let weak = Arc::downgrade(&kernel);
        kernel.events.set_unhandled_sink(Arc::new(move |err| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(kernel) = weak.upgrade() {
                    kernel.report_unhandled(err).await;
                }
            })
        }));
    }

    builtin::validate_boot(&kernel.store, &kernel.pool)?;

    let order = resolver::resolve(&kernel.store)?;
    let _ = kernel.order.set(order);

    task_runner::register_listeners(&kernel)?;

    if kernel.options.error_boundary {
        boundary::install(&kernel);
    }

    if let Err(err) = lifecycle::init_all(&kernel).await {
        boundary::uninstall(&kernel);
        return Err(err);
    }

    match tunnel::expand_tunnels(&kernel.store) {
        Ok(routes) => {
            let _ = kernel.routes.set(routes);
        }
        Err(err) => {
            let _ = lifecycle::dispose_all(&kernel).await;
            boundary::uninstall(&kernel);
            return Err(err);
        }
    }

    if kernel.options.shutdown_hooks {
        install_shutdown_hooks(&kernel);
    }

    kernel.store.lock();
    kernel.events.lock();
    kernel.middleware.lock();

    kernel
        .emit_event(
            system::ready_event().id(),
            json!({}),
            &system::runtime_source(),
        )
        .await?;

    debug!(counts = ?kernel.store.counts(), "runtime ready");

    let value = kernel
        .store
        .require_resource(&root_id)?
        .value()
        .unwrap_or_else(|| Arc::new(()) as ResourceValue);

    Ok(RunResult { kernel, value })
}

// ============================================================================
// COMPONENT REFERENCES
// ============================================================================

/// Accepts a task definition, an id string, or a `ComponentId`
pub trait AsTaskId {
    fn as_task_id(&self) -> ComponentId;
}

impl AsTaskId for Task {
    fn as_task_id(&self) -> ComponentId {
        self.id().clone()
    }
}
impl AsTaskId for str {
    fn as_task_id(&self) -> ComponentId {
        ComponentId::new(self)
    }
}
impl AsTaskId for ComponentId {
    fn as_task_id(&self) -> ComponentId {
        self.clone()
    }
}

/// Accepts an event definition, an id string, or a `ComponentId`
pub trait AsEventId {
    fn as_event_id(&self) -> ComponentId;
}

impl AsEventId for EventDef {
    fn as_event_id(&self) -> ComponentId {
        self.id().clone()
    }
}
impl AsEventId for str {
    fn as_event_id(&self) -> ComponentId {
        ComponentId::new(self)
    }
}
impl AsEventId for ComponentId {
    fn as_event_id(&self) -> ComponentId {
        self.clone()
    }
}

/// Accepts a resource definition, an id string, or a `ComponentId`
pub trait AsResourceId {
    fn as_resource_id(&self) -> ComponentId;
}

impl AsResourceId for Resource {
    fn as_resource_id(&self) -> ComponentId {
        self.id().clone()
    }
}
impl AsResourceId for str {
    fn as_resource_id(&self) -> ComponentId {
        ComponentId::new(self)
    }
}
impl AsResourceId for ComponentId {
    fn as_resource_id(&self) -> ComponentId {
        self.clone()
    }
}

// ============================================================================
// RUN RESULT
// ============================================================================

/// Handle on a booted runtime
pub struct RunResult {
    kernel: Arc<Kernel>,
    value: ResourceValue,
}

impl RunResult {
    /// The root resource's init value, untyped
    pub fn value_raw(&self) -> &ResourceValue {
        &self.value
    }

    /// The root resource's init value
    pub fn value<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, KernelError> {
        crate::api::value_as::<T>(&self.value).ok_or_else(|| KernelError::ResourceValueType {
            id: system::runtime_source(),
            expected: std::any::type_name::<T>(),
        })
    }

    /// Invoke a task through its full pipeline
    pub async fn run_task(
        &self,
        task: &(impl AsTaskId + ?Sized),
        input: Value,
    ) -> Result<Value, KernelError> {
        task_runner::invoke(&self.kernel, &task.as_task_id(), input).await
    }

    /// Emit an event; listener failures are funneled, not thrown
    pub async fn emit_event(
        &self,
        event: &(impl AsEventId + ?Sized),
        payload: Value,
    ) -> Result<(), KernelError> {
        self.kernel
            .emit_event(&event.as_event_id(), payload, &system::runtime_source())
            .await
    }

    /// Untyped value of a ready resource
    pub fn get_resource_value(
        &self,
        resource: &(impl AsResourceId + ?Sized),
    ) -> Result<ResourceValue, KernelError> {
        let id = resource.as_resource_id();
        let entry = self.kernel.store.require_resource(&id)?;
        match (entry.state(), entry.value()) {
            (ResourceState::Ready, Some(value)) => Ok(value),
            (state, _) => Err(KernelError::ResourceNotReady {
                id,
                state: state.as_str(),
            }),
        }
    }

    /// Typed value of a ready resource
    pub fn get_resource<T: Send + Sync + 'static>(
        &self,
        resource: &(impl AsResourceId + ?Sized),
    ) -> Result<Arc<T>, KernelError> {
        let id = resource.as_resource_id();
        let value = self.get_resource_value(&id)?;
        crate::api::value_as::<T>(&value).ok_or_else(|| KernelError::ResourceValueType {
            id,
            expected: std::any::type_name::<T>(),
        })
    }

    /// Tear the runtime down: reverse-order dispose, primitive cleanup,
    /// guard removal. Idempotent; a second call returns the first outcome.
    pub async fn dispose(&self) -> Result<(), KernelError> {
        let _guard = self.kernel.dispose_guard.lock().await;
        if let Some(result) = self.kernel.dispose_cell.get() {
            return result.clone();
        }

        let result = lifecycle::dispose_all(&self.kernel).await;
        self.kernel.pool.dispose();
        boundary::uninstall(&self.kernel);
        if let Some(handle) = self.kernel.signal_task.lock().take() {
            handle.abort();
        }
        self.kernel.cancel_root.cancel();

        if let Err(err) = &result {
            self.kernel.report_unhandled(err.clone()).await;
        }
        let _ = self.kernel.dispose_cell.set(result.clone());
        result
    }
}

impl std::fmt::Debug for RunResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunResult")
            .field("counts", &self.kernel.store.counts())
            .finish()
    }
}

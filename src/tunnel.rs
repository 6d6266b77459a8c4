//! Tunnel routing: transparent remote execution for selected tasks/events
//!
//! A tunnel is a resource tagged `skein.tunnel` whose value is a
//! [`TunnelRunner`]. After resources are ready the kernel expands the
//! runner's selectors into concrete route maps; a routed task's inner run is
//! replaced by the tunnel transport, a routed event additionally reaches the
//! tunnel's `emit` according to its delivery mode.

use std::sync::Arc;

use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::api::value_as;
use crate::def::{EventDef, Task};
use crate::errors::{KernelError, TunnelCode, TunnelFailure};
use crate::events::Emission;
use crate::ident::ComponentId;
use crate::store::{ResourceState, Store};
use crate::system;

// ============================================================================
// RUNNER VALUE
// ============================================================================

/// Which side of the wire this runner plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelMode {
    Client,
    Server,
    Both,
    #[default]
    None,
}

impl TunnelMode {
    /// Server-mode tunnels never redirect local invocation
    pub fn redirects_locally(&self) -> bool {
        matches!(self, TunnelMode::Client | TunnelMode::Both)
    }
}

/// How event emissions interact with local listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventDeliveryMode {
    /// Local listeners, then remote; remote errors propagate
    #[default]
    LocalFirst,
    /// Local and remote both run; a remote error propagates after local
    /// listeners complete
    Mirror,
    /// Remote only; local listeners are skipped
    RemoteFirst,
}

/// Remote task transport: `(task_id, input) -> result`
pub type TunnelRunFn =
    Arc<dyn Fn(ComponentId, Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Remote event transport
pub type TunnelEmitFn =
    Arc<dyn Fn(Emission) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Task selector: explicit items (string ids or `{"id": …}` objects) or a
/// predicate over definitions
#[derive(Clone)]
pub enum TaskSelector {
    Items(Vec<Value>),
    Filter(Arc<dyn Fn(&Task) -> bool + Send + Sync>),
}

impl TaskSelector {
    pub fn ids<I: IntoIterator<Item = S>, S: Into<String>>(ids: I) -> Self {
        TaskSelector::Items(ids.into_iter().map(|s| Value::String(s.into())).collect())
    }

    pub fn filter<F: Fn(&Task) -> bool + Send + Sync + 'static>(pred: F) -> Self {
        TaskSelector::Filter(Arc::new(pred))
    }
}

/// Event selector, same shapes as [`TaskSelector`]
#[derive(Clone)]
pub enum EventSelector {
    Items(Vec<Value>),
    Filter(Arc<dyn Fn(&EventDef) -> bool + Send + Sync>),
}

impl EventSelector {
    pub fn ids<I: IntoIterator<Item = S>, S: Into<String>>(ids: I) -> Self {
        EventSelector::Items(ids.into_iter().map(|s| Value::String(s.into())).collect())
    }

    pub fn filter<F: Fn(&EventDef) -> bool + Send + Sync + 'static>(pred: F) -> Self {
        EventSelector::Filter(Arc::new(pred))
    }
}

/// The value a tunnel resource resolves to
#[derive(Clone, Default)]
pub struct TunnelRunner {
    pub mode: TunnelMode,
    pub tasks: Option<TaskSelector>,
    pub events: Option<EventSelector>,
    pub event_delivery: EventDeliveryMode,
    pub run: Option<TunnelRunFn>,
    pub emit: Option<TunnelEmitFn>,
}

impl TunnelRunner {
    pub fn new(mode: TunnelMode) -> Self {
        TunnelRunner {
            mode,
            ..Default::default()
        }
    }

    pub fn client() -> Self {
        Self::new(TunnelMode::Client)
    }

    pub fn server() -> Self {
        Self::new(TunnelMode::Server)
    }

    pub fn tasks(mut self, selector: TaskSelector) -> Self {
        self.tasks = Some(selector);
        self
    }

    pub fn events(mut self, selector: EventSelector) -> Self {
        self.events = Some(selector);
        self
    }

    pub fn event_delivery(mut self, mode: EventDeliveryMode) -> Self {
        self.event_delivery = mode;
        self
    }

    /// The remote task transport
    pub fn run<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ComponentId, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.run = Some(Arc::new(move |id, input| Box::pin(f(id, input))));
        self
    }

    /// The remote event transport
    pub fn emit<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Emission) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.emit = Some(Arc::new(move |emission| Box::pin(f(emission))));
        self
    }
}

impl std::fmt::Debug for TunnelRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelRunner")
            .field("mode", &self.mode)
            .field("has_run", &self.run.is_some())
            .field("has_emit", &self.emit.is_some())
            .finish()
    }
}

// ============================================================================
// ROUTES
// ============================================================================

/// One expanded route: which tunnel serves the component
#[derive(Clone)]
pub struct TunnelBinding {
    pub tunnel_id: ComponentId,
    pub runner: Arc<TunnelRunner>,
}

/// Route maps produced once at boot
#[derive(Default)]
pub struct TunnelRoutes {
    task_routes: FxHashMap<ComponentId, TunnelBinding>,
    event_routes: FxHashMap<ComponentId, TunnelBinding>,
}

impl TunnelRoutes {
    pub fn task_route(&self, id: &ComponentId) -> Option<&TunnelBinding> {
        self.task_routes.get(id)
    }

    pub fn event_route(&self, id: &ComponentId) -> Option<&TunnelBinding> {
        self.event_routes.get(id)
    }

    pub fn is_task_tunneled(&self, id: &ComponentId) -> bool {
        self.task_routes.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.task_routes.is_empty() && self.event_routes.is_empty()
    }
}

impl std::fmt::Debug for TunnelRoutes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelRoutes")
            .field("tasks", &self.task_routes.len())
            .field("events", &self.event_routes.len())
            .finish()
    }
}

// ============================================================================
// EXPANSION
// ============================================================================

/// Expand every ready tunnel resource's selectors into concrete routes
///
/// Unresolvable string ids error; selector items that are neither strings
/// nor `{"id": …}` objects are skipped with a diagnostic. The first tunnel
/// claiming a component wins; later claims log a warning.
pub fn expand_tunnels(store: &Store) -> Result<TunnelRoutes, KernelError> {
    let mut routes = TunnelRoutes::default();

    let mut tunnels: Vec<_> = store
        .resources_snapshot()
        .into_iter()
        .filter(|entry| system::tunnel_tag().is_on(entry.definition.tags()))
        .collect();
    tunnels.sort_by(|a, b| {
        a.definition
            .id()
            .as_str()
            .cmp(b.definition.id().as_str())
    });

    for entry in tunnels {
        let tunnel_id = entry.definition.id().clone();
        if entry.state() != ResourceState::Ready {
            continue;
        }
        let Some(value) = entry.value() else { continue };
        let Some(runner) = value_as::<TunnelRunner>(&value) else {
            return Err(KernelError::Tunnel {
                id: tunnel_id,
                code: TunnelCode::Configuration,
                detail: "tunnel resource value is not a TunnelRunner".to_string(),
            });
        };

        if runner.tasks.is_some() && runner.run.is_none() {
            return Err(KernelError::Tunnel {
                id: tunnel_id,
                code: TunnelCode::Configuration,
                detail: "tasks[] configured but run transport is missing".to_string(),
            });
        }
        if runner.events.is_some() && runner.emit.is_none() {
            return Err(KernelError::Tunnel {
                id: tunnel_id,
                code: TunnelCode::Configuration,
                detail: "events[] configured but emit transport is missing".to_string(),
            });
        }
        if !runner.mode.redirects_locally() {
            continue;
        }

        let runner: Arc<TunnelRunner> = Arc::clone(&runner);

        if let Some(selector) = &runner.tasks {
            for task_id in expand_task_selector(store, selector)? {
                claim(
                    &mut routes.task_routes,
                    task_id,
                    &tunnel_id,
                    &runner,
                    "task",
                );
            }
        }
        if let Some(selector) = &runner.events {
            for event_id in expand_event_selector(store, selector)? {
                claim(
                    &mut routes.event_routes,
                    event_id,
                    &tunnel_id,
                    &runner,
                    "event",
                );
            }
        }
    }

    Ok(routes)
}

fn claim(
    map: &mut FxHashMap<ComponentId, TunnelBinding>,
    component: ComponentId,
    tunnel_id: &ComponentId,
    runner: &Arc<TunnelRunner>,
    what: &'static str,
) {
    if let Some(existing) = map.get(&component) {
        tracing::warn!(
            %component,
            first = %existing.tunnel_id,
            second = %tunnel_id,
            "{} already claimed by another tunnel; keeping the first",
            what
        );
        return;
    }
    map.insert(
        component,
        TunnelBinding {
            tunnel_id: tunnel_id.clone(),
            runner: Arc::clone(runner),
        },
    );
}

fn expand_task_selector(
    store: &Store,
    selector: &TaskSelector,
) -> Result<Vec<ComponentId>, KernelError> {
    match selector {
        TaskSelector::Items(items) => {
            expand_items(items, "tasks", |id| store.task(id).is_some())
        }
        TaskSelector::Filter(pred) => Ok(store
            .tasks_snapshot()
            .into_iter()
            .filter(|entry| pred(&entry.definition))
            .map(|entry| entry.definition.id().clone())
            .collect()),
    }
}

fn expand_event_selector(
    store: &Store,
    selector: &EventSelector,
) -> Result<Vec<ComponentId>, KernelError> {
    match selector {
        EventSelector::Items(items) => {
            expand_items(items, "events", |id| store.event(id).is_some())
        }
        EventSelector::Filter(pred) => Ok(store
            .events_snapshot()
            .into_iter()
            .filter(|event| !system::is_system_event(event) && pred(event))
            .map(|event| event.id().clone())
            .collect()),
    }
}

fn expand_items(
    items: &[Value],
    what: &'static str,
    exists: impl Fn(&ComponentId) -> bool,
) -> Result<Vec<ComponentId>, KernelError> {
    let mut out = Vec::new();
    for item in items {
        let raw = match item {
            Value::String(s) => Some(s.as_str()),
            Value::Object(map) => map.get("id").and_then(|v| v.as_str()),
            _ => None,
        };
        let Some(raw) = raw else {
            tracing::warn!(item = %item, "skipping unsupported tunnel selector item");
            continue;
        };
        let id = ComponentId::new(raw);
        if !exists(&id) {
            return Err(KernelError::TunnelSelectorNotFound {
                id: raw.to_string(),
                what,
            });
        }
        out.push(id);
    }
    Ok(out)
}

/// Fold a transport failure into the taxonomy, keeping tunnel codes and
/// remote app-error identity
pub(crate) fn capture_remote(tunnel_id: &ComponentId, err: anyhow::Error) -> KernelError {
    match err.downcast::<TunnelFailure>() {
        Ok(failure) => KernelError::Tunnel {
            id: tunnel_id.clone(),
            code: failure.code,
            detail: failure.message,
        },
        Err(other) => KernelError::capture(other),
    }
}

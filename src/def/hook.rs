//! Hook definitions
//!
//! A hook subscribes to one event (or `"*"` via [`Hook::on_any`]) and runs
//! with the emission. Hook failures never abort the emitter; they are routed
//! to the unhandled-error funnel.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::api::RunApi;
use crate::def::{dep, AsDependency, DependencyRef, DependencySpec, EventDef, ListenSpec, Meta, TagUsage};
use crate::events::Emission;
use crate::ident::{ComponentId, Kind};

/// Boxed hook body: `(emission, api) -> ()`
pub type HookRun =
    Arc<dyn Fn(Emission, RunApi) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Declarative hook descriptor
#[derive(Clone)]
pub struct Hook {
    pub(crate) id: ComponentId,
    pub(crate) on: Option<ListenSpec>,
    pub(crate) order: i32,
    pub(crate) dependencies: DependencySpec,
    pub(crate) run: Option<HookRun>,
    pub(crate) tags: Vec<TagUsage>,
    pub(crate) meta: Meta,
    pub(crate) fingerprint: u64,
}

impl Hook {
    pub fn new(id: impl Into<ComponentId>) -> Self {
        Hook {
            id: id.into(),
            on: None,
            order: 0,
            dependencies: DependencySpec::default(),
            run: None,
            tags: Vec::new(),
            meta: Meta::default(),
            fingerprint: crate::def::next_fingerprint(),
        }
    }

    /// Anonymous hook with a generated id
    pub fn anonymous() -> Self {
        Hook::new(ComponentId::anonymous(Kind::Hook))
    }

    /// Subscribe to one event
    pub fn on(mut self, event: &EventDef) -> Self {
        self.on = Some(ListenSpec::Event(event.id.clone()));
        self
    }

    /// Subscribe to every non-system event
    pub fn on_any(mut self) -> Self {
        self.on = Some(ListenSpec::Any);
        self
    }

    /// Listener ordering; lower runs first, ties by registration order
    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Declare a named dependency on another component
    pub fn dependency(mut self, name: &str, target: &impl AsDependency) -> Self {
        self.dependencies.push(dep(name, target));
        self
    }

    /// Declare all dependencies behind a factory (cycle breaking)
    pub fn dependencies_deferred<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Vec<DependencyRef> + Send + Sync + 'static,
    {
        self.dependencies = DependencySpec::Deferred(Arc::new(factory));
        self
    }

    /// The hook body
    pub fn run<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Emission, RunApi) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.run = Some(Arc::new(move |emission, api| Box::pin(f(emission, api))));
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

    pub fn id(&self) -> &ComponentId {
        &self.id
    }
}

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hook")
            .field("id", &self.id)
            .field("on", &self.on)
            .field("order", &self.order)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_targets_event() {
        let event = EventDef::new("app.user_created");
        let hook = Hook::new("app.audit").on(&event).order(-10);
        assert_eq!(hook.on, Some(ListenSpec::Event(ComponentId::new("app.user_created"))));
        assert_eq!(hook.order, -10);
    }

    #[test]
    fn wildcard_hook() {
        let hook = Hook::new("app.observer").on_any();
        assert_eq!(hook.on, Some(ListenSpec::Any));
    }
}

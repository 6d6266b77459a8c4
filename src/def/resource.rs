//! Resource definitions
//!
//! A resource is a stateful component with a lifecycle: `init` produces a
//! live value, `dispose` tears it down. Resources also carry the composition
//! graph: `register[]` transitively pulls in other components, `overrides[]`
//! swaps previously registered definitions, `exports` limits what leaves the
//! subtree.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::api::{ResourceValue, RunApi};
use crate::def::{
    dep, AsDependency, DependencyRef, DependencySpec, Meta, MiddlewareUsage, Registrable, TagUsage,
};
use crate::ident::{ComponentId, Kind};

/// Boxed init: `(config, api) -> value`
pub type ResourceInitFn =
    Arc<dyn Fn(Value, RunApi) -> BoxFuture<'static, anyhow::Result<ResourceValue>> + Send + Sync>;

/// Boxed dispose: `(value, config, api) -> ()`
pub type ResourceDisposeFn = Arc<
    dyn Fn(ResourceValue, Value, RunApi) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync,
>;

/// Declarative resource descriptor
#[derive(Clone)]
pub struct Resource {
    pub(crate) id: ComponentId,
    pub(crate) dependencies: DependencySpec,
    pub(crate) register: Vec<Registrable>,
    pub(crate) overrides: Vec<Registrable>,
    pub(crate) middleware: Vec<MiddlewareUsage>,
    pub(crate) init: Option<ResourceInitFn>,
    pub(crate) dispose: Option<ResourceDisposeFn>,
    pub(crate) context: Option<Arc<dyn Fn() -> Value + Send + Sync>>,
    pub(crate) tags: Vec<TagUsage>,
    pub(crate) meta: Meta,
    pub(crate) config: Value,
    pub(crate) exports: Option<Vec<ComponentId>>,
    pub(crate) fingerprint: u64,
}

impl Resource {
    pub fn new(id: impl Into<ComponentId>) -> Self {
        Resource {
            id: id.into(),
            dependencies: DependencySpec::default(),
            register: Vec::new(),
            overrides: Vec::new(),
            middleware: Vec::new(),
            init: None,
            dispose: None,
            context: None,
            tags: Vec::new(),
            meta: Meta::default(),
            config: Value::Null,
            exports: None,
            fingerprint: crate::def::next_fingerprint(),
        }
    }

    /// Anonymous resource with a generated id
    pub fn anonymous() -> Self {
        Resource::new(ComponentId::anonymous(Kind::Resource))
    }

    /// Register another component into this resource's subtree
    pub fn register(mut self, item: impl Into<Registrable>) -> Self {
        self.register.push(item.into());
        self
    }

    /// Replace an already-registered definition of the same id
    pub fn override_with(mut self, item: impl Into<Registrable>) -> Self {
        self.overrides.push(item.into());
        self
    }

    /// The init body; the returned value becomes the resource value
    pub fn init<F, Fut, T>(mut self, f: F) -> Self
    where
        F: Fn(Value, RunApi) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + Sync + 'static,
    {
        self.init = Some(Arc::new(move |cfg, api| {
            let fut = f(cfg, api);
            Box::pin(async move { fut.await.map(|v| Arc::new(v) as ResourceValue) })
        }));
        self
    }

    /// The dispose body, receiving the init value back
    pub fn dispose<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ResourceValue, Value, RunApi) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.dispose = Some(Arc::new(move |value, cfg, api| Box::pin(f(value, cfg, api))));
        self
    }

    /// Per-resource scratch factory, shared between init and dispose
    pub fn context<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.context = Some(Arc::new(f));
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

    /// Attach a middleware usage around init
    pub fn middleware(mut self, usage: impl Into<MiddlewareUsage>) -> Self {
        self.middleware.push(usage.into());
        self
    }

    /// Bind configuration; object configs shallow-merge across calls,
    /// anything else replaces
    pub fn with(mut self, config: Value) -> Self {
        self.config = match (self.config, config) {
            (Value::Object(mut base), Value::Object(update)) => {
                for (k, v) in update {
                    base.insert(k, v);
                }
                Value::Object(base)
            }
            (_, next) => next,
        };
        self
    }

    /// Limit which registered items are visible outside this subtree
    pub fn exports(mut self, items: Vec<&dyn AsDependency>) -> Self {
        self.exports = Some(
            items
                .into_iter()
                .map(|i| i.dependency_id().clone())
                .collect(),
        );
        self
    }

    /// Like [`Resource::exports`] but by raw id
    pub fn exports_ids(mut self, ids: Vec<&str>) -> Self {
        self.exports = Some(ids.into_iter().map(ComponentId::new).collect());
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

    pub fn tags(&self) -> &[TagUsage] {
        &self.tags
    }

    pub fn config(&self) -> &Value {
        &self.config
    }
}

impl AsDependency for Resource {
    fn dependency_kind(&self) -> Kind {
        Kind::Resource
    }

    fn dependency_id(&self) -> &ComponentId {
        &self.id
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("register", &self.register.len())
            .field("overrides", &self.overrides.len())
            .field("has_init", &self.init.is_some())
            .field("has_dispose", &self.dispose.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::def::Task;
    use serde_json::json;

    #[test]
    fn with_merges_object_configs() {
        let res = Resource::new("app.db")
            .with(json!({"host": "localhost", "port": 5432}))
            .with(json!({"port": 6432}));
        assert_eq!(res.config(), &json!({"host": "localhost", "port": 6432}));
    }

    #[test]
    fn with_replaces_non_object_configs() {
        let res = Resource::new("app.limit").with(json!(3)).with(json!(5));
        assert_eq!(res.config(), &json!(5));
    }

    #[test]
    fn register_accumulates() {
        let res = Resource::new("app")
            .register(Task::new("app.t1"))
            .register(Resource::new("app.db"));
        assert_eq!(res.register.len(), 2);
    }

    #[test]
    fn exports_capture_ids() {
        let t = Task::new("app.t1");
        let res = Resource::new("app").register(t.clone()).exports(vec![&t]);
        assert_eq!(res.exports.as_deref().unwrap(), &[ComponentId::new("app.t1")]);
    }

    #[tokio::test]
    async fn init_wraps_value_in_arc_any() {
        let res = Resource::new("app.db").init(|_cfg, _api| async { Ok("connection".to_string()) });
        let init = res.init.clone().unwrap();
        let api = RunApi::new(
            res.id().clone(),
            Default::default(),
            crate::journal::Journal::new(),
            Default::default(),
        );
        let value = init(Value::Null, api).await.unwrap();
        let typed = crate::api::value_as::<String>(&value).unwrap();
        assert_eq!(&*typed, "connection");
    }
}

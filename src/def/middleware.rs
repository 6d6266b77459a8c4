//! Middleware definitions
//!
//! Middleware wraps task runs (`TaskMiddleware`) or resource inits
//! (`ResourceMiddleware`). A definition is configurable: `with(cfg)` yields a
//! usage bound to that configuration, `everywhere()` flags the middleware as
//! global across all matching targets.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::api::{ResourceExecution, ResourceValue, RunApi, TaskExecution};
use crate::def::{dep, AsDependency, DependencyRef, DependencySpec, Meta, Resource, Task};
use crate::errors::KernelError;
use crate::ident::{ComponentId, Kind};

/// Boxed task middleware body: `(execution, api, config) -> result`
pub type TaskMiddlewareRun = Arc<
    dyn Fn(TaskExecution, RunApi, Value) -> BoxFuture<'static, anyhow::Result<Value>>
        + Send
        + Sync,
>;

/// Boxed resource middleware body: `(execution, api, config) -> value`
pub type ResourceMiddlewareRun = Arc<
    dyn Fn(ResourceExecution, RunApi, Value) -> BoxFuture<'static, anyhow::Result<ResourceValue>>
        + Send
        + Sync,
>;

/// How a middleware applies globally
#[derive(Clone)]
pub enum EverywhereFlag<T> {
    All,
    Filtered(Arc<dyn Fn(&T) -> bool + Send + Sync>),
}

impl<T> EverywhereFlag<T> {
    pub fn matches(&self, target: &T) -> bool {
        match self {
            EverywhereFlag::All => true,
            EverywhereFlag::Filtered(pred) => pred(target),
        }
    }
}

impl<T> std::fmt::Debug for EverywhereFlag<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EverywhereFlag::All => f.write_str("All"),
            EverywhereFlag::Filtered(_) => f.write_str("Filtered(..)"),
        }
    }
}

/// A middleware bound to one configuration, as attached to a target
#[derive(Clone, Debug)]
pub struct MiddlewareUsage {
    pub(crate) id: ComponentId,
    pub(crate) config: Value,
}

impl MiddlewareUsage {
    pub fn id(&self) -> &ComponentId {
        &self.id
    }

    pub fn config(&self) -> &Value {
        &self.config
    }
}

macro_rules! middleware_def {
    ($name:ident, $run:ty, $target:ty, $kind:expr, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone)]
        pub struct $name {
            pub(crate) id: ComponentId,
            pub(crate) dependencies: DependencySpec,
            pub(crate) run: Option<$run>,
            pub(crate) everywhere: Option<EverywhereFlag<$target>>,
            pub(crate) config_schema: Option<Value>,
            pub(crate) meta: Meta,
            pub(crate) fingerprint: u64,
        }

        impl $name {
            pub fn new(id: impl Into<ComponentId>) -> Self {
                $name {
                    id: id.into(),
                    dependencies: DependencySpec::default(),
                    run: None,
                    everywhere: None,
                    config_schema: None,
                    meta: Meta::default(),
                    fingerprint: crate::def::next_fingerprint(),
                }
            }

            /// Anonymous middleware with a generated id
            pub fn anonymous() -> Self {
                Self::new(ComponentId::anonymous($kind))
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

            /// Apply to every target; erroring if already flagged
            pub fn everywhere(mut self) -> Result<Self, KernelError> {
                if self.everywhere.is_some() {
                    return Err(KernelError::MiddlewareAlreadyGlobal {
                        id: self.id.clone(),
                    });
                }
                self.everywhere = Some(EverywhereFlag::All);
                Ok(self)
            }

            /// Apply to every target matching `pred`; erroring if already flagged
            pub fn everywhere_filtered<F>(mut self, pred: F) -> Result<Self, KernelError>
            where
                F: Fn(&$target) -> bool + Send + Sync + 'static,
            {
                if self.everywhere.is_some() {
                    return Err(KernelError::MiddlewareAlreadyGlobal {
                        id: self.id.clone(),
                    });
                }
                self.everywhere = Some(EverywhereFlag::Filtered(Arc::new(pred)));
                Ok(self)
            }

            /// JSON Schema configurations must satisfy
            pub fn config_schema(mut self, schema: Value) -> Self {
                self.config_schema = Some(schema);
                self
            }

            pub fn meta(mut self, meta: Meta) -> Self {
                self.meta = meta;
                self
            }

            /// A usage of this middleware bound to `config`
            pub fn with(&self, config: Value) -> MiddlewareUsage {
                MiddlewareUsage {
                    id: self.id.clone(),
                    config,
                }
            }

            /// A bare usage of this middleware
            pub fn usage(&self) -> MiddlewareUsage {
                self.with(Value::Null)
            }

            pub fn id(&self) -> &ComponentId {
                &self.id
            }

            pub fn is_global(&self) -> bool {
                self.everywhere.is_some()
            }
        }

        impl From<&$name> for MiddlewareUsage {
            fn from(def: &$name) -> Self {
                def.usage()
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("id", &self.id)
                    .field("everywhere", &self.everywhere)
                    .finish()
            }
        }
    };
}

middleware_def!(
    TaskMiddleware,
    TaskMiddlewareRun,
    Task,
    Kind::TaskMiddleware,
    "Middleware wrapping task runs"
);
middleware_def!(
    ResourceMiddleware,
    ResourceMiddlewareRun,
    Resource,
    Kind::ResourceMiddleware,
    "Middleware wrapping resource inits"
);

impl TaskMiddleware {
    /// The middleware body
    pub fn run<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(TaskExecution, RunApi, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.run = Some(Arc::new(move |exec, api, cfg| Box::pin(f(exec, api, cfg))));
        self
    }
}

impl ResourceMiddleware {
    /// The middleware body
    pub fn run<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ResourceExecution, RunApi, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ResourceValue>> + Send + 'static,
    {
        self.run = Some(Arc::new(move |exec, api, cfg| Box::pin(f(exec, api, cfg))));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn with_binds_config() {
        let mw = TaskMiddleware::new("app.auth");
        let usage = mw.with(json!({"role": "admin"}));
        assert_eq!(usage.id().as_str(), "app.auth");
        assert_eq!(usage.config(), &json!({"role": "admin"}));
    }

    #[test]
    fn everywhere_twice_errors() {
        let mw = TaskMiddleware::new("app.log").everywhere().unwrap();
        let err = mw.everywhere().unwrap_err();
        assert_eq!(err.kind(), "MIDDLEWARE_ALREADY_GLOBAL");
    }

    #[test]
    fn everywhere_filter_matches_targets() {
        let mw = TaskMiddleware::new("app.log")
            .everywhere_filtered(|task: &Task| task.id().starts_with("app."))
            .unwrap();
        let flag = mw.everywhere.clone().unwrap();
        assert!(flag.matches(&Task::new("app.t")));
        assert!(!flag.matches(&Task::new("other.t")));
    }

    #[tokio::test]
    async fn run_body_forwards_through_next() {
        let mw = TaskMiddleware::new("app.plus_one").run(|exec, _api, _cfg| async move {
            let n = exec.input().as_i64().unwrap_or(0);
            let result = exec.next_with(json!(n + 1)).await?;
            Ok(result)
        });
        let run = mw.run.clone().unwrap();

        let exec = TaskExecution {
            task_id: ComponentId::new("app.t"),
            input: json!(1),
            journal: crate::journal::Journal::new(),
            next: Arc::new(|input| Box::pin(async move { Ok(input) })),
        };
        let api = RunApi::new(
            ComponentId::new("app.t"),
            Default::default(),
            crate::journal::Journal::new(),
            Default::default(),
        );
        assert_eq!(run(exec, api, Value::Null).await.unwrap(), json!(2));
    }
}

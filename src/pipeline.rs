//! Middleware manager: pipeline composition
//!
//! For one task run (or resource init) the execution onion is, outermost to
//! innermost: global middleware (deduplicated against local), local
//! middleware left-to-right, global interceptors, then the inner body. Per
//! middleware interceptors wrap the middleware they target, inside its
//! surrounding layers. Tunneled tasks get their layer list filtered by the
//! `tunnel_policy` tag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

use crate::api::{
    NextResourceFn, NextTaskFn, ResourceExecution, ResourceInterceptor, RunApi, TaskExecution,
    TaskInterceptor,
};
use crate::def::{Resource, Task};
use crate::errors::KernelError;
use crate::ident::ComponentId;
use crate::journal::Journal;
use crate::store::{ResourceMiddlewareEntry, Store, TaskMiddlewareEntry};
use crate::system;

// ============================================================================
// LAYER SELECTION
// ============================================================================

/// One selected middleware application: the entry plus its bound config
pub struct TaskLayer {
    pub entry: Arc<TaskMiddlewareEntry>,
    pub config: Value,
    pub api: RunApi,
}

pub struct ResourceLayer {
    pub entry: Arc<ResourceMiddlewareEntry>,
    pub config: Value,
    pub api: RunApi,
}

/// Select the middleware (entry, config) pairs for a task, outermost first
///
/// Globals come first (sorted by id for determinism, skipping ids the task
/// already uses locally), then the task's own declarations in order. When
/// the task is tunneled, an optional `tunnel_policy` tag narrows the list to
/// the enumerated client-side ids.
pub fn select_task_middleware(
    store: &Store,
    task: &Task,
    tunneled: bool,
) -> Result<Vec<(Arc<TaskMiddlewareEntry>, Value)>, KernelError> {
    let local_ids: FxHashSet<ComponentId> =
        task.middleware.iter().map(|u| u.id().clone()).collect();

    let mut globals = store.global_task_middlewares();
    globals.sort_by(|a, b| a.definition.id().as_str().cmp(b.definition.id().as_str()));

    let mut layers: Vec<(Arc<TaskMiddlewareEntry>, Value)> = Vec::new();
    for entry in globals {
        if local_ids.contains(entry.definition.id()) {
            continue;
        }
        let matches = entry
            .definition
            .everywhere
            .as_ref()
            .map(|flag| flag.matches(task))
            .unwrap_or(false);
        if matches {
            layers.push((entry, Value::Null));
        }
    }

    for usage in &task.middleware {
        let entry = store.task_middleware(usage.id()).ok_or_else(|| {
            KernelError::MiddlewareNotRegistered {
                consumer: task.id().clone(),
                middleware: usage.id().clone(),
            }
        })?;
        layers.push((entry, usage.config().clone()));
    }

    if tunneled {
        if let Some(policy) = system::tunnel_policy_tag().extract(task.tags()) {
            let allowed = policy_ids(policy);
            layers.retain(|(entry, _)| allowed.contains(entry.definition.id().as_str()));
        }
    }

    Ok(layers)
}

/// Same selection for a resource init (no tunnel filtering; tunnels route
/// tasks and events only)
pub fn select_resource_middleware(
    store: &Store,
    resource: &Resource,
) -> Result<Vec<(Arc<ResourceMiddlewareEntry>, Value)>, KernelError> {
    let local_ids: FxHashSet<ComponentId> =
        resource.middleware.iter().map(|u| u.id().clone()).collect();

    let mut globals = store.global_resource_middlewares();
    globals.sort_by(|a, b| a.definition.id().as_str().cmp(b.definition.id().as_str()));

    let mut layers: Vec<(Arc<ResourceMiddlewareEntry>, Value)> = Vec::new();
    for entry in globals {
        if local_ids.contains(entry.definition.id()) {
            continue;
        }
        let matches = entry
            .definition
            .everywhere
            .as_ref()
            .map(|flag| flag.matches(resource))
            .unwrap_or(false);
        if matches {
            layers.push((entry, Value::Null));
        }
    }

    for usage in &resource.middleware {
        let entry = store.resource_middleware(usage.id()).ok_or_else(|| {
            KernelError::MiddlewareNotRegistered {
                consumer: resource.id().clone(),
                middleware: usage.id().clone(),
            }
        })?;
        layers.push((entry, usage.config().clone()));
    }

    Ok(layers)
}

/// Accepts `["id", ...]` or `{"client": ["id", ...]}`
fn policy_ids(policy: &Value) -> FxHashSet<String> {
    let list = match policy {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => map
            .get("client")
            .and_then(|v| v.as_array())
            .map(|a| a.as_slice())
            .unwrap_or(&[]),
        _ => &[],
    };
    list.iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

// ============================================================================
// MANAGER
// ============================================================================

/// Holds interceptors and composes execution onions; locks at boot end
pub struct MiddlewareManager {
    task_interceptors: RwLock<Vec<TaskInterceptor>>,
    resource_interceptors: RwLock<Vec<ResourceInterceptor>>,
    per_task_middleware: RwLock<FxHashMap<ComponentId, Vec<TaskInterceptor>>>,
    per_resource_middleware: RwLock<FxHashMap<ComponentId, Vec<ResourceInterceptor>>>,
    locked: AtomicBool,
}

impl MiddlewareManager {
    pub fn new() -> Self {
        MiddlewareManager {
            task_interceptors: RwLock::new(Vec::new()),
            resource_interceptors: RwLock::new(Vec::new()),
            per_task_middleware: RwLock::new(FxHashMap::default()),
            per_resource_middleware: RwLock::new(FxHashMap::default()),
            locked: AtomicBool::new(false),
        }
    }

    // ------------------------------------------------------------------
    // Interceptor registration (boot-time only)
    // ------------------------------------------------------------------

    /// Wrap every task pipeline, just outside the inner run
    pub fn intercept_tasks(&self, interceptor: TaskInterceptor) -> Result<(), KernelError> {
        self.ensure_unlocked()?;
        self.task_interceptors.write().push(interceptor);
        Ok(())
    }

    /// Wrap every resource init pipeline, just outside the inner init
    pub fn intercept_resources(
        &self,
        interceptor: ResourceInterceptor,
    ) -> Result<(), KernelError> {
        self.ensure_unlocked()?;
        self.resource_interceptors.write().push(interceptor);
        Ok(())
    }

    /// Wrap one specific task middleware wherever it runs
    pub fn intercept_task_middleware(
        &self,
        middleware: &ComponentId,
        interceptor: TaskInterceptor,
    ) -> Result<(), KernelError> {
        self.ensure_unlocked()?;
        self.per_task_middleware
            .write()
            .entry(middleware.clone())
            .or_default()
            .push(interceptor);
        Ok(())
    }

    /// Wrap one specific resource middleware wherever it runs
    pub fn intercept_resource_middleware(
        &self,
        middleware: &ComponentId,
        interceptor: ResourceInterceptor,
    ) -> Result<(), KernelError> {
        self.ensure_unlocked()?;
        self.per_resource_middleware
            .write()
            .entry(middleware.clone())
            .or_default()
            .push(interceptor);
        Ok(())
    }

    pub fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    fn ensure_unlocked(&self) -> Result<(), KernelError> {
        if self.is_locked() {
            return Err(KernelError::Locked {
                what: "middleware manager",
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Composition
    // ------------------------------------------------------------------

    /// Build the full task onion around `inner`
    ///
    /// The returned continuation is re-invocable: every layer clones its
    /// captures per call, so an outer layer (retry) may run the chain below
    /// it multiple times.
    pub fn compose_task(
        &self,
        task_id: &ComponentId,
        layers: Vec<TaskLayer>,
        journal: &Journal,
        inner: NextTaskFn,
    ) -> NextTaskFn {
        // Global interceptors sit just outside the inner run.
        let mut next = inner;
        for interceptor in self.task_interceptors.read().iter().cloned().rev() {
            let prev = next;
            let tid = task_id.clone();
            let jr = journal.clone();
            next = Arc::new(move |input| {
                interceptor(TaskExecution {
                    task_id: tid.clone(),
                    input,
                    journal: jr.clone(),
                    next: Arc::clone(&prev),
                })
            });
        }

        // Middleware layers, rightmost innermost.
        for layer in layers.into_iter().rev() {
            let prev = next;
            let Some(run) = layer.entry.definition.run.clone() else {
                // A middleware without a body is a pass-through.
                next = prev;
                continue;
            };

            let mw_id = layer.entry.definition.id().clone();
            let tid = task_id.clone();
            let jr = journal.clone();
            let api = layer.api;
            let config = layer.config;
            let base: NextTaskFn = Arc::new(move |input| {
                let exec = TaskExecution {
                    task_id: tid.clone(),
                    input,
                    journal: jr.clone(),
                    next: Arc::clone(&prev),
                };
                let fut = run(exec, api.clone(), config.clone());
                Box::pin(async move { fut.await.map_err(KernelError::capture) })
            });

            // This middleware's own interceptors wrap its body.
            let per_mw = self
                .per_task_middleware
                .read()
                .get(&mw_id)
                .cloned()
                .unwrap_or_default();
            let mut wrapped = base;
            for interceptor in per_mw.into_iter().rev() {
                let inner_fn = wrapped;
                let tid = task_id.clone();
                let jr = journal.clone();
                wrapped = Arc::new(move |input| {
                    interceptor(TaskExecution {
                        task_id: tid.clone(),
                        input,
                        journal: jr.clone(),
                        next: Arc::clone(&inner_fn),
                    })
                });
            }
            next = wrapped;
        }
        next
    }

    /// Build the full resource-init onion around `inner`
    pub fn compose_resource(
        &self,
        resource_id: &ComponentId,
        layers: Vec<ResourceLayer>,
        journal: &Journal,
        inner: NextResourceFn,
    ) -> NextResourceFn {
        let mut next = inner;
        for interceptor in self.resource_interceptors.read().iter().cloned().rev() {
            let prev = next;
            let rid = resource_id.clone();
            let jr = journal.clone();
            next = Arc::new(move |config| {
                interceptor(ResourceExecution {
                    resource_id: rid.clone(),
                    config,
                    journal: jr.clone(),
                    next: Arc::clone(&prev),
                })
            });
        }

        for layer in layers.into_iter().rev() {
            let prev = next;
            let Some(run) = layer.entry.definition.run.clone() else {
                next = prev;
                continue;
            };

            let mw_id = layer.entry.definition.id().clone();
            let rid = resource_id.clone();
            let jr = journal.clone();
            let api = layer.api;
            let config = layer.config;
            let base: NextResourceFn = Arc::new(move |cfg| {
                let exec = ResourceExecution {
                    resource_id: rid.clone(),
                    config: cfg,
                    journal: jr.clone(),
                    next: Arc::clone(&prev),
                };
                let fut = run(exec, api.clone(), config.clone());
                Box::pin(async move { fut.await.map_err(KernelError::capture) })
            });

            let per_mw = self
                .per_resource_middleware
                .read()
                .get(&mw_id)
                .cloned()
                .unwrap_or_default();
            let mut wrapped = base;
            for interceptor in per_mw.into_iter().rev() {
                let inner_fn = wrapped;
                let rid = resource_id.clone();
                let jr = journal.clone();
                wrapped = Arc::new(move |cfg| {
                    interceptor(ResourceExecution {
                        resource_id: rid.clone(),
                        config: cfg,
                        journal: jr.clone(),
                        next: Arc::clone(&inner_fn),
                    })
                });
            }
            next = wrapped;
        }
        next
    }
}

impl Default for MiddlewareManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MiddlewareManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareManager")
            .field("task_interceptors", &self.task_interceptors.read().len())
            .field(
                "resource_interceptors",
                &self.resource_interceptors.read().len(),
            )
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::def::{Resource, TaskMiddleware};
    use parking_lot::Mutex;
    use serde_json::json;

    fn api_for(id: &str) -> RunApi {
        RunApi::new(
            ComponentId::new(id),
            Default::default(),
            Journal::new(),
            Default::default(),
        )
    }

    fn logging_mw(id: &str, log: &Arc<Mutex<Vec<String>>>) -> TaskMiddleware {
        let log = Arc::clone(log);
        let label = id.to_string();
        TaskMiddleware::new(id).run(move |exec, _api, _cfg| {
            let log = Arc::clone(&log);
            let label = label.clone();
            async move {
                log.lock().push(format!("{}:before", label));
                let n = exec.input().as_i64().unwrap_or(0);
                let result = exec.next_with(json!(n + 1)).await?;
                log.lock().push(format!("{}:after", label));
                Ok(result)
            }
        })
    }

    fn store_with(task: &Task, mws: Vec<TaskMiddleware>) -> Store {
        let store = Store::new();
        let mut root = Resource::new("test_root").register(task.clone());
        for mw in mws {
            root = root.register(mw);
        }
        store.register_tree(root).unwrap();
        store
    }

    #[tokio::test]
    async fn composition_order_matches_contract() {
        // Scenario: [m1, m2] + one global interceptor; each layer adds 1.
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let m1 = logging_mw("mw.m1", &log);
        let m2 = logging_mw("mw.m2", &log);
        let task = Task::new("app.t").middleware(&m1).middleware(&m2);
        let store = store_with(&task, vec![m1, m2]);

        let manager = MiddlewareManager::new();
        {
            let log = Arc::clone(&log);
            manager
                .intercept_tasks(Arc::new(move |exec| {
                    let log = Arc::clone(&log);
                    Box::pin(async move {
                        log.lock().push("i".to_string());
                        let n = exec.input().as_i64().unwrap_or(0);
                        exec.next_with(json!(n + 1)).await
                    })
                }))
                .unwrap();
        }

        let selected = select_task_middleware(&store, &task, false).unwrap();
        let layers: Vec<TaskLayer> = selected
            .into_iter()
            .map(|(entry, config)| TaskLayer {
                entry,
                config,
                api: api_for("app.t"),
            })
            .collect();

        let journal = Journal::new();
        let log_inner = Arc::clone(&log);
        let inner: NextTaskFn = Arc::new(move |input| {
            let log = Arc::clone(&log_inner);
            Box::pin(async move {
                log.lock().push("task".to_string());
                let n = input.as_i64().unwrap_or(0);
                Ok(json!(n + 1))
            })
        });

        let composed = manager.compose_task(task.id(), layers, &journal, inner);
        let result = composed(json!(1)).await.unwrap();

        assert_eq!(result, json!(4));
        assert_eq!(
            *log.lock(),
            vec!["mw.m1:before", "mw.m2:before", "i", "task", "mw.m2:after", "mw.m1:after"]
        );
    }

    #[tokio::test]
    async fn per_middleware_interceptor_wraps_only_its_target() {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let m1 = logging_mw("mw.m1", &log);
        let m2 = logging_mw("mw.m2", &log);
        let task = Task::new("app.t").middleware(&m1).middleware(&m2);
        let store = store_with(&task, vec![m1, m2]);

        let manager = MiddlewareManager::new();
        {
            let log = Arc::clone(&log);
            manager
                .intercept_task_middleware(
                    &ComponentId::new("mw.m2"),
                    Arc::new(move |exec| {
                        let log = Arc::clone(&log);
                        Box::pin(async move {
                            log.lock().push("icpt(m2)".to_string());
                            exec.next().await
                        })
                    }),
                )
                .unwrap();
        }

        let selected = select_task_middleware(&store, &task, false).unwrap();
        let layers: Vec<TaskLayer> = selected
            .into_iter()
            .map(|(entry, config)| TaskLayer {
                entry,
                config,
                api: api_for("app.t"),
            })
            .collect();

        let inner: NextTaskFn = Arc::new(|input| Box::pin(async move { Ok(input) }));
        let composed = manager.compose_task(task.id(), layers, &Journal::new(), inner);
        composed(json!(0)).await.unwrap();

        assert_eq!(
            *log.lock(),
            vec!["mw.m1:before", "icpt(m2)", "mw.m2:before", "mw.m2:after", "mw.m1:after"]
        );
    }

    #[tokio::test]
    async fn global_middleware_dedups_against_local() {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let shared = logging_mw("mw.shared", &log).everywhere().unwrap();
        let other_global = logging_mw("mw.global", &log).everywhere().unwrap();
        // The task also declares `shared` locally with a config.
        let task = Task::new("app.t").middleware(shared.with(json!({"local": true})));
        let store = store_with(&task, vec![shared, other_global]);

        let selected = select_task_middleware(&store, &task, false).unwrap();
        let ids: Vec<&str> = selected
            .iter()
            .map(|(e, _)| e.definition.id().as_str())
            .collect();

        // Global list contributes only the non-duplicated one; the local
        // usage keeps its position and config.
        assert_eq!(ids, vec!["mw.global", "mw.shared"]);
        assert_eq!(selected[1].1, json!({"local": true}));
    }

    #[tokio::test]
    async fn everywhere_filter_limits_targets() {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let filtered = logging_mw("mw.filtered", &log)
            .everywhere_filtered(|task: &Task| task.id().starts_with("admin."))
            .unwrap();
        let admin_task = Task::new("admin.reset");
        let user_task = Task::new("app.greet");
        let store = Store::new();
        store
            .register_tree(
                Resource::new("test_root")
                    .register(admin_task.clone())
                    .register(user_task.clone())
                    .register(filtered),
            )
            .unwrap();

        let admin_layers = select_task_middleware(&store, &admin_task, false).unwrap();
        let user_layers = select_task_middleware(&store, &user_task, false).unwrap();
        assert_eq!(admin_layers.len(), 1);
        assert!(user_layers.is_empty());
    }

    #[tokio::test]
    async fn tunnel_policy_filters_client_side_layers() {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let auth = logging_mw("mw.auth", &log);
        let retry = logging_mw("mw.retry", &log);
        let task = Task::new("app.t")
            .middleware(&auth)
            .middleware(&retry)
            .tag(system::tunnel_policy_tag().with(json!(["mw.retry"])));
        let store = store_with(&task, vec![auth, retry]);

        // Untunneled: both run.
        let local = select_task_middleware(&store, &task, false).unwrap();
        assert_eq!(local.len(), 2);

        // Tunneled: only the allowlisted one stays client-side.
        let tunneled = select_task_middleware(&store, &task, true).unwrap();
        let ids: Vec<&str> = tunneled
            .iter()
            .map(|(e, _)| e.definition.id().as_str())
            .collect();
        assert_eq!(ids, vec!["mw.retry"]);
    }

    #[tokio::test]
    async fn tunneled_without_policy_keeps_all_layers() {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let auth = logging_mw("mw.auth", &log);
        let task = Task::new("app.t").middleware(&auth);
        let store = store_with(&task, vec![auth]);

        let tunneled = select_task_middleware(&store, &task, true).unwrap();
        assert_eq!(tunneled.len(), 1);
    }

    #[test]
    fn locked_manager_rejects_interceptors() {
        let manager = MiddlewareManager::new();
        manager.lock();

        let err = manager
            .intercept_tasks(Arc::new(|exec| Box::pin(async move { exec.next().await })))
            .unwrap_err();
        assert_eq!(err.kind(), "LOCKED");
    }

    #[tokio::test]
    async fn middleware_error_propagates_outward() {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let outer = logging_mw("mw.outer", &log);
        let bomb = TaskMiddleware::new("mw.bomb")
            .run(|_exec, _api, _cfg| async move { anyhow::bail!("mid boom") });
        let task = Task::new("app.t").middleware(&outer).middleware(&bomb);
        let store = store_with(&task, vec![outer, bomb]);

        let manager = MiddlewareManager::new();
        let selected = select_task_middleware(&store, &task, false).unwrap();
        let layers: Vec<TaskLayer> = selected
            .into_iter()
            .map(|(entry, config)| TaskLayer {
                entry,
                config,
                api: api_for("app.t"),
            })
            .collect();

        let inner: NextTaskFn = Arc::new(|input| Box::pin(async move { Ok(input) }));
        let composed = manager.compose_task(task.id(), layers, &Journal::new(), inner);
        let err = composed(json!(1)).await.unwrap_err();

        assert_eq!(err.kind(), "FAILURE");
        assert!(err.to_string().contains("mid boom"));
        // The outer layer saw the failure: no "after" entry.
        assert_eq!(*log.lock(), vec!["mw.outer:before"]);
    }
}

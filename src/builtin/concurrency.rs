//! Concurrency limiting and per-key serialization middleware
//!
//! Both builtins lean on one runtime-owned [`ConcurrencyPool`]: keyed FIFO
//! semaphores for `concurrency`, the serial queue set for `serial`. Usages
//! sharing a `key` share the underlying primitive; conflicting limits for
//! one key are rejected at boot. The pool is disposed with the runtime.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::json;

use crate::def::{DependencyRef, DependencySpec, Resource, TaskMiddleware};
use crate::errors::{KernelError, ValidationStage};
use crate::ident::{ComponentId, Kind};
use crate::store::Store;
use crate::sync::{Semaphore, SerialQueue};

pub const POOL_RESOURCE_ID: &str = "skein.concurrency.pool";
pub const CONCURRENCY_ID: &str = "skein.concurrency";
pub const SERIAL_ID: &str = "skein.serial";

// ============================================================================
// POOL
// ============================================================================

/// Runtime-owned registry of keyed semaphores and serial queues
pub struct ConcurrencyPool {
    semaphores: DashMap<String, Arc<Semaphore>>,
    serial: SerialQueue,
}

impl ConcurrencyPool {
    pub fn new() -> Self {
        ConcurrencyPool {
            semaphores: DashMap::new(),
            serial: SerialQueue::new(),
        }
    }

    /// Get or create the semaphore bound to `key`
    ///
    /// A key is bound to its first limit; a different limit for the same key
    /// is a configuration conflict.
    pub fn semaphore(&self, key: &str, limit: usize) -> Result<Arc<Semaphore>, KernelError> {
        use dashmap::mapref::entry::Entry;

        match self.semaphores.entry(key.to_string()) {
            Entry::Occupied(e) => {
                let existing = Arc::clone(e.get());
                if existing.capacity() != limit {
                    return Err(KernelError::runtime(format!(
                        "concurrency key '{}' is bound to limit {}, conflicting limit {} requested",
                        key,
                        existing.capacity(),
                        limit
                    )));
                }
                Ok(existing)
            }
            Entry::Vacant(e) => {
                let sem = Arc::new(Semaphore::new(limit));
                e.insert(Arc::clone(&sem));
                Ok(sem)
            }
        }
    }

    pub fn serial(&self) -> &SerialQueue {
        &self.serial
    }

    /// Dispose every owned primitive; waiters get `Disposed` errors
    pub fn dispose(&self) {
        for entry in self.semaphores.iter() {
            entry.value().dispose();
        }
        self.serial.dispose();
    }

    pub fn semaphore_count(&self) -> usize {
        self.semaphores.len()
    }
}

impl Default for ConcurrencyPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConcurrencyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyPool")
            .field("semaphores", &self.semaphore_count())
            .finish()
    }
}

/// The resource exposing the runtime's pool to the builtin middlewares
pub(crate) fn pool_resource(pool: &Arc<ConcurrencyPool>) -> Resource {
    let shared = Arc::clone(pool);
    let mut resource = Resource::new(POOL_RESOURCE_ID);
    resource.init = Some(Arc::new(move |_cfg, _api| {
        let value: crate::api::ResourceValue = Arc::clone(&shared) as crate::api::ResourceValue;
        Box::pin(async move { Ok(value) })
    }));
    resource
}

fn pool_dependency() -> DependencySpec {
    DependencySpec::Static(vec![DependencyRef {
        name: "pool".to_string(),
        kind: Kind::Resource,
        id: ComponentId::new(POOL_RESOURCE_ID),
    }])
}

// ============================================================================
// CONCURRENCY MIDDLEWARE
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConcurrencyConfig {
    limit: Option<usize>,
    key: Option<String>,
}

static CONCURRENCY_MW: Lazy<TaskMiddleware> = Lazy::new(|| {
    let mut mw = TaskMiddleware::new(CONCURRENCY_ID)
        .config_schema(json!({
            "type": "object",
            "properties": {
                "limit": {"type": "integer", "minimum": 1},
                "key": {"type": "string", "minLength": 1}
            },
            "additionalProperties": false
        }))
        .run(|exec, api, cfg| async move {
            let pool = api.deps().resource::<ConcurrencyPool>("pool")?;
            let config: ConcurrencyConfig = super::parse_config(&cfg)?;
            let limit = config
                .limit
                .ok_or_else(|| anyhow::anyhow!("concurrency middleware requires a limit"))?;
            let key = config
                .key
                .unwrap_or_else(|| format!("task:{}", exec.task_id()));

            let sem = pool.semaphore(&key, limit)?;
            sem.acquire(api.cancellation()).await?;
            let result = exec.next().await;
            // Released on success and failure alike.
            sem.release();
            Ok(result?)
        });
    mw.dependencies = pool_dependency();
    mw
});

/// Bound-parallelism middleware: `.with(json!({"limit": 2, "key": "db"}))`
pub fn concurrency() -> &'static TaskMiddleware {
    &CONCURRENCY_MW
}

/// Concurrency middleware over a caller-provided semaphore
pub fn concurrency_shared(semaphore: Arc<Semaphore>) -> TaskMiddleware {
    TaskMiddleware::anonymous().run(move |exec, api, _cfg| {
        let sem = Arc::clone(&semaphore);
        async move {
            sem.acquire(api.cancellation()).await?;
            let result = exec.next().await;
            sem.release();
            Ok(result?)
        }
    })
}

// ============================================================================
// SERIAL MIDDLEWARE
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SerialConfig {
    key: Option<String>,
}

static SERIAL_MW: Lazy<TaskMiddleware> = Lazy::new(|| {
    let mut mw = TaskMiddleware::new(SERIAL_ID)
        .config_schema(json!({
            "type": "object",
            "properties": {"key": {"type": "string", "minLength": 1}},
            "additionalProperties": false
        }))
        .run(|exec, api, cfg| async move {
            let pool = api.deps().resource::<ConcurrencyPool>("pool")?;
            let config: SerialConfig = super::parse_config(&cfg)?;
            let key = config
                .key
                .unwrap_or_else(|| format!("task:{}", exec.task_id()));
            let result = pool.serial().run(&key, exec.next()).await?;
            Ok(result?)
        });
    mw.dependencies = pool_dependency();
    mw
});

/// Single-flight middleware: same-key runs execute strictly sequentially
pub fn serial() -> &'static TaskMiddleware {
    &SERIAL_MW
}

// ============================================================================
// BOOT VALIDATION
// ============================================================================

/// Check every concurrency usage once: configs parse, limits are present,
/// shared keys agree on their limit. Keyed semaphores are pre-created so
/// distinct middleware instances sharing a key meet the same primitive.
pub(crate) fn validate_boot(store: &Store, pool: &ConcurrencyPool) -> Result<(), KernelError> {
    let mut keyed: FxHashMap<String, usize> = FxHashMap::default();

    for entry in store.tasks_snapshot() {
        let task_id = entry.definition.id().clone();
        for usage in &entry.definition.middleware {
            if usage.id().as_str() != CONCURRENCY_ID {
                continue;
            }
            let config: ConcurrencyConfig =
                super::parse_config(usage.config()).map_err(|e| KernelError::Validation {
                    target: task_id.clone(),
                    stage: ValidationStage::Config,
                    detail: e.to_string(),
                })?;
            let Some(limit) = config.limit else {
                return Err(KernelError::Validation {
                    target: task_id.clone(),
                    stage: ValidationStage::Config,
                    detail: "concurrency middleware requires a limit".to_string(),
                });
            };
            if let Some(key) = config.key {
                match keyed.get(&key) {
                    Some(previous) if *previous != limit => {
                        return Err(KernelError::Validation {
                            target: task_id.clone(),
                            stage: ValidationStage::Config,
                            detail: format!(
                                "concurrency key '{}' declared with limits {} and {}",
                                key, previous, limit
                            ),
                        });
                    }
                    Some(_) => {}
                    None => {
                        keyed.insert(key.clone(), limit);
                        pool.semaphore(&key, limit)?;
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::def::Task;

    #[test]
    fn pool_shares_semaphores_by_key() {
        let pool = ConcurrencyPool::new();
        let a = pool.semaphore("db", 2).unwrap();
        let b = pool.semaphore("db", 2).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.semaphore_count(), 1);
    }

    #[test]
    fn pool_rejects_conflicting_limits() {
        let pool = ConcurrencyPool::new();
        pool.semaphore("db", 2).unwrap();
        let err = pool.semaphore("db", 3).unwrap_err();
        assert!(err.to_string().contains("conflicting limit"));
    }

    #[test]
    fn pool_dispose_disposes_semaphores() {
        let pool = ConcurrencyPool::new();
        let sem = pool.semaphore("db", 1).unwrap();
        pool.dispose();
        assert!(sem.is_disposed());
        assert!(pool.serial().is_disposed());
    }

    #[test]
    fn validate_boot_rejects_conflicting_keyed_limits() {
        let store = Store::new();
        let root = crate::def::Resource::new("app")
            .register(concurrency().clone())
            .register(
                Task::new("app.a")
                    .middleware(concurrency().with(json!({"limit": 1, "key": "shared"}))),
            )
            .register(
                Task::new("app.b")
                    .middleware(concurrency().with(json!({"limit": 2, "key": "shared"}))),
            );
        store.register_tree(root).unwrap();

        let pool = ConcurrencyPool::new();
        let err = validate_boot(&store, &pool).unwrap_err();
        assert_eq!(err.kind(), "VALIDATION");
        assert!(err.to_string().contains("shared"));
    }

    #[test]
    fn validate_boot_requires_limit() {
        let store = Store::new();
        let root = crate::def::Resource::new("app")
            .register(concurrency().clone())
            .register(Task::new("app.a").middleware(concurrency().with(json!({"key": "k"}))));
        store.register_tree(root).unwrap();

        let err = validate_boot(&store, &ConcurrencyPool::new()).unwrap_err();
        assert!(err.to_string().contains("requires a limit"));
    }

    #[test]
    fn validate_boot_precreates_keyed_semaphores() {
        let store = Store::new();
        let root = crate::def::Resource::new("app")
            .register(concurrency().clone())
            .register(
                Task::new("app.a")
                    .middleware(concurrency().with(json!({"limit": 1, "key": "k"}))),
            );
        store.register_tree(root).unwrap();

        let pool = ConcurrencyPool::new();
        validate_boot(&store, &pool).unwrap();
        assert_eq!(pool.semaphore_count(), 1);
    }
}

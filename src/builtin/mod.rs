//! Standard middleware shipped with the kernel
//!
//! Concurrency limiting, per-key serialization, timeouts, retries and
//! fallbacks, all built on the kernel's own primitives. The fixed-id
//! middlewares (`concurrency`, `serial`, `timeout`, `retry`) are registered
//! automatically at boot; `fallback` mints a fresh definition per use since
//! its target is captured at construction.

mod concurrency;
mod fallback;
mod retry;
mod timeout;

pub use concurrency::{
    concurrency, concurrency_shared, serial, ConcurrencyPool, CONCURRENCY_ID, POOL_RESOURCE_ID,
    SERIAL_ID,
};
pub use fallback::{
    fallback, fallback_fn, fallback_task, fallback_value, FallbackTo, FALLBACK_ACTIVE,
    FALLBACK_ERROR,
};
pub use retry::{retry, RETRY_ID};
pub use timeout::{timeout, TIMEOUT_ID};

use std::sync::Arc;

use crate::def::Registrable;
use crate::errors::KernelError;
use crate::store::Store;

/// Register the fixed-id builtins plus the shared concurrency pool resource
pub(crate) fn register(store: &Store, pool: &Arc<ConcurrencyPool>) -> Result<(), KernelError> {
    store.store_item(
        Registrable::Resource(concurrency::pool_resource(pool)),
        None,
    )?;
    store.store_item(Registrable::TaskMiddleware(concurrency().clone()), None)?;
    store.store_item(Registrable::TaskMiddleware(serial().clone()), None)?;
    store.store_item(Registrable::TaskMiddleware(timeout().clone()), None)?;
    store.store_item(Registrable::TaskMiddleware(retry().clone()), None)?;
    Ok(())
}

/// Boot-time checks across all builtin usages (shared-key limit conflicts)
pub(crate) fn validate_boot(store: &Store, pool: &ConcurrencyPool) -> Result<(), KernelError> {
    concurrency::validate_boot(store, pool)
}

/// Parse a middleware config, treating null as the default
pub(crate) fn parse_config<T: Default + serde::de::DeserializeOwned>(
    config: &serde_json::Value,
) -> anyhow::Result<T> {
    if config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(config.clone())
        .map_err(|e| anyhow::anyhow!("invalid middleware config: {}", e))
}

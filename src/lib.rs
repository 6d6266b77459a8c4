//! # Skein
//!
//! Composable in-process application runtime: declare components, boot them
//! in dependency order, run them through layered middleware.
//!
//! ## Overview
//!
//! An application is assembled from declarative pieces:
//!
//! | Component | Role |
//! |-----------|------|
//! | [`Resource`] | Stateful unit with `init`/`dispose`; registers other components |
//! | [`Task`] | Named callable unit with dependencies and middleware |
//! | [`EventDef`] | Typed event; hooks and listening tasks subscribe to it |
//! | [`TaskMiddleware`] / [`ResourceMiddleware`] | Interception layers around runs/inits |
//! | [`Hook`] | Ordered event listener |
//! | [`TagDef`] | Typed marker carrying per-target configuration |
//! | [`ErrorDef`] | Typed application error helper |
//!
//! [`run`] registers the root resource's tree, topologically initializes
//! every resource, locks the registries and returns a [`RunResult`] handle
//! for invoking tasks, emitting events, reading resource values and
//! disposing cleanly (reverse order, concurrent per depth level).
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use serde_json::json;
//! use skein::{run, Resource, RunOptions, Task};
//!
//! let db = Resource::new("app.db")
//!     .init(|_cfg, _api| async { Ok("connection".to_string()) });
//!
//! let greet = Task::new("app.greet")
//!     .dependency("db", &db)
//!     .run(|input, api| async move {
//!         let conn = api.deps().resource::<String>("db")?;
//!         Ok(json!(format!("hello {} via {}", input, conn)))
//!     });
//!
//! let app = Resource::new("app").register(db).register(greet);
//!
//! let handle = run(app, RunOptions::new()).await?;
//! let out = handle.run_task("app.greet", json!("world")).await?;
//! handle.dispose().await?;
//! # Ok::<(), skein::KernelError>(())
//! ```
//!
//! ## Modules
//!
//! - [`def`] - Component definitions and fluent builders
//! - [`runtime`] - `run()`, `RunOptions`, `RunResult`
//! - [`events`] - Ordered pub/sub with wildcard listeners
//! - [`builtin`] - Standard middleware: concurrency, serial, timeout, retry, fallback
//! - [`tunnel`] - Transparent remote routing for selected tasks/events
//! - [`sync`] - FIFO semaphore and per-key serial queue
//! - [`journal`] - Per-invocation keyed scratchpad
//! - [`errors`] - The kernel error taxonomy
//!
//! ## Execution pipeline
//!
//! For one task run, outermost to innermost: global middleware (deduplicated
//! against local), local middleware left-to-right, global interceptors,
//! per-middleware interceptors, the task body. Tunneled tasks swap the body
//! for the tunnel transport and filter layers by the `tunnel_policy` tag.

pub mod api;
pub mod builtin;
pub mod def;
pub mod errors;
pub mod events;
pub mod ident;
pub mod journal;
pub mod runtime;
pub mod store;
pub mod sync;
pub mod system;
pub mod tunnel;

mod lifecycle;
mod pipeline;
mod resolver;
mod schema;
mod task_runner;

// Definitions
pub use def::{
    dep, index, ErrorDef, EventDef, Hook, Meta, MiddlewareUsage, Registrable, Resource,
    ResourceMiddleware, TagDef, TagUsage, Task, TaskMiddleware,
};
// Runtime facade
pub use runtime::{run, AsEventId, AsResourceId, AsTaskId, DebugLevel, RunOptions, RunResult};
// Execution-time API
pub use api::{value_as, Deps, ResourceValue, RunApi, Scratch, TaskExecution};
// Errors
pub use errors::{AppError, KernelError, TunnelCode, TunnelFailure};
// Events
pub use events::Emission;
// Identity
pub use ident::{ComponentId, Kind};
// Journal
pub use journal::{Journal, JournalKey};
// Tunneling
pub use tunnel::{EventDeliveryMode, EventSelector, TaskSelector, TunnelMode, TunnelRunner};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn quick_start_boots_and_runs() {
        let db =
            Resource::new("app.db").init(|_cfg, _api| async { Ok("connection".to_string()) });

        let greet = Task::new("app.greet")
            .dependency("db", &db)
            .run(|input, api| async move {
                let conn = api.deps().resource::<String>("db")?;
                Ok(json!(format!(
                    "hello {} via {}",
                    input.as_str().unwrap_or("?"),
                    conn
                )))
            });

        let app = Resource::new("app").register(db).register(greet);

        let handle = run(app, RunOptions::new()).await.unwrap();
        let out = handle.run_task("app.greet", json!("world")).await.unwrap();
        assert_eq!(out, json!("hello world via connection"));
        handle.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn index_bundles_components() {
        let t1 = Task::new("app.t1").run(|input, _api| async move { Ok(input) });
        let t2 = Task::new("app.t2").run(|input, _api| async move { Ok(input) });
        let bundle = index("app.tasks", vec![t1.into(), t2.into()]);
        let root = Resource::new("app").register(bundle);

        let handle = run(root, RunOptions::new()).await.unwrap();
        let ids: std::sync::Arc<serde_json::Value> = handle.get_resource("app.tasks").unwrap();
        assert_eq!(*ids, json!(["app.t1", "app.t2"]));
        // Bundled tasks are registered and callable.
        assert_eq!(
            handle.run_task("app.t1", json!(1)).await.unwrap(),
            json!(1)
        );
    }
}

//! Fallback middleware
//!
//! On inner failure supplies a replacement result: a fixed value, a computed
//! value, or another task invoked with the original input. The failure is
//! recorded in the journal under `fallback.active` / `fallback.error` so
//! downstream layers and callers can tell a rescued run from a clean one.

use std::sync::Arc;

use serde_json::Value;

use crate::def::{DependencyRef, DependencySpec, Task, TaskMiddleware};
use crate::errors::KernelError;
use crate::ident::{ComponentId, Kind};
use crate::journal::JournalKey;

/// Set to `true` when the fallback replaced a failed inner run
pub static FALLBACK_ACTIVE: JournalKey<bool> = JournalKey::new("fallback.active");

/// The error the fallback rescued
pub static FALLBACK_ERROR: JournalKey<KernelError> = JournalKey::new("fallback.error");

/// What to supply when the inner run fails
#[derive(Clone)]
pub enum FallbackTo {
    /// A fixed replacement value
    Value(Value),
    /// Computed from the error and the original input
    Compute(Arc<dyn Fn(&KernelError, &Value) -> Value + Send + Sync>),
    /// Another task, invoked with the original input
    Task(ComponentId),
}

/// Build a fallback middleware; each call mints a fresh anonymous definition
/// since the target is captured at construction, not via `with()`
pub fn fallback(to: FallbackTo) -> TaskMiddleware {
    let mut mw = TaskMiddleware::anonymous();
    if let FallbackTo::Task(task_id) = &to {
        mw.dependencies = DependencySpec::Static(vec![DependencyRef {
            name: "fallback".to_string(),
            kind: Kind::Task,
            id: task_id.clone(),
        }]);
    }

    mw.run(move |exec, api, _cfg| {
        let to = to.clone();
        async move {
            match exec.next().await {
                Ok(value) => Ok(value),
                Err(err) => {
                    tracing::debug!(
                        task = %exec.task_id(),
                        error = %err,
                        "inner run failed; supplying fallback"
                    );
                    exec.journal().replace(&FALLBACK_ACTIVE, true);
                    exec.journal().replace(&FALLBACK_ERROR, err.clone());

                    match to {
                        FallbackTo::Value(value) => Ok(value),
                        FallbackTo::Compute(f) => Ok(f(&err, exec.input())),
                        FallbackTo::Task(_) => {
                            let handle = api.deps().task("fallback")?;
                            Ok(handle.call(exec.input().clone()).await?)
                        }
                    }
                }
            }
        }
    })
}

/// Fallback to a fixed value
pub fn fallback_value(value: Value) -> TaskMiddleware {
    fallback(FallbackTo::Value(value))
}

/// Fallback computed from the error and the original input
pub fn fallback_fn<F>(f: F) -> TaskMiddleware
where
    F: Fn(&KernelError, &Value) -> Value + Send + Sync + 'static,
{
    fallback(FallbackTo::Compute(Arc::new(f)))
}

/// Fallback to another task, fed the original input
pub fn fallback_task(task: &Task) -> TaskMiddleware {
    fallback(FallbackTo::Task(task.id().clone()))
}

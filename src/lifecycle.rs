//! Resource lifecycle: init and dispose
//!
//! Init walks the resolved topological order; each resource gets its scratch
//! context, its middleware onion and its lifecycle events. A failed init
//! aborts the boot and unwinds already-ready resources in reverse, unless a
//! `on_error` listener suppresses it, in which case the resource is left
//! `failed` and its dependents fail on their own. Dispose walks depth
//! levels deepest-first; peers at one depth dispose concurrently and a
//! failure never stops the remaining teardown.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::api::{NextResourceFn, ResourceValue};
use crate::errors::KernelError;
use crate::ident::ComponentId;
use crate::journal::Journal;
use crate::pipeline::{self, ResourceLayer};
use crate::runtime::Kernel;
use crate::schema;
use crate::store::{ResourceEntry, ResourceState};
use crate::system;

/// Initialize every resource in topological order
pub(crate) async fn init_all(kernel: &Arc<Kernel>) -> Result<(), KernelError> {
    let order = match kernel.order.get() {
        Some(resolved) => resolved.init_order.clone(),
        None => return Err(KernelError::runtime("boot order was not resolved")),
    };

    for id in order {
        if let Err(err) = init_resource(kernel, &id).await {
            tracing::error!(resource = %id, error = %err, "resource init failed; unwinding");
            let _ = dispose_all(kernel).await;
            return Err(err);
        }
    }
    Ok(())
}

#[instrument(skip(kernel), fields(resource = %id))]
async fn init_resource(kernel: &Arc<Kernel>, id: &ComponentId) -> Result<(), KernelError> {
    let entry = kernel.store.require_resource(id)?;
    entry.set_state(ResourceState::Initializing);

    let journal = Journal::new();
    let config = entry.config().clone();

    kernel
        .emit_event(
            &system::before_init_id(id),
            json!({ "config": config.clone() }),
            id,
        )
        .await?;

    match run_init_pipeline(kernel, &entry, &journal, config).await {
        Ok(value) => {
            entry.set_value(value.clone());
            entry.set_state(ResourceState::Ready);
            debug!(resource = %id, "resource ready");
            kernel
                .emit_event(&system::after_init_id(id), json!({}), id)
                .await?;
            Ok(())
        }
        Err(err) => {
            entry.set_state(ResourceState::Failed);
            entry.clear_value();
            let emission = kernel
                .emit_event_returning(
                    &system::resource_error_id(id),
                    json!({ "error": err.to_string(), "kind": err.kind() }),
                    id,
                )
                .await?;
            if emission.is_suppressed() {
                // Listener accepted the failure: boot continues, dependents
                // fail on their own when they resolve this resource.
                debug!(resource = %id, "init failure suppressed");
                Ok(())
            } else {
                Err(err)
            }
        }
    }
}

async fn run_init_pipeline(
    kernel: &Arc<Kernel>,
    entry: &Arc<ResourceEntry>,
    journal: &Journal,
    config: Value,
) -> Result<ResourceValue, KernelError> {
    let id = entry.definition.id().clone();

    let selected = pipeline::select_resource_middleware(&kernel.store, &entry.definition)?;
    let mut layers = Vec::with_capacity(selected.len());
    for (mw_entry, mw_config) in selected {
        if let Some(config_schema) = &mw_entry.definition.config_schema {
            if !mw_config.is_null() {
                schema::validate(
                    mw_entry.definition.id(),
                    crate::errors::ValidationStage::Config,
                    config_schema,
                    &mw_config,
                )?;
            }
        }
        let cancel = kernel.cancel_root.child_token();
        let api = kernel.build_api(
            mw_entry.definition.id(),
            mw_entry.dependencies(),
            journal,
            &cancel,
        )?;
        layers.push(ResourceLayer {
            entry: mw_entry,
            config: mw_config,
            api,
        });
    }

    let inner: NextResourceFn = match entry.definition.init.clone() {
        Some(init) => {
            let cancel = kernel.cancel_root.child_token();
            let mut api = kernel.build_api(&id, entry.dependencies(), journal, &cancel)?;
            if let Some(scratch) = entry.scratch() {
                api = api.with_scratch(scratch.clone());
            }
            Arc::new(move |cfg| {
                let fut = init(cfg, api.clone());
                Box::pin(async move { fut.await.map_err(KernelError::capture) })
            })
        }
        None => {
            // No init: the resource is a pure composition node.
            Arc::new(|_cfg| {
                Box::pin(async move { Ok(Arc::new(()) as ResourceValue) })
            })
        }
    };

    let composed = kernel
        .middleware
        .compose_resource(&id, layers, journal, inner);
    composed(config).await
}

/// Dispose every ready resource, deepest dependents first
///
/// Peers at one depth dispose concurrently. Failures mark the resource
/// `failed-dispose` and are aggregated; teardown always runs to completion.
pub(crate) async fn dispose_all(kernel: &Arc<Kernel>) -> Result<(), KernelError> {
    let Some(resolved) = kernel.order.get() else {
        return Ok(());
    };

    let mut failures: Vec<(ComponentId, String)> = Vec::new();
    for level in resolved.dispose_levels() {
        let results = join_all(
            level
                .iter()
                .map(|id| dispose_resource(kernel, id.clone())),
        )
        .await;
        for result in results {
            if let Err((id, message)) = result {
                failures.push((id, message));
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(KernelError::DisposeFailed { failures })
    }
}

async fn dispose_resource(
    kernel: &Arc<Kernel>,
    id: ComponentId,
) -> Result<(), (ComponentId, String)> {
    let Some(entry) = kernel.store.resource(&id) else {
        return Ok(());
    };
    // Dispose runs at most once, and only after init completed.
    if entry.state() != ResourceState::Ready {
        return Ok(());
    }
    entry.set_state(ResourceState::Disposing);

    let Some(dispose) = entry.definition.dispose.clone() else {
        entry.set_state(ResourceState::Disposed);
        entry.clear_value();
        return Ok(());
    };
    let Some(value) = entry.value() else {
        entry.set_state(ResourceState::Disposed);
        return Ok(());
    };

    let journal = Journal::new();
    let cancel = kernel.cancel_root.child_token();
    let api = match kernel.build_api(&id, entry.dependencies(), &journal, &cancel) {
        Ok(api) => match entry.scratch() {
            Some(scratch) => api.with_scratch(scratch.clone()),
            None => api,
        },
        Err(err) => {
            entry.set_state(ResourceState::FailedDispose);
            return Err((id, err.to_string()));
        }
    };

    match dispose(value, entry.config().clone(), api).await {
        Ok(()) => {
            entry.set_state(ResourceState::Disposed);
            entry.clear_value();
            debug!(resource = %id, "resource disposed");
            Ok(())
        }
        Err(err) => {
            let err = KernelError::capture(err);
            tracing::error!(resource = %id, error = %err, "dispose failed");
            entry.set_state(ResourceState::FailedDispose);
            Err((id, err.to_string()))
        }
    }
}

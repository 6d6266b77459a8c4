//! Task runner
//!
//! One entry point, [`invoke`]: validate the input schema, consult tunnel
//! routing, compose the middleware onion, emit the lifecycle events around
//! the run, validate the result schema. Tasks subscribed to an event are
//! registered as listeners at boot and re-enter [`invoke`] with the emission
//! as input.

use std::sync::{Arc, Weak};

use serde_json::{json, Value};
use tracing::instrument;

use crate::api::NextTaskFn;
use crate::def::ListenSpec;
use crate::errors::{KernelError, TunnelCode, ValidationStage};
use crate::ident::ComponentId;
use crate::journal::Journal;
use crate::pipeline::{self, TaskLayer};
use crate::runtime::Kernel;
use crate::schema;
use crate::system;
use crate::tunnel;

/// Invoke a task through its full pipeline
#[instrument(skip(kernel, input), fields(task = %id))]
pub(crate) async fn invoke(
    kernel: &Arc<Kernel>,
    id: &ComponentId,
    input: Value,
) -> Result<Value, KernelError> {
    let entry = kernel.store.require_task(id)?;
    let definition = &entry.definition;

    if let Some(input_schema) = &definition.input_schema {
        schema::validate(id, ValidationStage::Input, input_schema, &input)?;
    }

    let journal = Journal::new();
    let cancel = kernel.cancel_root.child_token();
    let binding = kernel
        .routes
        .get()
        .and_then(|routes| routes.task_route(id))
        .cloned();
    let tunneled = binding.is_some();

    let selected = pipeline::select_task_middleware(&kernel.store, definition, tunneled)?;
    let mut layers = Vec::with_capacity(selected.len());
    for (mw_entry, config) in selected {
        if let Some(config_schema) = &mw_entry.definition.config_schema {
            if !config.is_null() {
                schema::validate(
                    mw_entry.definition.id(),
                    ValidationStage::Config,
                    config_schema,
                    &config,
                )?;
            }
        }
        let api = kernel.build_api(
            mw_entry.definition.id(),
            mw_entry.dependencies(),
            &journal,
            &cancel,
        )?;
        layers.push(TaskLayer {
            entry: mw_entry,
            config,
            api,
        });
    }

    let inner: NextTaskFn = match binding {
        Some(binding) => {
            let remote = binding.runner.run.clone().ok_or_else(|| KernelError::Tunnel {
                id: binding.tunnel_id.clone(),
                code: TunnelCode::Configuration,
                detail: "task routed through a tunnel with no run transport".to_string(),
            })?;
            let tunnel_id = binding.tunnel_id.clone();
            let task_id = id.clone();
            Arc::new(move |input| {
                let remote = Arc::clone(&remote);
                let tunnel_id = tunnel_id.clone();
                let task_id = task_id.clone();
                Box::pin(async move {
                    remote(task_id, input)
                        .await
                        .map_err(|e| tunnel::capture_remote(&tunnel_id, e))
                })
            })
        }
        None => {
            let Some(run) = definition.run.clone() else {
                return Err(KernelError::runtime(format!(
                    "task '{}' has no local body and no tunnel route",
                    id
                )));
            };
            let api = kernel.build_api(id, entry.dependencies(), &journal, &cancel)?;
            Arc::new(move |input| {
                let fut = run(input, api.clone());
                Box::pin(async move { fut.await.map_err(KernelError::capture) })
            })
        }
    };

    let composed = kernel.middleware.compose_task(id, layers, &journal, inner);

    kernel
        .emit_event(&system::before_run_id(id), json!({ "input": input.clone() }), id)
        .await?;

    match composed(input).await {
        Ok(result) => {
            kernel
                .emit_event(
                    &system::after_run_id(id),
                    json!({ "result": result.clone() }),
                    id,
                )
                .await?;
            if let Some(result_schema) = &definition.result_schema {
                schema::validate(id, ValidationStage::Result, result_schema, &result)?;
            }
            Ok(result)
        }
        Err(err) => {
            kernel
                .emit_event(
                    &system::task_error_id(id),
                    json!({ "error": err.to_string(), "kind": err.kind() }),
                    id,
                )
                .await?;
            Err(err)
        }
    }
}

/// Register every `on`-subscribed task and every hook as event listeners
///
/// Handlers hold a `Weak<Kernel>` so the listener table inside the kernel
/// does not keep the kernel alive.
pub(crate) fn register_listeners(kernel: &Arc<Kernel>) -> Result<(), KernelError> {
    // Stable registration order keeps listener ties deterministic.
    let mut tasks = kernel.store.tasks_snapshot();
    tasks.sort_by(|a, b| {
        a.definition
            .id()
            .as_str()
            .cmp(b.definition.id().as_str())
    });

    for entry in tasks {
        let Some(on) = entry.definition.on.clone() else {
            continue;
        };
        let id = entry.definition.id().clone();
        let weak: Weak<Kernel> = Arc::downgrade(kernel);
        let task_id = id.clone();
        kernel.events.add_listener(
            id,
            on,
            entry.definition.listener_order,
            Arc::new(move |emission| {
                let weak = weak.clone();
                let task_id = task_id.clone();
                Box::pin(async move {
                    let Some(kernel) = weak.upgrade() else {
                        return Ok(());
                    };
                    invoke(&kernel, &task_id, emission.to_value()).await?;
                    Ok(())
                })
            }),
        )?;
    }

    let mut hooks = kernel.store.hooks_snapshot();
    hooks.sort_by(|a, b| {
        a.definition
            .id()
            .as_str()
            .cmp(b.definition.id().as_str())
    });

    for entry in hooks {
        let definition = &entry.definition;
        let Some(on) = definition.on.clone() else {
            tracing::warn!(hook = %definition.id(), "hook without an event target; skipping");
            continue;
        };
        let Some(run) = definition.run.clone() else {
            tracing::warn!(hook = %definition.id(), "hook without a body; skipping");
            continue;
        };
        if let ListenSpec::Event(event) = &on {
            if !kernel.events.has_event(event) {
                return Err(KernelError::EventNotFound {
                    listener: definition.id().clone(),
                    event: event.clone(),
                });
            }
        }

        let id = definition.id().clone();
        let weak: Weak<Kernel> = Arc::downgrade(kernel);
        let hook_entry = Arc::clone(&entry);
        kernel.events.add_listener(
            id.clone(),
            on,
            definition.order,
            Arc::new(move |emission| {
                let weak = weak.clone();
                let hook_entry = Arc::clone(&hook_entry);
                let run = run.clone();
                let id = id.clone();
                Box::pin(async move {
                    let Some(kernel) = weak.upgrade() else {
                        return Ok(());
                    };
                    let journal = Journal::new();
                    let cancel = kernel.cancel_root.child_token();
                    let api =
                        kernel.build_api(&id, hook_entry.dependencies(), &journal, &cancel)?;
                    run(emission, api).await.map_err(KernelError::capture)
                })
            }),
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    // The runner's behavior is observable only through a booted kernel;
    // coverage lives in runtime.rs alongside the end-to-end scenarios.
}

//! Kernel-wide tags and events
//!
//! The `system` tag marks events that must never reach wildcard listeners.
//! Besides the two global events (`ready`, `unhandled_error`) every task and
//! resource gets an auto-created lifecycle event trio under its own id
//! namespace.

use once_cell::sync::Lazy;

use crate::def::{EventDef, Meta, TagDef};
use crate::ident::ComponentId;

static SYSTEM_TAG: Lazy<TagDef> = Lazy::new(|| {
    TagDef::new("skein.system").meta(Meta::titled("Excluded from wildcard listeners"))
});

static TUNNEL_TAG: Lazy<TagDef> =
    Lazy::new(|| TagDef::new("skein.tunnel").meta(Meta::titled("Marks tunnel resources")));

static TUNNEL_POLICY_TAG: Lazy<TagDef> = Lazy::new(|| {
    TagDef::new("skein.tunnel_policy")
        .meta(Meta::titled("Client-side middleware allowlist for tunneled tasks"))
});

static READY_EVENT: Lazy<EventDef> = Lazy::new(|| {
    EventDef::new("skein.ready")
        .tag(system_tag())
        .meta(Meta::titled("Emitted once after boot completes"))
});

static UNHANDLED_ERROR_EVENT: Lazy<EventDef> = Lazy::new(|| {
    EventDef::new("skein.unhandled_error")
        .tag(system_tag())
        .meta(Meta::titled("Funnel for hook/listener/boundary failures"))
});

/// Marker excluding an event from wildcard (`"*"`) listeners
pub fn system_tag() -> &'static TagDef {
    &SYSTEM_TAG
}

/// Marker identifying a resource whose value is a tunnel runner
pub fn tunnel_tag() -> &'static TagDef {
    &TUNNEL_TAG
}

/// Per-task allowlist of middleware ids that still run client-side when the
/// task is tunneled
pub fn tunnel_policy_tag() -> &'static TagDef {
    &TUNNEL_POLICY_TAG
}

/// Emitted exactly once, after every resource reached `ready`
pub fn ready_event() -> &'static EventDef {
    &READY_EVENT
}

/// Receives failures from hooks, wildcard listeners and the error boundary
pub fn unhandled_error_event() -> &'static EventDef {
    &UNHANDLED_ERROR_EVENT
}

/// Source id the runtime uses for its own emissions
pub fn runtime_source() -> ComponentId {
    ComponentId::new("skein.runtime")
}

// ============================================================================
// LIFECYCLE EVENT NAMESPACES
// ============================================================================

pub fn before_init_id(resource: &ComponentId) -> ComponentId {
    resource.derived("events.before_init")
}

pub fn after_init_id(resource: &ComponentId) -> ComponentId {
    resource.derived("events.after_init")
}

pub fn resource_error_id(resource: &ComponentId) -> ComponentId {
    resource.derived("events.on_error")
}

pub fn before_run_id(task: &ComponentId) -> ComponentId {
    task.derived("events.before_run")
}

pub fn after_run_id(task: &ComponentId) -> ComponentId {
    task.derived("events.after_run")
}

pub fn task_error_id(task: &ComponentId) -> ComponentId {
    task.derived("events.on_error")
}

/// The auto-created lifecycle trio for one resource
pub fn lifecycle_events_for_resource(id: &ComponentId) -> Vec<EventDef> {
    vec![
        EventDef::new(before_init_id(id)).tag(system_tag()),
        EventDef::new(after_init_id(id)).tag(system_tag()),
        EventDef::new(resource_error_id(id)).tag(system_tag()),
    ]
}

/// The auto-created lifecycle trio for one task
pub fn lifecycle_events_for_task(id: &ComponentId) -> Vec<EventDef> {
    vec![
        EventDef::new(before_run_id(id)).tag(system_tag()),
        EventDef::new(after_run_id(id)).tag(system_tag()),
        EventDef::new(task_error_id(id)).tag(system_tag()),
    ]
}

/// Whether an event definition carries the system tag
pub fn is_system_event(event: &EventDef) -> bool {
    system_tag().is_on(event.tags())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_events_are_system_tagged() {
        assert!(is_system_event(ready_event()));
        assert!(is_system_event(unhandled_error_event()));
        assert_eq!(ready_event().id().as_str(), "skein.ready");
    }

    #[test]
    fn lifecycle_ids_are_namespaced() {
        let id = ComponentId::new("app.db");
        assert_eq!(before_init_id(&id).as_str(), "app.db.events.before_init");
        assert_eq!(task_error_id(&id).as_str(), "app.db.events.on_error");
    }

    #[test]
    fn lifecycle_trios_are_system_tagged() {
        let id = ComponentId::new("app.t");
        for event in lifecycle_events_for_task(&id) {
            assert!(is_system_event(&event));
        }
        for event in lifecycle_events_for_resource(&id) {
            assert!(is_system_event(&event));
        }
    }
}

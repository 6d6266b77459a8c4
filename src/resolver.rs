//! Dependency resolver
//!
//! Verifies every declared edge (existence, visibility, middleware and event
//! references) and linearizes resource initialization with a depth-first
//! topological sort. Only resource→resource init edges participate in cycle
//! detection; cycles through tasks or middleware are legal and handled by
//! deferred dependency factories at description time.

use rustc_hash::FxHashMap;

use crate::def::{DependencyRef, ListenSpec};
use crate::errors::KernelError;
use crate::ident::{ComponentId, Kind};
use crate::store::Store;

/// Boot ordering produced once per run
#[derive(Debug, Clone)]
pub struct ResolvedOrder {
    /// Resources in init order: dependencies strictly before dependents
    pub init_order: Vec<ComponentId>,
    /// Longest-chain depth per resource; equal depths may dispose
    /// concurrently
    pub depths: FxHashMap<ComponentId, usize>,
}

impl ResolvedOrder {
    /// Resources grouped by depth, deepest group first (dispose order)
    pub fn dispose_levels(&self) -> Vec<Vec<ComponentId>> {
        let max_depth = self.depths.values().copied().max().unwrap_or(0);
        let mut levels: Vec<Vec<ComponentId>> = vec![Vec::new(); max_depth + 1];
        // Walk init order backwards so levels keep reverse-init ordering.
        for id in self.init_order.iter().rev() {
            let depth = self.depths.get(id).copied().unwrap_or(0);
            levels[depth].push(id.clone());
        }
        levels.reverse();
        levels.retain(|level| !level.is_empty());
        levels
    }
}

/// Verify the whole store and compute the resource init order
pub fn resolve(store: &Store) -> Result<ResolvedOrder, KernelError> {
    verify_references(store)?;
    topo_sort_resources(store)
}

// ============================================================================
// REFERENCE VERIFICATION
// ============================================================================

fn verify_references(store: &Store) -> Result<(), KernelError> {
    for entry in store.tasks_snapshot() {
        let id = entry.definition.id().clone();
        verify_deps(store, &id, entry.dependencies())?;
        for usage in &entry.definition.middleware {
            if store.task_middleware(usage.id()).is_none() {
                return Err(KernelError::MiddlewareNotRegistered {
                    consumer: id.clone(),
                    middleware: usage.id().clone(),
                });
            }
        }
        if let Some(ListenSpec::Event(event)) = &entry.definition.on {
            if store.event(event).is_none() {
                return Err(KernelError::EventNotFound {
                    listener: id.clone(),
                    event: event.clone(),
                });
            }
        }
    }

    for entry in store.resources_snapshot() {
        let id = entry.definition.id().clone();
        verify_deps(store, &id, entry.dependencies())?;
        for usage in &entry.definition.middleware {
            if store.resource_middleware(usage.id()).is_none() {
                return Err(KernelError::MiddlewareNotRegistered {
                    consumer: id.clone(),
                    middleware: usage.id().clone(),
                });
            }
        }
    }

    for entry in store.hooks_snapshot() {
        let id = entry.definition.id().clone();
        verify_deps(store, &id, entry.dependencies())?;
        if let Some(ListenSpec::Event(event)) = &entry.definition.on {
            if store.event(event).is_none() {
                return Err(KernelError::EventNotFound {
                    listener: id.clone(),
                    event: event.clone(),
                });
            }
        }
    }

    Ok(())
}

fn verify_deps(
    store: &Store,
    consumer: &ComponentId,
    deps: &[DependencyRef],
) -> Result<(), KernelError> {
    for dep in deps {
        if !store.has(dep.kind, &dep.id) {
            return Err(KernelError::DependencyNotFound {
                consumer: consumer.clone(),
                kind: dep.kind,
                missing: dep.id.clone(),
            });
        }
        let visible = store.with_visibility(|vt| vt.is_accessible(&dep.id, consumer));
        if !visible {
            return Err(KernelError::InaccessibleDependency {
                consumer: consumer.clone(),
                target: dep.id.clone(),
            });
        }
    }
    Ok(())
}

// ============================================================================
// TOPOLOGICAL SORT
// ============================================================================

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    White,
    Gray,
    Black,
}

fn topo_sort_resources(store: &Store) -> Result<ResolvedOrder, KernelError> {
    // Stable iteration keeps init order deterministic across runs.
    let mut ids: Vec<ComponentId> = store
        .resources_snapshot()
        .into_iter()
        .map(|e| e.definition.id().clone())
        .collect();
    ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));

    let mut edges: FxHashMap<ComponentId, Vec<ComponentId>> = FxHashMap::default();
    for id in &ids {
        let entry = store.require_resource(id)?;
        let resource_deps: Vec<ComponentId> = entry
            .dependencies()
            .iter()
            .filter(|d| d.kind == Kind::Resource)
            .map(|d| d.id.clone())
            .collect();
        edges.insert(id.clone(), resource_deps);
    }

    let mut marks: FxHashMap<ComponentId, Mark> =
        ids.iter().map(|id| (id.clone(), Mark::White)).collect();
    let mut order = Vec::with_capacity(ids.len());
    let mut depths: FxHashMap<ComponentId, usize> = FxHashMap::default();
    let mut stack = Vec::new();

    for id in &ids {
        visit(id, &edges, &mut marks, &mut order, &mut depths, &mut stack)?;
    }

    Ok(ResolvedOrder {
        init_order: order,
        depths,
    })
}

fn visit(
    id: &ComponentId,
    edges: &FxHashMap<ComponentId, Vec<ComponentId>>,
    marks: &mut FxHashMap<ComponentId, Mark>,
    order: &mut Vec<ComponentId>,
    depths: &mut FxHashMap<ComponentId, usize>,
    stack: &mut Vec<ComponentId>,
) -> Result<usize, KernelError> {
    match marks.get(id).copied().unwrap_or(Mark::White) {
        Mark::Black => return Ok(depths.get(id).copied().unwrap_or(0)),
        Mark::Gray => {
            // Back-edge: report the cycle in walk order, closing the loop.
            let start = stack.iter().position(|s| s == id).unwrap_or(0);
            let mut path: Vec<ComponentId> = stack[start..].to_vec();
            path.push(id.clone());
            return Err(KernelError::CircularDependencies { path });
        }
        Mark::White => {}
    }

    marks.insert(id.clone(), Mark::Gray);
    stack.push(id.clone());

    let mut depth = 0usize;
    if let Some(deps) = edges.get(id) {
        for dep in deps {
            let dep_depth = visit(dep, edges, marks, order, depths, stack)?;
            depth = depth.max(dep_depth + 1);
        }
    }

    stack.pop();
    marks.insert(id.clone(), Mark::Black);
    depths.insert(id.clone(), depth);
    order.push(id.clone());
    Ok(depth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::def::{Hook, Resource, Task, TaskMiddleware};

    fn id(s: &str) -> ComponentId {
        ComponentId::new(s)
    }

    fn position(order: &[ComponentId], target: &str) -> usize {
        order.iter().position(|i| i.as_str() == target).unwrap()
    }

    #[test]
    fn linear_chain_orders_dependencies_first() {
        let store = Store::new();
        let a = Resource::new("chain.a");
        let b = Resource::new("chain.b").dependency("a", &a);
        let c = Resource::new("chain.c").dependency("b", &b);
        let root = Resource::new("chain")
            .register(a)
            .register(b)
            .register(c);
        store.register_tree(root).unwrap();

        let resolved = resolve(&store).unwrap();
        let order = &resolved.init_order;
        assert!(position(order, "chain.a") < position(order, "chain.b"));
        assert!(position(order, "chain.b") < position(order, "chain.c"));

        assert_eq!(resolved.depths[&id("chain.a")], 0);
        assert_eq!(resolved.depths[&id("chain.b")], 1);
        assert_eq!(resolved.depths[&id("chain.c")], 2);
    }

    #[test]
    fn cycle_is_reported_with_path() {
        let store = Store::new();
        let a_probe = Resource::new("cyc.a");
        let b = Resource::new("cyc.b").dependency("a", &a_probe);
        // Close the loop with a deferred factory, like users break
        // description-time cycles.
        let b_probe = b.clone();
        let a = Resource::new("cyc.a")
            .dependencies_deferred(move || vec![crate::def::dep("b", &b_probe)]);

        let store_root = Resource::new("cyc").register(a).register(b);
        store.register_tree(store_root).unwrap();

        let err = resolve(&store).unwrap_err();
        assert_eq!(err.kind(), "CIRCULAR_DEPENDENCIES");
        let msg = err.to_string();
        assert!(msg.contains("cyc.a") && msg.contains("cyc.b"));
    }

    #[test]
    fn missing_dependency_is_reported() {
        let store = Store::new();
        let ghost = Resource::new("app.ghost");
        let root = Resource::new("app")
            .register(Task::new("app.t").dependency("ghost", &ghost));
        store.register_tree(root).unwrap();

        let err = resolve(&store).unwrap_err();
        assert_eq!(err.kind(), "DEPENDENCY_NOT_FOUND");
    }

    #[test]
    fn unregistered_middleware_is_reported() {
        let store = Store::new();
        let mw = TaskMiddleware::new("app.mw");
        let root = Resource::new("app").register(Task::new("app.t").middleware(&mw));
        store.register_tree(root).unwrap();

        let err = resolve(&store).unwrap_err();
        assert_eq!(err.kind(), "MIDDLEWARE_NOT_REGISTERED");
    }

    #[test]
    fn hook_on_unknown_event_is_reported() {
        let store = Store::new();
        let phantom_event = crate::def::EventDef::new("app.ghost_event");
        let root =
            Resource::new("app").register(Hook::new("app.h").on(&phantom_event));
        store.register_tree(root).unwrap();

        let err = resolve(&store).unwrap_err();
        assert_eq!(err.kind(), "EVENT_NOT_FOUND");
    }

    #[test]
    fn hidden_dependency_is_rejected() {
        let store = Store::new();
        let secret = Task::new("lib.secret");
        let exported = Task::new("lib.open");
        let lib = Resource::new("lib")
            .register(secret.clone())
            .register(exported.clone())
            .exports(vec![&exported]);
        let consumer = Task::new("app.consumer").dependency("secret", &secret);
        let root = Resource::new("app").register(lib).register(consumer);
        store.register_tree(root).unwrap();

        let err = resolve(&store).unwrap_err();
        assert_eq!(err.kind(), "INACCESSIBLE_DEPENDENCY");
    }

    #[test]
    fn dispose_levels_group_by_depth() {
        let store = Store::new();
        let base = Resource::new("app.base");
        let left = Resource::new("app.left").dependency("base", &base);
        let right = Resource::new("app.right").dependency("base", &base);
        let root = Resource::new("app")
            .register(base)
            .register(left)
            .register(right);
        store.register_tree(root).unwrap();

        let resolved = resolve(&store).unwrap();
        let levels = resolved.dispose_levels();

        // Deepest first: left/right (peers) dispose before base.
        let first: Vec<&str> = levels[0].iter().map(|i| i.as_str()).collect();
        assert!(first.contains(&"app.left") && first.contains(&"app.right"));
        let last = levels.last().unwrap();
        assert!(last.iter().any(|i| i.as_str() == "app.base"));
    }

    #[test]
    fn deferred_factories_resolve_once_here() {
        let store = Store::new();
        let base = Resource::new("app.base");
        let base_clone = base.clone();
        let dependent = Resource::new("app.dep")
            .dependencies_deferred(move || vec![crate::def::dep("base", &base_clone)]);
        let root = Resource::new("app").register(base).register(dependent);
        store.register_tree(root).unwrap();

        let resolved = resolve(&store).unwrap();
        assert!(
            position(&resolved.init_order, "app.base")
                < position(&resolved.init_order, "app.dep")
        );
    }
}

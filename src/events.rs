//! Event manager: typed pub/sub with ordered listeners
//!
//! Listeners subscribe to one event id or to `"*"`. For one emission they run
//! strictly sequentially in `(order ascending, registration ascending)`
//! order; concurrent emissions interleave only between listener awaits, never
//! within one. Wildcard listeners are excluded from system-tagged events.
//! Listener failures never abort the emitter: they are routed to the
//! unhandled-error sink.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};

use crate::def::ListenSpec;
use crate::errors::KernelError;
use crate::ident::ComponentId;

tokio::task_local! {
    /// Event ids currently being emitted on this logical call path; used by
    /// the optional recursion guard.
    static EMIT_PATH: Vec<ComponentId>;
}

/// Whether `event` is currently being emitted on this call path; the
/// unhandled-error funnel uses this to avoid re-entering itself.
pub fn emission_in_progress(event: &ComponentId) -> bool {
    EMIT_PATH.try_with(|p| p.contains(event)).unwrap_or(false)
}

// ============================================================================
// EMISSION
// ============================================================================

/// One concrete firing of an event, handed to every listener
#[derive(Clone)]
pub struct Emission {
    pub id: ComponentId,
    pub data: Value,
    pub source: ComponentId,
    pub timestamp_ms: u64,
    suppressed: Arc<AtomicBool>,
}

impl Emission {
    pub fn new(id: ComponentId, data: Value, source: ComponentId) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Emission {
            id,
            data,
            source,
            timestamp_ms,
            suppressed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Mark the failure behind this emission as handled (lifecycle `on_error`
    /// events only; a no-op elsewhere)
    pub fn suppress(&self) {
        self.suppressed.store(true, Ordering::SeqCst);
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::SeqCst)
    }

    /// JSON shape used when an emission becomes a listening task's input
    pub fn to_value(&self) -> Value {
        json!({
            "event": self.id.as_str(),
            "data": self.data,
            "source": self.source.as_str(),
            "timestamp_ms": self.timestamp_ms,
        })
    }
}

impl std::fmt::Debug for Emission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emission")
            .field("id", &self.id)
            .field("source", &self.source)
            .finish()
    }
}

// ============================================================================
// LISTENERS
// ============================================================================

/// Boxed listener body
pub type ListenerFn =
    Arc<dyn Fn(Emission) -> BoxFuture<'static, Result<(), KernelError>> + Send + Sync>;

/// One subscription, ordered by `(order, seq)`
#[derive(Clone)]
pub struct ListenerEntry {
    pub id: ComponentId,
    pub on: ListenSpec,
    pub order: i32,
    seq: u64,
    handler: ListenerFn,
}

/// Sink receiving listener failures (the unhandled-error funnel)
pub type UnhandledSink = Arc<dyn Fn(KernelError) -> BoxFuture<'static, ()> + Send + Sync>;

// ============================================================================
// EVENT MANAGER
// ============================================================================

/// Ordered pub/sub hub; mutable until [`EventManager::lock`]
pub struct EventManager {
    /// Sorted by (order, seq); insertion keeps the invariant
    listeners: RwLock<Vec<ListenerEntry>>,
    /// Registered event ids -> system flag
    events: RwLock<FxHashMap<ComponentId, bool>>,
    seq: AtomicU64,
    locked: AtomicBool,
    cycle_detection: AtomicBool,
    unhandled: RwLock<Option<UnhandledSink>>,
}

impl EventManager {
    pub fn new() -> Self {
        EventManager {
            listeners: RwLock::new(Vec::new()),
            events: RwLock::new(FxHashMap::default()),
            seq: AtomicU64::new(0),
            locked: AtomicBool::new(false),
            cycle_detection: AtomicBool::new(false),
            unhandled: RwLock::new(None),
        }
    }

    /// Enable/disable the recursion guard (a boot option)
    pub fn set_cycle_detection(&self, enabled: bool) {
        self.cycle_detection.store(enabled, Ordering::SeqCst);
    }

    /// Install the failure sink listener errors are routed to
    pub fn set_unhandled_sink(&self, sink: UnhandledSink) {
        *self.unhandled.write() = Some(sink);
    }

    /// Index an event id; `system` events never reach wildcard listeners
    pub fn register_event(&self, id: ComponentId, system: bool) -> Result<(), KernelError> {
        self.ensure_unlocked()?;
        self.events.write().insert(id, system);
        Ok(())
    }

    pub fn has_event(&self, id: &ComponentId) -> bool {
        self.events.read().contains_key(id)
    }

    /// Subscribe; ties in `order` preserve registration order
    pub fn add_listener(
        &self,
        id: ComponentId,
        on: ListenSpec,
        order: i32,
        handler: ListenerFn,
    ) -> Result<(), KernelError> {
        self.ensure_unlocked()?;
        if let ListenSpec::Event(event_id) = &on {
            if !self.has_event(event_id) {
                return Err(KernelError::EventNotFound {
                    listener: id,
                    event: event_id.clone(),
                });
            }
        }
        let entry = ListenerEntry {
            id,
            on,
            order,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            handler,
        };
        let mut listeners = self.listeners.write();
        let at = listeners
            .partition_point(|l| (l.order, l.seq) <= (entry.order, entry.seq));
        listeners.insert(at, entry);
        Ok(())
    }

    /// Unsubscribe by listener id
    pub fn remove_listener(&self, id: &ComponentId) -> Result<(), KernelError> {
        self.ensure_unlocked()?;
        self.listeners.write().retain(|l| &l.id != id);
        Ok(())
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Freeze subscriptions; runtime emits keep working
    pub fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    fn ensure_unlocked(&self) -> Result<(), KernelError> {
        if self.is_locked() {
            return Err(KernelError::Locked {
                what: "event manager",
            });
        }
        Ok(())
    }

    /// Emit `event` with `data`, running matching listeners sequentially
    pub async fn emit(
        &self,
        event: &ComponentId,
        data: Value,
        source: &ComponentId,
    ) -> Result<Emission, KernelError> {
        let emission = Emission::new(event.clone(), data, source.clone());
        self.dispatch(&emission).await?;
        Ok(emission)
    }

    /// Run matching listeners for a prepared emission
    ///
    /// Split from [`EventManager::emit`] so tunnel mirror mode can dispatch
    /// locally and remotely from one emission object.
    pub async fn dispatch(&self, emission: &Emission) -> Result<(), KernelError> {
        let event = &emission.id;
        let system = {
            let events = self.events.read();
            match events.get(event) {
                Some(system) => *system,
                None => {
                    return Err(KernelError::EventNotFound {
                        listener: emission.source.clone(),
                        event: event.clone(),
                    })
                }
            }
        };

        let path = EMIT_PATH.try_with(|p| p.clone()).unwrap_or_default();
        if self.cycle_detection.load(Ordering::SeqCst) && path.contains(event) {
            let mut full = path.clone();
            full.push(event.clone());
            return Err(KernelError::EmissionCycle {
                event: event.clone(),
                path: full,
            });
        }

        let matching: Vec<ListenerEntry> = {
            let listeners = self.listeners.read();
            listeners
                .iter()
                .filter(|l| match &l.on {
                    ListenSpec::Event(id) => id == event,
                    ListenSpec::Any => !system,
                })
                .cloned()
                .collect()
        };

        let mut scoped_path = path;
        scoped_path.push(event.clone());
        let run = self.run_listeners(matching, emission.clone());
        EMIT_PATH.scope(scoped_path, run).await;
        Ok(())
    }

    async fn run_listeners(&self, listeners: Vec<ListenerEntry>, emission: Emission) {
        for listener in listeners {
            if let Err(err) = (listener.handler)(emission.clone()).await {
                tracing::error!(
                    listener = %listener.id,
                    event = %emission.id,
                    error = %err,
                    "event listener failed"
                );
                let sink = self.unhandled.read().clone();
                if let Some(sink) = sink {
                    sink(err).await;
                }
            }
        }
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("events", &self.events.read().len())
            .field("listeners", &self.listener_count())
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &str) -> ListenerFn {
        let log = Arc::clone(log);
        let label = label.to_string();
        Arc::new(move |_emission| {
            let log = Arc::clone(&log);
            let label = label.clone();
            Box::pin(async move {
                log.lock().push(label);
                Ok(())
            })
        })
    }

    fn manager_with_event(id: &str, system: bool) -> EventManager {
        let manager = EventManager::new();
        manager
            .register_event(ComponentId::new(id), system)
            .unwrap();
        manager
    }

    #[tokio::test]
    async fn listeners_run_in_order_then_registration() {
        let manager = manager_with_event("app.e", false);
        let log = Arc::new(Mutex::new(Vec::new()));

        manager
            .add_listener(
                ComponentId::new("l.late"),
                ListenSpec::Event(ComponentId::new("app.e")),
                10,
                recorder(&log, "late"),
            )
            .unwrap();
        manager
            .add_listener(
                ComponentId::new("l.early"),
                ListenSpec::Event(ComponentId::new("app.e")),
                -5,
                recorder(&log, "early"),
            )
            .unwrap();
        manager
            .add_listener(
                ComponentId::new("l.tie_a"),
                ListenSpec::Event(ComponentId::new("app.e")),
                0,
                recorder(&log, "tie_a"),
            )
            .unwrap();
        manager
            .add_listener(
                ComponentId::new("l.tie_b"),
                ListenSpec::Event(ComponentId::new("app.e")),
                0,
                recorder(&log, "tie_b"),
            )
            .unwrap();

        manager
            .emit(&ComponentId::new("app.e"), Value::Null, &ComponentId::new("test"))
            .await
            .unwrap();

        assert_eq!(*log.lock(), vec!["early", "tie_a", "tie_b", "late"]);
    }

    #[tokio::test]
    async fn wildcard_receives_plain_but_not_system_events() {
        let manager = manager_with_event("app.plain", false);
        manager
            .register_event(ComponentId::new("app.internal"), true)
            .unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        manager
            .add_listener(
                ComponentId::new("l.wild"),
                ListenSpec::Any,
                0,
                recorder(&log, "wild"),
            )
            .unwrap();

        manager
            .emit(&ComponentId::new("app.plain"), Value::Null, &ComponentId::new("t"))
            .await
            .unwrap();
        manager
            .emit(&ComponentId::new("app.internal"), Value::Null, &ComponentId::new("t"))
            .await
            .unwrap();

        assert_eq!(*log.lock(), vec!["wild"]);
    }

    #[tokio::test]
    async fn listener_failure_is_swallowed_and_funneled() {
        let manager = manager_with_event("app.e", false);
        let captured: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        {
            let captured = Arc::clone(&captured);
            manager.set_unhandled_sink(Arc::new(move |err| {
                let captured = Arc::clone(&captured);
                Box::pin(async move {
                    captured.lock().push(err.to_string());
                })
            }));
        }

        manager
            .add_listener(
                ComponentId::new("l.bad"),
                ListenSpec::Event(ComponentId::new("app.e")),
                0,
                Arc::new(|_| Box::pin(async { Err(KernelError::runtime("hook boom")) })),
            )
            .unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        manager
            .add_listener(
                ComponentId::new("l.good"),
                ListenSpec::Event(ComponentId::new("app.e")),
                1,
                recorder(&log, "good"),
            )
            .unwrap();

        // The emit itself succeeds and later listeners still run.
        manager
            .emit(&ComponentId::new("app.e"), Value::Null, &ComponentId::new("t"))
            .await
            .unwrap();
        assert_eq!(*log.lock(), vec!["good"]);
        assert_eq!(captured.lock().len(), 1);
        assert!(captured.lock()[0].contains("hook boom"));
    }

    #[tokio::test]
    async fn unknown_event_errors() {
        let manager = EventManager::new();
        let err = manager
            .emit(&ComponentId::new("app.ghost"), Value::Null, &ComponentId::new("t"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "EVENT_NOT_FOUND");
    }

    #[tokio::test]
    async fn locked_manager_rejects_subscriptions() {
        let manager = manager_with_event("app.e", false);
        manager.lock();

        let err = manager
            .add_listener(
                ComponentId::new("l"),
                ListenSpec::Any,
                0,
                Arc::new(|_| Box::pin(async { Ok(()) })),
            )
            .unwrap_err();
        assert_eq!(err.kind(), "LOCKED");

        let err = manager.remove_listener(&ComponentId::new("l")).unwrap_err();
        assert_eq!(err.kind(), "LOCKED");

        // Emitting is a runtime-time operation and stays allowed.
        manager
            .emit(&ComponentId::new("app.e"), Value::Null, &ComponentId::new("t"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cycle_guard_fails_fast_on_recursive_emit() {
        let manager = Arc::new(manager_with_event("app.e", false));
        manager.set_cycle_detection(true);

        let inner = Arc::clone(&manager);
        let observed: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let observed_in = Arc::clone(&observed);
        manager
            .add_listener(
                ComponentId::new("l.reemit"),
                ListenSpec::Event(ComponentId::new("app.e")),
                0,
                Arc::new(move |_| {
                    let inner = Arc::clone(&inner);
                    let observed = Arc::clone(&observed_in);
                    Box::pin(async move {
                        let err = inner
                            .emit(&ComponentId::new("app.e"), Value::Null, &ComponentId::new("l"))
                            .await
                            .unwrap_err();
                        *observed.lock() = Some(err.kind().to_string());
                        Ok(())
                    })
                }),
            )
            .unwrap();

        manager
            .emit(&ComponentId::new("app.e"), Value::Null, &ComponentId::new("t"))
            .await
            .unwrap();
        assert_eq!(observed.lock().as_deref(), Some("EMISSION_CYCLE"));
    }

    #[tokio::test]
    async fn nested_distinct_events_pass_cycle_guard() {
        let manager = Arc::new(manager_with_event("app.outer", false));
        manager
            .register_event(ComponentId::new("app.inner"), false)
            .unwrap();
        manager.set_cycle_detection(true);

        let inner = Arc::clone(&manager);
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_in = Arc::clone(&log);
        manager
            .add_listener(
                ComponentId::new("l.outer"),
                ListenSpec::Event(ComponentId::new("app.outer")),
                0,
                Arc::new(move |_| {
                    let inner = Arc::clone(&inner);
                    let log = Arc::clone(&log_in);
                    Box::pin(async move {
                        inner
                            .emit(&ComponentId::new("app.inner"), Value::Null, &ComponentId::new("l"))
                            .await?;
                        log.lock().push("outer done");
                        Ok(())
                    })
                }),
            )
            .unwrap();

        manager
            .emit(&ComponentId::new("app.outer"), Value::Null, &ComponentId::new("t"))
            .await
            .unwrap();
        assert_eq!(*log.lock(), vec!["outer done"]);
    }

    #[test]
    fn emission_suppression_flag_is_shared() {
        let emission = Emission::new(
            ComponentId::new("app.e"),
            Value::Null,
            ComponentId::new("t"),
        );
        let clone = emission.clone();
        clone.suppress();
        assert!(emission.is_suppressed());
    }

    #[test]
    fn emission_to_value_shape() {
        let emission = Emission::new(
            ComponentId::new("app.e"),
            json!({"x": 1}),
            ComponentId::new("runtime"),
        );
        let v = emission.to_value();
        assert_eq!(v["event"], "app.e");
        assert_eq!(v["data"]["x"], 1);
        assert_eq!(v["source"], "runtime");
    }
}

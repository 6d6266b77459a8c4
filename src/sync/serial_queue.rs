//! Per-key single-flight executor
//!
//! `run(key, fut)` serializes futures submitted under the same key: each
//! starts only after the previous one settled, in enqueue order (tokio's
//! fair mutex provides the FIFO hand-off). Results and failures are
//! delivered only to their own caller. Idle queues are evicted after a
//! bounded inactivity window to keep the key map from growing without
//! bound.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::KernelError;

/// Inactivity window after which an idle queue is dropped
const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(60);

struct QueueCell {
    // Fair mutex: lock() waiters are released in request order.
    chain: tokio::sync::Mutex<()>,
    last_used: parking_lot::Mutex<Instant>,
}

/// Per-key serial executor with idle eviction
pub struct SerialQueue {
    queues: Arc<DashMap<String, Arc<QueueCell>>>,
    idle_ttl: Duration,
    disposed: Arc<AtomicBool>,
    sweep_cancel: CancellationToken,
}

impl SerialQueue {
    /// Create a queue set with the default 60s idle eviction window
    pub fn new() -> Self {
        Self::with_idle_ttl(DEFAULT_IDLE_TTL)
    }

    /// Create a queue set with a custom idle eviction window
    pub fn with_idle_ttl(idle_ttl: Duration) -> Self {
        SerialQueue {
            queues: Arc::new(DashMap::new()),
            idle_ttl,
            disposed: Arc::new(AtomicBool::new(false)),
            sweep_cancel: CancellationToken::new(),
        }
    }

    /// Execute `fut` under `key`, after every earlier submission to that key
    pub async fn run<F, T>(&self, key: &str, fut: F) -> Result<T, KernelError>
    where
        F: Future<Output = T>,
    {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(KernelError::Disposed { what: "serial queue" });
        }

        let cell = self.checkout(key);
        let _guard = cell.chain.lock().await;

        // Re-validate after the suspension point: dispose may have raced us.
        if self.disposed.load(Ordering::SeqCst) {
            return Err(KernelError::Disposed { what: "serial queue" });
        }

        let output = fut.await;
        *cell.last_used.lock() = Instant::now();
        Ok(output)
    }

    /// Number of live (non-evicted) queues
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Evict all queues and reject further submissions; idempotent
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sweep_cancel.cancel();
        self.queues.clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn checkout(&self, key: &str) -> Arc<QueueCell> {
        use dashmap::mapref::entry::Entry;

        match self.queues.entry(key.to_string()) {
            Entry::Occupied(e) => Arc::clone(e.get()),
            Entry::Vacant(e) => {
                let cell = Arc::new(QueueCell {
                    chain: tokio::sync::Mutex::new(()),
                    last_used: parking_lot::Mutex::new(Instant::now()),
                });
                e.insert(Arc::clone(&cell));
                self.schedule_eviction(key.to_string(), Arc::downgrade(&cell));
                cell
            }
        }
    }

    /// One sweeper per queue: wakes at the eviction horizon, evicts once the
    /// queue has been idle and uncontended for a full window.
    fn schedule_eviction(&self, key: String, cell: std::sync::Weak<QueueCell>) {
        let queues = Arc::clone(&self.queues);
        let idle_ttl = self.idle_ttl;
        let disposed = Arc::clone(&self.disposed);
        let cancel = self.sweep_cancel.clone();

        tokio::spawn(async move {
            loop {
                let Some(live) = cell.upgrade() else { return };
                let now = Instant::now();
                let target = *live.last_used.lock() + idle_ttl;
                // A queue that is mid-flight keeps its stale last_used; back
                // off a full window instead of spinning on a past deadline.
                let horizon = if target <= now { now + idle_ttl } else { target };
                drop(live);

                tokio::select! {
                    _ = tokio::time::sleep_until(horizon) => {}
                    _ = cancel.cancelled() => return,
                }

                if disposed.load(Ordering::SeqCst) {
                    return;
                }
                let Some(live) = cell.upgrade() else { return };
                let idle = live.last_used.lock().elapsed() >= idle_ttl;
                let uncontended = live.chain.try_lock().is_ok();
                if idle && uncontended {
                    queues.remove(&key);
                    return;
                }
            }
        });
    }
}

impl Default for SerialQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("queues", &self.queue_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

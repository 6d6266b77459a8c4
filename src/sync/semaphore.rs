//! Counted semaphore with strict FIFO fairness
//!
//! Permits are handed to waiters in arrival order: a release while waiters
//! queue transfers the permit directly to the front waiter instead of
//! bumping the counter, so a late acquirer can never overtake. Acquisition
//! is cooperative: callers pass a `CancellationToken` and waiting resolves
//! early on cancel or dispose.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::errors::KernelError;

struct Waiter {
    seq: u64,
    grant: oneshot::Sender<Result<(), KernelError>>,
}

struct State {
    permits: usize,
    waiters: VecDeque<Waiter>,
    next_seq: u64,
    disposed: bool,
}

/// FIFO permit allocator
pub struct Semaphore {
    capacity: usize,
    state: Mutex<State>,
}

impl Semaphore {
    /// Create a semaphore with `capacity` permits
    pub fn new(capacity: usize) -> Self {
        Semaphore {
            capacity,
            state: Mutex::new(State {
                permits: capacity,
                waiters: VecDeque::new(),
                next_seq: 0,
                disposed: false,
            }),
        }
    }

    /// Total permit count
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Currently free permits
    pub fn available(&self) -> usize {
        self.state.lock().permits
    }

    /// Number of queued waiters
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Acquire one permit, waiting FIFO behind earlier acquirers
    ///
    /// Resolves with `Cancelled` if `cancel` fires first, or `Disposed` if
    /// the semaphore is disposed while waiting.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), KernelError> {
        let (rx, seq) = {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(KernelError::Disposed { what: "semaphore" });
            }
            // Fast path only when nobody is queued, preserving FIFO order.
            if state.permits > 0 && state.waiters.is_empty() {
                state.permits -= 1;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiters.push_back(Waiter { seq, grant: tx });
            (rx, seq)
        };

        tokio::select! {
            granted = rx => match granted {
                Ok(result) => result,
                Err(_) => Err(KernelError::Disposed { what: "semaphore" }),
            },
            _ = cancel.cancelled() => {
                // Re-validate under the lock: the grant may have raced us.
                let removed = {
                    let mut state = self.state.lock();
                    let before = state.waiters.len();
                    state.waiters.retain(|w| w.seq != seq);
                    state.waiters.len() != before
                };
                if !removed {
                    // A permit was already handed over; give it back.
                    self.release();
                }
                Err(KernelError::Cancelled { what: "semaphore acquire" })
            }
        }
    }

    /// Return one permit, waking the front waiter if any
    pub fn release(&self) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        // Hand the permit directly to the oldest live waiter.
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.grant.send(Ok(())).is_ok() {
                return;
            }
        }
        if state.permits < self.capacity {
            state.permits += 1;
        }
    }

    /// Reject all waiters and refuse further acquires; idempotent
    pub fn dispose(&self) {
        let waiters = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            let _ = waiter
                .grant
                .send(Err(KernelError::Disposed { what: "semaphore" }));
        }
    }

    /// Whether dispose has been called
    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Semaphore")
            .field("capacity", &self.capacity)
            .field("permits", &state.permits)
            .field("waiting", &state.waiters.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}

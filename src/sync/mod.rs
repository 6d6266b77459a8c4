//! Kernel-owned synchronization primitives
//!
//! The only shared mutable structures at runtime: a FIFO [`Semaphore`] and a
//! per-key [`SerialQueue`]. Both are cancellation-aware and disposable; the
//! standard concurrency middlewares are built on top of them.

mod semaphore;
mod serial_queue;

pub use semaphore::Semaphore;
pub use serial_queue::SerialQueue;

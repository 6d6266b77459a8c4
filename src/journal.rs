//! Execution journal: per-invocation keyed scratchpad
//!
//! The journal travels with a single task run or resource init through every
//! middleware layer. It is the only supported channel for a middleware to
//! talk to downstream layers or the final run without ambient state. Keys
//! are typed handles; values live behind `Arc` so reads are zero-copy.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::errors::KernelError;

/// Typed journal key
///
/// Declare once (usually as a static) and share between the writer and the
/// readers; the associated type keeps both sides honest.
///
/// ```rust,ignore
/// static ATTEMPTS: JournalKey<u32> = JournalKey::new("retry.attempts");
/// journal.set(&ATTEMPTS, 3)?;
/// assert_eq!(journal.get(&ATTEMPTS).as_deref(), Some(&3));
/// ```
pub struct JournalKey<T> {
    name: &'static str,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> JournalKey<T> {
    /// Create a key; `name` must be unique within one invocation
    pub const fn new(name: &'static str) -> Self {
        JournalKey {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Per-invocation scratchpad shared across middleware layers
///
/// Cloning shares the underlying slots (Arc), mirroring how the journal is
/// handed to each layer of the pipeline.
#[derive(Clone, Default)]
pub struct Journal {
    slots: Arc<RwLock<FxHashMap<&'static str, Arc<dyn Any + Send + Sync>>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value under `key`; fails if the key is already set
    pub fn set<T: Send + Sync + 'static>(
        &self,
        key: &JournalKey<T>,
        value: T,
    ) -> Result<(), KernelError> {
        let mut slots = self.slots.write();
        if slots.contains_key(key.name) {
            return Err(KernelError::JournalKeyTaken { key: key.name });
        }
        slots.insert(key.name, Arc::new(value));
        Ok(())
    }

    /// Store a value under `key`, replacing any previous value
    pub fn replace<T: Send + Sync + 'static>(&self, key: &JournalKey<T>, value: T) {
        self.slots.write().insert(key.name, Arc::new(value));
    }

    /// Read the value under `key`, if set with a matching type
    pub fn get<T: Send + Sync + 'static>(&self, key: &JournalKey<T>) -> Option<Arc<T>> {
        let slots = self.slots.read();
        let slot = slots.get(key.name)?;
        Arc::clone(slot).downcast::<T>().ok()
    }

    /// Read and clone the value under `key`
    pub fn get_cloned<T: Clone + Send + Sync + 'static>(&self, key: &JournalKey<T>) -> Option<T> {
        self.get(key).map(|arc| (*arc).clone())
    }

    /// Whether `key` is set (regardless of type)
    pub fn contains<T>(&self, key: &JournalKey<T>) -> bool {
        self.slots.read().contains_key(key.name)
    }

    /// Names of all keys currently set
    pub fn keys(&self) -> Vec<&'static str> {
        self.slots.read().keys().copied().collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal").field("len", &self.len()).finish()
    }
}

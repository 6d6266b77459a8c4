//! Component identity: interned ids and kind markers
//!
//! Every definition carries a `ComponentId` plus a `Kind`. Ids are interned
//! `Arc<str>` so cloning is O(1) and equality starts with a pointer compare.
//! Anonymous definitions get a generated `{kind}.anonymous.{n}` id.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Serialize, Serializer};
use thiserror::Error;

/// Global string interner (thread-safe, lock-free)
static INTERNER: Lazy<DashMap<Arc<str>, ()>> = Lazy::new(DashMap::new);

/// Counter backing anonymous id generation
static ANON_COUNTER: Lazy<AtomicU64> = Lazy::new(|| AtomicU64::new(0));

/// Allowed id shape: dot-namespaced segments of `[A-Za-z0-9_-]`
static ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+(\.[A-Za-z0-9_-]+)*$").expect("static id pattern"));

fn intern(s: &str) -> Arc<str> {
    let key: Arc<str> = Arc::from(s);
    if let Some(existing) = INTERNER.get(&key) {
        return Arc::clone(existing.key());
    }
    INTERNER.insert(Arc::clone(&key), ());
    key
}

// ============================================================================
// KIND
// ============================================================================

/// Marker distinguishing what a definition is, used to dispatch registration
/// and lookup without structural guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Task,
    Resource,
    Event,
    TaskMiddleware,
    ResourceMiddleware,
    Hook,
    Tag,
    Error,
}

impl Kind {
    /// Stable lowercase label, used in error messages and generated ids
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Task => "task",
            Kind::Resource => "resource",
            Kind::Event => "event",
            Kind::TaskMiddleware => "task-middleware",
            Kind::ResourceMiddleware => "resource-middleware",
            Kind::Hook => "hook",
            Kind::Tag => "tag",
            Kind::Error => "error",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// COMPONENT ID
// ============================================================================

/// Interned, globally comparable component identifier
///
/// Construction never fails; format validation happens at registration via
/// [`ComponentId::validate`], so malformed ids surface as kernel errors
/// instead of panics inside builder chains.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ComponentId(Arc<str>);

impl ComponentId {
    /// Maximum allowed length
    pub const MAX_LENGTH: usize = 190;

    /// Create an id from a string, interning it
    pub fn new(id: impl AsRef<str>) -> Self {
        ComponentId(intern(id.as_ref()))
    }

    /// Generate a unique id for an anonymous definition of the given kind
    pub fn anonymous(kind: Kind) -> Self {
        let n = ANON_COUNTER.fetch_add(1, Ordering::Relaxed);
        ComponentId(intern(&format!("{}.anonymous.{}", kind.as_str(), n)))
    }

    /// Derive a namespaced child id, e.g. lifecycle event ids
    pub fn derived(&self, suffix: &str) -> Self {
        ComponentId(intern(&format!("{}.{}", self.0, suffix)))
    }

    /// Check id format: non-empty, bounded, dot-namespaced `[A-Za-z0-9_-]`
    pub fn validate(&self) -> Result<(), IdError> {
        let id = self.as_str();
        if id.is_empty() {
            return Err(IdError::Empty);
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(IdError::TooLong(id.len()));
        }
        if !ID_PATTERN.is_match(id) {
            return Err(IdError::InvalidCharacters(id.to_string()));
        }
        Ok(())
    }

    /// Get as string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for ComponentId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentId({:?})", &*self.0)
    }
}

impl From<&str> for ComponentId {
    fn from(s: &str) -> Self {
        ComponentId::new(s)
    }
}

impl From<String> for ComponentId {
    fn from(s: String) -> Self {
        ComponentId::new(s)
    }
}

impl PartialEq<&str> for ComponentId {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl Serialize for ComponentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Id format violations, surfaced during registration
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("id cannot be empty")]
    Empty,
    #[error("id too long ({0} > {})", ComponentId::MAX_LENGTH)]
    TooLong(usize),
    #[error("id contains invalid characters: '{0}'")]
    InvalidCharacters(String),
}

//! Kernel error taxonomy
//!
//! One enum covers every failure the kernel itself can produce, each variant
//! carrying a stable kind string (part of the public contract). User code
//! running inside tasks, resources, hooks and tunnels returns `anyhow::Result`;
//! [`KernelError::capture`] folds those into the taxonomy, preserving typed
//! app-error identity (`{id, data}`) across the boundary.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::ident::{ComponentId, IdError, Kind};

// ============================================================================
// TYPED APP ERRORS
// ============================================================================

/// A typed application error: a stable id plus structured data
///
/// Produced by [`crate::def::ErrorDef::throw`]; survives tunneling and
/// `anyhow` round-trips via [`KernelError::capture`].
#[derive(Debug, Clone, Error, PartialEq)]
#[error("app error '{id}': {data}")]
pub struct AppError {
    pub id: ComponentId,
    pub data: Value,
}

impl AppError {
    pub fn new(id: impl Into<ComponentId>, data: Value) -> Self {
        AppError {
            id: id.into(),
            data,
        }
    }
}

// ============================================================================
// TUNNEL CODES
// ============================================================================

/// Classification of remote-call failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelCode {
    InvalidResponse,
    HttpError,
    Configuration,
    Unknown,
}

impl TunnelCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelCode::InvalidResponse => "INVALID_RESPONSE",
            TunnelCode::HttpError => "HTTP_ERROR",
            TunnelCode::Configuration => "CONFIGURATION",
            TunnelCode::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for TunnelCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type tunnel transports may surface through `anyhow`
///
/// Transports that want a precise code bail with this; anything else is
/// captured as `UNKNOWN`.
#[derive(Debug, Clone, Error)]
#[error("tunnel failure [{code}]: {message}")]
pub struct TunnelFailure {
    pub code: TunnelCode,
    pub message: String,
}

impl TunnelFailure {
    pub fn new(code: TunnelCode, message: impl Into<String>) -> Self {
        TunnelFailure {
            code,
            message: message.into(),
        }
    }
}

// ============================================================================
// KERNEL ERROR
// ============================================================================

/// Which schema a validation failure applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStage {
    Input,
    Result,
    Config,
}

impl fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationStage::Input => f.write_str("input"),
            ValidationStage::Result => f.write_str("result"),
            ValidationStage::Config => f.write_str("config"),
        }
    }
}

/// Every error the kernel raises
///
/// Cloneable so aggregates (dispose results, fallback journals) can retain
/// copies; user failures are held behind `Arc<anyhow::Error>`.
#[derive(Debug, Clone, Error)]
pub enum KernelError {
    #[error("duplicate {kind} registration: '{id}'")]
    DuplicateRegistration { kind: Kind, id: ComponentId },

    #[error("'{consumer}' depends on unregistered {kind} '{missing}'")]
    DependencyNotFound {
        consumer: ComponentId,
        kind: Kind,
        missing: ComponentId,
    },

    #[error("'{consumer}' depends on '{target}' which is not visible from its owner subtree")]
    InaccessibleDependency {
        consumer: ComponentId,
        target: ComponentId,
    },

    #[error("register[] of '{owner}' contains an item with no kind marker: {detail}")]
    UnknownItemType { owner: ComponentId, detail: String },

    #[error("circular dependencies among resources: {}", format_cycle(path))]
    CircularDependencies { path: Vec<ComponentId> },

    #[error("'{listener}' listens to unregistered event '{event}'")]
    EventNotFound {
        listener: ComponentId,
        event: ComponentId,
    },

    #[error("middleware '{id}' was already flagged everywhere()")]
    MiddlewareAlreadyGlobal { id: ComponentId },

    #[error("'{consumer}' uses middleware '{middleware}' which is not registered")]
    MiddlewareNotRegistered {
        consumer: ComponentId,
        middleware: ComponentId,
    },

    #[error("{what} is locked; registration-time APIs are unavailable after boot")]
    Locked { what: &'static str },

    #[error("store already initialized; run() can only be invoked once per store")]
    StoreAlreadyInitialized,

    #[error("invalid id '{id}': {source}")]
    InvalidId {
        id: String,
        #[source]
        source: IdError,
    },

    #[error("override target '{id}' is not registered")]
    OverrideTargetNotFound { id: ComponentId },

    #[error("{stage} validation failed for '{target}': {detail}")]
    Validation {
        target: ComponentId,
        stage: ValidationStage,
        detail: String,
    },

    #[error("'{id}' timed out after {ttl:?}")]
    Timeout { id: ComponentId, ttl: Duration },

    #[error("task '{id}' is not registered")]
    TaskNotFound { id: ComponentId },

    #[error("resource '{id}' is not registered")]
    ResourceNotFound { id: ComponentId },

    #[error("resource '{id}' is in state '{state}', not ready")]
    ResourceNotReady {
        id: ComponentId,
        state: &'static str,
    },

    #[error("resource '{id}' value is not a '{expected}'")]
    ResourceValueType {
        id: ComponentId,
        expected: &'static str,
    },

    #[error("'{id}' not found while trying to resolve {what} for tunnel")]
    TunnelSelectorNotFound { id: String, what: &'static str },

    #[error("tunnel '{id}' [{code}]: {detail}")]
    Tunnel {
        id: ComponentId,
        code: TunnelCode,
        detail: String,
    },

    #[error("emission cycle on '{event}': {}", format_cycle(path))]
    EmissionCycle {
        event: ComponentId,
        path: Vec<ComponentId>,
    },

    #[error("journal key '{key}' already set; pass override to replace it")]
    JournalKeyTaken { key: &'static str },

    #[error("{what} was disposed")]
    Disposed { what: &'static str },

    #[error("{what} was cancelled")]
    Cancelled { what: &'static str },

    #[error("dispose completed with {} failure(s): {}", failures.len(), format_failures(failures))]
    DisposeFailed {
        failures: Vec<(ComponentId, String)>,
    },

    #[error(transparent)]
    App(#[from] AppError),

    /// User-supplied closure failed with an arbitrary error
    #[error("{0}")]
    Failure(Arc<anyhow::Error>),

    /// Generic escape hatch
    #[error("{0}")]
    Runtime(String),
}

fn format_cycle(path: &[ComponentId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn format_failures(failures: &[(ComponentId, String)]) -> String {
    failures
        .iter()
        .map(|(id, msg)| format!("{}: {}", id, msg))
        .collect::<Vec<_>>()
        .join("; ")
}

impl KernelError {
    /// Stable kind string; part of the public contract
    pub fn kind(&self) -> &'static str {
        match self {
            KernelError::DuplicateRegistration { .. } => "DUPLICATE_REGISTRATION",
            KernelError::DependencyNotFound { .. } => "DEPENDENCY_NOT_FOUND",
            KernelError::InaccessibleDependency { .. } => "INACCESSIBLE_DEPENDENCY",
            KernelError::UnknownItemType { .. } => "UNKNOWN_ITEM_TYPE",
            KernelError::CircularDependencies { .. } => "CIRCULAR_DEPENDENCIES",
            KernelError::EventNotFound { .. } => "EVENT_NOT_FOUND",
            KernelError::MiddlewareAlreadyGlobal { .. } => "MIDDLEWARE_ALREADY_GLOBAL",
            KernelError::MiddlewareNotRegistered { .. } => "MIDDLEWARE_NOT_REGISTERED",
            KernelError::Locked { .. } => "LOCKED",
            KernelError::StoreAlreadyInitialized => "STORE_ALREADY_INITIALIZED",
            KernelError::InvalidId { .. } => "INVALID_ID",
            KernelError::OverrideTargetNotFound { .. } => "OVERRIDE_TARGET_NOT_FOUND",
            KernelError::Validation { .. } => "VALIDATION",
            KernelError::Timeout { .. } => "TIMEOUT",
            KernelError::TaskNotFound { .. } => "TASK_NOT_FOUND",
            KernelError::ResourceNotFound { .. } => "RESOURCE_NOT_FOUND",
            KernelError::ResourceNotReady { .. } => "RESOURCE_NOT_READY",
            KernelError::ResourceValueType { .. } => "RESOURCE_VALUE_TYPE",
            KernelError::TunnelSelectorNotFound { .. } => "TUNNEL_SELECTOR_NOT_FOUND",
            KernelError::Tunnel { .. } => "TUNNEL",
            KernelError::EmissionCycle { .. } => "EMISSION_CYCLE",
            KernelError::JournalKeyTaken { .. } => "JOURNAL_KEY_TAKEN",
            KernelError::Disposed { .. } => "DISPOSED",
            KernelError::Cancelled { .. } => "CANCELLED",
            KernelError::DisposeFailed { .. } => "DISPOSE_FAILED",
            KernelError::App(_) => "APP",
            KernelError::Failure(_) => "FAILURE",
            KernelError::Runtime(_) => "RUNTIME",
        }
    }

    /// Fold a user-closure error into the taxonomy
    ///
    /// Downcast order matters: a `KernelError` thrown through `anyhow` is
    /// unwrapped intact, an [`AppError`] keeps its `{id, data}` identity, a
    /// [`TunnelFailure`] keeps its code. Everything else becomes `Failure`.
    pub fn capture(err: anyhow::Error) -> Self {
        let err = match err.downcast::<KernelError>() {
            Ok(kernel) => return kernel,
            Err(other) => other,
        };
        let err = match err.downcast::<AppError>() {
            Ok(app) => return KernelError::App(app),
            Err(other) => other,
        };
        KernelError::Failure(Arc::new(err))
    }

    /// The `{id, data}` pair if this error carries typed app identity
    pub fn app(&self) -> Option<&AppError> {
        match self {
            KernelError::App(app) => Some(app),
            _ => None,
        }
    }

    /// Generic error with a message
    pub fn runtime(msg: impl Into<String>) -> Self {
        KernelError::Runtime(msg.into())
    }

    /// Short guidance on resolving this error, if any
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            KernelError::DuplicateRegistration { .. } => {
                Some("use unique ids per kind, or declare the replacement in overrides[]")
            }
            KernelError::DependencyNotFound { .. } => {
                Some("add the component to a register[] reachable from the root resource")
            }
            KernelError::InaccessibleDependency { .. } => {
                Some("export the item from its owning resource, or move the consumer into the owner subtree")
            }
            KernelError::CircularDependencies { .. } => {
                Some("break the cycle with a deferred dependency factory")
            }
            KernelError::Locked { .. } => {
                Some("registration must happen before run(); only runtime APIs work afterwards")
            }
            KernelError::MiddlewareNotRegistered { .. } => {
                Some("register the middleware in the same register[] tree that uses it")
            }
            KernelError::TunnelSelectorNotFound { .. } => {
                Some("tunnel selectors must name tasks/events registered before boot")
            }
            _ => None,
        }
    }
}

impl From<anyhow::Error> for KernelError {
    fn from(err: anyhow::Error) -> Self {
        KernelError::capture(err)
    }
}

//! Typed application error helpers
//!
//! An `ErrorDef` names an error id; `throw(data)` produces the matching
//! [`AppError`]. When a thrown error carries `{id, data}` and the definition
//! is registered, the kernel re-attaches the typed identity on the way out,
//! including across tunnels.

use serde_json::Value;

use crate::def::Meta;
use crate::errors::{AppError, KernelError};
use crate::ident::ComponentId;

/// Declarative error descriptor
#[derive(Clone)]
pub struct ErrorDef {
    pub(crate) id: ComponentId,
    pub(crate) data_schema: Option<Value>,
    pub(crate) meta: Meta,
    pub(crate) fingerprint: u64,
}

impl ErrorDef {
    pub fn new(id: impl Into<ComponentId>) -> Self {
        ErrorDef {
            id: id.into(),
            data_schema: None,
            meta: Meta::default(),
            fingerprint: crate::def::next_fingerprint(),
        }
    }

    /// JSON Schema the error data should satisfy (metadata only)
    pub fn data_schema(mut self, schema: Value) -> Self {
        self.data_schema = Some(schema);
        self
    }

    pub fn meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    pub fn id(&self) -> &ComponentId {
        &self.id
    }

    /// Produce the typed error carrying `data`
    pub fn throw(&self, data: Value) -> AppError {
        AppError::new(self.id.clone(), data)
    }

    /// Whether `err` carries this definition's identity
    pub fn matches(&self, err: &KernelError) -> bool {
        err.app().map(|app| app.id == self.id).unwrap_or(false)
    }
}

impl std::fmt::Debug for ErrorDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorDef").field("id", &self.id).finish()
    }
}

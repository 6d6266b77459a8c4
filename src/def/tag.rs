//! Tags: typed markers with optional per-target configuration
//!
//! A tag usage attaches to tasks, resources, events or hooks. Middleware and
//! kernel policies read them back via [`TagDef::extract`].

use serde_json::Value;

use crate::def::{Meta, Registrable};
use crate::ident::ComponentId;

/// Declarative tag descriptor
#[derive(Clone)]
pub struct TagDef {
    pub(crate) id: ComponentId,
    pub(crate) config_schema: Option<Value>,
    pub(crate) meta: Meta,
    pub(crate) fingerprint: u64,
}

impl TagDef {
    pub fn new(id: impl Into<ComponentId>) -> Self {
        TagDef {
            id: id.into(),
            config_schema: None,
            meta: Meta::default(),
            fingerprint: crate::def::next_fingerprint(),
        }
    }

    /// JSON Schema attached configurations must satisfy
    pub fn config_schema(mut self, schema: Value) -> Self {
        self.config_schema = Some(schema);
        self
    }

    pub fn meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    pub fn id(&self) -> &ComponentId {
        &self.id
    }

    /// A usage of this tag carrying configuration
    pub fn with(&self, config: Value) -> TagUsage {
        TagUsage {
            id: self.id.clone(),
            config,
        }
    }

    /// A bare usage of this tag
    pub fn usage(&self) -> TagUsage {
        self.with(Value::Null)
    }

    /// Whether this tag is present in a usage list
    pub fn is_on(&self, tags: &[TagUsage]) -> bool {
        tags.iter().any(|t| t.id == self.id)
    }

    /// Read this tag's configuration from a usage list
    pub fn extract<'a>(&self, tags: &'a [TagUsage]) -> Option<&'a Value> {
        tags.iter().find(|t| t.id == self.id).map(|t| &t.config)
    }
}

impl std::fmt::Debug for TagDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagDef").field("id", &self.id).finish()
    }
}

/// One attachment of a tag to a component
#[derive(Clone, Debug)]
pub struct TagUsage {
    pub(crate) id: ComponentId,
    pub(crate) config: Value,
}

impl TagUsage {
    pub fn id(&self) -> &ComponentId {
        &self.id
    }

    pub fn config(&self) -> &Value {
        &self.config
    }
}

impl From<&TagDef> for TagUsage {
    fn from(def: &TagDef) -> Self {
        def.usage()
    }
}

impl From<TagDef> for TagUsage {
    fn from(def: TagDef) -> Self {
        def.usage()
    }
}

/// Convenience for registering a tag definition
impl From<&TagDef> for Registrable {
    fn from(def: &TagDef) -> Self {
        Registrable::Tag(def.clone())
    }
}

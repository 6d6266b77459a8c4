//! Event definitions
//!
//! An event is pure identity plus tags; the payload type is descriptive
//! only. Listeners attach via hooks or via a task's `on`.

use crate::def::{AsDependency, Meta, TagUsage};
use crate::ident::{ComponentId, Kind};

/// Declarative event descriptor
#[derive(Clone)]
pub struct EventDef {
    pub(crate) id: ComponentId,
    pub(crate) tags: Vec<TagUsage>,
    pub(crate) meta: Meta,
    pub(crate) fingerprint: u64,
}

impl EventDef {
    pub fn new(id: impl Into<ComponentId>) -> Self {
        EventDef {
            id: id.into(),
            tags: Vec::new(),
            meta: Meta::default(),
            fingerprint: crate::def::next_fingerprint(),
        }
    }

    pub fn tag(mut self, usage: impl Into<TagUsage>) -> Self {
        self.tags.push(usage.into());
        self
    }

    pub fn meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    pub fn id(&self) -> &ComponentId {
        &self.id
    }

    pub fn tags(&self) -> &[TagUsage] {
        &self.tags
    }
}

impl AsDependency for EventDef {
    fn dependency_kind(&self) -> Kind {
        Kind::Event
    }

    fn dependency_id(&self) -> &ComponentId {
        &self.id
    }
}

impl std::fmt::Debug for EventDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDef").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system;

    #[test]
    fn event_carries_tags() {
        let event = EventDef::new("app.audit").tag(system::system_tag());
        assert_eq!(event.id().as_str(), "app.audit");
        assert!(system::system_tag().is_on(event.tags()));
    }
}

//! Ownership and export visibility
//!
//! Every item registered through a resource is tracked with its owner,
//! forming a child→parent forest over an index arena. A resource may declare
//! an export set; items left out are invisible outside its subtree. The
//! accessibility rule walks the target's owner chain: each hop must either
//! already contain the consumer or export the link being crossed.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ident::ComponentId;

struct Node {
    id: ComponentId,
    owner: Option<usize>,
    /// None = no export set declared, everything in the subtree is visible
    exports: Option<FxHashSet<ComponentId>>,
}

/// Arena-indexed owner graph
#[derive(Default)]
pub struct VisibilityTracker {
    nodes: Vec<Node>,
    index: FxHashMap<ComponentId, usize>,
}

impl VisibilityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id` as registered by `owner` (None for the root)
    pub fn track(&mut self, id: ComponentId, owner: Option<&ComponentId>) {
        if self.index.contains_key(&id) {
            return;
        }
        let owner_idx = owner.and_then(|o| self.index.get(o).copied());
        let idx = self.nodes.len();
        self.nodes.push(Node {
            id: id.clone(),
            owner: owner_idx,
            exports: None,
        });
        self.index.insert(id, idx);
    }

    /// Declare the export set of an owning resource
    pub fn set_exports(&mut self, owner: &ComponentId, exports: Vec<ComponentId>) {
        if let Some(&idx) = self.index.get(owner) {
            self.nodes[idx].exports = Some(exports.into_iter().collect());
        }
    }

    pub fn is_tracked(&self, id: &ComponentId) -> bool {
        self.index.contains_key(id)
    }

    /// Direct owner of `id`, if any
    pub fn owner_of(&self, id: &ComponentId) -> Option<&ComponentId> {
        let idx = *self.index.get(id)?;
        let owner_idx = self.nodes[idx].owner?;
        Some(&self.nodes[owner_idx].id)
    }

    /// Whether `consumer` may depend on `target`
    ///
    /// Accepts when the target is untracked, when the walk reaches an
    /// ancestor whose subtree contains the consumer, or when every owner
    /// crossed on the way up exports the link being left behind.
    pub fn is_accessible(&self, target: &ComponentId, consumer: &ComponentId) -> bool {
        let Some(&target_idx) = self.index.get(target) else {
            return true;
        };

        // Consumer-side ancestor chain, including the consumer itself.
        let mut consumer_chain = FxHashSet::default();
        if let Some(&consumer_idx) = self.index.get(consumer) {
            let mut cur = Some(consumer_idx);
            while let Some(idx) = cur {
                consumer_chain.insert(idx);
                cur = self.nodes[idx].owner;
            }
        }

        let mut cur = target_idx;
        loop {
            let Some(owner_idx) = self.nodes[cur].owner else {
                // Top of the tracked forest: publicly visible.
                return true;
            };
            if consumer_chain.contains(&owner_idx) {
                // Common ancestor reached; same-subtree access.
                return true;
            }
            if let Some(exports) = &self.nodes[owner_idx].exports {
                if !exports.contains(&self.nodes[cur].id) {
                    return false;
                }
            }
            cur = owner_idx;
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl std::fmt::Debug for VisibilityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisibilityTracker")
            .field("tracked", &self.len())
            .finish()
    }
}

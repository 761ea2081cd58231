//! Identity-preserving live handles over graph nodes.
//!
//! Application code holds [`LiveNode`] handles rather than raw ids, and
//! the pool guarantees that one node id maps to at most one live handle
//! at a time: asking twice returns the same `Arc` for as long as any
//! clone of it is alive. Handles carry no document data; every read and
//! write goes through an explicitly passed [`LayeredCache`], so the
//! pool never entangles itself with the cache's borrows.
//!
//! The pool also owns fresh-id allocation. Ids have the shape
//! `"{prefix}:{counter}"` where the prefix names the owning actor, so
//! two actors that have never synchronized still cannot collide.
//!
//! Performance targets:
//! - get_or_create / allocate_id: O(1) amortized
//! - prune: O(tracked handles), run opportunistically
//!
//! Reference: Gamma et al. — Design Patterns (Flyweight)

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::cache::LayeredCache;
use crate::node::{Entry, Json, NodeId};

/// Dead weak entries are swept after this many handle insertions.
const PRUNE_INTERVAL: usize = 1024;

/// A pooled handle to one node. Compare with [`Arc::ptr_eq`] for
/// identity.
pub type LiveNode = Arc<NodeHandle>;

/// Handle state: just the node's id. All data access borrows a cache.
#[derive(Debug)]
pub struct NodeHandle {
    id: NodeId,
}

impl NodeHandle {
    /// The node this handle addresses.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Effective value of one of this node's cells.
    pub fn get<'a>(&self, cache: &'a LayeredCache, key: &str) -> Option<&'a Entry> {
        cache.get_child(&self.id, key)
    }

    /// Visible keys of this node.
    pub fn keys(&self, cache: &LayeredCache) -> Vec<String> {
        cache.keys(&self.id)
    }

    /// Visible `(key, entry)` pairs of this node.
    pub fn entries(&self, cache: &LayeredCache) -> Vec<(String, Entry)> {
        cache.entries(&self.id)
    }

    /// Write an inline value under this node.
    pub fn set_value(&self, cache: &mut LayeredCache, key: impl Into<String>, value: impl Into<Json>) {
        cache.set_value(self.id.clone(), key, value);
    }

    /// Write a reference under this node.
    pub fn set_ref(&self, cache: &mut LayeredCache, key: impl Into<String>, target: impl Into<NodeId>) {
        cache.set_ref(self.id.clone(), key, target);
    }

    /// Delete one of this node's cells.
    pub fn delete(&self, cache: &mut LayeredCache, key: &str) -> bool {
        cache.delete_child(&self.id, key)
    }
}

/// A resolved cell: inline JSON, or a live handle for a reference.
#[derive(Debug, Clone)]
pub enum LiveValue {
    /// Inline JSON payload.
    Json(Json),
    /// Pooled handle to the referenced node.
    Node(LiveNode),
}

impl LiveValue {
    /// The inline value, if any.
    pub fn as_json(&self) -> Option<&Json> {
        match self {
            LiveValue::Json(value) => Some(value),
            LiveValue::Node(_) => None,
        }
    }

    /// The live handle, if this cell is a reference.
    pub fn as_node(&self) -> Option<&LiveNode> {
        match self {
            LiveValue::Json(_) => None,
            LiveValue::Node(node) => Some(node),
        }
    }
}

/// Weak-memoizing handle pool plus fresh-id allocator for one actor.
#[derive(Debug)]
pub struct LiveNodePool {
    /// Actor namespace baked into every allocated id.
    prefix: String,
    /// Monotonic allocation counter; ids are never reused.
    next_node: u64,
    handles: HashMap<NodeId, Weak<NodeHandle>>,
    inserts_since_prune: usize,
}

impl LiveNodePool {
    /// Create a pool allocating ids under the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next_node: 0,
            handles: HashMap::new(),
            inserts_since_prune: 0,
        }
    }

    /// Pool for a numbered actor.
    pub fn for_actor(actor: u32) -> Self {
        Self::new(actor.to_string())
    }

    /// The handle for a node id, pointer-identical to any other live
    /// handle for the same id from this pool.
    pub fn get_or_create(&mut self, id: &NodeId) -> LiveNode {
        if let Some(weak) = self.handles.get(id) {
            if let Some(handle) = weak.upgrade() {
                return handle;
            }
        }
        let handle = Arc::new(NodeHandle { id: id.clone() });
        self.handles.insert(id.clone(), Arc::downgrade(&handle));
        self.inserts_since_prune += 1;
        if self.inserts_since_prune >= PRUNE_INTERVAL {
            self.prune();
        }
        handle
    }

    /// The root node's handle.
    pub fn root(&mut self) -> LiveNode {
        self.get_or_create(&NodeId::root())
    }

    /// Allocate a fresh node id. Never reused, never collides across
    /// actors.
    pub fn allocate_id(&mut self) -> NodeId {
        self.next_node += 1;
        let id = NodeId::new(format!("{}:{}", self.prefix, self.next_node));
        log::trace!("allocated node id {}", id);
        id
    }

    /// Create a fresh node and attach it under `parent[key]` as a
    /// reference, returning its handle.
    pub fn attach_new(
        &mut self,
        cache: &mut LayeredCache,
        parent: &NodeId,
        key: impl Into<String>,
    ) -> LiveNode {
        let id = self.allocate_id();
        cache.set_ref(parent.clone(), key, id.clone());
        self.get_or_create(&id)
    }

    /// Materialize a stored cell: inline values are cloned out,
    /// references become pooled handles.
    pub fn resolve(&mut self, entry: &Entry) -> LiveValue {
        match entry {
            Entry::Value(value) => LiveValue::Json(value.clone()),
            Entry::Ref(id) => LiveValue::Node(self.get_or_create(id)),
        }
    }

    /// Look up `node[key]` in the cache and materialize it.
    pub fn resolve_child(
        &mut self,
        cache: &LayeredCache,
        node: &NodeId,
        key: &str,
    ) -> Option<LiveValue> {
        let entry = cache.get_child(node, key)?.clone();
        Some(self.resolve(&entry))
    }

    /// Number of tracked ids, dead weak entries included.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the pool tracks no ids.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Sweep entries whose handles have all been dropped, returning how
    /// many were removed.
    pub fn prune(&mut self) -> usize {
        let before = self.handles.len();
        self.handles.retain(|_, weak| weak.strong_count() > 0);
        self.inserts_since_prune = 0;
        before - self.handles.len()
    }
}

//! Change summaries exchanged between server and replicas.
//!
//! A [`Delta`] is the net effect of one committed transaction, split
//! into three buckets keyed by node: deleted keys, written inline
//! values, and written references. The wire form is a three-element
//! array `[deletedByNode, valuesByNode, refsByNode]`; every bucket is
//! an insertion-ordered map so replicas that apply the same delta also
//! agree on listing order, not just on contents.
//!
//! Reference: Kleppmann — DDIA, Chapter 5 (Leader-Based Replication)

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::cache::LayeredCache;
use crate::node::{Entry, Json, NodeId};

/// Net effect of one committed transaction.
///
/// A cell appears in at most one bucket: its final slot in the
/// committed layer was either a deletion or a write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "DeltaWire", into = "DeltaWire")]
pub struct Delta {
    /// Keys deleted, per node.
    pub deleted: IndexMap<NodeId, Vec<String>>,
    /// Inline values written, per node.
    pub values: IndexMap<NodeId, IndexMap<String, Json>>,
    /// References written, per node.
    pub refs: IndexMap<NodeId, IndexMap<String, NodeId>>,
}

/// Wire form: `[deletedByNode, valuesByNode, refsByNode]`.
#[derive(Serialize, Deserialize)]
struct DeltaWire(
    IndexMap<NodeId, Vec<String>>,
    IndexMap<NodeId, IndexMap<String, Json>>,
    IndexMap<NodeId, IndexMap<String, NodeId>>,
);

impl From<DeltaWire> for Delta {
    fn from(wire: DeltaWire) -> Self {
        Self {
            deleted: wire.0,
            values: wire.1,
            refs: wire.2,
        }
    }
}

impl From<Delta> for DeltaWire {
    fn from(delta: Delta) -> Self {
        Self(delta.deleted, delta.values, delta.refs)
    }
}

impl Delta {
    /// An empty delta (also the duplicate-op acknowledgement payload).
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the delta carries no changes at all.
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.values.is_empty() && self.refs.is_empty()
    }

    /// Total number of changed cells across all buckets.
    pub fn change_count(&self) -> usize {
        let deleted: usize = self.deleted.values().map(|keys| keys.len()).sum();
        let values: usize = self.values.values().map(|kv| kv.len()).sum();
        let refs: usize = self.refs.values().map(|kv| kv.len()).sum();
        deleted + values + refs
    }

    /// Record a deleted key.
    pub fn record_delete(&mut self, node: NodeId, key: String) {
        self.deleted.entry(node).or_default().push(key);
    }

    /// Record a written inline value.
    pub fn record_value(&mut self, node: NodeId, key: String, value: Json) {
        self.values.entry(node).or_default().insert(key, value);
    }

    /// Record a written reference.
    pub fn record_ref(&mut self, node: NodeId, key: String, target: NodeId) {
        self.refs.entry(node).or_default().insert(key, target);
    }

    /// Replay this delta onto a replica cache as ambient writes.
    ///
    /// Deletions are applied first, then values, then references; each
    /// bucket replays in recording order. The buckets are disjoint per
    /// cell, so the relative order of the buckets only matters for the
    /// listing position of re-created keys.
    pub fn apply_to(&self, cache: &mut LayeredCache) {
        for (node, keys) in &self.deleted {
            for key in keys {
                cache.delete_child(node, key);
            }
        }
        for (node, writes) in &self.values {
            for (key, value) in writes {
                cache.set_child(node.clone(), key.clone(), Entry::Value(value.clone()));
            }
        }
        for (node, writes) in &self.refs {
            for (key, target) in writes {
                cache.set_child(node.clone(), key.clone(), Entry::Ref(target.clone()));
            }
        }
    }
}

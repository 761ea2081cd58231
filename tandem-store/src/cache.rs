//! Layered transactional cache over the document graph.
//!
//! The committed document lives in a root index; every open transaction
//! is one overlay layer on a stack. Reads walk innermost-first, writes
//! and deletes land in the top layer, and a commit folds the top layer
//! into whatever is beneath it. Deletions inside a layer are tombstones
//! that shadow everything below without touching it.
//!
//! Architecture:
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                LayeredCache                  │
//! │                                              │
//! │   layer 1 (innermost, writable) ─┐           │
//! │   layer 0                        │ lookups   │
//! │   root (committed)             ◄─┘           │
//! │                                              │
//! │   commit:   fold top layer into the next     │
//! │   rollback: discard top layer                │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Performance targets:
//! - get_child: O(open layers) map probes
//! - set_child / delete_child: O(1) into the top layer
//! - delta / commit / rollback: O(top-layer size)
//!
//! Reference: Kleppmann — DDIA, Chapter 7 (Transactions)

use std::collections::HashSet;

use serde_json::json;
use thiserror::Error;

use crate::delta::Delta;
use crate::index::NestedIndex;
use crate::node::{Entry, Json, NodeId, Slot};

/// Transaction-stack misuse.
///
/// These are programmer errors: the engine opens and closes layers in
/// strictly balanced pairs, so hitting one means the calling code path
/// is broken and should abort.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// delta / commit / rollback was called with no open transaction.
    #[error("no active transaction")]
    NoActiveTransaction,
}

/// The document graph: a committed root plus a stack of transaction
/// layers.
///
/// The root stores [`Entry`] directly and therefore can never hold a
/// tombstone; layers store [`Slot`] so a deletion is representable
/// distinctly from "not written here".
#[derive(Debug, Clone, Default)]
pub struct LayeredCache {
    root: NestedIndex<NodeId, String, Entry>,
    /// Transaction stack, outermost first; the last element is writable.
    layers: Vec<NestedIndex<NodeId, String, Slot>>,
}

impl LayeredCache {
    /// Create an empty cache with no open transaction.
    pub fn new() -> Self {
        Self::default()
    }

    // ────────────────────────────────────────────────────────────────
    // Reads
    // ────────────────────────────────────────────────────────────────

    /// Effective value of one cell, innermost layer first.
    ///
    /// A tombstone in any layer makes the cell absent regardless of
    /// what older layers or the root hold.
    pub fn get_child(&self, node: &NodeId, key: &str) -> Option<&Entry> {
        for layer in self.layers.iter().rev() {
            if let Some(slot) = layer.get(node, key) {
                return match slot {
                    Slot::Entry(entry) => Some(entry),
                    Slot::Tombstone => None,
                };
            }
        }
        self.root.get(node, key)
    }

    /// Visible keys of one node.
    ///
    /// Order: the root's keys in root insertion order, then each open
    /// layer's new keys from outermost to innermost, deduplicated, with
    /// tombstoned cells filtered out.
    pub fn keys(&self, node: &NodeId) -> Vec<String> {
        self.entries(node).into_iter().map(|(key, _)| key).collect()
    }

    /// Visible `(key, entry)` pairs of one node, ordered as [`keys`].
    ///
    /// Every listed key carries its effective (innermost) value.
    ///
    /// [`keys`]: LayeredCache::keys
    pub fn entries(&self, node: &NodeId) -> Vec<(String, Entry)> {
        let mut out = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let sources = self
            .root
            .keys_at(node)
            .chain(self.layers.iter().flat_map(|layer| layer.keys_at(node)));
        for key in sources {
            if seen.insert(key.as_str()) {
                if let Some(entry) = self.get_child(node, key) {
                    out.push((key.clone(), entry.clone()));
                }
            }
        }
        out
    }

    // ────────────────────────────────────────────────────────────────
    // Writes
    // ────────────────────────────────────────────────────────────────

    /// Write one cell.
    ///
    /// Goes into the top transaction layer, or straight into the root
    /// when no transaction is open (an ambient write).
    pub fn set_child(&mut self, node: impl Into<NodeId>, key: impl Into<String>, entry: Entry) {
        let node = node.into();
        let key = key.into();
        match self.layers.last_mut() {
            Some(top) => {
                top.set(node, key, Slot::Entry(entry));
            }
            None => {
                self.root.set(node, key, entry);
            }
        }
    }

    /// Write one inline value.
    pub fn set_value(&mut self, node: impl Into<NodeId>, key: impl Into<String>, value: impl Into<Json>) {
        self.set_child(node, key, Entry::Value(value.into()));
    }

    /// Write one reference.
    pub fn set_ref(&mut self, node: impl Into<NodeId>, key: impl Into<String>, target: impl Into<NodeId>) {
        self.set_child(node, key, Entry::Ref(target.into()));
    }

    /// Delete one cell, returning whether it was visible beforehand.
    ///
    /// With a transaction open this records a tombstone in the top
    /// layer (unconditionally, so the deletion survives commit even for
    /// cells only the root holds); otherwise it removes from the root.
    pub fn delete_child(&mut self, node: &NodeId, key: &str) -> bool {
        let was_visible = self.get_child(node, key).is_some();
        match self.layers.last_mut() {
            Some(top) => {
                top.set(node.clone(), key.to_string(), Slot::Tombstone);
            }
            None => {
                self.root.delete(node, key);
            }
        }
        was_visible
    }

    // ────────────────────────────────────────────────────────────────
    // Transactions
    // ────────────────────────────────────────────────────────────────

    /// Push a fresh transaction layer; all writes go there until it is
    /// committed or rolled back.
    pub fn start_transaction(&mut self) {
        self.layers.push(NestedIndex::new());
        log::trace!("transaction opened (depth {})", self.layers.len());
    }

    /// Whether any transaction is open.
    pub fn in_transaction(&self) -> bool {
        !self.layers.is_empty()
    }

    /// Number of open transaction layers.
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Summarize the top layer as a [`Delta`] without consuming it.
    ///
    /// Safe to call repeatedly; the layer is left untouched, so a
    /// caller can extract the delta and then decide to commit or roll
    /// back.
    pub fn delta(&self) -> Result<Delta, StoreError> {
        let top = self.layers.last().ok_or(StoreError::NoActiveTransaction)?;
        let mut delta = Delta::new();
        for (node, key, slot) in top.iter() {
            match slot {
                Slot::Tombstone => delta.record_delete(node.clone(), key.clone()),
                Slot::Entry(Entry::Value(value)) => {
                    delta.record_value(node.clone(), key.clone(), value.clone())
                }
                Slot::Entry(Entry::Ref(target)) => {
                    delta.record_ref(node.clone(), key.clone(), target.clone())
                }
            }
        }
        Ok(delta)
    }

    /// Commit the top layer.
    ///
    /// With an enclosing layer, every slot (tombstones included) folds
    /// into it; committing the outermost layer applies writes to the
    /// root and turns tombstones into root deletions.
    pub fn commit(&mut self) -> Result<(), StoreError> {
        let popped = self.layers.pop().ok_or(StoreError::NoActiveTransaction)?;
        let writes = popped.len();
        match self.layers.last_mut() {
            Some(next) => {
                for (node, key, slot) in popped.into_entries() {
                    next.set(node, key, slot);
                }
                log::debug!("commit: folded {} writes into the enclosing layer", writes);
            }
            None => {
                for (node, key, slot) in popped.into_entries() {
                    match slot {
                        Slot::Tombstone => {
                            self.root.delete(&node, &key);
                        }
                        Slot::Entry(entry) => {
                            self.root.set(node, key, entry);
                        }
                    }
                }
                log::debug!("commit: applied {} writes to the root", writes);
            }
        }
        Ok(())
    }

    /// Discard the top layer and everything written into it.
    pub fn rollback(&mut self) -> Result<(), StoreError> {
        let popped = self.layers.pop().ok_or(StoreError::NoActiveTransaction)?;
        log::debug!("rollback: discarded {} writes", popped.len());
        Ok(())
    }

    /// Run `f` inside its own transaction.
    ///
    /// On `Ok` the layer is committed and its delta returned alongside
    /// the closure's output; on `Err` the layer is rolled back and the
    /// cache is left exactly as before. The closure may open nested
    /// transactions but must leave the stack balanced; draining the
    /// ambient layer is a programmer error and panics.
    pub fn mutate<T, E>(
        &mut self,
        f: impl FnOnce(&mut LayeredCache) -> Result<T, E>,
    ) -> Result<(T, Delta), E> {
        self.start_transaction();
        match f(self) {
            Ok(out) => {
                let delta = self
                    .delta()
                    .expect("mutate closure must leave its transaction layer open");
                self.commit()
                    .expect("mutate closure must leave its transaction layer open");
                Ok((out, delta))
            }
            Err(err) => {
                self.rollback()
                    .expect("mutate closure must leave its transaction layer open");
                Err(err)
            }
        }
    }

    /// Drop every layer and the root. Full reinitialization only, used
    /// by bootstrap and catch-up resync paths.
    pub fn reset(&mut self) {
        let dropped = self.layers.len();
        self.layers.clear();
        self.root.clear();
        log::debug!("reset: cleared root and {} open layers", dropped);
    }

    // ────────────────────────────────────────────────────────────────
    // Whole-document views
    // ────────────────────────────────────────────────────────────────

    /// The visible document as one JSON object keyed by node id.
    ///
    /// Inline values render raw; references render as `{"$ref": id}`.
    /// Nodes with no visible keys are omitted.
    pub fn data(&self) -> Json {
        let mut doc = serde_json::Map::new();
        for node in self.node_ids() {
            let entries = self.entries(&node);
            if entries.is_empty() {
                continue;
            }
            let mut fields = serde_json::Map::new();
            for (key, entry) in entries {
                let rendered = match entry {
                    Entry::Value(value) => value,
                    Entry::Ref(target) => json!({ "$ref": target.as_str() }),
                };
                fields.insert(key, rendered);
            }
            doc.insert(node.to_string(), Json::Object(fields));
        }
        Json::Object(doc)
    }

    /// Every visible cell as an owned `(node, key, entry)` triple.
    ///
    /// Node order follows [`data`]; per-node order follows [`entries`].
    ///
    /// [`data`]: LayeredCache::data
    /// [`entries`]: LayeredCache::entries
    pub fn dump(&self) -> Vec<(NodeId, String, Entry)> {
        let mut out = Vec::new();
        for node in self.node_ids() {
            for (key, entry) in self.entries(&node) {
                out.push((node.clone(), key, entry));
            }
        }
        out
    }

    /// The full visible state as a [`Delta`], for catch-up syncs.
    ///
    /// Everything lands in the value/ref buckets; the deleted bucket is
    /// always empty.
    pub fn snapshot_delta(&self) -> Delta {
        let mut delta = Delta::new();
        for (node, key, entry) in self.dump() {
            match entry {
                Entry::Value(value) => delta.record_value(node, key, value),
                Entry::Ref(target) => delta.record_ref(node, key, target),
            }
        }
        delta
    }

    /// Write a batch of cells, typically a snapshot from a persistence
    /// adapter. Plain ambient writes; bootstrap callers [`reset`]
    /// first.
    ///
    /// [`reset`]: LayeredCache::reset
    pub fn load_entries(&mut self, entries: impl IntoIterator<Item = (NodeId, String, Entry)>) {
        for (node, key, entry) in entries {
            self.set_child(node, key, entry);
        }
    }

    /// Node ids with at least one written cell anywhere in the stack,
    /// root's first.
    fn node_ids(&self) -> Vec<NodeId> {
        let mut seen: HashSet<&NodeId> = HashSet::new();
        let mut out = Vec::new();
        let sources = self
            .root
            .top_level_keys()
            .chain(self.layers.iter().flat_map(|layer| layer.top_level_keys()));
        for node in sources {
            if seen.insert(node) {
                out.push(node.clone());
            }
        }
        out
    }
}

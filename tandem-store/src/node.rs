//! Node identity and cell values.
//!
//! Every piece of document structure lives in some node's key/value map.
//! A cell holds either an inline JSON value or a reference to another
//! node, tagged on the wire as `{"$val": …}` / `{"$ref": …}`. Deletions
//! inside an open transaction are recorded as a [`Slot::Tombstone`];
//! the committed root stores [`Entry`] directly and therefore cannot
//! contain a tombstone by construction.

use serde::{Deserialize, Serialize};

/// Dynamic JSON payload type used throughout the store.
pub type Json = serde_json::Value;

/// Reserved identifier of the document root node.
pub const ROOT_ID: &str = "root";

/// Opaque identifier of one node in the document graph.
///
/// Serializes as a bare string. Freshly allocated ids have the shape
/// `"{actor}:{counter}"` (see `LiveNodePool::allocate_id`), which keeps
/// ids from unsynchronized actors disjoint. Ids are never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Wrap an existing id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The reserved root id.
    pub fn root() -> Self {
        Self(ROOT_ID.to_string())
    }

    /// Whether this id addresses the document root.
    pub fn is_root(&self) -> bool {
        self.0 == ROOT_ID
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One cell of a node: an inline JSON value or a reference to a child
/// node.
///
/// The serde tag doubles as the wire representation used inside deltas
/// and snapshots: `{"$val": 5}` or `{"$ref": "2:7"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Entry {
    /// Inline JSON payload.
    #[serde(rename = "$val")]
    Value(Json),
    /// Edge to another node in the graph.
    #[serde(rename = "$ref")]
    Ref(NodeId),
}

impl Entry {
    /// Build an inline value entry.
    pub fn value(value: impl Into<Json>) -> Self {
        Entry::Value(value.into())
    }

    /// Build a reference entry.
    pub fn reference(id: impl Into<NodeId>) -> Self {
        Entry::Ref(id.into())
    }

    /// Whether this cell holds an inline value.
    pub fn is_value(&self) -> bool {
        matches!(self, Entry::Value(_))
    }

    /// Whether this cell is an edge to another node.
    pub fn is_ref(&self) -> bool {
        matches!(self, Entry::Ref(_))
    }

    /// The inline value, if any.
    pub fn as_value(&self) -> Option<&Json> {
        match self {
            Entry::Value(v) => Some(v),
            Entry::Ref(_) => None,
        }
    }

    /// The referenced node id, if any.
    pub fn as_ref_id(&self) -> Option<&NodeId> {
        match self {
            Entry::Value(_) => None,
            Entry::Ref(id) => Some(id),
        }
    }
}

/// One cell inside a transaction layer.
///
/// A layer must be able to record "deleted here" distinctly from "not
/// written here", so deletion is an explicit variant rather than a
/// sentinel value.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    /// The cell was written (or overwritten) in this layer.
    Entry(Entry),
    /// The cell was deleted in this layer; shadows everything beneath.
    Tombstone,
}

impl Slot {
    /// Whether this slot records a deletion.
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Slot::Tombstone)
    }

    /// The written entry, unless this slot is a tombstone.
    pub fn entry(&self) -> Option<&Entry> {
        match self {
            Slot::Entry(e) => Some(e),
            Slot::Tombstone => None,
        }
    }
}

impl From<Entry> for Slot {
    fn from(entry: Entry) -> Self {
        Slot::Entry(entry)
    }
}

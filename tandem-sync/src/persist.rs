//! Pluggable snapshot persistence.
//!
//! A room persists its document as a flat list of cells and restores
//! it by replaying them. Where the snapshot lives is the adapter's
//! business; the engine only ever sees `load` and `save`. The bundled
//! [`MemoryAdapter`] keeps the snapshot in process memory and counts
//! its calls, which is what the lifecycle tests lean on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tandem_store::{Entry, NodeId};

/// Why a snapshot could not be loaded or saved.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Underlying I/O failure.
    #[error("snapshot i/o failed: {0}")]
    Io(#[from] std::io::Error),
    /// Backend-specific failure.
    #[error("snapshot backend failed: {0}")]
    Backend(String),
}

/// One persisted cell: `node[key] = entry`.
///
/// Serde-ready so file- or database-backed adapters can store the
/// list as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Node the cell lives in.
    pub node: NodeId,
    /// Key within the node.
    pub key: String,
    /// Cell contents.
    pub entry: Entry,
}

impl SnapshotEntry {
    /// Build a snapshot cell.
    pub fn new(node: impl Into<NodeId>, key: impl Into<String>, entry: Entry) -> Self {
        Self {
            node: node.into(),
            key: key.into(),
            entry,
        }
    }

    /// From the cache's dump triple.
    pub fn from_cell((node, key, entry): (NodeId, String, Entry)) -> Self {
        Self { node, key, entry }
    }

    /// Into the triple `load_entries` consumes.
    pub fn into_cell(self) -> (NodeId, String, Entry) {
        (self.node, self.key, self.entry)
    }
}

/// Where a room's snapshot comes from and goes to.
///
/// Calls are synchronous; the room task invokes them off its command
/// loop, so an adapter that blocks only stalls its own room.
pub trait PersistenceAdapter: Send + Sync {
    /// Load every persisted cell (empty when nothing was saved yet).
    fn load(&self) -> Result<Vec<SnapshotEntry>, PersistError>;

    /// Replace the persisted snapshot.
    fn save(&self, entries: &[SnapshotEntry]) -> Result<(), PersistError>;
}

/// In-memory adapter: the whole snapshot behind a mutex, plus call
/// counters.
#[derive(Default)]
pub struct MemoryAdapter {
    entries: Mutex<Vec<SnapshotEntry>>,
    loads: AtomicU64,
    saves: AtomicU64,
}

impl MemoryAdapter {
    /// An empty adapter.
    pub fn new() -> Self {
        Self::default()
    }

    /// An adapter pre-seeded with a snapshot.
    pub fn with_entries(entries: Vec<SnapshotEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
            loads: AtomicU64::new(0),
            saves: AtomicU64::new(0),
        }
    }

    /// How many times `load` ran.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    /// How many times `save` ran.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    /// A copy of the currently stored snapshot.
    pub fn stored(&self) -> Vec<SnapshotEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl PersistenceAdapter for MemoryAdapter {
    fn load(&self) -> Result<Vec<SnapshotEntry>, PersistError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.stored())
    }

    fn save(&self, entries: &[SnapshotEntry]) -> Result<(), PersistError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        let mut stored = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *stored = entries.to_vec();
        Ok(())
    }
}

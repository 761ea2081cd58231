//! # tandem-store — Transactional document graph
//!
//! The local half of a replicated JSON document: an ordered node graph
//! with layered transactions, change-summary deltas, and
//! identity-preserving live handles.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   resolve $ref    ┌──────────────┐
//! │ LiveNodePool │ ◄────────────────► │ LayeredCache │
//! │ (handles +   │                    │ (root + tx   │
//! │  fresh ids)  │    read / write    │  layers)     │
//! └──────────────┘                    └──────┬───────┘
//!                                            │ delta()
//!                                            ▼
//!                                     ┌──────────────┐
//!                                     │    Delta     │
//!                                     │ [del,val,ref]│
//!                                     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`index`] — Two-level insertion-ordered map (`NestedIndex`)
//! - [`node`] — Node ids, `$val`/`$ref` cells, layer slots
//! - [`cache`] — Layered transactional cache with tombstone shadowing
//! - [`delta`] — Per-transaction change summaries and replica replay
//! - [`pool`] — Weak-memoized live handles and fresh-id allocation
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Cell read through 2 layers | <100ns |
//! | Commit of a 100-write transaction | <50μs |
//! | Delta extraction (100 writes) | <100μs |
//! | Handle lookup (warm pool) | <50ns |

pub mod cache;
pub mod delta;
pub mod index;
pub mod node;
pub mod pool;

// Re-exports for convenience
pub use cache::{LayeredCache, StoreError};
pub use delta::Delta;
pub use index::NestedIndex;
pub use node::{Entry, Json, NodeId, Slot, ROOT_ID};
pub use pool::{LiveNode, LiveNodePool, LiveValue, NodeHandle};

//! # tandem-sync — Replication layer for tandem documents
//!
//! Server-arbitrated multiplayer editing over the `tandem-store`
//! document model: clients submit named mutations, one engine per
//! document executes them transactionally, and the resulting deltas
//! fan out to every session.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   ClientMsg (JSON)   ┌──────────────────────┐
//! │ ClientReplica │ ────────────────────► │  RoomSessionManager  │
//! │ (per user)    │ ◄──────────────────── │  (task + cmd queue)  │
//! └───────┬───────┘   ServerMsg (JSON)   └──────────┬───────────┘
//!         │                                         │
//!         ▼                                         ▼
//! ┌───────────────┐                       ┌──────────────────────┐
//! │ LayeredCache  │                       │      SyncServer      │
//! │ (local copy)  │                       │ (authority: dedup,   │
//! └───────────────┘                       │  tx, delta fan-out)  │
//!                                         └──────────┬───────────┘
//!                                                    │
//!                                          ┌─────────┴─────────┐
//!                                          │ PersistenceAdapter │
//!                                          │ (snapshots)        │
//!                                          └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire protocol (ops, deltas, greetings)
//! - [`mutation`] — Closed table of named mutations
//! - [`server`] — Per-document engine: sessions, dedup, fan-out
//! - [`room`] — Single-owner room task, tickets, load lifecycle
//! - [`client`] — Client replica with pending-op queue
//! - [`socket`] — Session socket trait + in-process channel pair
//! - [`persist`] — Snapshot adapter trait + in-memory adapter
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Op apply + fan-out (10 sessions) | <100μs |
//! | Duplicate rejection | O(1), no alloc |
//! | Message encode/decode | <5μs |
//! | Catch-up dump (10K cells) | <10ms |

pub mod client;
pub mod mutation;
pub mod persist;
pub mod protocol;
pub mod room;
pub mod server;
pub mod socket;

// Re-exports for convenience
pub use client::{ClientReplica, PendingOps, ReplicaError, ReplicaEvent, MAX_PENDING_OPS};
pub use mutation::{MutationCtx, MutationError, MutationFn, MutationRegistry, RegistryError};
pub use persist::{MemoryAdapter, PersistError, PersistenceAdapter, SnapshotEntry};
pub use protocol::{Actor, ClientMsg, Op, OpId, ProtocolError, ServerMsg};
pub use room::{
    LoadState, RoomConfig, RoomError, RoomRegistry, RoomSessionManager, RoomStatus, Ticket,
};
pub use server::{OpOutcome, ServerStats, Session, SyncServer, SERVER_ACTOR};
pub use socket::{ChannelSocket, SessionSocket, SocketEvent, CLOSE_KICKED, CLOSE_NORMAL};

//! Client-side replica of one document.
//!
//! The in-process half of the wire contract. A replica owns a local
//! [`LayeredCache`] that only ever changes by applying authoritative
//! server deltas, stamps outgoing ops with its per-actor clock, and
//! keeps every unacknowledged op queued so a resync can replay it.
//! There is no optimistic local application: an op takes effect
//! locally when its authoritative delta comes back.
//!
//! Transport is the host's job: `prepare_op` hands back the message to
//! send, `handle_server_msg` consumes whatever arrives.
//!
//! Reference: Kleppmann — DDIA, Chapter 5 (Leader-Based Replication)

use std::collections::VecDeque;

use thiserror::Error;

use tandem_store::{Json, LayeredCache, LiveNode, LiveNodePool, LiveValue, NodeId};

use crate::protocol::{Actor, ClientMsg, Op, OpId, ServerMsg};

/// Default cap on unacknowledged ops.
pub const MAX_PENDING_OPS: usize = 10_000;

/// Why the replica refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReplicaError {
    /// No identity yet: the server's first message has not arrived.
    #[error("replica is not connected")]
    NotConnected,
    /// Too many unacknowledged ops.
    #[error("pending op queue is full")]
    QueueFull,
}

/// What applying one server message did.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaEvent {
    /// Identity assigned; the replica is live.
    Joined {
        /// Actor this replica now speaks as.
        actor: Actor,
    },
    /// An authoritative delta was applied (possibly empty).
    DeltaApplied {
        /// Which op produced it.
        op_id: OpId,
        /// Whether that op was this replica's own.
        own: bool,
        /// Cells changed.
        changes: usize,
    },
    /// A full-state dump replaced local state.
    Resynced {
        /// Cells in the dump.
        changes: usize,
        /// Still-unacknowledged ops to send again, original clocks
        /// intact; the server's watermark discards whatever it already
        /// ran.
        resend: Vec<ClientMsg>,
    },
}

/// Unacknowledged ops awaiting their authoritative echo.
///
/// Clocks are enqueued in increasing order, so acknowledgement is a
/// front-of-queue trim.
pub struct PendingOps {
    queue: VecDeque<(u64, Op)>,
    max_size: usize,
}

impl PendingOps {
    /// A queue holding at most `max_size` ops.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an op; `false` means the queue is full.
    pub fn enqueue(&mut self, clock: u64, op: Op) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back((clock, op));
        true
    }

    /// Drop every op at or below the acknowledged clock, returning how
    /// many were dropped.
    pub fn acknowledge(&mut self, clock: u64) -> usize {
        let before = self.queue.len();
        while self.queue.front().is_some_and(|(c, _)| *c <= clock) {
            self.queue.pop_front();
        }
        before - self.queue.len()
    }

    /// Walk the queued `(clock, op)` pairs, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &(u64, Op)> {
        self.queue.iter()
    }

    /// Remove and return everything queued.
    pub fn drain(&mut self) -> Vec<(u64, Op)> {
        self.queue.drain(..).collect()
    }

    /// Number of queued ops.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop everything queued.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// One client's view of a document.
pub struct ClientReplica {
    actor: Option<Actor>,
    session_key: Option<String>,
    cache: LayeredCache,
    /// Created when the first server message assigns the actor.
    pool: Option<LiveNodePool>,
    /// Clock for the next outgoing op.
    next_clock: u64,
    /// Server clock of the last applied message.
    last_server_clock: u64,
    pending: PendingOps,
}

impl Default for ClientReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientReplica {
    /// A detached replica with the default pending capacity.
    pub fn new() -> Self {
        Self::with_pending_capacity(MAX_PENDING_OPS)
    }

    /// A detached replica capping unacknowledged ops at `capacity`.
    pub fn with_pending_capacity(capacity: usize) -> Self {
        Self {
            actor: None,
            session_key: None,
            cache: LayeredCache::new(),
            pool: None,
            next_clock: 1,
            last_server_clock: 0,
            pending: PendingOps::new(capacity),
        }
    }

    // ────────────────────────────────────────────────────────────────
    // Outbound
    // ────────────────────────────────────────────────────────────────

    /// Stamp an op with this replica's next clock and queue it until
    /// the authoritative delta acknowledges it. Returns the message to
    /// send.
    pub fn prepare_op(&mut self, op: Op) -> Result<ClientMsg, ReplicaError> {
        let actor = self.actor.ok_or(ReplicaError::NotConnected)?;
        let clock = self.next_clock;
        if !self.pending.enqueue(clock, op.clone()) {
            return Err(ReplicaError::QueueFull);
        }
        self.next_clock += 1;
        Ok(ClientMsg::op(op, OpId::new(actor, clock)))
    }

    /// The message requesting a full-state dump.
    pub fn catch_up_msg(&self) -> Result<ClientMsg, ReplicaError> {
        if self.actor.is_none() {
            return Err(ReplicaError::NotConnected);
        }
        Ok(ClientMsg::catch_up())
    }

    // ────────────────────────────────────────────────────────────────
    // Inbound
    // ────────────────────────────────────────────────────────────────

    /// Apply one server message to local state.
    pub fn handle_server_msg(&mut self, msg: ServerMsg) -> ReplicaEvent {
        match msg {
            ServerMsg::First {
                actor,
                session_key,
                server_clock,
            } => {
                let previous = self.actor;
                self.actor = Some(actor);
                self.session_key = Some(session_key);
                self.last_server_clock = server_clock;
                // Handles survive a reconnect as the same actor; a new
                // actor needs a new id namespace.
                if previous != Some(actor) {
                    self.pool = Some(LiveNodePool::for_actor(actor));
                }
                log::info!(
                    "replica joined as actor {} (server clock {})",
                    actor,
                    server_clock
                );
                ReplicaEvent::Joined { actor }
            }
            ServerMsg::Delta {
                server_clock,
                op_id,
                delta,
            } => {
                delta.apply_to(&mut self.cache);
                self.last_server_clock = server_clock;
                let own = self.actor == Some(op_id.actor());
                if own {
                    let acked = self.pending.acknowledge(op_id.clock());
                    log::trace!(
                        "delta for own op {} applied, {} acknowledged, {} still pending",
                        op_id,
                        acked,
                        self.pending.len()
                    );
                }
                ReplicaEvent::DeltaApplied {
                    op_id,
                    own,
                    changes: delta.change_count(),
                }
            }
            ServerMsg::InitialSync {
                server_clock,
                delta,
                full_cc,
            } => {
                if full_cc {
                    self.cache.reset();
                }
                delta.apply_to(&mut self.cache);
                self.last_server_clock = server_clock;
                let resend = match self.actor {
                    Some(actor) => self
                        .pending
                        .iter()
                        .map(|(clock, op)| ClientMsg::op(op.clone(), OpId::new(actor, *clock)))
                        .collect(),
                    None => Vec::new(),
                };
                log::info!(
                    "resynced {} cells at server clock {}, {} ops to resend",
                    delta.change_count(),
                    server_clock,
                    resend.len()
                );
                ReplicaEvent::Resynced {
                    changes: delta.change_count(),
                    resend,
                }
            }
        }
    }

    // ────────────────────────────────────────────────────────────────
    // Live access
    // ────────────────────────────────────────────────────────────────

    /// Allocate a fresh node id in this replica's namespace.
    pub fn allocate_node_id(&mut self) -> Result<NodeId, ReplicaError> {
        match self.pool.as_mut() {
            Some(pool) => Ok(pool.allocate_id()),
            None => Err(ReplicaError::NotConnected),
        }
    }

    /// The root node's live handle.
    pub fn root_node(&mut self) -> Result<LiveNode, ReplicaError> {
        match self.pool.as_mut() {
            Some(pool) => Ok(pool.root()),
            None => Err(ReplicaError::NotConnected),
        }
    }

    /// The live handle for a node id.
    pub fn resolve(&mut self, id: &NodeId) -> Result<LiveNode, ReplicaError> {
        match self.pool.as_mut() {
            Some(pool) => Ok(pool.get_or_create(id)),
            None => Err(ReplicaError::NotConnected),
        }
    }

    /// Materialize `node[key]` from the local cache.
    pub fn resolve_child(
        &mut self,
        node: &NodeId,
        key: &str,
    ) -> Result<Option<LiveValue>, ReplicaError> {
        match self.pool.as_mut() {
            Some(pool) => Ok(pool.resolve_child(&self.cache, node, key)),
            None => Err(ReplicaError::NotConnected),
        }
    }

    // ────────────────────────────────────────────────────────────────
    // Inspection
    // ────────────────────────────────────────────────────────────────

    /// Whether an identity has been assigned.
    pub fn is_live(&self) -> bool {
        self.actor.is_some()
    }

    /// This replica's actor, once assigned.
    pub fn actor(&self) -> Option<Actor> {
        self.actor
    }

    /// This replica's session key, once assigned.
    pub fn session_key(&self) -> Option<&str> {
        self.session_key.as_deref()
    }

    /// Server clock of the last applied message.
    pub fn server_clock(&self) -> u64 {
        self.last_server_clock
    }

    /// Number of unacknowledged ops.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The local document as JSON.
    pub fn data(&self) -> Json {
        self.cache.data()
    }

    /// Read access to the local cache.
    pub fn cache(&self) -> &LayeredCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_store::Delta;

    fn joined_replica(actor: Actor) -> ClientReplica {
        let mut replica = ClientReplica::new();
        replica.handle_server_msg(ServerMsg::first(actor, "key-1", 0));
        replica
    }

    fn value_delta(key: &str, value: Json) -> Delta {
        let mut delta = Delta::new();
        delta.record_value(NodeId::root(), key.to_string(), value);
        delta
    }

    #[test]
    fn test_pending_ops_queue() {
        let mut pending = PendingOps::new(100);
        assert!(pending.is_empty());

        assert!(pending.enqueue(1, Op::new("setChild", vec![json!("root")])));
        assert!(pending.enqueue(2, Op::new("deleteChild", vec![])));
        assert!(pending.enqueue(3, Op::new("setChild", vec![])));
        assert_eq!(pending.len(), 3);

        // Acknowledging a clock trims everything at or below it.
        assert_eq!(pending.acknowledge(2), 2);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.acknowledge(1), 0);

        let drained = pending.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, 3);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_pending_ops_capacity() {
        let mut pending = PendingOps::new(2);
        assert!(pending.enqueue(1, Op::new("a", vec![])));
        assert!(pending.enqueue(2, Op::new("b", vec![])));
        assert!(!pending.enqueue(3, Op::new("c", vec![])));
        assert_eq!(pending.len(), 2);

        pending.clear();
        assert!(pending.is_empty());
    }

    #[test]
    fn test_detached_replica_refuses_everything() {
        let mut replica = ClientReplica::new();
        assert!(!replica.is_live());
        assert_eq!(
            replica.prepare_op(Op::new("setChild", vec![])),
            Err(ReplicaError::NotConnected)
        );
        assert_eq!(replica.catch_up_msg(), Err(ReplicaError::NotConnected));
        assert_eq!(replica.allocate_node_id(), Err(ReplicaError::NotConnected));
        assert_eq!(replica.root_node().unwrap_err(), ReplicaError::NotConnected);
    }

    #[test]
    fn test_first_assigns_identity_and_namespace() {
        let mut replica = ClientReplica::new();
        let event = replica.handle_server_msg(ServerMsg::first(4, "sess-key", 9));

        assert_eq!(event, ReplicaEvent::Joined { actor: 4 });
        assert!(replica.is_live());
        assert_eq!(replica.actor(), Some(4));
        assert_eq!(replica.session_key(), Some("sess-key"));
        assert_eq!(replica.server_clock(), 9);
        assert_eq!(replica.allocate_node_id().unwrap(), NodeId::from("4:1"));
    }

    #[test]
    fn test_prepare_op_stamps_sequential_clocks() {
        let mut replica = joined_replica(2);

        let msg = replica
            .prepare_op(Op::new("setChild", vec![json!("root"), json!("a"), json!(1)]))
            .unwrap();
        match msg {
            ClientMsg::Op { op_id, .. } => assert_eq!(op_id, OpId::new(2, 1)),
            other => panic!("expected op, got {:?}", other),
        }
        let msg = replica.prepare_op(Op::new("deleteChild", vec![])).unwrap();
        match msg {
            ClientMsg::Op { op_id, .. } => assert_eq!(op_id, OpId::new(2, 2)),
            other => panic!("expected op, got {:?}", other),
        }
        assert_eq!(replica.pending_len(), 2);
    }

    #[test]
    fn test_own_delta_acknowledges_pending() {
        let mut replica = joined_replica(2);
        replica.prepare_op(Op::new("setChild", vec![])).unwrap();
        replica.prepare_op(Op::new("setChild", vec![])).unwrap();

        let event = replica.handle_server_msg(ServerMsg::delta(
            1,
            OpId::new(2, 1),
            value_delta("title", json!("v1")),
        ));
        assert_eq!(
            event,
            ReplicaEvent::DeltaApplied {
                op_id: OpId::new(2, 1),
                own: true,
                changes: 1
            }
        );
        assert_eq!(replica.pending_len(), 1);
        assert_eq!(replica.data(), json!({"root": {"title": "v1"}}));
        assert_eq!(replica.server_clock(), 1);
    }

    #[test]
    fn test_foreign_delta_applies_without_acking() {
        let mut replica = joined_replica(2);
        replica.prepare_op(Op::new("setChild", vec![])).unwrap();

        let event = replica.handle_server_msg(ServerMsg::delta(
            1,
            OpId::new(9, 1),
            value_delta("by", json!("someone else")),
        ));
        assert_eq!(
            event,
            ReplicaEvent::DeltaApplied {
                op_id: OpId::new(9, 1),
                own: false,
                changes: 1
            }
        );
        assert_eq!(replica.pending_len(), 1);
        assert_eq!(replica.data(), json!({"root": {"by": "someone else"}}));
    }

    #[test]
    fn test_initial_sync_replaces_state_and_requeues_pending() {
        let mut replica = joined_replica(2);
        replica.handle_server_msg(ServerMsg::delta(
            1,
            OpId::new(9, 1),
            value_delta("stale", json!("gone after sync")),
        ));
        replica
            .prepare_op(Op::new("setChild", vec![json!("root"), json!("mine"), json!(1)]))
            .unwrap();

        let event = replica.handle_server_msg(ServerMsg::initial_sync(
            7,
            value_delta("fresh", json!("authoritative")),
        ));
        match event {
            ReplicaEvent::Resynced { changes, resend } => {
                assert_eq!(changes, 1);
                assert_eq!(resend.len(), 1);
                match &resend[0] {
                    ClientMsg::Op { op, op_id } => {
                        assert_eq!(op.name(), "setChild");
                        // Original clock survives the resync.
                        assert_eq!(*op_id, OpId::new(2, 1));
                    }
                    other => panic!("expected op, got {:?}", other),
                }
            }
            other => panic!("expected resync, got {:?}", other),
        }

        // The stale cell is gone; only the dump's contents remain.
        assert_eq!(replica.data(), json!({"root": {"fresh": "authoritative"}}));
        assert_eq!(replica.server_clock(), 7);
        assert_eq!(replica.pending_len(), 1);
    }

    #[test]
    fn test_queue_full_does_not_burn_a_clock() {
        let mut replica = ClientReplica::with_pending_capacity(1);
        replica.handle_server_msg(ServerMsg::first(3, "k", 0));

        replica.prepare_op(Op::new("setChild", vec![])).unwrap();
        assert_eq!(
            replica.prepare_op(Op::new("setChild", vec![])),
            Err(ReplicaError::QueueFull)
        );

        // Acknowledge the first op; the next one reuses clock 2.
        replica.handle_server_msg(ServerMsg::delta(1, OpId::new(3, 1), Delta::new()));
        let msg = replica.prepare_op(Op::new("setChild", vec![])).unwrap();
        match msg {
            ClientMsg::Op { op_id, .. } => assert_eq!(op_id, OpId::new(3, 2)),
            other => panic!("expected op, got {:?}", other),
        }
    }

    #[test]
    fn test_reconnect_keeps_handles_for_same_actor() {
        let mut replica = joined_replica(4);
        let root_before = replica.root_node().unwrap();

        // Same actor, fresh session: handles survive.
        replica.handle_server_msg(ServerMsg::first(4, "new-session", 5));
        let root_after = replica.root_node().unwrap();
        assert!(LiveNode::ptr_eq(&root_before, &root_after));

        // Different actor: a new id namespace.
        replica.handle_server_msg(ServerMsg::first(9, "other", 5));
        assert_eq!(replica.allocate_node_id().unwrap(), NodeId::from("9:1"));
    }

    #[test]
    fn test_resolve_child_through_local_cache() {
        let mut replica = joined_replica(2);
        let mut delta = Delta::new();
        delta.record_ref(NodeId::root(), "kid".to_string(), NodeId::from("9:1"));
        delta.record_value(NodeId::from("9:1"), "leaf".to_string(), json!(42));
        replica.handle_server_msg(ServerMsg::delta(1, OpId::new(9, 1), delta));

        let kid = replica.resolve_child(&NodeId::root(), "kid").unwrap();
        match kid {
            Some(LiveValue::Node(node)) => assert_eq!(node.id(), &NodeId::from("9:1")),
            other => panic!("expected node handle, got {:?}", other),
        }
        let leaf = replica.resolve_child(&NodeId::from("9:1"), "leaf").unwrap();
        match leaf {
            Some(LiveValue::Json(value)) => assert_eq!(value, json!(42)),
            other => panic!("expected json, got {:?}", other),
        }
        assert!(replica
            .resolve_child(&NodeId::root(), "missing")
            .unwrap()
            .is_none());
    }
}

//! Wire protocol between replicas and the sync server.
//!
//! JSON-encoded, discriminated by a `"type"` tag:
//!
//! ```text
//! client → server
//!   op          { op: [name, args], opId: [actor, clock] }
//!   catchUp     {}
//!
//! server → client
//!   first       { actor, sessionKey, serverClock }
//!   delta       { serverClock, opId, delta: [del, val, ref] }
//!   initialSync { serverClock, delta, fullCC }
//! ```
//!
//! Deltas embed dynamic JSON values, so the codec is serde_json rather
//! than a fixed-layout binary format. An empty `delta` message is the
//! acknowledgement for duplicate and failed ops; it reaches only the
//! originator, while real deltas fan out to every session.

use serde::{Deserialize, Serialize};
use tandem_store::{Delta, Json};

/// Numeric identity of one collaborating client. Actor 0 is reserved
/// for the server's own node allocations.
pub type Actor = u32;

/// Globally unique operation id: `[actor, clock]`.
///
/// Clocks are per-actor and strictly increasing from 1; the server
/// executes each op id at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId(pub Actor, pub u64);

impl OpId {
    /// Build an op id.
    pub fn new(actor: Actor, clock: u64) -> Self {
        Self(actor, clock)
    }

    /// The issuing actor.
    pub fn actor(&self) -> Actor {
        self.0
    }

    /// The actor-local clock.
    pub fn clock(&self) -> u64 {
        self.1
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.0, self.1)
    }
}

/// A named mutation invocation: `[name, args]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op(String, Vec<Json>);

impl Op {
    /// Build an op.
    pub fn new(name: impl Into<String>, args: Vec<Json>) -> Self {
        Self(name.into(), args)
    }

    /// The mutation name.
    pub fn name(&self) -> &str {
        &self.0
    }

    /// The argument list.
    pub fn args(&self) -> &[Json] {
        &self.1
    }
}

/// Messages a replica sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMsg {
    /// Request execution of one mutation.
    #[serde(rename = "op", rename_all = "camelCase")]
    Op {
        /// The mutation to run.
        op: Op,
        /// Idempotency key; duplicates are acknowledged but not re-run.
        op_id: OpId,
    },
    /// Request a full-state resync.
    #[serde(rename = "catchUp")]
    CatchUp {},
}

impl ClientMsg {
    /// Build an op message.
    pub fn op(op: Op, op_id: OpId) -> Self {
        ClientMsg::Op { op, op_id }
    }

    /// Build a catch-up request.
    pub fn catch_up() -> Self {
        ClientMsg::CatchUp {}
    }

    /// Encode to JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::EncodeFailed(e.to_string()))
    }

    /// Decode from JSON bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::DecodeFailed(e.to_string()))
    }
}

/// Messages the server sends to sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMsg {
    /// Greeting for a freshly registered session.
    #[serde(rename = "first", rename_all = "camelCase")]
    First {
        /// The actor this session speaks as.
        actor: Actor,
        /// Opaque key identifying the session.
        session_key: String,
        /// Server clock at registration time.
        server_clock: u64,
    },
    /// One committed mutation's changes (or an empty acknowledgement).
    #[serde(rename = "delta", rename_all = "camelCase")]
    Delta {
        /// Server clock after the commit.
        server_clock: u64,
        /// The op that produced the changes.
        op_id: OpId,
        /// Net changes; empty for duplicate/failed ops.
        delta: Delta,
    },
    /// Full-state dump answering a catch-up request.
    #[serde(rename = "initialSync", rename_all = "camelCase")]
    InitialSync {
        /// Server clock at dump time.
        server_clock: u64,
        /// Complete visible state as value/ref buckets.
        delta: Delta,
        /// Always true: the dump replaces replica state wholesale.
        #[serde(rename = "fullCC")]
        full_cc: bool,
    },
}

impl ServerMsg {
    /// Build a greeting.
    pub fn first(actor: Actor, session_key: impl Into<String>, server_clock: u64) -> Self {
        ServerMsg::First {
            actor,
            session_key: session_key.into(),
            server_clock,
        }
    }

    /// Build a broadcast delta.
    pub fn delta(server_clock: u64, op_id: OpId, delta: Delta) -> Self {
        ServerMsg::Delta {
            server_clock,
            op_id,
            delta,
        }
    }

    /// Build the empty acknowledgement sent to the originator of a
    /// duplicate or failed op.
    pub fn empty_ack(server_clock: u64, op_id: OpId) -> Self {
        Self::delta(server_clock, op_id, Delta::new())
    }

    /// Build a full-state dump.
    pub fn initial_sync(server_clock: u64, delta: Delta) -> Self {
        ServerMsg::InitialSync {
            server_clock,
            delta,
            full_cc: true,
        }
    }

    /// Encode to JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::EncodeFailed(e.to_string()))
    }

    /// Decode from JSON bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::DecodeFailed(e.to_string()))
    }
}

/// Wire codec errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Message could not be serialized
    EncodeFailed(String),
    /// Payload was not a valid message
    DecodeFailed(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::EncodeFailed(e) => write!(f, "encode failed: {}", e),
            ProtocolError::DecodeFailed(e) => write!(f, "decode failed: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}

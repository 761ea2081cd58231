//! Named mutations and the closed registry that dispatches them.
//!
//! Every state change goes through a mutation: a plain function from
//! `(store, args)` to success or failure, registered under a name at
//! startup and invoked by the server inside a transaction. The table is
//! closed after construction; an op naming anything else fails with a
//! typed error instead of executing.
//!
//! Mutations never see partial state from other ops and never manage
//! transactions themselves; the engine opens the layer, extracts the
//! delta, and commits or rolls back around the call.

use std::collections::HashMap;

use thiserror::Error;

use tandem_store::{Json, LayeredCache, LiveNodePool, NodeId};

/// Borrows a mutation runs against: the document cache and the
/// server-side handle pool.
pub struct MutationCtx<'a> {
    /// The document, with the op's transaction layer already open.
    pub cache: &'a mut LayeredCache,
    /// Server pool, for handle resolution and server-side ids.
    pub pool: &'a mut LiveNodePool,
}

/// A registered mutation body.
pub type MutationFn = fn(&mut MutationCtx<'_>, &[Json]) -> Result<(), MutationError>;

/// Why a mutation could not run (or refused to).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    /// The op named a mutation the registry does not know.
    #[error("unknown mutation: {0}")]
    Unknown(String),
    /// The argument list did not match the mutation's signature.
    #[error("invalid arguments for {mutation}: {reason}")]
    InvalidArgs {
        /// Which mutation rejected its arguments.
        mutation: &'static str,
        /// What was wrong with them.
        reason: String,
    },
    /// The mutation body refused mid-flight; its writes are discarded.
    #[error("mutation failed: {0}")]
    Failed(String),
}

/// Registry construction errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Two entries tried to claim the same name.
    #[error("duplicate mutation name: {0}")]
    DuplicateName(&'static str),
}

/// Immutable name → body table, built once at startup.
#[derive(Debug)]
pub struct MutationRegistry {
    table: HashMap<&'static str, MutationFn>,
}

impl MutationRegistry {
    /// Build a registry from a closed entry list, rejecting duplicate
    /// names.
    pub fn build(entries: &[(&'static str, MutationFn)]) -> Result<Self, RegistryError> {
        let mut table = HashMap::with_capacity(entries.len());
        for (name, body) in entries {
            if table.insert(*name, *body).is_some() {
                return Err(RegistryError::DuplicateName(name));
            }
        }
        log::debug!("mutation registry built with {} entries", table.len());
        Ok(Self { table })
    }

    /// The standard document mutations: `setChild`, `deleteChild`,
    /// `attachChild`.
    pub fn standard() -> Self {
        Self::build(&[
            ("setChild", set_child as MutationFn),
            ("deleteChild", delete_child as MutationFn),
            ("attachChild", attach_child as MutationFn),
        ])
        .expect("standard mutation names are distinct")
    }

    /// Look up a mutation body by name.
    pub fn lookup(&self, name: &str) -> Result<MutationFn, MutationError> {
        self.table
            .get(name)
            .copied()
            .ok_or_else(|| MutationError::Unknown(name.to_string()))
    }

    /// Whether a name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    /// Number of registered mutations.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

// ────────────────────────────────────────────────────────────────────
// Standard mutations
// ────────────────────────────────────────────────────────────────────

/// `setChild(node, key, value)` — write one inline value.
fn set_child(ctx: &mut MutationCtx<'_>, args: &[Json]) -> Result<(), MutationError> {
    let node = arg_node_id(args, 0, "setChild")?;
    let key = arg_str(args, 1, "setChild")?;
    let value = arg_json(args, 2, "setChild")?;
    ctx.cache.set_value(node, key, value.clone());
    Ok(())
}

/// `deleteChild(node, key)` — delete one cell.
fn delete_child(ctx: &mut MutationCtx<'_>, args: &[Json]) -> Result<(), MutationError> {
    let node = arg_node_id(args, 0, "deleteChild")?;
    let key = arg_str(args, 1, "deleteChild")?;
    ctx.cache.delete_child(&node, key);
    Ok(())
}

/// `attachChild(parent, key, newNodeId)` — attach a fresh node under
/// `parent[key]`.
///
/// The id is caller-allocated (replicas draw from their own pool
/// namespace), so a client can build structure around the id before the
/// authoritative delta returns. The root id can never be re-attached.
fn attach_child(ctx: &mut MutationCtx<'_>, args: &[Json]) -> Result<(), MutationError> {
    let parent = arg_node_id(args, 0, "attachChild")?;
    let key = arg_str(args, 1, "attachChild")?;
    let new_id = arg_node_id(args, 2, "attachChild")?;
    if new_id.is_root() {
        return Err(MutationError::InvalidArgs {
            mutation: "attachChild",
            reason: "cannot attach the root node".to_string(),
        });
    }
    ctx.cache.set_ref(parent, key, new_id.clone());
    ctx.pool.get_or_create(&new_id);
    Ok(())
}

// ────────────────────────────────────────────────────────────────────
// Argument helpers
// ────────────────────────────────────────────────────────────────────

fn arg_json<'a>(
    args: &'a [Json],
    index: usize,
    mutation: &'static str,
) -> Result<&'a Json, MutationError> {
    args.get(index).ok_or(MutationError::InvalidArgs {
        mutation,
        reason: format!("missing argument {}", index),
    })
}

fn arg_str<'a>(
    args: &'a [Json],
    index: usize,
    mutation: &'static str,
) -> Result<&'a str, MutationError> {
    arg_json(args, index, mutation)?
        .as_str()
        .ok_or(MutationError::InvalidArgs {
            mutation,
            reason: format!("argument {} must be a string", index),
        })
}

fn arg_node_id(
    args: &[Json],
    index: usize,
    mutation: &'static str,
) -> Result<NodeId, MutationError> {
    Ok(NodeId::from(arg_str(args, index, mutation)?))
}

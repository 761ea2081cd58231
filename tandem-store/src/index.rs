//! Two-level insertion-ordered index.
//!
//! The storage substrate shared by the committed root and every
//! transaction layer: an ordered map of groups, each an ordered map of
//! leaves. Iteration order is first-insertion order at both levels, and
//! overwriting an existing pair keeps its position.
//!
//! Performance targets:
//! - set / get / has: O(1) amortized
//! - len: O(1) (maintained incrementally, never recomputed)
//! - delete: O(k) in the group's key count (order-preserving removal)
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (Hash Indexes)

use std::borrow::Borrow;
use std::collections::HashSet;
use std::hash::Hash;

use indexmap::IndexMap;

/// An insertion-ordered map of `K1` groups, each holding `K2 → V`
/// leaves.
///
/// Empty groups are removed eagerly, so [`top_level_keys`] only ever
/// yields groups with at least one leaf. Lookups accept any borrowed
/// form of the keys, as the std map types do.
///
/// [`top_level_keys`]: NestedIndex::top_level_keys
#[derive(Debug, Clone)]
pub struct NestedIndex<K1, K2, V> {
    groups: IndexMap<K1, IndexMap<K2, V>>,
    len: usize,
}

// Manual impl: the derive would bound all three type parameters by
// `Default`, which key and leaf types need not implement.
impl<K1, K2, V> Default for NestedIndex<K1, K2, V> {
    fn default() -> Self {
        Self {
            groups: IndexMap::new(),
            len: 0,
        }
    }
}

impl<K1: Eq + Hash, K2: Eq + Hash, V> NestedIndex<K1, K2, V> {
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            groups: IndexMap::new(),
            len: 0,
        }
    }

    /// Insert or overwrite one leaf, returning the displaced value.
    ///
    /// An overwrite keeps the leaf's iteration position.
    pub fn set(&mut self, k1: K1, k2: K2, value: V) -> Option<V> {
        let displaced = self.groups.entry(k1).or_default().insert(k2, value);
        if displaced.is_none() {
            self.len += 1;
        }
        displaced
    }

    /// Look up one leaf.
    pub fn get<Q1, Q2>(&self, k1: &Q1, k2: &Q2) -> Option<&V>
    where
        K1: Borrow<Q1>,
        K2: Borrow<Q2>,
        Q1: Hash + Eq + ?Sized,
        Q2: Hash + Eq + ?Sized,
    {
        self.groups.get(k1)?.get(k2)
    }

    /// Look up one leaf for in-place mutation.
    pub fn get_mut<Q1, Q2>(&mut self, k1: &Q1, k2: &Q2) -> Option<&mut V>
    where
        K1: Borrow<Q1>,
        K2: Borrow<Q2>,
        Q1: Hash + Eq + ?Sized,
        Q2: Hash + Eq + ?Sized,
    {
        self.groups.get_mut(k1)?.get_mut(k2)
    }

    /// Whether the leaf exists.
    pub fn has<Q1, Q2>(&self, k1: &Q1, k2: &Q2) -> bool
    where
        K1: Borrow<Q1>,
        K2: Borrow<Q2>,
        Q1: Hash + Eq + ?Sized,
        Q2: Hash + Eq + ?Sized,
    {
        self.get(k1, k2).is_some()
    }

    /// Remove one leaf, returning it.
    ///
    /// Uses order-preserving removal so the remaining leaves keep their
    /// positions; the group itself is dropped once its last leaf goes.
    pub fn delete<Q1, Q2>(&mut self, k1: &Q1, k2: &Q2) -> Option<V>
    where
        K1: Borrow<Q1>,
        K2: Borrow<Q2>,
        Q1: Hash + Eq + ?Sized,
        Q2: Hash + Eq + ?Sized,
    {
        let group = self.groups.get_mut(k1)?;
        let removed = group.shift_remove(k2);
        if removed.is_some() {
            self.len -= 1;
            if group.is_empty() {
                self.groups.shift_remove(k1);
            }
        }
        removed
    }

    /// Remove an entire group, returning how many leaves it held.
    pub fn delete_all<Q1>(&mut self, k1: &Q1) -> usize
    where
        K1: Borrow<Q1>,
        Q1: Hash + Eq + ?Sized,
    {
        match self.groups.shift_remove(k1) {
            Some(group) => {
                self.len -= group.len();
                group.len()
            }
            None => 0,
        }
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.groups.clear();
        self.len = 0;
    }

    /// Total number of leaves across all groups.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the index holds no leaves.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Leaf keys of one group, in first-insertion order.
    pub fn keys_at<'a, Q1>(&'a self, k1: &Q1) -> impl Iterator<Item = &'a K2> + 'a
    where
        K1: Borrow<Q1>,
        Q1: Hash + Eq + ?Sized,
    {
        self.groups.get(k1).into_iter().flat_map(|group| group.keys())
    }

    /// Leaves of one group, in first-insertion order.
    pub fn entries_at<'a, Q1>(&'a self, k1: &Q1) -> impl Iterator<Item = (&'a K2, &'a V)> + 'a
    where
        K1: Borrow<Q1>,
        Q1: Hash + Eq + ?Sized,
    {
        self.groups.get(k1).into_iter().flat_map(|group| group.iter())
    }

    /// Leaves of one group restricted to a candidate set.
    ///
    /// Yields in index order, not candidate order.
    pub fn filter_at<'a, Q1>(
        &'a self,
        k1: &Q1,
        candidates: &'a HashSet<K2>,
    ) -> impl Iterator<Item = (&'a K2, &'a V)> + 'a
    where
        K1: Borrow<Q1>,
        Q1: Hash + Eq + ?Sized,
    {
        self.entries_at(k1).filter(|(k2, _)| candidates.contains(k2))
    }

    /// Keys of all non-empty groups, in first-insertion order.
    pub fn top_level_keys(&self) -> impl Iterator<Item = &K1> {
        self.groups.keys()
    }

    /// All leaves as `(group, key, value)`, groups outermost.
    pub fn iter(&self) -> impl Iterator<Item = (&K1, &K2, &V)> {
        self.groups
            .iter()
            .flat_map(|(k1, group)| group.iter().map(move |(k2, v)| (k1, k2, v)))
    }

    /// Consume the index, yielding owned `(group, key, value)` leaves
    /// in iteration order.
    pub fn into_entries(self) -> impl Iterator<Item = (K1, K2, V)>
    where
        K1: Clone,
    {
        self.groups.into_iter().flat_map(|(k1, group)| {
            group.into_iter().map(move |(k2, v)| (k1.clone(), k2, v))
        })
    }
}

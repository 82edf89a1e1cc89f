//! The persistent, copy-on-write B-tree.
//!
//! A `Btree` value is just `{store, root_offset, size, dirt}`: there is no
//! in-memory pointer graph, so every mutation that touches the tree copies
//! the path from the mutated leaf to the root and appends the copies to the
//! `Store`, leaving every node already reachable from an older header fully
//! intact. Two `Btree` values can therefore share the same `Store` and
//! coexist: an old snapshot remains valid for as long as a `Reader` holds
//! it.

mod cursor;

pub use cursor::RangeCursor;

use std::fmt::Debug;
use std::ops::Bound;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::node::{
    self, encode_header, AnyNode, Branch, HeaderRecord, Leaf, LeafEntry,
};
use crate::store::Store;

/// Default branching factor: a leaf or branch holds at most this many
/// entries before it splits.
pub const DEFAULT_ORDER: usize = 32;

pub trait Key:
    Ord + std::hash::Hash + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}
impl<
        T: Ord
            + std::hash::Hash
            + Clone
            + Debug
            + Serialize
            + DeserializeOwned
            + Send
            + Sync
            + 'static,
    > Key for T
{
}

/// `PartialEq` lets `CatchUp` tell whether a key's value actually changed
/// between two snapshots instead of unconditionally re-inserting it.
pub trait Value: Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T: Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static> Value for T {}

#[derive(Clone)]
pub struct Btree<K, V> {
    store: Arc<dyn Store>,
    root_offset: u64,
    size: u64,
    dirt: u64,
    order: usize,
    _marker: std::marker::PhantomData<(K, V)>,
}

/// The outcome of inserting or deleting along one root-to-leaf path: either
/// the node on that level was rewritten in place (no growth) or it split
/// into two, which the caller must thread into its own parent.
enum Rewrite<K> {
    Single(u64),
    Split { left_min: K, left: u64, right_min: K, right: u64 },
}

impl<K: Key, V: Value> Btree<K, V> {
    pub fn new(store: Arc<dyn Store>) -> Result<Self> {
        Self::new_with_order(store, DEFAULT_ORDER)
    }

    pub fn new_with_order(store: Arc<dyn Store>, order: usize) -> Result<Self> {
        if let Some(header) = store.latest_header()? {
            return Ok(Btree {
                store,
                root_offset: header.root_offset,
                size: header.size,
                dirt: header.dirt,
                order,
                _marker: std::marker::PhantomData,
            });
        }
        debug!(path = %store.file_path().display(), "no header found, creating empty tree");
        let empty: Leaf<K> = Vec::new();
        let root_offset = node::write_leaf(store.as_ref(), &empty)?;
        let tree = Btree {
            store,
            root_offset,
            size: 0,
            dirt: 0,
            order,
            _marker: std::marker::PhantomData,
        };
        tree.commit()
    }

    /// Wraps an already-built tree (root, size, dirt all known ahead of
    /// time) without probing the store for an existing header or creating an
    /// empty root. Used by `Compactor`, which constructs its new tree bottom
    /// up on a fresh `Store` and only wants a `commit()` at the very end.
    pub(crate) fn from_parts(store: Arc<dyn Store>, root_offset: u64, size: u64, dirt: u64, order: usize) -> Self {
        Btree { store, root_offset, size, dirt, order, _marker: std::marker::PhantomData }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn root_offset(&self) -> u64 {
        self.root_offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn dirt(&self) -> u64 {
        self.dirt
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// `dirt / (dirt + size + 1)`: monotone non-decreasing in `dirt` at
    /// fixed `size`, zero for a freshly compacted tree, and always < 1.
    pub fn dirt_factor(&self) -> f64 {
        self.dirt as f64 / (self.dirt as f64 + self.size as f64 + 1.0)
    }

    fn with_root(&self, root_offset: u64, size: u64, dirt: u64) -> Self {
        Btree {
            store: self.store.clone(),
            root_offset,
            size,
            dirt,
            order: self.order,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn lookup(&self, key: &K) -> Result<Option<V>> {
        let mut offset = self.root_offset;
        loop {
            match node::read_any::<K>(self.store.as_ref(), offset)? {
                AnyNode::Branch(entries) => {
                    offset = child_for_key(&entries, key);
                }
                AnyNode::Leaf(entries) => {
                    return match find_entry(&entries, key) {
                        Some(LeafEntry::Present { value_offset, .. }) => {
                            Ok(Some(node::read_value(self.store.as_ref(), *value_offset)?))
                        }
                        _ => Ok(None),
                    };
                }
            }
        }
    }

    pub fn has_key(&self, key: &K) -> Result<(bool, Option<V>)> {
        match self.lookup(key)? {
            Some(v) => Ok((true, Some(v))),
            None => Ok((false, None)),
        }
    }

    pub fn insert(&self, key: K, value: V, commit: bool) -> Result<Self> {
        let value_offset = node::write_value(self.store.as_ref(), &value)?;
        let (rewrite, grew) = insert_at(self.store.as_ref(), self.root_offset, &key, value_offset, self.order)?;
        let new_root = match rewrite {
            Rewrite::Single(offset) => offset,
            Rewrite::Split { left_min, left, right_min, right } => {
                let branch: Branch<K> = vec![(left_min, left), (right_min, right)];
                node::write_branch(self.store.as_ref(), &branch)?
            }
        };
        let new_size = if grew { self.size + 1 } else { self.size };
        let next = self.with_root(new_root, new_size, self.dirt + 1);
        if commit {
            next.commit()
        } else {
            Ok(next)
        }
    }

    /// Removes `key`, rewriting the path to its leaf. No merge/rebalance is
    /// performed even if this empties a leaf — compaction reclaims that
    /// space instead. `dirt` increases even when `key` was already absent,
    /// since the rewrite still happened.
    pub fn delete(&self, key: &K, commit: bool) -> Result<Self> {
        self.delete_impl(key, false, commit)
    }

    /// Same as `delete`, but leaves an explicit tombstone entry instead of
    /// removing the leaf slot outright, so an in-flight `Compactor` reading
    /// an older snapshot of this same file still observes the deletion when
    /// it eventually reaches this key (see `CatchUp`).
    pub fn mark_deleted(&self, key: &K, commit: bool) -> Result<Self> {
        self.delete_impl(key, true, commit)
    }

    fn delete_impl(&self, key: &K, tombstone: bool, commit: bool) -> Result<Self> {
        let (new_root, removed) = delete_at(self.store.as_ref(), self.root_offset, key, tombstone)?;
        let new_size = if removed { self.size.saturating_sub(1) } else { self.size };
        let next = self.with_root(new_root, new_size, self.dirt + 1);
        if commit {
            next.commit()
        } else {
            Ok(next)
        }
    }

    /// Writes a header record pointing at the current root and syncs the
    /// store. All node writes the header could reach must already be
    /// durable before this call per the invariant that a committed header
    /// never dangles.
    pub fn commit(&self) -> Result<Self> {
        self.store.sync()?;
        let header = HeaderRecord { root_offset: self.root_offset, size: self.size, dirt: self.dirt };
        self.store.append(&encode_header(&header))?;
        self.store.sync()?;
        Ok(self.clone())
    }

    pub fn range(&self, min: Bound<K>, max: Bound<K>, reverse: bool) -> RangeCursor<K, V> {
        RangeCursor::new(self.store.clone(), self.root_offset, min, max, reverse)
    }

    /// Collects every leaf entry reachable from the root, tombstones
    /// included. Only `CatchUp` needs raw tombstones (to know which keys a
    /// compaction's source snapshot must still delete); ordinary traversal
    /// goes through `range`, which skips them. Not lazy — fine for the short
    /// catch-up window it is used in, wrong for anything user-facing.
    pub(crate) fn all_leaf_entries(&self) -> Result<Vec<LeafEntry<K>>> {
        let mut out = Vec::new();
        collect_entries::<K>(self.store.as_ref(), self.root_offset, &mut out)?;
        Ok(out)
    }
}

fn collect_entries<K: Key>(store: &dyn Store, offset: u64, out: &mut Vec<LeafEntry<K>>) -> Result<()> {
    match node::read_any::<K>(store, offset)? {
        AnyNode::Leaf(entries) => {
            out.extend(entries);
            Ok(())
        }
        AnyNode::Branch(entries) => {
            for (_, child) in entries {
                collect_entries::<K>(store, child, out)?;
            }
            Ok(())
        }
    }
}

fn find_entry<'a, K: Ord>(entries: &'a [LeafEntry<K>], key: &K) -> Option<&'a LeafEntry<K>> {
    entries.binary_search_by(|e| e.key().cmp(key)).ok().map(|i| &entries[i])
}

/// Index of the child whose declared range could contain `key`: the last
/// entry whose `min_key <= key`, or the first entry if `key` is smaller
/// than every declared `min_key` (the leftmost child has no real lower
/// bound).
pub(crate) fn child_index<K: Ord>(entries: &Branch<K>, key: &K) -> usize {
    match entries.binary_search_by(|(min_key, _)| min_key.cmp(key)) {
        Ok(i) => i,
        Err(0) => 0,
        Err(i) => i - 1,
    }
}

fn child_for_key<K: Ord + Clone>(entries: &Branch<K>, key: &K) -> u64 {
    entries[child_index(entries, key)].1
}

fn insert_at<K: Key>(
    store: &dyn Store,
    node_offset: u64,
    key: &K,
    value_offset: u64,
    order: usize,
) -> Result<(Rewrite<K>, bool)> {
    match node::read_any::<K>(store, node_offset)? {
        AnyNode::Leaf(mut entries) => {
            let grew = match entries.binary_search_by(|e| e.key().cmp(key)) {
                Ok(i) => {
                    entries[i] = LeafEntry::Present { key: key.clone(), value_offset };
                    false
                }
                Err(i) => {
                    entries.insert(i, LeafEntry::Present { key: key.clone(), value_offset });
                    true
                }
            };
            Ok((split_leaf_if_needed(store, entries, order)?, grew))
        }
        AnyNode::Branch(mut entries) => {
            let i = child_index(&entries, key);
            let (child_rewrite, grew) = insert_at(store, entries[i].1, key, value_offset, order)?;
            match child_rewrite {
                Rewrite::Single(new_child) => {
                    entries[i].1 = new_child;
                }
                Rewrite::Split { left_min, left, right_min, right } => {
                    entries[i] = (left_min, left);
                    entries.insert(i + 1, (right_min, right));
                }
            }
            Ok((split_branch_if_needed(store, entries, order)?, grew))
        }
    }
}

fn split_leaf_if_needed<K: Key>(store: &dyn Store, entries: Leaf<K>, order: usize) -> Result<Rewrite<K>> {
    if entries.len() <= order {
        let offset = node::write_leaf(store, &entries)?;
        return Ok(Rewrite::Single(offset));
    }
    let mid = entries.len() / 2;
    let right_min = entries[mid].key().clone();
    let left_min = entries[0].key().clone();
    let right: Leaf<K> = entries[mid..].to_vec();
    let left: Leaf<K> = entries[..mid].to_vec();
    let left_offset = node::write_leaf(store, &left)?;
    let right_offset = node::write_leaf(store, &right)?;
    Ok(Rewrite::Split { left_min, left: left_offset, right_min, right: right_offset })
}

fn split_branch_if_needed<K: Key>(store: &dyn Store, entries: Branch<K>, order: usize) -> Result<Rewrite<K>> {
    if entries.len() <= order {
        let offset = node::write_branch(store, &entries)?;
        return Ok(Rewrite::Single(offset));
    }
    let mid = entries.len() / 2;
    let right_min = entries[mid].0.clone();
    let left_min = entries[0].0.clone();
    let right: Branch<K> = entries[mid..].to_vec();
    let left: Branch<K> = entries[..mid].to_vec();
    let left_offset = node::write_branch(store, &left)?;
    let right_offset = node::write_branch(store, &right)?;
    Ok(Rewrite::Split { left_min, left: left_offset, right_min, right: right_offset })
}

/// Rewrites the path from `node_offset` to the leaf holding `key`. Deletion
/// never merges or rebalances underfull nodes (compaction reclaims that
/// space instead); every call still rewrites the full path, even when `key`
/// is absent, because a no-op delete is still a write for `dirt` accounting
/// purposes.
fn delete_at<K: Key>(
    store: &dyn Store,
    node_offset: u64,
    key: &K,
    tombstone: bool,
) -> Result<(u64, bool)> {
    match node::read_any::<K>(store, node_offset)? {
        AnyNode::Leaf(mut entries) => {
            let removed = match entries.binary_search_by(|e| e.key().cmp(key)) {
                Ok(i) => {
                    if tombstone {
                        entries[i] = LeafEntry::Tombstone { key: key.clone() };
                    } else {
                        entries.remove(i);
                    }
                    true
                }
                Err(_) => false,
            };
            Ok((node::write_leaf(store, &entries)?, removed))
        }
        AnyNode::Branch(mut entries) => {
            let i = child_index(&entries, key);
            let (new_child, removed) = delete_at(store, entries[i].1, key, tombstone)?;
            entries[i].1 = new_child;
            Ok((node::write_branch(store, &entries)?, removed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::store::mem::MemStore;
    use std::path::Path;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Wraps a `MemStore` and starts refusing `append` once the store has
    /// grown past a configurable byte count, standing in for a process that
    /// dies partway through writing a commit. Every write that does land is
    /// a real, complete `MemStore::append` — nothing torn, which matches
    /// `latest_header`'s job of ignoring whatever never got fully written.
    struct FailingStore {
        inner: MemStore,
        fail_after: AtomicU64,
    }

    impl FailingStore {
        fn new() -> Self {
            FailingStore { inner: MemStore::new(), fail_after: AtomicU64::new(u64::MAX) }
        }

        fn fail_after_n_more_bytes(&self, n: u64) {
            let current = self.inner.length().unwrap();
            self.fail_after.store(current + n, Ordering::SeqCst);
        }
    }

    impl Store for FailingStore {
        fn append(&self, bytes: &[u8]) -> Result<u64> {
            let would_be = self.inner.length()? + bytes.len() as u64;
            if would_be > self.fail_after.load(Ordering::SeqCst) {
                return Err(ErrorCode::IoError(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "simulated crash mid-write",
                )));
            }
            self.inner.append(bytes)
        }

        fn read_at(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
            self.inner.read_at(offset, len)
        }

        fn sync(&self) -> Result<()> {
            self.inner.sync()
        }

        fn length(&self) -> Result<u64> {
            self.inner.length()
        }

        fn latest_header(&self) -> Result<Option<HeaderRecord>> {
            self.inner.latest_header()
        }

        fn file_path(&self) -> &Path {
            self.inner.file_path()
        }
    }

    #[test]
    fn crash_after_commit_leaves_prior_commit_readable() {
        let store: Arc<FailingStore> = Arc::new(FailingStore::new());
        let tree: Btree<String, i64> = Btree::new_with_order(store.clone(), 4).unwrap();
        let tree = tree.insert("a".to_string(), 1, true).unwrap();
        let good_root = tree.root_offset();
        let good_size = tree.size();

        store.fail_after_n_more_bytes(1);
        let crashed = tree.insert("b".to_string(), 2, true);
        assert!(crashed.is_err());

        let reopened: Btree<String, i64> = Btree::new_with_order(store.clone(), 4).unwrap();
        assert_eq!(reopened.root_offset(), good_root);
        assert_eq!(reopened.size(), good_size);
        assert_eq!(reopened.lookup(&"a".to_string()).unwrap(), Some(1));
        assert_eq!(reopened.lookup(&"b".to_string()).unwrap(), None);
    }

    #[test]
    fn crash_before_any_commit_yields_fresh_empty_tree_on_reopen() {
        let store: Arc<FailingStore> = Arc::new(FailingStore::new());
        store.fail_after_n_more_bytes(0);

        let tree: Result<Btree<String, i64>> = Btree::new_with_order(store.clone(), 4);
        assert!(tree.is_err(), "even the empty-tree bootstrap commit must fail under a zero budget");

        store.fail_after.store(u64::MAX, Ordering::SeqCst);
        let reopened: Btree<String, i64> = Btree::new_with_order(store.clone(), 4).unwrap();
        assert_eq!(reopened.size(), 0);
        assert_eq!(reopened.lookup(&"a".to_string()).unwrap(), None);
    }

    #[test]
    fn no_op_delete_still_bumps_dirt_and_commits() {
        let store: Arc<MemStore> = Arc::new(MemStore::new());
        let tree: Btree<String, i64> = Btree::new_with_order(store, 4).unwrap();
        let tree = tree.insert("a".to_string(), 1, true).unwrap();
        let dirt_before = tree.dirt();

        let tree = tree.delete(&"missing".to_string(), true).unwrap();
        assert_eq!(tree.dirt(), dirt_before + 1);
        assert_eq!(tree.size(), 1);
    }
}

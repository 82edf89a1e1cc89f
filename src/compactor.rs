//! Bulk-loads a fresh, fully packed B-tree from a live snapshot.
//!
//! Compaction never touches the source tree: it streams the snapshot's live
//! entries in key order into a brand new `Store` and builds leaves and
//! branches bottom up, so the result has none of the stale copies an
//! incremental insert/delete history accumulates. Any I/O failure aborts the
//! attempt; the partially written target file is simply abandoned (see
//! `cleanup`) and the source tree is returned untouched by the caller.

use std::ops::Bound;
use std::sync::Arc;

use tracing::info;

use crate::btree::{Btree, Key, Value};
use crate::error::Result;
use crate::node::{self, Leaf, LeafEntry};
use crate::store::Store;

/// Streams every live `(key, value)` in `source` into `target` and returns
/// the resulting tree, already committed. `target` must be empty: compaction
/// always writes into a fresh file, never reuses one.
pub fn compact<K: Key, V: Value>(source: &Btree<K, V>, target: Arc<dyn Store>) -> Result<Btree<K, V>> {
    let order = source.order();
    info!(path = %target.file_path().display(), order, "compaction started");

    let mut leaf_buf: Leaf<K> = Vec::new();
    let mut level: Vec<(K, u64)> = Vec::new();
    let mut count: u64 = 0;

    for item in source.range(Bound::Unbounded, Bound::Unbounded, false) {
        let (key, value) = item?;
        let value_offset = node::write_value(target.as_ref(), &value)?;
        leaf_buf.push(LeafEntry::Present { key, value_offset });
        count += 1;
        if leaf_buf.len() >= order {
            flush_leaf(target.as_ref(), &mut leaf_buf, &mut level)?;
        }
    }
    flush_leaf(target.as_ref(), &mut leaf_buf, &mut level)?;

    let root_offset = if level.is_empty() {
        node::write_leaf::<K>(target.as_ref(), &Vec::new())?
    } else {
        build_branches(target.as_ref(), level, order)?
    };

    let compacted = Btree::from_parts(target, root_offset, count, 0, order);
    let compacted = compacted.commit()?;
    info!(size = count, "compaction finished");
    Ok(compacted)
}

fn flush_leaf<K: Key>(store: &dyn Store, buf: &mut Leaf<K>, level: &mut Vec<(K, u64)>) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    let min_key = buf[0].key().clone();
    let offset = node::write_leaf(store, buf)?;
    level.push((min_key, offset));
    buf.clear();
    Ok(())
}

/// Groups `level` into chunks of at most `order` and writes one branch node
/// per chunk, repeating on the resulting level until a single node (the new
/// root) remains.
fn build_branches<K: Key>(store: &dyn Store, mut level: Vec<(K, u64)>, order: usize) -> Result<u64> {
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len() / order + 1);
        for chunk in level.chunks(order) {
            let min_key = chunk[0].0.clone();
            let branch = chunk.to_vec();
            let offset = node::write_branch(store, &branch)?;
            next.push((min_key, offset));
        }
        level = next;
    }
    Ok(level[0].1)
}

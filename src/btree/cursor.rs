//! Lazy, streaming range traversal.
//!
//! A `RangeCursor` holds a stack of `(node, position)` frames from the root
//! down to the leaf currently being consumed. Advancing pops frames that
//! are fully consumed and descends into the next sibling on demand, so a
//! `select` over a huge range never materializes more than one root-to-leaf
//! path at a time.

use std::ops::Bound;
use std::sync::Arc;

use crate::error::Result;
use crate::node::{self, AnyNode, Branch, Leaf, LeafEntry};
use crate::store::Store;

use super::{child_index, Key, Value};

struct BranchFrame<K> {
    entries: Branch<K>,
    idx: i64,
}

struct LeafFrame<K> {
    entries: Leaf<K>,
    idx: i64,
}

enum Frame<K> {
    Branch(BranchFrame<K>),
    Leaf(LeafFrame<K>),
}

pub struct RangeCursor<K, V> {
    store: Arc<dyn Store>,
    root_offset: u64,
    stack: Vec<Frame<K>>,
    min: Bound<K>,
    max: Bound<K>,
    reverse: bool,
    started: bool,
    finished: bool,
    _marker: std::marker::PhantomData<V>,
}

impl<K: Key, V: Value> RangeCursor<K, V> {
    pub(crate) fn new(store: Arc<dyn Store>, root_offset: u64, min: Bound<K>, max: Bound<K>, reverse: bool) -> Self {
        RangeCursor {
            store,
            root_offset,
            stack: Vec::new(),
            min,
            max,
            reverse,
            started: false,
            finished: false,
            _marker: std::marker::PhantomData,
        }
    }
}

fn start_child_index<K: Ord + Clone>(entries: &Branch<K>, bound: &Bound<K>, reverse: bool) -> usize {
    match bound {
        Bound::Unbounded => {
            if reverse {
                entries.len() - 1
            } else {
                0
            }
        }
        Bound::Included(k) | Bound::Excluded(k) => child_index(entries, k),
    }
}

fn lower_pos<K: Ord>(entries: &[LeafEntry<K>], bound: &Bound<K>) -> usize {
    match bound {
        Bound::Unbounded => 0,
        Bound::Included(k) => entries.partition_point(|e| e.key() < k),
        Bound::Excluded(k) => entries.partition_point(|e| e.key() <= k),
    }
}

fn upper_pos<K: Ord>(entries: &[LeafEntry<K>], bound: &Bound<K>) -> usize {
    match bound {
        Bound::Unbounded => entries.len(),
        Bound::Included(k) => entries.partition_point(|e| e.key() <= k),
        Bound::Excluded(k) => entries.partition_point(|e| e.key() < k),
    }
}

fn violates_upper<K: Ord>(key: &K, max: &Bound<K>) -> bool {
    match max {
        Bound::Unbounded => false,
        Bound::Included(k) => key > k,
        Bound::Excluded(k) => key >= k,
    }
}

fn violates_lower<K: Ord>(key: &K, min: &Bound<K>) -> bool {
    match min {
        Bound::Unbounded => false,
        Bound::Included(k) => key < k,
        Bound::Excluded(k) => key <= k,
    }
}

/// Walks from `offset` down to a leaf, following `bound` at every branch
/// level (the same bound governs the whole initial descent), and pushes one
/// frame per level onto `stack`. Called once to seed the cursor at the
/// first matching leaf, and again (with `Bound::Unbounded`) whenever the
/// cursor needs to drop into a sibling subtree it hasn't restricted yet.
fn push_path<K: Key>(
    store: &dyn Store,
    mut offset: u64,
    bound: &Bound<K>,
    reverse: bool,
    stack: &mut Vec<Frame<K>>,
) -> Result<()> {
    loop {
        match node::read_any::<K>(store, offset)? {
            AnyNode::Branch(entries) => {
                let start = start_child_index(&entries, bound, reverse);
                let next_offset = entries[start].1;
                let idx = if reverse { start as i64 - 1 } else { start as i64 + 1 };
                stack.push(Frame::Branch(BranchFrame { entries, idx }));
                offset = next_offset;
            }
            AnyNode::Leaf(entries) => {
                let idx = if reverse {
                    upper_pos(&entries, bound) as i64 - 1
                } else {
                    lower_pos(&entries, bound) as i64
                };
                stack.push(Frame::Leaf(LeafFrame { entries, idx }));
                return Ok(());
            }
        }
    }
}

impl<K: Key, V: Value> Iterator for RangeCursor<K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if !self.started {
            self.started = true;
            let bound = if self.reverse { self.max.clone() } else { self.min.clone() };
            if let Err(e) = push_path(self.store.as_ref(), self.root_offset, &bound, self.reverse, &mut self.stack) {
                self.finished = true;
                return Some(Err(e));
            }
        }
        loop {
            match self.stack.last_mut() {
                None => {
                    self.finished = true;
                    return None;
                }
                Some(Frame::Leaf(lf)) => {
                    let has_next = if self.reverse { lf.idx >= 0 } else { (lf.idx as usize) < lf.entries.len() };
                    if !has_next {
                        self.stack.pop();
                        continue;
                    }
                    let i = lf.idx as usize;
                    let entry = lf.entries[i].clone();
                    if self.reverse {
                        lf.idx -= 1;
                    } else {
                        lf.idx += 1;
                    }
                    let stop = if self.reverse {
                        violates_lower(entry.key(), &self.min)
                    } else {
                        violates_upper(entry.key(), &self.max)
                    };
                    if stop {
                        self.finished = true;
                        self.stack.clear();
                        return None;
                    }
                    if let LeafEntry::Present { key, value_offset } = entry {
                        return match node::read_value::<V>(self.store.as_ref(), value_offset) {
                            Ok(v) => Some(Ok((key, v))),
                            Err(e) => {
                                self.finished = true;
                                Some(Err(e))
                            }
                        };
                    }
                    // tombstone: keep looping within this frame
                }
                Some(Frame::Branch(bf)) => {
                    let has_next = if self.reverse { bf.idx >= 0 } else { (bf.idx as usize) < bf.entries.len() };
                    if !has_next {
                        self.stack.pop();
                        continue;
                    }
                    let i = bf.idx as usize;
                    let child_offset = bf.entries[i].1;
                    if self.reverse {
                        bf.idx -= 1;
                    } else {
                        bf.idx += 1;
                    }
                    if let Err(e) = push_path(self.store.as_ref(), child_offset, &Bound::Unbounded, self.reverse, &mut self.stack) {
                        self.finished = true;
                        return Some(Err(e));
                    }
                }
            }
        }
    }
}

//! Replays writes that landed on the source tree while compaction was
//! streaming it, so the tree the coordinator swaps in afterward is never
//! missing anything a caller saw committed.
//!
//! Compaction reads a single frozen snapshot, but writes keep landing on the
//! live tree for as long as compaction takes. Every write that happens while
//! a compaction is in flight is still reachable as deltas between the
//! snapshot compaction started from (`original`) and the tree as it stands
//! once compaction finishes (`latest`): re-insert whatever changed or was
//! added, and replay whatever tombstones `mark_deleted` left behind while
//! the compaction was in flight (see `Btree::mark_deleted`). Repeated
//! because writes can keep landing while catch-up itself runs; the
//! coordinator calls this in a loop until a round finds nothing left to
//! replay.

use std::ops::Bound;

use tracing::info;

use crate::btree::{Btree, Key, Value};
use crate::error::Result;
use crate::node::LeafEntry;

/// One round of catch-up: reconciles `compacted` against everything `latest`
/// has that `original` (the snapshot compaction started from) didn't. The
/// returned tree still needs a final `commit()`, which `Coordinator` does
/// once it also knows this round converged.
pub fn catch_up<K: Key, V: Value>(
    original: &Btree<K, V>,
    latest: &Btree<K, V>,
    compacted: &Btree<K, V>,
) -> Result<Btree<K, V>> {
    let mut result = compacted.clone();
    let mut replayed = 0u64;

    for item in latest.range(Bound::Unbounded, Bound::Unbounded, false) {
        let (key, value) = item?;
        if original.lookup(&key)?.as_ref() != Some(&value) {
            result = result.insert(key, value, false)?;
            replayed += 1;
        }
    }

    for entry in latest.all_leaf_entries()? {
        if let LeafEntry::Tombstone { key } = entry {
            if original.has_key(&key)?.0 {
                result = result.delete(&key, false)?;
                replayed += 1;
            }
        }
    }

    let result = result.commit()?;
    info!(replayed, "catch-up round finished");
    Ok(result)
}

/// Whether `latest` is byte-for-byte the same snapshot `original` was, i.e.
/// nothing landed on the live tree during compaction (or during a prior
/// catch-up round) and there is nothing left to replay.
pub fn converged<K: Key, V: Value>(original: &Btree<K, V>, latest: &Btree<K, V>) -> bool {
    original.root_offset() == latest.root_offset()
}

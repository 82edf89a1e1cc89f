//! The public, typed handle to an open database.
//!
//! `Db<K, V>` is a thin wrapper around a `Coordinator` handle: every method
//! here is a direct pass-through to a coordinator call. Kept separate from
//! `coordinator` because the coordinator's job is running the state machine
//! and this module's job is being a pleasant API to hold onto.

use std::collections::HashMap;
use std::ops::Bound;
use std::path::PathBuf;
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::btree::{Key, Value};
use crate::config::AutoCompact;
use crate::coordinator::{Coordinator, Event};
use crate::error::Result;
use crate::reader::Select;

/// How long `select` and `get_and_update_multi` wait for the coordinator to
/// reply before giving up with `ErrorCode::Timeout`, when the caller doesn't
/// pick their own.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// An open, embedded key-value database backed by an append-only B-tree.
///
/// Cloning a `Db` is cheap and shares the same coordinator thread; use it the
/// way you'd use an `Arc` to a connection pool.
#[derive(Clone)]
pub struct Db<K, V> {
    coordinator: Coordinator<K, V>,
}

impl<K: Key, V: Value> Db<K, V> {
    /// Opens (creating if necessary) the database rooted at `data_dir`, with
    /// the default branching factor and auto-compact policy.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with(data_dir, crate::btree::DEFAULT_ORDER, AutoCompact::default())
    }

    pub fn open_with(data_dir: impl Into<PathBuf>, order: usize, auto_compact: AutoCompact) -> Result<Self> {
        Ok(Db { coordinator: Coordinator::open(data_dir, order, auto_compact)? })
    }

    pub fn get(&self, key: K) -> Result<Option<V>> {
        self.coordinator.get(key)
    }

    pub fn get_or(&self, key: K, default: V) -> Result<V> {
        Ok(self.coordinator.get(key)?.unwrap_or(default))
    }

    pub fn fetch(&self, key: K) -> Result<V> {
        self.coordinator.fetch(key)
    }

    pub fn has_key(&self, key: K) -> Result<bool> {
        self.coordinator.has_key(key)
    }

    pub fn put(&self, key: K, value: V) -> Result<()> {
        self.coordinator.put(key, value)
    }

    pub fn delete(&self, key: K) -> Result<()> {
        self.coordinator.delete(key)
    }

    pub fn update(&self, key: K, initial: V, f: impl FnOnce(V) -> V + Send + 'static) -> Result<()> {
        self.coordinator.update(key, initial, f)
    }

    pub fn get_and_update<R: Send + 'static>(
        &self,
        key: K,
        f: impl FnOnce(Option<V>) -> (R, Option<V>) + Send + 'static,
    ) -> Result<R> {
        self.coordinator.get_and_update(key, f)
    }

    pub fn get_and_update_multi<R: Send + 'static>(
        &self,
        keys: Vec<K>,
        f: impl FnOnce(HashMap<K, V>) -> Result<(R, Vec<(K, V)>, Vec<K>)> + Send + 'static,
    ) -> Result<R> {
        self.coordinator.get_and_update_multi(keys, f, DEFAULT_TIMEOUT)
    }

    pub fn get_and_update_multi_timeout<R: Send + 'static>(
        &self,
        keys: Vec<K>,
        f: impl FnOnce(HashMap<K, V>) -> Result<(R, Vec<(K, V)>, Vec<K>)> + Send + 'static,
        timeout: Duration,
    ) -> Result<R> {
        self.coordinator.get_and_update_multi(keys, f, timeout)
    }

    pub fn select<R: Send + 'static>(
        &self,
        min: Bound<K>,
        max: Bound<K>,
        reverse: bool,
        f: impl FnOnce(Select<(K, V)>) -> Result<R> + Send + 'static,
    ) -> Result<R> {
        self.coordinator.select(min, max, reverse, f, DEFAULT_TIMEOUT)
    }

    pub fn select_timeout<R: Send + 'static>(
        &self,
        min: Bound<K>,
        max: Bound<K>,
        reverse: bool,
        f: impl FnOnce(Select<(K, V)>) -> Result<R> + Send + 'static,
        timeout: Duration,
    ) -> Result<R> {
        self.coordinator.select(min, max, reverse, f, timeout)
    }

    pub fn size(&self) -> Result<u64> {
        self.coordinator.size()
    }

    pub fn dirt_factor(&self) -> Result<f64> {
        self.coordinator.dirt_factor()
    }

    /// Requests a compaction. Returns as soon as it has been scheduled, not
    /// when it finishes; `Err(PendingCompaction)` if one is already running.
    pub fn compact(&self) -> Result<()> {
        self.coordinator.compact()
    }

    pub fn set_auto_compact(&self, setting: AutoCompact) -> Result<()> {
        self.coordinator.set_auto_compact(setting)
    }

    /// Returns a channel that receives an `Event` for every mutation and
    /// compaction-lifecycle transition from now on. Multiple subscribers can
    /// coexist; a slow one only falls behind its own channel, it never
    /// blocks the database.
    pub fn subscribe(&self) -> Result<Receiver<Event<K, V>>> {
        self.coordinator.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db: Db<String, String> = Db::open(dir.path()).unwrap();

        assert_eq!(db.get("a".into()).unwrap(), None);
        db.put("a".into(), "1".into()).unwrap();
        assert_eq!(db.get("a".into()).unwrap(), Some("1".into()));
        assert!(db.has_key("a".into()).unwrap());

        db.delete("a".into()).unwrap();
        assert_eq!(db.get("a".into()).unwrap(), None);
        assert!(db.fetch("a".into()).is_err());
    }

    #[test]
    fn reopen_recovers_committed_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db: Db<String, i64> = Db::open(dir.path()).unwrap();
            db.put("x".into(), 42).unwrap();
            db.put("y".into(), 7).unwrap();
        }
        let db: Db<String, i64> = Db::open(dir.path()).unwrap();
        assert_eq!(db.get("x".into()).unwrap(), Some(42));
        assert_eq!(db.get("y".into()).unwrap(), Some(7));
        assert_eq!(db.size().unwrap(), 2);
    }

    #[test]
    fn update_applies_fn_to_current_or_initial() {
        let dir = tempfile::tempdir().unwrap();
        let db: Db<String, i64> = Db::open(dir.path()).unwrap();
        db.update("counter".into(), 0, |v| v + 1).unwrap();
        db.update("counter".into(), 0, |v| v + 1).unwrap();
        assert_eq!(db.get("counter".into()).unwrap(), Some(2));
    }

    #[test]
    fn get_and_update_multi_is_atomic_and_rolls_back_on_panic() {
        let dir = tempfile::tempdir().unwrap();
        let db: Db<String, i64> = Db::open(dir.path()).unwrap();
        db.put("a".into(), 10).unwrap();
        db.put("b".into(), 20).unwrap();

        let result: Result<i64> = db.get_and_update_multi(vec!["a".into(), "b".into()], |_current| {
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(db.get("a".into()).unwrap(), Some(10));
        assert_eq!(db.get("b".into()).unwrap(), Some(20));

        let moved: Result<i64> = db.get_and_update_multi(vec!["a".into(), "b".into()], |current| {
            let a = *current.get("a").unwrap();
            let b = *current.get("b").unwrap();
            Ok((a + b, vec![("a".into(), 0), ("b".into(), a + b)], vec![]))
        });
        assert_eq!(moved.unwrap(), 30);
        assert_eq!(db.get("a".into()).unwrap(), Some(0));
        assert_eq!(db.get("b".into()).unwrap(), Some(30));
    }

    #[test]
    fn select_streams_ordered_range() {
        let dir = tempfile::tempdir().unwrap();
        let db: Db<i64, i64> = Db::open(dir.path()).unwrap();
        for i in 0..10 {
            db.put(i, i * i).unwrap();
        }
        let evens: Vec<(i64, i64)> = db
            .select(Bound::Unbounded, Bound::Unbounded, false, |s| {
                s.filter(|(k, _)| k % 2 == 0).collect_vec()
            })
            .unwrap();
        assert_eq!(evens, vec![(0, 0), (2, 4), (4, 16), (6, 36), (8, 64)]);
    }

    #[test]
    fn subscribers_see_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let db: Db<String, i64> = Db::open(dir.path()).unwrap();
        let events = db.subscribe().unwrap();
        db.put("a".into(), 1).unwrap();
        let event = events.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(event, Event::Put { .. }));
    }

    #[test]
    fn compact_shrinks_dirt() {
        let dir = tempfile::tempdir().unwrap();
        let db: Db<i64, i64> = Db::open_with(dir.path(), 4, AutoCompact::Off).unwrap();
        for i in 0..50 {
            db.put(i, i).unwrap();
            db.delete(i).unwrap();
        }
        assert!(db.dirt_factor().unwrap() > 0.0);
        db.compact().unwrap();

        for _ in 0..200 {
            if db.dirt_factor().unwrap() == 0.0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(db.dirt_factor().unwrap(), 0.0);
    }
}

//! Executes exactly one read request against a frozen `Btree` snapshot.
//!
//! A `Reader` never mutates anything; it runs concurrently with the
//! coordinator's write stream and with other readers because it only ever
//! touches read-only file offsets. Once its job finishes it reports back
//! to the coordinator so the snapshot's file can eventually be cleaned up
//! (see `cleanup`).

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::debug;

use crate::btree::{Btree, Key, RangeCursor, Value};
use crate::error::{ErrorCode, Result};

/// A unit of work dispatched onto a snapshot by the coordinator. Boxed so
/// the coordinator's dispatch loop doesn't need to know the shape of every
/// possible read (point lookup, existence check, or a `select` pipeline).
pub type ReadJob<K, V> = Box<dyn FnOnce(&Btree<K, V>) + Send>;

/// Runs `job` against `btree` to completion. Readers are not cancellable:
/// a caller-side timeout just stops waiting on the reply channel, it does
/// not interrupt work already in flight, which is safe because the work is
/// bounded by the traversal rather than by external I/O.
pub fn run<K: Key, V: Value>(btree: Btree<K, V>, job: ReadJob<K, V>) {
    debug!(file = %btree.store().file_path().display(), root = btree.root_offset(), "reader dispatched");
    job(&btree);
}

/// A lazy pipeline over one `select` call's result stream. Built with the
/// `filter`/`map`/`take`/`drop`/`take_while`/`drop_while` combinators and
/// consumed by exactly one of `collect_vec`, `fold`, or `fold1`.
pub struct Select<T> {
    iter: Box<dyn Iterator<Item = Result<T>> + Send>,
}

impl<T: Send + 'static> Select<T> {
    pub fn from_cursor(cursor: impl Iterator<Item = Result<T>> + Send + 'static) -> Self {
        Select { iter: Box::new(cursor) }
    }

    pub fn filter<F>(self, pred: F) -> Select<T>
    where
        F: Fn(&T) -> bool + Send + 'static,
    {
        Select { iter: Box::new(self.iter.filter(move |item| match item {
            Ok(t) => pred(t),
            Err(_) => true,
        })) }
    }

    pub fn map<U, F>(self, f: F) -> Select<U>
    where
        F: Fn(T) -> U + Send + 'static,
        U: Send + 'static,
    {
        Select { iter: Box::new(self.iter.map(move |item| item.map(&f))) }
    }

    pub fn take(self, n: usize) -> Select<T> {
        Select { iter: Box::new(self.iter.take(n)) }
    }

    pub fn drop(self, n: usize) -> Select<T> {
        Select { iter: Box::new(self.iter.skip(n)) }
    }

    pub fn take_while<F>(self, pred: F) -> Select<T>
    where
        F: Fn(&T) -> bool + Send + 'static,
    {
        Select { iter: Box::new(self.iter.take_while(move |item| match item {
            Ok(t) => pred(t),
            Err(_) => false,
        })) }
    }

    pub fn drop_while<F>(self, pred: F) -> Select<T>
    where
        F: Fn(&T) -> bool + Send + 'static,
    {
        let mut dropping = true;
        Select { iter: Box::new(self.iter.filter(move |item| {
            if !dropping {
                return true;
            }
            match item {
                Ok(t) if pred(t) => false,
                _ => {
                    dropping = false;
                    true
                }
            }
        })) }
    }

    /// Materializes the remaining stream into a `Vec` — the "none" reduction.
    pub fn collect_vec(self) -> Result<Vec<T>> {
        self.iter.collect()
    }

    pub fn fold<B, F>(self, init: B, mut f: F) -> Result<B>
    where
        F: FnMut(B, T) -> B,
    {
        let mut acc = init;
        for item in self.iter {
            acc = f(acc, item?);
        }
        Ok(acc)
    }

    /// A fold with no initial value; fails on an empty input rather than
    /// fabricating one out of `T`.
    pub fn fold1<F>(self, mut f: F) -> Result<T>
    where
        F: FnMut(T, T) -> T,
    {
        let mut iter = self.iter;
        let mut acc = match iter.next() {
            Some(first) => first?,
            None => return Err(ErrorCode::UserError("fold1 over an empty selection".into())),
        };
        for item in iter {
            acc = f(acc, item?);
        }
        Ok(acc)
    }
}

/// Runs a user-supplied select pipeline over `cursor`, catching any panic
/// raised inside `f`'s closures and reporting it as `UserError` with
/// whatever partial results had accumulated discarded, per the "errors
/// raised by user functions are caught and reported" contract.
pub fn run_select<K, V, R, F>(cursor: RangeCursor<K, V>, f: F) -> Result<R>
where
    K: Key,
    V: Value,
    R: Send + 'static,
    F: FnOnce(Select<(K, V)>) -> Result<R>,
{
    let select = Select::from_cursor(cursor);
    match catch_unwind(AssertUnwindSafe(|| f(select))) {
        Ok(result) => result,
        Err(payload) => Err(ErrorCode::UserError(panic_message(&payload))),
    }
}

pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "user function panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> Select<i32> {
        Select::from_cursor(vec![1, 2, 3, 4, 5].into_iter().map(Ok))
    }

    #[test]
    fn filter_map_collect() {
        let out = data().filter(|n| n % 2 == 0).map(|n| n * 10).collect_vec().unwrap();
        assert_eq!(out, vec![20, 40]);
    }

    #[test]
    fn take_and_drop() {
        let out = data().drop(1).take(2).collect_vec().unwrap();
        assert_eq!(out, vec![2, 3]);
    }

    #[test]
    fn take_while_stops_early() {
        let out = data().take_while(|&n| n < 4).collect_vec().unwrap();
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn drop_while_skips_prefix() {
        let out = data().drop_while(|&n| n < 3).collect_vec().unwrap();
        assert_eq!(out, vec![3, 4, 5]);
    }

    #[test]
    fn fold_with_initial() {
        let out = data().fold(0, |acc, n| acc + n).unwrap();
        assert_eq!(out, 15);
    }

    #[test]
    fn fold1_fails_on_empty() {
        let empty: Select<i32> = Select::from_cursor(std::iter::empty());
        assert!(empty.fold1(|a, b| a + b).is_err());
    }

    #[test]
    fn run_select_catches_panics() {
        let cursor: Select<i32> = data();
        let result: Result<i32> = run_select_over(cursor, |s| s.map(|n| if n == 3 { panic!("boom") } else { n }).fold(0, |a, b| a + b));
        assert!(matches!(result, Err(ErrorCode::UserError(_))));
    }

    // `run_select` takes a `RangeCursor`, which needs a real store; this
    // helper exercises the same catch_unwind plumbing directly against a
    // plain `Select` for a unit test that doesn't need disk.
    fn run_select_over<T: Send + 'static, R: Send + 'static>(
        select: Select<T>,
        f: impl FnOnce(Select<T>) -> Result<R>,
    ) -> Result<R> {
        match catch_unwind(AssertUnwindSafe(|| f(select))) {
            Ok(result) => result,
            Err(payload) => Err(ErrorCode::UserError(panic_message(&payload))),
        }
    }
}

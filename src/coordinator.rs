//! Single-writer authority over the current tree, and the state machine that
//! drives compaction, catch-up and cleanup around it.
//!
//! Everything that touches `current` runs on one dedicated thread pulling
//! messages off a mailbox, one at a time, in send order — that serialization
//! is what makes per-key writes linearizable without any lock the caller has
//! to think about. Reads never wait on that thread for longer than it takes
//! to clone an `Arc` and hand a snapshot to a thread-pool worker; the actual
//! traversal happens off the mailbox entirely (see `reader`).

use std::any::Any;
use std::collections::HashMap;
use std::fs;
use std::ops::Bound;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::btree::{Btree, Key, Value};
use crate::catchup;
use crate::cleanup::CleanUp;
use crate::compactor;
use crate::config::AutoCompact;
use crate::error::{ErrorCode, Result};
use crate::reader::{self, panic_message, run_select, ReadJob, Select};
use crate::store::{FileStore, Store};
use crate::thread_pool::{SharedQueueThreadPool, ThreadPool};

/// Broadcast to every `subscribe()`r after a mutation or a compaction
/// lifecycle transition. Delivery is best-effort: a subscriber that never
/// drains its channel just falls behind, it never blocks the coordinator.
#[derive(Clone, Debug)]
pub enum Event<K, V> {
    Put { key: K, value: V },
    Delete { key: K },
    CompactionStarted,
    /// One catch-up round finished reconciling writes that landed on the
    /// live tree while compaction was streaming it. Fires once per round;
    /// a single compaction can fire this more than once before the final
    /// `CompactionCompleted` if writes keep landing faster than catch-up
    /// can converge.
    CatchUpCompleted,
    CompactionCompleted,
}

type BoxedResult = Result<Box<dyn Any + Send>>;

enum Msg<K, V> {
    ReaderDone { path: PathBuf },
    Get { key: K, reply: Sender<Result<Option<V>>> },
    Select {
        min: Bound<K>,
        max: Bound<K>,
        reverse: bool,
        job: Box<dyn FnOnce(Select<(K, V)>) -> BoxedResult + Send>,
        reply: Sender<BoxedResult>,
    },
    Put { key: K, value: V, reply: Sender<Result<()>> },
    Delete { key: K, reply: Sender<Result<()>> },
    Update { key: K, initial: V, f: Box<dyn FnOnce(V) -> V + Send>, reply: Sender<Result<()>> },
    GetAndUpdate {
        key: K,
        f: Box<dyn FnOnce(Option<V>) -> (Box<dyn Any + Send>, Option<V>) + Send>,
        reply: Sender<BoxedResult>,
    },
    GetAndUpdateMulti {
        keys: Vec<K>,
        f: Box<dyn FnOnce(HashMap<K, V>) -> Result<(Box<dyn Any + Send>, Vec<(K, V)>, Vec<K>)> + Send>,
        reply: Sender<BoxedResult>,
    },
    Stats { reply: Sender<(u64, f64)> },
    CompactRequest { reply: Sender<Result<()>> },
    CompactionCompleted { snapshot: Btree<K, V>, result: Result<Btree<K, V>> },
    CatchUpCompleted { original: Btree<K, V>, latest: Btree<K, V>, result: Result<Btree<K, V>> },
    SetAutoCompact { setting: AutoCompact, reply: Sender<Result<()>> },
    Subscribe { reply: Sender<Receiver<Event<K, V>>> },
}

enum CompactionPhase {
    Idle,
    Compacting,
    CatchingUp,
}

impl CompactionPhase {
    fn is_idle(&self) -> bool {
        matches!(self, CompactionPhase::Idle)
    }
}

/// A cheap, cloneable handle to a running coordinator. All the real state
/// lives on the coordinator's own thread; this just wraps the mailbox
/// `Sender`.
#[derive(Clone)]
pub struct Coordinator<K, V> {
    sender: Sender<Msg<K, V>>,
}

struct State<K, V> {
    data_dir: PathBuf,
    current: Btree<K, V>,
    next_file_stem: u64,
    order: usize,
    compaction: CompactionPhase,
    busy_files: HashMap<PathBuf, u64>,
    cleanup_pending: bool,
    auto_compact: AutoCompact,
    subscribers: Vec<Sender<Event<K, V>>>,
    cleanup: CleanUp,
    reader_pool: SharedQueueThreadPool,
    self_sender: Sender<Msg<K, V>>,
}

impl<K: Key, V: Value> Coordinator<K, V> {
    pub fn open(data_dir: impl Into<PathBuf>, order: usize, auto_compact: AutoCompact) -> Result<Self> {
        let auto_compact = auto_compact.validate()?;
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        let (existing, max_stem) = scan_data_dir(&data_dir)?;
        let path = existing.unwrap_or_else(|| data_dir.join("0.cub"));
        let store: Arc<dyn Store> = Arc::new(FileStore::open(&path)?);
        let current = Btree::new_with_order(store, order)?;
        info!(path = %path.display(), size = current.size(), "database opened");

        let (sender, receiver) = unbounded();
        let reader_pool = SharedQueueThreadPool::new(num_cpus::get().max(1) as u32)?;
        let state = State {
            data_dir,
            current,
            next_file_stem: max_stem + 1,
            order,
            compaction: CompactionPhase::Idle,
            busy_files: HashMap::new(),
            cleanup_pending: false,
            auto_compact,
            subscribers: Vec::new(),
            cleanup: CleanUp::spawn()?,
            reader_pool,
            self_sender: sender.clone(),
        };
        thread::Builder::new().name("coordinator".into()).spawn(move || run(state, receiver))?;
        Ok(Coordinator { sender })
    }

    fn call<R>(&self, build: impl FnOnce(Sender<R>) -> Msg<K, V>) -> Result<R> {
        let (reply, rx) = unbounded();
        self.sender.send(build(reply)).map_err(|_| ErrorCode::CoordinatorGone)?;
        rx.recv().map_err(|_| ErrorCode::CoordinatorGone)
    }

    fn call_timeout<R>(&self, timeout: Duration, build: impl FnOnce(Sender<R>) -> Msg<K, V>) -> Result<R> {
        let (reply, rx) = unbounded();
        self.sender.send(build(reply)).map_err(|_| ErrorCode::CoordinatorGone)?;
        match rx.recv_timeout(timeout) {
            Ok(v) => Ok(v),
            Err(RecvTimeoutError::Timeout) => Err(ErrorCode::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(ErrorCode::CoordinatorGone),
        }
    }

    pub fn get(&self, key: K) -> Result<Option<V>> {
        self.call(|reply| Msg::Get { key, reply })?
    }

    pub fn fetch(&self, key: K) -> Result<V> {
        self.get(key)?.ok_or(ErrorCode::NotFound)
    }

    pub fn has_key(&self, key: K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn put(&self, key: K, value: V) -> Result<()> {
        self.call(|reply| Msg::Put { key, value, reply })?
    }

    pub fn delete(&self, key: K) -> Result<()> {
        self.call(|reply| Msg::Delete { key, reply })?
    }

    pub fn update(&self, key: K, initial: V, f: impl FnOnce(V) -> V + Send + 'static) -> Result<()> {
        self.call(|reply| Msg::Update { key, initial, f: Box::new(f), reply })?
    }

    pub fn get_and_update<R: Send + 'static>(
        &self,
        key: K,
        f: impl FnOnce(Option<V>) -> (R, Option<V>) + Send + 'static,
    ) -> Result<R> {
        let boxed = move |v: Option<V>| {
            let (r, next) = f(v);
            (Box::new(r) as Box<dyn Any + Send>, next)
        };
        let out = self.call(|reply| Msg::GetAndUpdate { key, f: Box::new(boxed), reply })??;
        Ok(*out.downcast::<R>().expect("get_and_update reply type mismatch"))
    }

    pub fn get_and_update_multi<R: Send + 'static>(
        &self,
        keys: Vec<K>,
        f: impl FnOnce(HashMap<K, V>) -> Result<(R, Vec<(K, V)>, Vec<K>)> + Send + 'static,
        timeout: Duration,
    ) -> Result<R> {
        let boxed = move |m: HashMap<K, V>| {
            f(m).map(|(r, puts, deletes)| (Box::new(r) as Box<dyn Any + Send>, puts, deletes))
        };
        let out = self.call_timeout(timeout, |reply| Msg::GetAndUpdateMulti { keys, f: Box::new(boxed), reply })??;
        Ok(*out.downcast::<R>().expect("get_and_update_multi reply type mismatch"))
    }

    pub fn select<R: Send + 'static>(
        &self,
        min: Bound<K>,
        max: Bound<K>,
        reverse: bool,
        f: impl FnOnce(Select<(K, V)>) -> Result<R> + Send + 'static,
        timeout: Duration,
    ) -> Result<R> {
        let boxed = move |s: Select<(K, V)>| f(s).map(|r| Box::new(r) as Box<dyn Any + Send>);
        let out = self.call_timeout(timeout, |reply| Msg::Select { min, max, reverse, job: Box::new(boxed), reply })??;
        Ok(*out.downcast::<R>().expect("select reply type mismatch"))
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.call(|reply| Msg::Stats { reply })?.0)
    }

    pub fn dirt_factor(&self) -> Result<f64> {
        Ok(self.call(|reply| Msg::Stats { reply })?.1)
    }

    pub fn compact(&self) -> Result<()> {
        self.call(|reply| Msg::CompactRequest { reply })?
    }

    pub fn set_auto_compact(&self, setting: AutoCompact) -> Result<()> {
        self.call(|reply| Msg::SetAutoCompact { setting, reply })?
    }

    pub fn subscribe(&self) -> Result<Receiver<Event<K, V>>> {
        self.call(|reply| Msg::Subscribe { reply })
    }
}

fn scan_data_dir(data_dir: &Path) -> Result<(Option<PathBuf>, u64)> {
    let mut newest: Option<(u64, PathBuf)> = None;
    let mut max_stem: u64 = 0;
    for entry in fs::read_dir(data_dir)? {
        let path = entry?.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
        let Ok(n) = u64::from_str_radix(stem, 16) else { continue };
        max_stem = max_stem.max(n);
        if path.extension().and_then(|e| e.to_str()) == Some("cub")
            && newest.as_ref().map_or(true, |(cur, _)| n > *cur)
        {
            newest = Some((n, path));
        }
    }
    Ok((newest.map(|(_, p)| p), max_stem))
}

fn run<K: Key, V: Value>(mut state: State<K, V>, receiver: Receiver<Msg<K, V>>) {
    for msg in receiver {
        handle(&mut state, msg);
    }
    debug!("coordinator mailbox closed, thread exiting");
}

fn handle<K: Key, V: Value>(state: &mut State<K, V>, msg: Msg<K, V>) {
    match msg {
        Msg::ReaderDone { path } => {
            if let Some(count) = state.busy_files.get_mut(&path) {
                *count -= 1;
                if *count == 0 {
                    state.busy_files.remove(&path);
                }
            }
            maybe_run_pending_cleanup(state);
        }
        Msg::Get { key, reply } => dispatch_read(
            state,
            Box::new(move |bt| {
                let _ = reply.send(bt.lookup(&key));
            }),
        ),
        Msg::Select { min, max, reverse, job, reply } => dispatch_read(
            state,
            Box::new(move |bt| {
                let cursor = bt.range(min, max, reverse);
                let _ = reply.send(run_select(cursor, job));
            }),
        ),
        Msg::Put { key, value, reply } => {
            match state.current.insert(key.clone(), value.clone(), true) {
                Ok(next) => {
                    state.current = next;
                    broadcast(state, Event::Put { key, value });
                    maybe_auto_compact(state);
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
        }
        Msg::Delete { key, reply } => {
            let result = if state.compaction.is_idle() {
                state.current.delete(&key, true)
            } else {
                state.current.mark_deleted(&key, true)
            };
            match result {
                Ok(next) => {
                    state.current = next;
                    broadcast(state, Event::Delete { key });
                    maybe_auto_compact(state);
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
        }
        Msg::Update { key, initial, f, reply } => {
            let current_value = match state.current.lookup(&key) {
                Ok(v) => v.unwrap_or(initial),
                Err(e) => {
                    let _ = reply.send(Err(e));
                    return;
                }
            };
            let new_value = match catch_unwind(AssertUnwindSafe(|| f(current_value))) {
                Ok(v) => v,
                Err(payload) => {
                    let _ = reply.send(Err(ErrorCode::UserError(panic_message(&payload))));
                    return;
                }
            };
            match state.current.insert(key.clone(), new_value.clone(), true) {
                Ok(next) => {
                    state.current = next;
                    broadcast(state, Event::Put { key, value: new_value });
                    maybe_auto_compact(state);
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
        }
        Msg::GetAndUpdate { key, f, reply } => {
            let current_value = match state.current.lookup(&key) {
                Ok(v) => v,
                Err(e) => {
                    let _ = reply.send(Err(e));
                    return;
                }
            };
            let (result, next_value) = match catch_unwind(AssertUnwindSafe(|| f(current_value))) {
                Ok(pair) => pair,
                Err(payload) => {
                    let _ = reply.send(Err(ErrorCode::UserError(panic_message(&payload))));
                    return;
                }
            };
            let outcome = match next_value {
                Some(v) => state.current.insert(key.clone(), v.clone(), true).map(|next| (next, Some(v))),
                None if state.compaction.is_idle() => {
                    state.current.delete(&key, true).map(|next| (next, None))
                }
                None => state.current.mark_deleted(&key, true).map(|next| (next, None)),
            };
            match outcome {
                Ok((next, put_value)) => {
                    state.current = next;
                    match put_value {
                        Some(value) => broadcast(state, Event::Put { key, value }),
                        None => broadcast(state, Event::Delete { key }),
                    }
                    maybe_auto_compact(state);
                    let _ = reply.send(Ok(result));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
        }
        Msg::GetAndUpdateMulti { keys, f, reply } => {
            let mut current_map = HashMap::new();
            for key in &keys {
                match state.current.lookup(key) {
                    Ok(Some(v)) => {
                        current_map.insert(key.clone(), v);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                }
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| f(current_map)));
            let (result, puts, deletes) = match outcome {
                Ok(Ok(triple)) => triple,
                Ok(Err(e)) => {
                    let _ = reply.send(Err(e));
                    return;
                }
                Err(payload) => {
                    let _ = reply.send(Err(ErrorCode::UserError(panic_message(&payload))));
                    return;
                }
            };
            let mut tree = state.current.clone();
            let mut events = Vec::with_capacity(puts.len() + deletes.len());
            let mut failed = None;
            for (key, value) in puts {
                match tree.insert(key.clone(), value.clone(), false) {
                    Ok(next) => {
                        tree = next;
                        events.push(Event::Put { key, value });
                    }
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                }
            }
            if failed.is_none() {
                for key in deletes {
                    let next = if state.compaction.is_idle() {
                        tree.delete(&key, false)
                    } else {
                        tree.mark_deleted(&key, false)
                    };
                    match next {
                        Ok(next) => {
                            tree = next;
                            events.push(Event::Delete { key });
                        }
                        Err(e) => {
                            failed = Some(e);
                            break;
                        }
                    }
                }
            }
            if let Some(e) = failed {
                let _ = reply.send(Err(e));
                return;
            }
            match tree.commit() {
                Ok(committed) => {
                    state.current = committed;
                    for event in events {
                        broadcast(state, event);
                    }
                    maybe_auto_compact(state);
                    let _ = reply.send(Ok(result));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
        }
        Msg::Stats { reply } => {
            let _ = reply.send((state.current.dirt(), state.current.dirt_factor()));
        }
        Msg::CompactRequest { reply } => {
            if !state.compaction.is_idle() {
                let _ = reply.send(Err(ErrorCode::PendingCompaction));
                return;
            }
            match start_compaction(state) {
                Ok(()) => {
                    broadcast(state, Event::CompactionStarted);
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
        }
        Msg::CompactionCompleted { snapshot, result } => match result {
            Ok(compacted) => {
                state.compaction = CompactionPhase::CatchingUp;
                dispatch_catch_up(state, snapshot, state.current.clone(), compacted);
            }
            Err(e) => {
                warn!(error = %e, "compaction failed, abandoning target file");
                state.compaction = CompactionPhase::Idle;
            }
        },
        Msg::CatchUpCompleted { original, latest, result } => match result {
            Ok(compacted) => {
                broadcast(state, Event::CatchUpCompleted);
                if catchup::converged(&latest, &state.current) {
                    match promote_compaction_target(compacted) {
                        Ok(promoted) => {
                            state.current = promoted;
                            state.compaction = CompactionPhase::Idle;
                            broadcast(state, Event::CompactionCompleted);
                            schedule_cleanup(state);
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to promote compacted file, abandoning compaction");
                            state.compaction = CompactionPhase::Idle;
                        }
                    }
                } else {
                    let new_latest = state.current.clone();
                    dispatch_catch_up(state, original, new_latest, compacted);
                }
            }
            Err(e) => {
                warn!(error = %e, "catch-up failed, abandoning compaction");
                state.compaction = CompactionPhase::Idle;
            }
        },
        Msg::SetAutoCompact { setting, reply } => match setting.validate() {
            Ok(valid) => {
                state.auto_compact = valid;
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        },
        Msg::Subscribe { reply } => {
            let (tx, rx) = unbounded();
            state.subscribers.push(tx);
            let _ = reply.send(rx);
        }
    }
}

fn dispatch_read<K: Key, V: Value>(state: &mut State<K, V>, job: ReadJob<K, V>) {
    let snapshot = state.current.clone();
    let path = snapshot.store().file_path().to_path_buf();
    *state.busy_files.entry(path.clone()).or_insert(0) += 1;
    let self_sender = state.self_sender.clone();
    state.reader_pool.spawn(move || {
        reader::run(snapshot, job);
        let _ = self_sender.send(Msg::ReaderDone { path });
    });
}

fn broadcast<K: Key, V: Value>(state: &mut State<K, V>, event: Event<K, V>) {
    state.subscribers.retain(|s| s.send(event.clone()).is_ok());
}

fn maybe_auto_compact<K: Key, V: Value>(state: &mut State<K, V>) {
    if !state.compaction.is_idle() {
        return;
    }
    let dirt = state.current.dirt();
    let dirt_factor = state.current.dirt_factor();
    if state.auto_compact.should_compact(dirt, dirt_factor) {
        if let Err(e) = start_compaction(state) {
            warn!(error = %e, "auto-compact trigger failed to start");
        } else {
            broadcast(state, Event::CompactionStarted);
        }
    }
}

fn start_compaction<K: Key, V: Value>(state: &mut State<K, V>) -> Result<()> {
    let target_path = state.data_dir.join(format!("{:x}.compact", state.next_file_stem));
    state.next_file_stem += 1;
    state.cleanup.clean_up_old_compaction_files(&state.data_dir, &target_path);
    let target_store: Arc<dyn Store> = Arc::new(FileStore::open(&target_path)?);
    let snapshot = state.current.clone();
    state.compaction = CompactionPhase::Compacting;
    let self_sender = state.self_sender.clone();
    thread::spawn(move || {
        let result = compactor::compact(&snapshot, target_store);
        let _ = self_sender.send(Msg::CompactionCompleted { snapshot, result });
    });
    Ok(())
}

fn dispatch_catch_up<K: Key, V: Value>(
    state: &mut State<K, V>,
    original: Btree<K, V>,
    latest: Btree<K, V>,
    compacted: Btree<K, V>,
) {
    let self_sender = state.self_sender.clone();
    let original_for_reply = original.clone();
    let latest_for_reply = latest.clone();
    thread::spawn(move || {
        let result = catchup::catch_up(&original, &latest, &compacted);
        let _ = self_sender.send(Msg::CatchUpCompleted {
            original: original_for_reply,
            latest: latest_for_reply,
            result,
        });
    });
}

/// Renames the compaction target's backing file from its working
/// `N.compact` name to `N.cub` and reopens a `Store` at the new path, so
/// `scan_data_dir` recognizes it on the next `Coordinator::open` the same
/// way it recognizes any other current file.
fn promote_compaction_target<K: Key, V: Value>(compacted: Btree<K, V>) -> Result<Btree<K, V>> {
    let old_path = compacted.store().file_path().to_path_buf();
    let new_path = old_path.with_extension("cub");
    fs::rename(&old_path, &new_path)?;
    let store: Arc<dyn Store> = Arc::new(FileStore::open(&new_path)?);
    Ok(Btree::from_parts(store, compacted.root_offset(), compacted.size(), compacted.dirt(), compacted.order()))
}

fn schedule_cleanup<K: Key, V: Value>(state: &mut State<K, V>) {
    let current_path = state.current.store().file_path().to_path_buf();
    let any_other_busy = state.busy_files.keys().any(|p| p != &current_path);
    if any_other_busy {
        state.cleanup_pending = true;
        return;
    }
    state.cleanup.clean_up(&state.data_dir, &current_path);
    state.cleanup_pending = false;
}

fn maybe_run_pending_cleanup<K: Key, V: Value>(state: &mut State<K, V>) {
    if !state.cleanup_pending {
        return;
    }
    let current_path = state.current.store().file_path().to_path_buf();
    let any_other_busy = state.busy_files.keys().any(|p| p != &current_path);
    if !any_other_busy {
        state.cleanup.clean_up(&state.data_dir, &current_path);
        state.cleanup_pending = false;
    }
}

//! Deletes files the active tree and every live reader have finished with.
//!
//! A dedicated thread drains a mailbox of jobs one at a time, so two cleanup
//! passes never race each other on the same directory. The `Coordinator`
//! only ever enqueues a job once `busy_files` says no reader still holds a
//! non-current file open (see `coordinator`); this module never checks that
//! itself, it just deletes what it's told to.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::error::Result;

enum Job {
    OldCompactionFiles { data_dir: PathBuf, keep: PathBuf },
    Obsolete { data_dir: PathBuf, keep: PathBuf },
}

/// A handle to the background cleanup thread. Cloning it is cheap (just the
/// channel sender) so the coordinator can hand it out freely.
#[derive(Clone)]
pub struct CleanUp {
    sender: Sender<Job>,
}

impl CleanUp {
    pub fn spawn() -> Result<Self> {
        let (sender, receiver) = unbounded();
        thread::Builder::new().name("cleanup".into()).spawn(move || worker(receiver))?;
        Ok(CleanUp { sender })
    }

    /// Deletes every `.compact` file in `data_dir` except `keep`. Called
    /// when a new compaction starts, to sweep away an orphaned target left
    /// behind by a prior compaction that was aborted or never promoted.
    pub fn clean_up_old_compaction_files(&self, data_dir: impl Into<PathBuf>, keep: impl Into<PathBuf>) {
        let _ = self.sender.send(Job::OldCompactionFiles { data_dir: data_dir.into(), keep: keep.into() });
    }

    /// Deletes every `.cub` and `.compact` file in `data_dir` except `keep`
    /// (the now-current tree's file). Called once a compaction has been
    /// promoted and no reader is still scanning the superseded file.
    pub fn clean_up(&self, data_dir: impl Into<PathBuf>, keep: impl Into<PathBuf>) {
        let _ = self.sender.send(Job::Obsolete { data_dir: data_dir.into(), keep: keep.into() });
    }
}

fn worker(receiver: Receiver<Job>) {
    for job in receiver {
        match job {
            Job::OldCompactionFiles { data_dir, keep } => {
                remove_matching(&data_dir, &keep, |name| name.ends_with(".compact"));
            }
            Job::Obsolete { data_dir, keep } => {
                remove_matching(&data_dir, &keep, |name| name.ends_with(".cub") || name.ends_with(".compact"));
            }
        }
    }
}

fn remove_matching(data_dir: &Path, keep: &Path, matches: impl Fn(&str) -> bool) {
    let entries = match fs::read_dir(data_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %data_dir.display(), error = %e, "cleanup could not list data dir");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path == keep {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !matches(name) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed obsolete file"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove obsolete file"),
        }
    }
}

//! An append-only block device over a single file.
//!
//! `FileStore` is the only `Store` implementation shipped here, but the
//! engine talks to it through the `Store` trait so tests can swap in an
//! in-memory fake without touching a real filesystem.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::{ErrorCode, Result};
use crate::node::{decode_header, HeaderRecord, HEADER_LEN};

pub trait Store: Send + Sync {
    fn append(&self, bytes: &[u8]) -> Result<u64>;
    fn read_at(&self, offset: u64, len: u32) -> Result<Vec<u8>>;
    fn sync(&self) -> Result<()>;
    fn length(&self) -> Result<u64>;
    fn latest_header(&self) -> Result<Option<HeaderRecord>>;
    fn file_path(&self) -> &Path;
}

/// A single data file, opened once and shared (via `Arc`) by every `Btree`
/// snapshot, `Reader`, and background worker that refers to it.
///
/// Reads use `pread` (`FileExt::read_at`), which does not disturb a shared
/// file cursor, so they never contend with the writer or with each other.
/// Appends serialize through `write_pos` to keep offset allocation and the
/// actual `pwrite` atomic with respect to each other; the engine's
/// single-writer contract means this lock is never contended in practice.
pub struct FileStore {
    path: PathBuf,
    file: File,
    write_pos: Mutex<u64>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let len = file.metadata()?.len();
        debug!(path = %path.display(), len, "opened store file");
        Ok(FileStore { path, file, write_pos: Mutex::new(len) })
    }
}

impl Store for FileStore {
    fn append(&self, bytes: &[u8]) -> Result<u64> {
        let mut pos = self.write_pos.lock().unwrap();
        let offset = *pos;
        self.file.write_at(bytes, offset)?;
        *pos += bytes.len() as u64;
        Ok(offset)
    }

    fn read_at(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn length(&self) -> Result<u64> {
        Ok(*self.write_pos.lock().unwrap())
    }

    fn latest_header(&self) -> Result<Option<HeaderRecord>> {
        let len = self.length()?;
        if len < HEADER_LEN as u64 {
            return Ok(None);
        }
        let mut candidate = len - HEADER_LEN as u64;
        loop {
            let mut buf = vec![0u8; HEADER_LEN];
            if self.file.read_exact_at(&mut buf, candidate).is_ok() {
                if let Some(header) = decode_header(&buf, candidate)? {
                    return Ok(Some(header));
                }
            }
            if candidate == 0 {
                break;
            }
            candidate -= 1;
        }
        warn!(path = %self.path.display(), "no valid header found; treating store as empty");
        Ok(None)
    }

    fn file_path(&self) -> &Path {
        &self.path
    }
}

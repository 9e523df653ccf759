//! Durable checkpoints: the timestamp of the last delivered log line per
//! container.
//!
//! Backed by a single sled tree. Keys are short container ids, values are
//! 8-byte little-endian Unix timestamps in seconds.

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use chrono::{Duration, Utc};
use sled::{Db, Tree};

const CHECKPOINT_TREE: &str = "checkpoints";
const TIMESTAMP_LEN: usize = std::mem::size_of::<i64>();
pub const DEFAULT_LOOKBACK: Duration = Duration::hours(24);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(#[from] sled::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Checkpoint for {key} is {len} bytes, expected 8")]
    Corrupt { key: String, len: usize },
    #[error("Checkpoint store is closed")]
    Closed,
}

/// Summary of what the store currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub checkpoints: usize,
    pub size_on_disk: u64,
}

struct Inner {
    db: Db,
    tree: Tree,
}

pub struct CheckpointStore {
    path: PathBuf,
    lookback: Duration,
    inner: RwLock<Option<Inner>>,
}

impl CheckpointStore {
    /// Opens (or creates) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            // sled does not create intermediate directories.
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = sled::Config::new().path(&path).open()?;
        Self::from_db(db, path)
    }

    /// In-memory store that is discarded on drop.
    #[cfg(test)]
    pub fn open_temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, PathBuf::new())
    }

    fn from_db(db: Db, path: PathBuf) -> Result<Self, StoreError> {
        let tree = db.open_tree(CHECKPOINT_TREE)?;
        Ok(Self {
            path,
            lookback: DEFAULT_LOOKBACK,
            inner: RwLock::new(Some(Inner { db, tree })),
        })
    }

    /// Sets the window used for containers that have no checkpoint yet.
    #[must_use]
    pub fn with_lookback(mut self, lookback: Duration) -> Self {
        self.lookback = lookback;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_tree<T>(
        &self,
        f: impl FnOnce(&Inner) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(inner) => f(inner),
            None => Err(StoreError::Closed),
        }
    }

    /// Stored checkpoint for `id`, if one was ever written.
    pub fn checkpoint(&self, id: &str) -> Result<Option<i64>, StoreError> {
        self.with_tree(|inner| match inner.tree.get(id.as_bytes())? {
            Some(bytes) => decode(id, &bytes).map(Some),
            None => Ok(None),
        })
    }

    /// Timestamp to resume `id` from. Containers without a checkpoint resume
    /// from the lookback window before now.
    pub fn get_last_log_ts(&self, id: &str) -> Result<i64, StoreError> {
        match self.checkpoint(id)? {
            Some(ts) => Ok(ts),
            None => Ok((Utc::now() - self.lookback).timestamp()),
        }
    }

    /// Records `ts` for `id`. The stored value only moves forward, so writes
    /// racing out of order never rewind a checkpoint.
    pub fn put_last_log_ts(&self, id: &str, ts: i64) -> Result<(), StoreError> {
        self.with_tree(|inner| {
            let mut corrupt = None;
            inner.tree.fetch_and_update(id.as_bytes(), |old| {
                let current = old.and_then(|bytes| match decode(id, bytes) {
                    Ok(current) => Some(current),
                    Err(e) => {
                        corrupt = Some(e);
                        None
                    }
                });
                Some(current.map_or(ts, |current| current.max(ts)).to_le_bytes().to_vec())
            })?;
            if let Some(e) = corrupt {
                log::warn!(target: "splunk_pump::storage", "overwrote unreadable checkpoint: {e}");
            }
            Ok(())
        })
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        self.with_tree(|inner| {
            Ok(StoreStats {
                checkpoints: inner.tree.len(),
                size_on_disk: inner.db.size_on_disk()?,
            })
        })
    }

    /// Flushes pending writes and releases the database. Every later call
    /// fails with [`StoreError::Closed`].
    pub fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match guard.take() {
            Some(inner) => {
                inner.db.flush()?;
                log::info!(target: "splunk_pump::storage", "closed checkpoint store {:?}", self.path);
                Ok(())
            }
            None => Err(StoreError::Closed),
        }
    }
}

fn decode(id: &str, bytes: &[u8]) -> Result<i64, StoreError> {
    let buf: [u8; TIMESTAMP_LEN] = bytes.try_into().map_err(|_| StoreError::Corrupt {
        key: id.to_string(),
        len: bytes.len(),
    })?;
    Ok(i64::from_le_bytes(buf))
}

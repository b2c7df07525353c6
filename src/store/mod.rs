//! The embedded log-structured KV store and its parts.

use std::collections::HashSet;
use std::fmt;

use crate::Result;

mod bitcask;
mod keydir;
mod segment;
mod snapshot;

pub use self::bitcask::Bitcask;
pub use self::keydir::{Keydir, Loc, KEYDIR_SHARDS};

/// Default soft cap on a segment file before the writer rotates.
pub const DEFAULT_SEGMENT_CAP: u64 = 2 * 1024 * 1024 * 1024;

/// Default number of orphaned keydir locations that triggers compaction.
pub const DEFAULT_COMPACTION_THRESHOLD: i64 = 1 << 17;

/// Defines the storage interface the catalog layers its indexes over.
///
/// One store holds keys of a single fixed width. Readers may run in
/// parallel; writers serialize on the store's active-log lock.
pub trait KvStore: Clone + Send + Sync + 'static {
    /// Append `value` to the active log and point `key` at it, replacing
    /// any existing locations.
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Add `value` under `key`. A value already stored under `key` with
    /// equal bytes makes this a no-op.
    fn append(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Value bytes at the key's first location, `None` if absent.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Ordered concatenation of `key[prefix.len()..]` for every live key
    /// starting with `prefix`.
    fn key_suffixes_for(&self, prefix: &[u8]) -> Result<Vec<u8>>;

    /// Cheap keydir probe.
    fn exists(&self, key: &[u8]) -> Result<bool>;

    /// Append a tombstone and drop the key. Absent keys are a no-op.
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Walk all live (key, value) pairs. Returning `false` stops early.
    fn iterate(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>) -> Result<()>;

    /// A fresh batch of staged operations for this store.
    fn start_batch(&self) -> Batch {
        Batch::default()
    }

    /// Apply a batch: one contiguous run of log appends, keydir updated
    /// last. On error nothing staged becomes visible.
    fn write_batch(&self, batch: Batch) -> Result<()>;

    /// Mark every current key as a sweep candidate; `set` operations until
    /// [`KvStore::end_refresh`] unmark keys they touch.
    fn begin_refresh(&self) -> Result<()>;

    /// Delete the keys still marked since [`KvStore::begin_refresh`];
    /// returns how many were swept.
    fn end_refresh(&self) -> Result<u64>;

    /// Number of live keys.
    fn len(&self) -> u64;

    /// True when no key is live.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// fsync the active log, rotate it, and save a keydir snapshot.
    fn flush(&self) -> Result<()>;

    /// Flush, then refuse further writes with [`crate::RombaError::Closed`].
    fn close(&self) -> Result<()>;

    /// Size, orphaned count and file counts.
    fn stats(&self) -> Result<StoreStats>;
}

/// Construction parameters for a store.
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Fixed key width for this store.
    pub key_size: u16,
    /// Soft cap on a segment file before rotation.
    pub segment_cap: u64,
    /// Orphaned-location count that triggers compaction; negative disables.
    pub compaction_threshold: i64,
}

impl StoreOptions {
    /// Options with defaults for keys of width `key_size`.
    pub fn new(key_size: u16) -> StoreOptions {
        StoreOptions {
            key_size,
            segment_cap: DEFAULT_SEGMENT_CAP,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
        }
    }

    /// Override the segment soft cap.
    pub fn segment_cap(mut self, cap: u64) -> StoreOptions {
        self.segment_cap = cap;
        self
    }

    /// Override the compaction trigger.
    pub fn compaction_threshold(mut self, threshold: i64) -> StoreOptions {
        self.compaction_threshold = threshold;
        self
    }
}

/// A staged operation inside a [`Batch`].
#[derive(Debug, Clone)]
pub(crate) enum BatchOp {
    Set { key: Vec<u8>, value: Vec<u8> },
    Append { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// In-memory staged operations, applied atomically by
/// [`KvStore::write_batch`].
///
/// `size` tracks the staged key and value bytes so callers can bound how
/// much a batch accumulates before flushing.
#[derive(Debug, Default)]
pub struct Batch {
    pub(crate) ops: Vec<BatchOp>,
    appended: HashSet<Vec<u8>>,
    size: u64,
}

impl Batch {
    /// Stage a set.
    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        self.size += (key.len() + value.len()) as u64;
        self.ops.push(BatchOp::Set {
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    /// Stage an append. Duplicate (key, value) pairs within the batch
    /// collapse to one.
    pub fn append(&mut self, key: &[u8], value: &[u8]) {
        let mut fingerprint = Vec::with_capacity(key.len() + value.len());
        fingerprint.extend_from_slice(key);
        fingerprint.extend_from_slice(value);
        if !self.appended.insert(fingerprint) {
            return;
        }
        self.size += (key.len() + value.len()) as u64;
        self.ops.push(BatchOp::Append {
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    /// Stage a delete.
    pub fn delete(&mut self, key: &[u8]) {
        self.size += key.len() as u64;
        self.ops.push(BatchOp::Delete { key: key.to_vec() });
    }

    /// Staged bytes across all operations.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of staged operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Counters reported by [`KvStore::stats`].
#[derive(Debug, Clone, Copy)]
pub struct StoreStats {
    /// Live keys.
    pub keys: u64,
    /// Orphaned locations awaiting compaction.
    pub orphaned: i64,
    /// Segment files on disk.
    pub segments: usize,
    /// Total bytes across segment files.
    pub disk_bytes: u64,
}

impl fmt::Display for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} keys, {} orphaned, {} segments, {} bytes on disk",
            self.keys, self.orphaned, self.segments, self.disk_bytes
        )
    }
}

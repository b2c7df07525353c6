use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

/// Number of keydir partitions. A small prime keeps the shard spread even
/// for hash-shaped keys.
pub const KEYDIR_SHARDS: usize = 13;

/// A position in the value log.
///
/// `vpos` references the start of the value bytes; `vsize` is repeated here
/// so a random get needs exactly one positioned read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Loc {
    /// Segment file id the value lives in.
    pub file_id: i32,
    /// Byte offset of the value within the segment.
    pub vpos: i32,
    /// Byte length of the value.
    pub vsize: i32,
}

/// In-memory map from fixed-width keys to lists of log locations,
/// partitioned into [`KEYDIR_SHARDS`] shards with independent locks.
///
/// Readers and writers on different shards never contend. Multi-valued
/// entries model the one-to-many rom-to-dats relation directly.
pub struct Keydir {
    shards: Vec<RwLock<HashMap<Vec<u8>, Vec<Loc>>>>,
    key_size: u16,
    orphaned: AtomicI64,
}

fn shard_of(key: &[u8]) -> usize {
    debug_assert!(key.len() >= 2);
    ((key[1] as usize) << 8 | key[0] as usize) % KEYDIR_SHARDS
}

impl Keydir {
    /// An empty keydir for keys of the given fixed width.
    pub fn new(key_size: u16) -> Keydir {
        let shards = (0..KEYDIR_SHARDS).map(|_| RwLock::new(HashMap::new())).collect();
        Keydir {
            shards,
            key_size,
            orphaned: AtomicI64::new(0),
        }
    }

    /// The fixed key width this keydir was built for.
    pub fn key_size(&self) -> u16 {
        self.key_size
    }

    /// Locations for `key`, empty if absent. Returns a copy; the shard read
    /// lock is held only for the lookup.
    pub fn get(&self, key: &[u8]) -> Vec<Loc> {
        let shard = self.shards[shard_of(key)].read().unwrap();
        shard.get(key).cloned().unwrap_or_default()
    }

    /// True if `key` has at least one live location.
    pub fn contains(&self, key: &[u8]) -> bool {
        let shard = self.shards[shard_of(key)].read().unwrap();
        shard.contains_key(key)
    }

    /// Replace any existing list with `[loc]`. Displaced locations count as
    /// orphaned bytes in the log.
    pub fn put(&self, key: &[u8], loc: Loc) {
        let mut shard = self.shards[shard_of(key)].write().unwrap();
        if let Some(old) = shard.insert(key.to_vec(), vec![loc]) {
            self.orphaned.fetch_add(old.len() as i64, Ordering::Relaxed);
        }
    }

    /// Append `loc` to the list for `key`, creating the entry if absent.
    pub fn append(&self, key: &[u8], loc: Loc) {
        let mut shard = self.shards[shard_of(key)].write().unwrap();
        shard.entry(key.to_vec()).or_default().push(loc);
    }

    /// Remove the entry for `key`. Its locations count as orphaned.
    pub fn delete(&self, key: &[u8]) {
        let mut shard = self.shards[shard_of(key)].write().unwrap();
        if let Some(old) = shard.remove(key) {
            self.orphaned.fetch_add(old.len() as i64, Ordering::Relaxed);
        }
    }

    /// Drop all locations older than `min_file_id`; entries left without a
    /// location disappear. Called after compaction has rewritten live values.
    pub fn forget_past(&self, min_file_id: i32) {
        for lock in &self.shards {
            let mut shard = lock.write().unwrap();
            shard.retain(|_, locs| {
                locs.retain(|loc| loc.file_id >= min_file_id);
                !locs.is_empty()
            });
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> u64 {
        self.shards.iter().map(|s| s.read().unwrap().len() as u64).sum()
    }

    /// True when no key is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of locations displaced by put/delete since the last compaction.
    pub fn orphaned(&self) -> i64 {
        self.orphaned.load(Ordering::Relaxed)
    }

    /// Reset the orphaned counter (after compaction, or when loading a
    /// snapshot that recorded its own count).
    pub fn set_orphaned(&self, n: i64) {
        self.orphaned.store(n, Ordering::Relaxed);
    }

    /// All keys starting with `prefix`, unordered.
    pub fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for lock in &self.shards {
            let shard = lock.read().unwrap();
            out.extend(shard.keys().filter(|k| k.starts_with(prefix)).cloned());
        }
        out
    }

    /// Visit every entry. Shards are walked one at a time under their read
    /// lock; `f` must not call back into this keydir.
    pub fn for_each(&self, f: &mut dyn FnMut(&[u8], &[Loc])) {
        for lock in &self.shards {
            let shard = lock.read().unwrap();
            for (key, locs) in shard.iter() {
                f(key, locs);
            }
        }
    }
}

use std::collections::HashSet;
use std::fs::{self, File};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use dashmap::DashMap;
use log::{error, info, warn};

use crate::error::{RombaError, Result};
use crate::store::keydir::{Keydir, Loc};
use crate::store::segment::{
    data_path, replay_segment, sorted_file_ids, LogWriter, TAG_APPEND, TAG_DELETE, TAG_SET,
};
use crate::store::snapshot::{
    load_snapshot, snapshot_path, snapshot_sha1_path, sorted_snapshot_ids, write_snapshot,
};
use crate::store::{Batch, BatchOp, KvStore, StoreOptions, StoreStats};

/// The one KV engine: append-only `data.<N>` segments under a directory,
/// a sharded in-memory [`Keydir`], and checksummed keydir snapshots.
///
/// Writers serialize on the active-log lock; reads go through per-segment
/// pread handles and the keydir's shard locks and never block each other.
#[derive(Clone)]
pub struct Bitcask {
    inner: Arc<Inner>,
}

struct Inner {
    dir: PathBuf,
    opts: StoreOptions,
    keydir: Keydir,
    /// `None` once the store is closed.
    writer: Mutex<Option<LogWriter>>,
    /// Shared read-only handles per segment, opened lazily.
    readers: DashMap<i32, Arc<File>>,
    /// Keys marked by `begin_refresh` and not yet re-set.
    doomed: Mutex<Option<HashSet<Vec<u8>>>>,
}

/// What a staged batch op resolved to once its record hit the log.
enum Staged<'a> {
    Put(&'a [u8], Loc),
    Append(&'a [u8], Loc),
    Delete(&'a [u8]),
}

impl Bitcask {
    /// Open the store at `dir`, creating the directory if needed.
    ///
    /// Recovery order: newest verifiable keydir snapshot first, then replay
    /// of every younger segment. With no usable snapshot the keydir is
    /// rebuilt from the logs start to end.
    pub fn open(dir: impl Into<PathBuf>, opts: StoreOptions) -> Result<Bitcask> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let data_ids = sorted_file_ids(&dir)?;

        let mut keydir = None;
        let mut covered = -1;
        for &sid in sorted_snapshot_ids(&dir)?.iter().rev() {
            match load_snapshot(&dir, sid, opts.key_size) {
                Ok(kd) => {
                    keydir = Some(kd);
                    covered = sid;
                    break;
                }
                Err(e) => warn!("skipping keydir snapshot {} in {:?}: {}", sid, dir, e),
            }
        }
        let keydir = keydir.unwrap_or_else(|| Keydir::new(opts.key_size));

        let replay: Vec<i32> = data_ids.iter().copied().filter(|&id| id > covered).collect();
        let last = replay.last().copied();
        for id in replay {
            replay_segment(&dir, id, opts.key_size, Some(id) == last, &mut |tag, key, loc| {
                match tag {
                    TAG_SET => keydir.put(key, loc),
                    TAG_APPEND => keydir.append(key, loc),
                    _ => keydir.delete(key),
                }
            })?;
        }

        let active = data_ids.last().copied().unwrap_or(-1).max(covered) + 1;
        let writer = LogWriter::open(&dir, active)?;

        Ok(Bitcask {
            inner: Arc::new(Inner {
                dir,
                opts,
                keydir,
                writer: Mutex::new(Some(writer)),
                readers: DashMap::new(),
                doomed: Mutex::new(None),
            }),
        })
    }

    /// Copy all live values into a fresh segment, repoint the keydir and
    /// delete the stale segments and snapshots.
    pub fn compact(&self) -> Result<()> {
        let mut slot = self.inner.writer.lock().unwrap();
        if slot.is_none() {
            return Err(RombaError::Closed);
        }
        self.inner.compact_locked(&mut slot)
    }

    /// The directory this store lives in.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }
}

impl Inner {
    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.opts.key_size as usize {
            return Err(RombaError::Msg(format!(
                "key width {} does not match store width {}",
                key.len(),
                self.opts.key_size
            )));
        }
        Ok(())
    }

    fn read_value(&self, loc: Loc) -> Result<Vec<u8>> {
        let file = match self.readers.get(&loc.file_id) {
            Some(f) => Arc::clone(&f),
            None => {
                let f = Arc::new(File::open(data_path(&self.dir, loc.file_id))?);
                self.readers.insert(loc.file_id, Arc::clone(&f));
                f
            }
        };
        let mut buf = vec![0u8; loc.vsize as usize];
        file.read_exact_at(&mut buf, loc.vpos as u64)?;
        Ok(buf)
    }

    /// True if `value` is already stored under `key` with equal bytes.
    fn has_equal_value(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        for loc in self.keydir.get(key) {
            if loc.vsize as usize == value.len() && self.read_value(loc)? == value {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn unmark(&self, key: &[u8]) {
        if let Some(doomed) = self.doomed.lock().unwrap().as_mut() {
            doomed.remove(key);
        }
    }

    /// Rotate when the active segment passed the soft cap, then compact
    /// when enough locations have been orphaned. Both need the writer slot.
    fn maintain(&self, slot: &mut Option<LogWriter>) -> Result<()> {
        let w = slot.as_mut().expect("writer present");
        if w.pos() >= self.opts.segment_cap {
            w.sync()?;
            let closed = w.file_id();
            write_snapshot(&self.dir, closed, &self.keydir)?;
            *slot = Some(LogWriter::open(&self.dir, closed + 1)?);
        }
        if self.opts.compaction_threshold >= 0
            && self.keydir.orphaned() > self.opts.compaction_threshold
        {
            let now = SystemTime::now();
            info!("compaction starts in {:?}", self.dir);
            self.compact_locked(slot)?;
            info!("compaction finished, cost {:?}", now.elapsed().unwrap_or_default());
        }
        Ok(())
    }

    fn compact_locked(&self, slot: &mut Option<LogWriter>) -> Result<()> {
        let active = slot.as_mut().expect("writer present");
        active.sync()?;
        let compaction_id = active.file_id() + 1;
        let new_active = active.file_id() + 2;

        let mut cw = LogWriter::open(&self.dir, compaction_id)?;

        let mut entries: Vec<(Vec<u8>, Vec<Loc>)> = Vec::new();
        self.keydir.for_each(&mut |key, locs| entries.push((key.to_vec(), locs.to_vec())));

        for (key, locs) in &entries {
            let mut fresh = Vec::with_capacity(locs.len());
            for (i, loc) in locs.iter().enumerate() {
                let value = self.read_value(*loc)?;
                let tag = if i == 0 { TAG_SET } else { TAG_APPEND };
                fresh.push(cw.append_record(tag, key, &value)?);
            }
            let mut fresh = fresh.into_iter();
            if let Some(first) = fresh.next() {
                self.keydir.put(key, first);
            }
            for loc in fresh {
                self.keydir.append(key, loc);
            }
        }
        cw.sync()?;

        self.keydir.forget_past(compaction_id);
        self.keydir.set_orphaned(0);
        write_snapshot(&self.dir, compaction_id, &self.keydir)?;

        *slot = Some(LogWriter::open(&self.dir, new_active)?);

        // Stale segments may survive a failed unlink while readers hold
        // handles; the next compaction retries.
        self.readers.retain(|&id, _| id >= compaction_id);
        for id in sorted_file_ids(&self.dir)? {
            if id < compaction_id {
                let path = data_path(&self.dir, id);
                if let Err(e) = fs::remove_file(&path) {
                    error!("{:?} cannot be deleted: {}", path, e);
                }
            }
        }
        for id in sorted_snapshot_ids(&self.dir)? {
            if id < compaction_id {
                for path in [snapshot_path(&self.dir, id), snapshot_sha1_path(&self.dir, id)] {
                    if let Err(e) = fs::remove_file(&path) {
                        error!("{:?} cannot be deleted: {}", path, e);
                    }
                }
            }
        }

        Ok(())
    }
}

impl KvStore for Bitcask {
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.check_key(key)?;
        let mut slot = self.inner.writer.lock().unwrap();
        let w = slot.as_mut().ok_or(RombaError::Closed)?;
        let loc = w.append_record(TAG_SET, key, value)?;
        self.inner.keydir.put(key, loc);
        self.inner.unmark(key);
        self.inner.maintain(&mut slot)
    }

    fn append(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.check_key(key)?;
        let mut slot = self.inner.writer.lock().unwrap();
        let w = slot.as_mut().ok_or(RombaError::Closed)?;
        if self.inner.has_equal_value(key, value)? {
            return Ok(());
        }
        let loc = w.append_record(TAG_APPEND, key, value)?;
        self.inner.keydir.append(key, loc);
        self.inner.maintain(&mut slot)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.inner.keydir.get(key).first() {
            Some(&loc) => Ok(Some(self.inner.read_value(loc)?)),
            None => Ok(None),
        }
    }

    fn key_suffixes_for(&self, prefix: &[u8]) -> Result<Vec<u8>> {
        let mut keys = self.inner.keydir.keys_with_prefix(prefix);
        keys.sort_unstable();
        let suffix_len = (self.inner.opts.key_size as usize).saturating_sub(prefix.len());
        let mut out = Vec::with_capacity(keys.len() * suffix_len);
        for key in keys {
            out.extend_from_slice(&key[prefix.len()..]);
        }
        Ok(out)
    }

    fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.inner.keydir.contains(key))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.check_key(key)?;
        let mut slot = self.inner.writer.lock().unwrap();
        let w = slot.as_mut().ok_or(RombaError::Closed)?;
        if !self.inner.keydir.contains(key) {
            return Ok(());
        }
        w.append_record(TAG_DELETE, key, &[])?;
        self.inner.keydir.delete(key);
        self.inner.unmark(key);
        self.inner.maintain(&mut slot)
    }

    fn iterate(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>) -> Result<()> {
        let mut entries: Vec<(Vec<u8>, Vec<Loc>)> = Vec::new();
        self.inner.keydir.for_each(&mut |key, locs| entries.push((key.to_vec(), locs.to_vec())));
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        for (key, locs) in entries {
            for loc in locs {
                let value = self.inner.read_value(loc)?;
                if !f(&key, &value)? {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn write_batch(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut slot = self.inner.writer.lock().unwrap();
        let w = slot.as_mut().ok_or(RombaError::Closed)?;
        let start = w.pos();

        let mut staged: Vec<Staged<'_>> = Vec::with_capacity(batch.ops.len());
        let mut failure: Option<RombaError> = None;

        for op in &batch.ops {
            let res = (|| -> Result<()> {
                match op {
                    BatchOp::Set { key, value } => {
                        self.inner.check_key(key)?;
                        let loc = w.append_record(TAG_SET, key, value)?;
                        staged.push(Staged::Put(key, loc));
                    }
                    BatchOp::Append { key, value } => {
                        self.inner.check_key(key)?;
                        if !self.inner.has_equal_value(key, value)? {
                            let loc = w.append_record(TAG_APPEND, key, value)?;
                            staged.push(Staged::Append(key, loc));
                        }
                    }
                    BatchOp::Delete { key } => {
                        self.inner.check_key(key)?;
                        if self.inner.keydir.contains(key) {
                            w.append_record(TAG_DELETE, key, &[])?;
                            staged.push(Staged::Delete(key));
                        }
                    }
                }
                Ok(())
            })();
            if let Err(e) = res {
                failure = Some(e);
                break;
            }
        }

        if let Some(e) = failure {
            // unwind so a restart cannot replay half a batch
            if let Err(t) = w.truncate_to(start) {
                error!("could not unwind failed batch in {:?}: {}", self.inner.dir, t);
            }
            return Err(e);
        }

        // the batch becomes visible here, after every record is in the log
        for op in staged {
            match op {
                Staged::Put(key, loc) => {
                    self.inner.keydir.put(key, loc);
                    self.inner.unmark(key);
                }
                Staged::Append(key, loc) => self.inner.keydir.append(key, loc),
                Staged::Delete(key) => {
                    self.inner.keydir.delete(key);
                    self.inner.unmark(key);
                }
            }
        }

        self.inner.maintain(&mut slot)
    }

    fn begin_refresh(&self) -> Result<()> {
        let mut marks = HashSet::new();
        self.inner.keydir.for_each(&mut |key, _| {
            marks.insert(key.to_vec());
        });
        *self.inner.doomed.lock().unwrap() = Some(marks);
        Ok(())
    }

    fn end_refresh(&self) -> Result<u64> {
        let doomed = match self.inner.doomed.lock().unwrap().take() {
            Some(doomed) => doomed,
            None => return Ok(0),
        };
        let mut swept = 0;
        for key in doomed {
            self.delete(&key)?;
            swept += 1;
        }
        Ok(swept)
    }

    fn len(&self) -> u64 {
        self.inner.keydir.len()
    }

    fn flush(&self) -> Result<()> {
        let mut slot = self.inner.writer.lock().unwrap();
        let w = slot.as_mut().ok_or(RombaError::Closed)?;
        w.sync()?;
        let closed = w.file_id();
        write_snapshot(&self.inner.dir, closed, &self.inner.keydir)?;
        *slot = Some(LogWriter::open(&self.inner.dir, closed + 1)?);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut slot = self.inner.writer.lock().unwrap();
        let w = match slot.as_mut() {
            Some(w) => w,
            None => return Ok(()),
        };
        w.sync()?;
        write_snapshot(&self.inner.dir, w.file_id(), &self.inner.keydir)?;
        *slot = None;
        Ok(())
    }

    fn stats(&self) -> Result<StoreStats> {
        let ids = sorted_file_ids(&self.inner.dir)?;
        let mut disk_bytes = 0;
        for &id in &ids {
            disk_bytes += fs::metadata(data_path(&self.inner.dir, id))?.len();
        }
        Ok(StoreStats {
            keys: self.inner.keydir.len(),
            orphaned: self.inner.keydir.orphaned(),
            segments: ids.len(),
            disk_bytes,
        })
    }
}

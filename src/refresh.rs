//! Scanning a DAT tree into the catalog.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread;

use log::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::catalog::{RomDb, MAX_BATCH_SIZE};
use crate::error::{RombaError, Result};
use crate::parse::DatParser;
use crate::store::KvStore;

/// Default size of the parse worker pool.
pub const DEFAULT_WORKERS: usize = 4;

/// File extensions accepted as DAT files.
pub const DAT_EXTENSIONS: &[&str] = &["dat", "xml"];

/// Counters from one refresh pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshStats {
    /// DAT files dispatched to workers.
    pub files: u64,
    /// Dats actually indexed.
    pub indexed: u64,
    /// Dat rows swept because their file disappeared from the tree.
    pub swept: u64,
    /// True when the pass stopped at the cancellation token.
    pub cancelled: bool,
}

/// Drives a full refresh: orphan, walk, parse in parallel, batch-index,
/// sweep what was not seen.
pub struct Refresher<P> {
    parser: P,
    workers: usize,
    cancel: Arc<AtomicBool>,
}

impl<P: DatParser> Refresher<P> {
    /// A refresher over `parser` with the default worker count.
    pub fn new(parser: P) -> Refresher<P> {
        Refresher {
            parser,
            workers: DEFAULT_WORKERS,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set the worker count (at least one).
    pub fn workers(mut self, workers: usize) -> Refresher<P> {
        self.workers = workers.max(1);
        self
    }

    /// Token another thread may set to stop the pass; the driver checks it
    /// between files.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Run one refresh pass over the DAT tree at `dats_root`.
    ///
    /// Every dat found is re-indexed at a fresh generation. Dats absent
    /// from the tree are deleted at the end of a complete pass; a
    /// cancelled or failed pass leaves them orphaned but stored.
    pub fn run<S: KvStore>(&self, db: &RomDb<S>, dats_root: &Path) -> Result<RefreshStats> {
        let generation = db.orphan_dats()?;
        db.begin_dat_refresh()?;
        info!("refresh of {:?} at generation {}", dats_root, generation);

        let abort = AtomicBool::new(false);
        let (files, indexed, cancelled) = thread::scope(|scope| {
            let mut senders = Vec::with_capacity(self.workers);
            let mut handles = Vec::with_capacity(self.workers);
            for id in 0..self.workers {
                let (tx, rx) = sync_channel::<PathBuf>(64);
                senders.push(tx);
                let parser = &self.parser;
                let abort = &abort;
                handles.push(scope.spawn(move || worker_loop(id, db, parser, rx, abort)));
            }

            let mut files: u64 = 0;
            let mut cancelled = false;
            for entry in WalkDir::new(dats_root) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("skipping unreadable path: {}", e);
                        continue;
                    }
                };
                if !entry.file_type().is_file() || !accepted(entry.path()) {
                    continue;
                }
                if self.cancel.load(Ordering::SeqCst) {
                    warn!("refresh cancelled after {} files", files);
                    cancelled = true;
                    break;
                }
                if abort.load(Ordering::SeqCst) {
                    break;
                }
                let _ = senders[files as usize % self.workers].send(entry.into_path());
                files += 1;
            }
            drop(senders);

            let mut indexed: u64 = 0;
            let mut first_err: Option<RombaError> = None;
            for handle in handles {
                match handle.join() {
                    Ok(Ok(count)) => indexed += count,
                    Ok(Err(e)) => {
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                    }
                    Err(_) => {
                        if first_err.is_none() {
                            first_err = Some(RombaError::Msg("refresh worker panicked".to_owned()));
                        }
                    }
                }
            }
            match first_err {
                Some(e) => Err(e),
                None => Ok((files, indexed, cancelled)),
            }
        })?;

        let swept = if cancelled { 0 } else { db.end_dat_refresh()? };
        info!(
            "refresh done: {} files, {} dats indexed, {} dat rows swept",
            files, indexed, swept
        );
        Ok(RefreshStats {
            files,
            indexed,
            swept,
            cancelled,
        })
    }
}

fn accepted(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| DAT_EXTENSIONS.iter().any(|want| ext.eq_ignore_ascii_case(want)))
        .unwrap_or(false)
}

fn worker_loop<S: KvStore, P: DatParser>(
    id: usize,
    db: &RomDb<S>,
    parser: &P,
    rx: Receiver<PathBuf>,
    abort: &AtomicBool,
) -> Result<u64> {
    let mut batch = db.start_batch();
    let mut indexed: u64 = 0;

    for path in rx {
        let res = parser.parse(&path).and_then(|(dat, sha1)| {
            debug!("worker {} indexing {:?}", id, path);
            batch.index_dat(&dat, Some(&sha1))
        });
        if let Err(e) = res {
            abort.store(true, Ordering::SeqCst);
            error!("refresh worker {} failed on {:?}: {}", id, path, e);
            // staged-but-unflushed work is dropped with the batch
            return Err(e);
        }
        indexed += 1;

        if batch.size() >= MAX_BATCH_SIZE {
            if let Err(e) = batch.flush() {
                abort.store(true, Ordering::SeqCst);
                error!("refresh worker {} could not flush: {}", id, e);
                return Err(e);
            }
        }
    }

    batch.close()?;
    Ok(indexed)
}

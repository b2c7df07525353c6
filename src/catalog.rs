//! The catalog: six logical indexes layered over KV stores.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use log::info;

use crate::error::{RombaError, Result};
use crate::keys::{
    crc_with_size_and_sha1_key, crc_with_size_key, md5_with_size_and_sha1_key, md5_with_size_key,
    sha1_sha1_key, CRCSHA1_KEY_SIZE, CRC_KEY_SIZE, DATS_KEY_SIZE, MD5SHA1_KEY_SIZE, MD5_KEY_SIZE,
    SHA1_KEY_SIZE, SIZE_FIELD,
};
use crate::model::{Dat, Rom, CRC_SIZE, MD5_SIZE, SHA1_SIZE};
use crate::store::{Batch, Bitcask, KvStore, StoreOptions};

/// Flush threshold for a [`RomBatch`], in staged bytes.
pub const MAX_BATCH_SIZE: u64 = 10 * 1024 * 1024;

/// How many generations behind current a dat must be before
/// [`RomDb::sweep_orphans`] deletes it.
pub const GENERATION_SWEEP_LAG: i64 = 1;

const GENERATION_FILE: &str = "romba-generation";

/// The byte stored under every index key.
const INDEX_VALUE: &[u8] = &[1];

/// Subdirectory and key width per index.
const INDEXES: [(&str, usize); 6] = [
    ("dats_db", DATS_KEY_SIZE),
    ("sha1_db", SHA1_KEY_SIZE),
    ("crc_db", CRC_KEY_SIZE),
    ("md5_db", MD5_KEY_SIZE),
    ("crcsha1_db", CRCSHA1_KEY_SIZE),
    ("md5sha1_db", MD5SHA1_KEY_SIZE),
];

/// Consumer of the rom stream produced by [`RomDb::join_crc_md5`].
///
/// `declare` must be idempotent; returning an error aborts the iteration.
pub trait Combiner {
    /// Take note of one reconstructed rom.
    fn declare(&mut self, rom: &Rom) -> Result<()>;
}

/// The multi-hash DAT catalog.
///
/// Six KV stores under one root directory, plus the generation counter
/// persisted as ASCII decimal in `romba-generation`. Construction goes
/// through a store factory; [`RomDb::open`] wires the default engine.
#[derive(Clone)]
pub struct RomDb<S: KvStore = Bitcask> {
    root: PathBuf,
    generation: Arc<AtomicI64>,
    gen_lock: Arc<Mutex<()>>,
    dats: S,
    sha1: S,
    crc: S,
    md5: S,
    crcsha1: S,
    md5sha1: S,
}

impl RomDb<Bitcask> {
    /// Open a catalog at `root` backed by [`Bitcask`] stores.
    pub fn open(root: impl Into<PathBuf>) -> Result<RomDb<Bitcask>> {
        RomDb::open_with(root, |dir, key_size| Bitcask::open(dir, StoreOptions::new(key_size)))
    }
}

impl<S: KvStore> RomDb<S> {
    /// Open a catalog at `root`, building each index store with `factory`.
    ///
    /// The factory receives the index directory and the fixed key width for
    /// that index.
    pub fn open_with<F>(root: impl Into<PathBuf>, factory: F) -> Result<RomDb<S>>
    where
        F: Fn(&Path, u16) -> Result<S>,
    {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let generation = read_generation(&root)?;

        let mut stores = INDEXES
            .iter()
            .map(|&(name, key_size)| factory(&root.join(name), key_size as u16))
            .collect::<Result<Vec<S>>>()?
            .into_iter();

        Ok(RomDb {
            root,
            generation: Arc::new(AtomicI64::new(generation)),
            gen_lock: Arc::new(Mutex::new(())),
            dats: stores.next().expect("six stores"),
            sha1: stores.next().expect("six stores"),
            crc: stores.next().expect("six stores"),
            md5: stores.next().expect("six stores"),
            crcsha1: stores.next().expect("six stores"),
            md5sha1: stores.next().expect("six stores"),
        })
    }

    /// The catalog root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The current refresh generation.
    pub fn generation(&self) -> i64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Advance the generation and persist it. Every dat indexed before this
    /// call is orphaned: still stored, but filtered from
    /// [`RomDb::dats_for_rom`] until re-indexed.
    pub fn orphan_dats(&self) -> Result<i64> {
        let _guard = self.gen_lock.lock().unwrap();
        let next = self.generation.load(Ordering::SeqCst) + 1;
        write_generation(&self.root, next)?;
        self.generation.store(next, Ordering::SeqCst);
        Ok(next)
    }

    /// Index a dat under its SHA1 identity. See [`RomBatch::index_dat`].
    pub fn index_dat(&self, dat: &Dat, sha1_bytes: Option<&[u8]>) -> Result<()> {
        let mut batch = self.start_batch();
        batch.index_dat(dat, sha1_bytes)?;
        batch.close()
    }

    /// Record the crc→sha1 / md5→sha1 mappings of a loose rom. See
    /// [`RomBatch::index_rom`].
    pub fn index_rom(&self, rom: &Rom) -> Result<()> {
        let mut batch = self.start_batch();
        batch.index_rom(rom)?;
        batch.close()
    }

    /// Decode the dat stored under `sha1_bytes`, `None` if absent.
    pub fn get_dat(&self, sha1_bytes: &[u8]) -> Result<Option<Dat>> {
        match self.dats.get(sha1_bytes)? {
            Some(bytes) => Ok(Some(Dat::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All dats of the current generation that reference `rom`, looked up
    /// through whichever hashes the rom carries. Ordered by dat SHA1,
    /// deduplicated.
    pub fn dats_for_rom(&self, rom: &Rom) -> Result<Vec<Dat>> {
        let current = self.generation();
        let mut dats = Vec::new();
        for key in self.dat_keys_for_rom(rom)? {
            if let Some(dat) = self.get_dat(&key)? {
                if dat.generation == current {
                    dats.push(dat);
                }
            }
        }
        Ok(dats)
    }

    /// Like [`RomDb::dats_for_rom`], but without the generation filter:
    /// every stored dat referencing `rom` is partitioned by `pred` into
    /// (accepted, rejected).
    pub fn filtered_dats_for_rom(
        &self,
        rom: &Rom,
        pred: impl Fn(&Dat) -> bool,
    ) -> Result<(Vec<Dat>, Vec<Dat>)> {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for key in self.dat_keys_for_rom(rom)? {
            if let Some(dat) = self.get_dat(&key)? {
                if pred(&dat) {
                    accepted.push(dat);
                } else {
                    rejected.push(dat);
                }
            }
        }
        Ok((accepted, rejected))
    }

    /// Unique dat SHA1s referencing `rom`, in suffix-lexicographic order
    /// per index, sha1 index first.
    fn dat_keys_for_rom(&self, rom: &Rom) -> Result<Vec<Vec<u8>>> {
        let mut keys: Vec<Vec<u8>> = Vec::new();
        let mut seen: HashSet<Vec<u8>> = HashSet::new();

        let mut collect = |suffixes: Vec<u8>| {
            for chunk in suffixes.chunks(SHA1_SIZE) {
                if seen.insert(chunk.to_vec()) {
                    keys.push(chunk.to_vec());
                }
            }
        };

        if let Some(sha1) = rom.sha1.as_deref() {
            collect(self.sha1.key_suffixes_for(sha1)?);
        }
        if let Some(prefix) = md5_with_size_key(rom) {
            collect(self.md5.key_suffixes_for(&prefix)?);
        }
        if let Some(prefix) = crc_with_size_key(rom) {
            collect(self.crc.key_suffixes_for(&prefix)?);
        }
        Ok(keys)
    }

    /// Fill in `rom.sha1` from the crc∥size or md5∥size mappings when it is
    /// absent. Extra mappings (same partial hash, different sha1) come back
    /// as alternate roms.
    pub fn complete_rom(&self, rom: &mut Rom) -> Result<Vec<Rom>> {
        if rom.sha1.is_some() {
            return Ok(Vec::new());
        }

        let mut suffixes = Vec::new();
        if let Some(prefix) = crc_with_size_key(rom) {
            suffixes = self.crcsha1.key_suffixes_for(&prefix)?;
        }
        if suffixes.is_empty() {
            if let Some(prefix) = md5_with_size_key(rom) {
                suffixes = self.md5sha1.key_suffixes_for(&prefix)?;
            }
        }

        let mut chunks = suffixes.chunks(SHA1_SIZE);
        if let Some(first) = chunks.next() {
            rom.sha1 = Some(first.to_vec());
        }
        Ok(chunks
            .map(|chunk| {
                let mut alt = rom.clone();
                alt.sha1 = Some(chunk.to_vec());
                alt
            })
            .collect())
    }

    /// SHA1s recorded for a partial hash: 4 bytes resolve through crcsha1,
    /// 16 through md5sha1; a 20-byte hash already is the answer.
    pub fn resolve_hash(&self, hash: &[u8]) -> Result<Vec<Vec<u8>>> {
        let suffixes = match hash.len() {
            CRC_SIZE => self.crcsha1.key_suffixes_for(hash)?,
            MD5_SIZE => self.md5sha1.key_suffixes_for(hash)?,
            SHA1_SIZE => return Ok(vec![hash.to_vec()]),
            n => return Err(RombaError::UnknownHashSize(n)),
        };
        Ok(suffixes
            .chunks(SIZE_FIELD + SHA1_SIZE)
            .map(|chunk| chunk[SIZE_FIELD..].to_vec())
            .collect())
    }

    /// Stream every rom reconstructible from the crcsha1 and md5sha1 keys
    /// into `combiner`. A declare error aborts the iteration.
    pub fn join_crc_md5(&self, combiner: &mut dyn Combiner) -> Result<()> {
        self.crcsha1.iterate(&mut |key, _| {
            combiner.declare(&rom_from_mapping_key(key, true))?;
            Ok(true)
        })?;
        self.md5sha1.iterate(&mut |key, _| {
            combiner.declare(&rom_from_mapping_key(key, false))?;
            Ok(true)
        })
    }

    /// Decode and visit every stored dat. Returning `false` stops early.
    pub fn for_each_dat(&self, f: &mut dyn FnMut(&Dat) -> Result<bool>) -> Result<()> {
        self.dats.iterate(&mut |_, value| {
            let dat = Dat::from_bytes(value)?;
            f(&dat)
        })
    }

    /// Number of rom→dat rows in the sha1 index.
    pub fn num_roms(&self) -> u64 {
        self.sha1.len()
    }

    /// Mark every stored dat as a sweep candidate for the running refresh
    /// pass; re-indexing unmarks.
    pub fn begin_dat_refresh(&self) -> Result<()> {
        self.dats.begin_refresh()
    }

    /// Delete the dat rows not re-indexed since [`RomDb::begin_dat_refresh`].
    /// Their index rows dangle harmlessly until [`RomDb::sweep_orphans`].
    pub fn end_dat_refresh(&self) -> Result<u64> {
        self.dats.end_refresh()
    }

    /// Physically delete every dat more than [`GENERATION_SWEEP_LAG`]
    /// generations behind current, together with its dependent index rows
    /// (the rows suffixed by the dat's SHA1). Returns how many dats went.
    pub fn sweep_orphans(&self) -> Result<u64> {
        let cutoff = self.generation() - GENERATION_SWEEP_LAG;

        let mut doomed: Vec<(Vec<u8>, Dat)> = Vec::new();
        self.dats.iterate(&mut |key, value| {
            let dat = Dat::from_bytes(value)?;
            if dat.generation < cutoff {
                doomed.push((key.to_vec(), dat));
            }
            Ok(true)
        })?;

        let mut removed = 0;
        for (key, dat) in doomed {
            for rom in dat.roms() {
                if let Some(k) = sha1_sha1_key(rom, &key) {
                    self.sha1.delete(&k)?;
                }
                if let Some(k) = crc_with_size_and_sha1_key(rom, Some(&key)) {
                    self.crc.delete(&k)?;
                }
                if let Some(k) = md5_with_size_and_sha1_key(rom, Some(&key)) {
                    self.md5.delete(&k)?;
                }
            }
            self.dats.delete(&key)?;
            removed += 1;
        }
        if removed > 0 {
            info!("swept {} orphaned dats from {:?}", removed, self.root);
        }
        Ok(removed)
    }

    /// Pretty diagnostic listing of every index touched by `hash`.
    ///
    /// `size` narrows the crc/md5 prefixes when non-negative.
    pub fn debug_get(&self, hash: &[u8], size: i64) -> Result<String> {
        let mut out = String::new();
        match hash.len() {
            CRC_SIZE => {
                debug_suffixes(&mut out, "crc_db", &self.crc, hash, size)?;
                debug_suffixes(&mut out, "crcsha1_db", &self.crcsha1, hash, size)?;
            }
            MD5_SIZE => {
                debug_suffixes(&mut out, "md5_db", &self.md5, hash, size)?;
                debug_suffixes(&mut out, "md5sha1_db", &self.md5sha1, hash, size)?;
            }
            SHA1_SIZE => {
                let suffixes = self.sha1.key_suffixes_for(hash)?;
                let _ = writeln!(
                    out,
                    "sha1_db {}: {} dat(s)",
                    hex::encode(hash),
                    suffixes.len() / SHA1_SIZE
                );
                for chunk in suffixes.chunks(SHA1_SIZE) {
                    let _ = writeln!(out, "  dat sha1 {}", hex::encode(chunk));
                }
                match self.get_dat(hash)? {
                    Some(dat) => {
                        let _ = writeln!(
                            out,
                            "dats_db {}: {:?} generation {}",
                            hex::encode(hash),
                            dat.name,
                            dat.generation
                        );
                    }
                    None => {
                        let _ = writeln!(out, "dats_db {}: absent", hex::encode(hash));
                    }
                }
            }
            n => return Err(RombaError::UnknownHashSize(n)),
        }
        Ok(out)
    }

    /// One stats line per index store.
    pub fn print_stats(&self) -> Result<String> {
        let mut out = String::new();
        for (name, store) in self.stores() {
            let _ = writeln!(out, "{}: {}", name, store.stats()?);
        }
        Ok(out)
    }

    /// A fresh accumulator batching writes across all six indexes.
    pub fn start_batch(&self) -> RomBatch<S> {
        RomBatch::new(self.clone())
    }

    /// Flush and close all six stores. Further writes fail as closed.
    pub fn close(&self) -> Result<()> {
        for (_, store) in self.stores() {
            store.close()?;
        }
        Ok(())
    }

    fn stores(&self) -> [(&'static str, &S); 6] {
        [
            (INDEXES[0].0, &self.dats),
            (INDEXES[1].0, &self.sha1),
            (INDEXES[2].0, &self.crc),
            (INDEXES[3].0, &self.md5),
            (INDEXES[4].0, &self.crcsha1),
            (INDEXES[5].0, &self.md5sha1),
        ]
    }
}

fn rom_from_mapping_key(key: &[u8], crc: bool) -> Rom {
    let hash_len = if crc { CRC_SIZE } else { MD5_SIZE };
    let mut size_bytes = [0u8; SIZE_FIELD];
    size_bytes.copy_from_slice(&key[hash_len..hash_len + SIZE_FIELD]);
    let mut rom = Rom {
        size: i64::from_be_bytes(size_bytes),
        sha1: Some(key[hash_len + SIZE_FIELD..].to_vec()),
        ..Rom::default()
    };
    if crc {
        rom.crc = Some(key[..hash_len].to_vec());
    } else {
        rom.md5 = Some(key[..hash_len].to_vec());
    }
    rom
}

fn debug_suffixes<S: KvStore>(
    out: &mut String,
    label: &str,
    store: &S,
    hash: &[u8],
    size: i64,
) -> Result<()> {
    let mut prefix = hash.to_vec();
    if size >= 0 {
        prefix.extend_from_slice(&size.to_be_bytes());
    }
    let suffixes = store.key_suffixes_for(&prefix)?;
    let chunk_len = if size >= 0 { SHA1_SIZE } else { SIZE_FIELD + SHA1_SIZE };
    let _ = writeln!(
        out,
        "{} {} size {}: {} entr(ies)",
        label,
        hex::encode(hash),
        size,
        suffixes.len() / chunk_len
    );
    for chunk in suffixes.chunks(chunk_len) {
        if size >= 0 {
            let _ = writeln!(out, "  sha1 {}", hex::encode(chunk));
        } else {
            let mut size_bytes = [0u8; SIZE_FIELD];
            size_bytes.copy_from_slice(&chunk[..SIZE_FIELD]);
            let _ = writeln!(
                out,
                "  size {} sha1 {}",
                i64::from_be_bytes(size_bytes),
                hex::encode(&chunk[SIZE_FIELD..])
            );
        }
    }
    Ok(())
}

fn read_generation(root: &Path) -> Result<i64> {
    match fs::read_to_string(root.join(GENERATION_FILE)) {
        Ok(text) => text
            .trim()
            .parse()
            .map_err(|e| RombaError::Msg(format!("bad generation file: {}", e))),
        Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn write_generation(root: &Path, generation: i64) -> Result<()> {
    Ok(fs::write(root.join(GENERATION_FILE), format!("{}", generation))?)
}

/// Accumulates index writes across all six stores and applies them in
/// batches.
///
/// Callers should [`RomBatch::flush`] once [`RomBatch::size`] passes
/// [`MAX_BATCH_SIZE`]; [`RomBatch::close`] implies a final flush.
pub struct RomBatch<S: KvStore> {
    db: RomDb<S>,
    dats: Batch,
    sha1: Batch,
    crc: Batch,
    md5: Batch,
    crcsha1: Batch,
    md5sha1: Batch,
    staged_dats: HashSet<Vec<u8>>,
}

impl<S: KvStore> RomBatch<S> {
    fn new(db: RomDb<S>) -> RomBatch<S> {
        RomBatch {
            db,
            dats: Batch::default(),
            sha1: Batch::default(),
            crc: Batch::default(),
            md5: Batch::default(),
            crcsha1: Batch::default(),
            md5sha1: Batch::default(),
            staged_dats: HashSet::new(),
        }
    }

    /// Stage a dat under its SHA1 identity, stamped with the current
    /// generation.
    ///
    /// When the dat key was previously absent the write fans out: one row
    /// per rom in each index its hashes allow, plus the crc→sha1 and
    /// md5→sha1 completion rows whenever the rom's sha1 is known.
    /// Re-indexing an existing dat only rewrites the dat row; the index
    /// rows are idempotent by content and stay as they are.
    ///
    /// Fails with [`RombaError::Sha1Missing`] when `sha1_bytes` is `None`
    /// or not 20 bytes.
    pub fn index_dat(&mut self, dat: &Dat, sha1_bytes: Option<&[u8]>) -> Result<()> {
        let key = match sha1_bytes {
            Some(key) if key.len() == SHA1_SIZE => key,
            _ => return Err(RombaError::Sha1Missing),
        };

        let mut stamped = dat.clone();
        stamped.generation = self.db.generation();

        let fresh = !self.db.dats.exists(key)? && self.staged_dats.insert(key.to_vec());
        self.dats.set(key, &stamped.to_bytes()?);

        if fresh {
            for rom in stamped.roms() {
                if let Some(k) = sha1_sha1_key(rom, key) {
                    self.sha1.append(&k, INDEX_VALUE);
                }
                if let Some(k) = crc_with_size_and_sha1_key(rom, Some(key)) {
                    self.crc.append(&k, INDEX_VALUE);
                }
                if let Some(k) = md5_with_size_and_sha1_key(rom, Some(key)) {
                    self.md5.append(&k, INDEX_VALUE);
                }
                if rom.sha1.is_some() {
                    self.stage_completion_rows(rom);
                }
            }
        }
        Ok(())
    }

    /// Stage the crc→sha1 / md5→sha1 completion rows for a loose rom whose
    /// sha1 is known. Roms without a sha1 (or without any partial hash)
    /// stage nothing.
    pub fn index_rom(&mut self, rom: &Rom) -> Result<()> {
        if rom.sha1.is_some() {
            self.stage_completion_rows(rom);
        }
        Ok(())
    }

    fn stage_completion_rows(&mut self, rom: &Rom) {
        if let Some(k) = crc_with_size_and_sha1_key(rom, None) {
            self.crcsha1.append(&k, INDEX_VALUE);
        }
        if let Some(k) = md5_with_size_and_sha1_key(rom, None) {
            self.md5sha1.append(&k, INDEX_VALUE);
        }
    }

    /// Staged bytes across all six underlying batches.
    pub fn size(&self) -> u64 {
        self.dats.size()
            + self.sha1.size()
            + self.crc.size()
            + self.md5.size()
            + self.crcsha1.size()
            + self.md5sha1.size()
    }

    /// Apply everything staged. Index rows go first and the dat rows last,
    /// so a dat row on disk always implies its index rows.
    pub fn flush(&mut self) -> Result<()> {
        self.db.sha1.write_batch(mem::take(&mut self.sha1))?;
        self.db.crc.write_batch(mem::take(&mut self.crc))?;
        self.db.md5.write_batch(mem::take(&mut self.md5))?;
        self.db.crcsha1.write_batch(mem::take(&mut self.crcsha1))?;
        self.db.md5sha1.write_batch(mem::take(&mut self.md5sha1))?;
        self.db.dats.write_batch(mem::take(&mut self.dats))?;
        self.staged_dats.clear();
        Ok(())
    }

    /// Final flush.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

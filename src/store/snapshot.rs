//! Checksummed on-disk serialization of the keydir.
//!
//! A snapshot pair is `keydir_<N>` plus `keydir-sha1_<N>` holding the hex
//! SHA1 of the snapshot bytes. `keydir_<N>` covers every record in segments
//! `0..=N`; segments at or below `N` are never appended again, so open can
//! load the newest verified pair and replay only younger segments.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use sha1::{Digest, Sha1};

use crate::error::{RombaError, Result};
use crate::store::keydir::{Keydir, Loc};

pub(crate) fn snapshot_path(dir: &Path, file_id: i32) -> PathBuf {
    dir.join(format!("keydir_{}", file_id))
}

pub(crate) fn snapshot_sha1_path(dir: &Path, file_id: i32) -> PathBuf {
    dir.join(format!("keydir-sha1_{}", file_id))
}

/// Ids of all snapshots under `dir`, sorted ascending.
pub(crate) fn sorted_snapshot_ids(dir: &Path) -> Result<Vec<i32>> {
    let mut ids: Vec<i32> = fs::read_dir(dir)?
        .flat_map(|res| -> Result<_> { Ok(res?.path()) })
        .filter(|path| path.is_file())
        .flat_map(|path| {
            path.file_name()
                .and_then(|s| s.to_str())
                .and_then(|s| s.strip_prefix("keydir_"))
                .map(str::parse::<i32>)
        })
        .flatten()
        .collect();

    ids.sort_unstable();

    Ok(ids)
}

struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha1,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct HashingReader<R: Read> {
    inner: R,
    hasher: Sha1,
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Serialize `keydir` as the pair `keydir_<file_id>` / `keydir-sha1_<file_id>`.
pub(crate) fn write_snapshot(dir: &Path, file_id: i32, keydir: &Keydir) -> Result<()> {
    let path = snapshot_path(dir, file_id);
    let mut w = HashingWriter {
        inner: BufWriter::new(File::create(&path)?),
        hasher: Sha1::new(),
    };

    w.write_i64::<BigEndian>(keydir.len() as i64)?;
    w.write_i64::<BigEndian>(keydir.orphaned())?;
    w.write_i16::<BigEndian>(keydir.key_size() as i16)?;

    let mut io_err: Option<io::Error> = None;
    keydir.for_each(&mut |key, locs| {
        if io_err.is_some() {
            return;
        }
        let res = (|| -> io::Result<()> {
            w.write_all(key)?;
            w.write_i32::<BigEndian>(locs.len() as i32)?;
            for loc in locs {
                w.write_i16::<BigEndian>(loc.file_id as i16)?;
                w.write_i32::<BigEndian>(loc.vpos)?;
                w.write_i32::<BigEndian>(loc.vsize)?;
            }
            Ok(())
        })();
        if let Err(e) = res {
            io_err = Some(e);
        }
    });
    if let Some(e) = io_err {
        return Err(e.into());
    }

    w.flush()?;
    let digest = w.hasher.finalize();
    fs::write(snapshot_sha1_path(dir, file_id), hex::encode(digest))?;
    Ok(())
}

fn corrupt(path: &Path, reason: &str) -> RombaError {
    RombaError::CorruptSnapshot {
        path: path.to_path_buf(),
        reason: reason.to_owned(),
    }
}

/// Load and verify the snapshot pair for `file_id`.
///
/// Fails with [`RombaError::CorruptSnapshot`] on truncation, a key-size
/// mismatch, trailing bytes or a SHA1 mismatch.
pub(crate) fn load_snapshot(dir: &Path, file_id: i32, expect_key_size: u16) -> Result<Keydir> {
    let path = snapshot_path(dir, file_id);
    let expected = fs::read_to_string(snapshot_sha1_path(dir, file_id))
        .map_err(|_| corrupt(&path, "missing sha1 sibling"))?;

    let mut r = HashingReader {
        inner: BufReader::new(File::open(&path)?),
        hasher: Sha1::new(),
    };

    let parsed = (|| -> io::Result<Keydir> {
        let count = r.read_i64::<BigEndian>()?;
        let orphaned = r.read_i64::<BigEndian>()?;
        let key_size = r.read_i16::<BigEndian>()? as u16;
        if key_size != expect_key_size {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "key size mismatch"));
        }

        let keydir = Keydir::new(key_size);
        let mut key = vec![0u8; key_size as usize];
        for _ in 0..count {
            r.read_exact(&mut key)?;
            let kc = r.read_i32::<BigEndian>()?;
            for _ in 0..kc {
                let file_id = r.read_i16::<BigEndian>()? as i32;
                let vpos = r.read_i32::<BigEndian>()?;
                let vsize = r.read_i32::<BigEndian>()?;
                keydir.append(&key, Loc { file_id, vpos, vsize });
            }
        }
        keydir.set_orphaned(orphaned);
        Ok(keydir)
    })();

    let keydir = match parsed {
        Ok(keydir) => keydir,
        Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(corrupt(&path, "truncated"));
        }
        Err(e) => return Err(corrupt(&path, &e.to_string())),
    };

    let mut trailer = [0u8; 1];
    if r.inner.read(&mut trailer)? != 0 {
        return Err(corrupt(&path, "trailing bytes"));
    }

    let digest = hex::encode(r.hasher.finalize());
    if digest != expected.trim() {
        return Err(corrupt(&path, "sha1 mismatch"));
    }

    Ok(keydir)
}

use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::warn;

use crate::error::{RombaError, Result};
use crate::store::keydir::Loc;

/// Record was written by `set`: replaces any prior list for the key.
pub(crate) const TAG_SET: u8 = 0;
/// Record was written by `append`: adds a location to the key's list.
pub(crate) const TAG_APPEND: u8 = 1;
/// Tombstone: the key's list is removed. Carries no value bytes.
pub(crate) const TAG_DELETE: u8 = 2;

/// join path: {dir}/data.{id}
pub(crate) fn data_path(dir: &Path, file_id: i32) -> PathBuf {
    dir.join(format!("data.{}", file_id))
}

/// Sorted ids of the `data.<N>` segment files under `dir`.
pub(crate) fn sorted_file_ids(dir: &Path) -> Result<Vec<i32>> {
    let mut ids: Vec<i32> = fs::read_dir(dir)?
        .flat_map(|res| -> Result<_> { Ok(res?.path()) })
        .filter(|path| path.is_file())
        .flat_map(|path| {
            path.file_name()
                .and_then(OsStr::to_str)
                .and_then(|s| s.strip_prefix("data."))
                .map(str::parse::<i32>)
        })
        .flatten()
        .collect();

    ids.sort_unstable();

    Ok(ids)
}

/// A `BufWriter` that tracks the position it has written to.
pub(crate) struct BufWriterWithPos<W: Write + Seek> {
    writer: BufWriter<W>,
    pos: u64,
}

impl<W: Write + Seek> BufWriterWithPos<W> {
    pub(crate) fn new(mut inner: W) -> Result<Self> {
        let pos = inner.seek(SeekFrom::End(0))?;
        Ok(BufWriterWithPos {
            writer: BufWriter::new(inner),
            pos,
        })
    }

    pub(crate) fn pos(&self) -> u64 {
        self.pos
    }

    pub(crate) fn get_ref(&self) -> &W {
        self.writer.get_ref()
    }
}

impl<W: Write + Seek> Write for BufWriterWithPos<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = self.writer.write(buf)?;
        self.pos += len as u64;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// The open, append-only tail of a store: one `data.<N>` file.
pub(crate) struct LogWriter {
    writer: BufWriterWithPos<File>,
    file_id: i32,
    path: PathBuf,
}

impl LogWriter {
    /// Open (or create) segment `file_id` for appending.
    pub(crate) fn open(dir: &Path, file_id: i32) -> Result<LogWriter> {
        let path = data_path(dir, file_id);
        let file = OpenOptions::new().create(true).write(true).append(true).open(&path)?;
        Ok(LogWriter {
            writer: BufWriterWithPos::new(file)?,
            file_id,
            path,
        })
    }

    pub(crate) fn file_id(&self) -> i32 {
        self.file_id
    }

    pub(crate) fn pos(&self) -> u64 {
        self.writer.pos()
    }

    /// Append one record and return the location of its value bytes.
    ///
    /// The buffered stream is flushed before returning so concurrent readers
    /// observe the record immediately.
    pub(crate) fn append_record(&mut self, tag: u8, key: &[u8], value: &[u8]) -> Result<Loc> {
        let start = self.writer.pos();
        self.writer.write_u8(tag)?;
        self.writer.write_u16::<BigEndian>(key.len() as u16)?;
        self.writer.write_all(key)?;
        self.writer.write_i32::<BigEndian>(value.len() as i32)?;
        self.writer.write_all(value)?;
        self.writer.flush()?;

        let vpos = start + 1 + 2 + key.len() as u64 + 4;
        Ok(Loc {
            file_id: self.file_id,
            vpos: vpos as i32,
            vsize: value.len() as i32,
        })
    }

    /// Discard everything at and after `pos`. Used to unwind a failed batch.
    pub(crate) fn truncate_to(&mut self, pos: u64) -> Result<()> {
        // the buffer may hold bytes of the aborted record; drop them along
        // with anything already on disk past `pos`
        let _ = self.writer.flush();
        let file = self.writer.get_ref();
        file.set_len(pos)?;
        self.writer = BufWriterWithPos::new(
            OpenOptions::new().write(true).append(true).open(&self.path)?,
        )?;
        Ok(())
    }

    /// Flush buffers and fsync the segment.
    pub(crate) fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

/// Replay one segment into keydir operations.
///
/// `apply` receives `(tag, key, loc)` per record in log order. A record torn
/// at the tail is truncated away with a warning when `truncate_tail` is set
/// (the segment is the last one); anywhere else it is a fatal
/// [`RombaError::CorruptLog`]. A tag or key width that cannot have been
/// written by this store is fatal regardless of position.
pub(crate) fn replay_segment(
    dir: &Path,
    file_id: i32,
    key_size: u16,
    truncate_tail: bool,
    apply: &mut dyn FnMut(u8, &[u8], Loc),
) -> Result<()> {
    let path = data_path(dir, file_id);
    let file = File::open(&path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut pos: u64 = 0;
    let mut key = vec![0u8; key_size as usize];

    loop {
        let tag = match reader.read_u8() {
            Ok(tag) => tag,
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };

        let record = (|| -> io::Result<Option<Loc>> {
            let ksize = reader.read_u16::<BigEndian>()?;
            if tag > TAG_DELETE || ksize != key_size {
                return Ok(None);
            }
            reader.read_exact(&mut key)?;
            let vsize = reader.read_i32::<BigEndian>()?;
            if vsize < 0 {
                return Ok(None);
            }
            if pos + record_overhead(key_size) + vsize as u64 > file_len {
                // value cut short: a torn tail, not a malformed record
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
            }
            let vpos = pos + record_overhead(key_size);
            reader.seek_relative(vsize as i64)?;
            Ok(Some(Loc {
                file_id,
                vpos: vpos as i32,
                vsize,
            }))
        })();

        match record {
            Ok(Some(loc)) => {
                apply(tag, &key, loc);
                pos = loc.vpos as u64 + loc.vsize as u64;
            }
            Ok(None) => return Err(RombaError::CorruptLog { path, offset: pos }),
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof && truncate_tail => {
                warn!("truncating torn record at {}:{}", path.display(), pos);
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(pos)?;
                return Ok(());
            }
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(RombaError::CorruptLog { path, offset: pos });
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

fn record_overhead(key_size: u16) -> u64 {
    1 + 2 + key_size as u64 + 4
}

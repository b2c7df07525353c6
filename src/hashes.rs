//! Hashing loose ROM files for ingestion and lookup.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use md5::{Digest as _, Md5};
use sha1::Sha1;

use crate::model::Rom;
use crate::Result;

/// Compute crc32, md5, sha1 and the byte size of `reader` in one pass.
pub fn hash_reader<R: Read>(mut reader: R) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>, i64)> {
    let mut crc = crc32fast::Hasher::new();
    let mut md5 = Md5::new();
    let mut sha1 = Sha1::new();
    let mut size: i64 = 0;
    let mut buf = [0u8; 64 * 1024];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        crc.update(&buf[..n]);
        md5.update(&buf[..n]);
        sha1.update(&buf[..n]);
        size += n as i64;
    }

    Ok((
        crc.finalize().to_be_bytes().to_vec(),
        md5.finalize().to_vec(),
        sha1.finalize().to_vec(),
        size,
    ))
}

/// Hash the file at `path` into a fully populated [`Rom`].
pub fn rom_from_file(path: &Path) -> Result<Rom> {
    let (crc, md5, sha1, size) = hash_reader(BufReader::new(File::open(path)?))?;
    Ok(Rom {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        size,
        crc: Some(crc),
        md5: Some(md5),
        sha1: Some(sha1),
        path: Some(path.to_string_lossy().into_owned()),
    })
}

//! Compound-key assembly for the six catalog indexes.
//!
//! All keys are fixed-width concatenations in network byte order; the size
//! field is always an 8-byte big-endian i64. Builders return `None` when the
//! rom lacks the hash the key starts from.

use crate::model::{Rom, CRC_SIZE, MD5_SIZE, SHA1_SIZE};

/// Byte width of the encoded size field.
pub const SIZE_FIELD: usize = 8;

/// Key width of the dats index: sha1(dat).
pub const DATS_KEY_SIZE: usize = SHA1_SIZE;
/// Key width of the sha1 index: sha1(rom) ∥ sha1(dat).
pub const SHA1_KEY_SIZE: usize = SHA1_SIZE + SHA1_SIZE;
/// Key width of the crc index: crc ∥ size ∥ sha1(dat).
pub const CRC_KEY_SIZE: usize = CRC_SIZE + SIZE_FIELD + SHA1_SIZE;
/// Key width of the md5 index: md5 ∥ size ∥ sha1(dat).
pub const MD5_KEY_SIZE: usize = MD5_SIZE + SIZE_FIELD + SHA1_SIZE;
/// Key width of the crcsha1 index: crc ∥ size ∥ sha1(rom).
pub const CRCSHA1_KEY_SIZE: usize = CRC_SIZE + SIZE_FIELD + SHA1_SIZE;
/// Key width of the md5sha1 index: md5 ∥ size ∥ sha1(rom).
pub const MD5SHA1_KEY_SIZE: usize = MD5_SIZE + SIZE_FIELD + SHA1_SIZE;

fn with_size(hash: &[u8], size: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(hash.len() + SIZE_FIELD + SHA1_SIZE);
    key.extend_from_slice(hash);
    key.extend_from_slice(&size.to_be_bytes());
    key
}

/// `crc ∥ size`: the prefix used to complete partial roms.
pub fn crc_with_size_key(rom: &Rom) -> Option<Vec<u8>> {
    rom.crc.as_deref().map(|crc| with_size(crc, rom.size))
}

/// `md5 ∥ size`: the prefix used to complete partial roms.
pub fn md5_with_size_key(rom: &Rom) -> Option<Vec<u8>> {
    rom.md5.as_deref().map(|md5| with_size(md5, rom.size))
}

/// `crc ∥ size ∥ sha1`, where the trailing sha1 is the dat's when given and
/// the rom's own otherwise.
pub fn crc_with_size_and_sha1_key(rom: &Rom, dat_sha1: Option<&[u8]>) -> Option<Vec<u8>> {
    let sha1 = dat_sha1.or(rom.sha1.as_deref())?;
    let mut key = crc_with_size_key(rom)?;
    key.extend_from_slice(sha1);
    Some(key)
}

/// `md5 ∥ size ∥ sha1`, where the trailing sha1 is the dat's when given and
/// the rom's own otherwise.
pub fn md5_with_size_and_sha1_key(rom: &Rom, dat_sha1: Option<&[u8]>) -> Option<Vec<u8>> {
    let sha1 = dat_sha1.or(rom.sha1.as_deref())?;
    let mut key = md5_with_size_key(rom)?;
    key.extend_from_slice(sha1);
    Some(key)
}

/// `sha1(rom) ∥ sha1(dat)`.
pub fn sha1_sha1_key(rom: &Rom, dat_sha1: &[u8]) -> Option<Vec<u8>> {
    rom.sha1.as_deref().map(|sha1| {
        let mut key = Vec::with_capacity(SHA1_KEY_SIZE);
        key.extend_from_slice(sha1);
        key.extend_from_slice(dat_sha1);
        key
    })
}

use serde::{Deserialize, Serialize};

use crate::Result;

/// Byte width of a CRC32 hash.
pub const CRC_SIZE: usize = 4;
/// Byte width of an MD5 hash.
pub const MD5_SIZE: usize = 16;
/// Byte width of a SHA1 hash.
pub const SHA1_SIZE: usize = 20;

/// A content record: one file inside a game, identified by its hashes.
///
/// At least one hash is present after parsing; SHA1 is the canonical
/// identity. `size` is the uncompressed byte size declared by the DAT.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rom {
    /// File name as declared by the DAT.
    pub name: String,
    /// Declared size in bytes.
    pub size: i64,
    /// CRC32, 4 bytes.
    #[serde(with = "hex_bytes", default, skip_serializing_if = "Option::is_none")]
    pub crc: Option<Vec<u8>>,
    /// MD5, 16 bytes.
    #[serde(with = "hex_bytes", default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<Vec<u8>>,
    /// SHA1, 20 bytes.
    #[serde(with = "hex_bytes", default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<Vec<u8>>,
    /// Where the file was last seen on disk, if anywhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Rom {
    /// True if any of the three hashes is present.
    pub fn has_hash(&self) -> bool {
        self.crc.is_some() || self.md5.is_some() || self.sha1.is_some()
    }
}

/// A named aggregation of roms. Never addressed directly by the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    /// Game name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// The roms making up this game.
    #[serde(default)]
    pub roms: Vec<Rom>,
}

/// A DAT descriptor: a named collection of games.
///
/// Identity is the SHA1 of the DAT's byte form, computed by the parser and
/// carried separately from this record. `generation` records the refresh
/// epoch at which the dat was last indexed; once the catalog's current
/// generation moves past it the dat is orphaned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dat {
    /// DAT name from its header.
    pub name: String,
    /// Header description.
    #[serde(default)]
    pub description: String,
    /// Header author.
    #[serde(default)]
    pub author: String,
    /// Header version.
    #[serde(default)]
    pub version: String,
    /// Header category.
    #[serde(default)]
    pub category: String,
    /// Path of the source file within the DAT tree.
    #[serde(default)]
    pub path: String,
    /// Refresh epoch at which this dat was indexed.
    #[serde(default)]
    pub generation: i64,
    /// True for dats synthesized from loose files rather than parsed.
    #[serde(default)]
    pub artificial: bool,
    /// The games enumerated by this dat.
    #[serde(default)]
    pub games: Vec<Game>,
}

impl Dat {
    /// Encode to the value bytes stored in the dats index.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from value bytes read back from the dats index.
    pub fn from_bytes(bytes: &[u8]) -> Result<Dat> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Iterate all roms across all games.
    pub fn roms(&self) -> impl Iterator<Item = &Rom> {
        self.games.iter().flat_map(|g| g.roms.iter())
    }
}

/// Hashes travel as lowercase hex strings inside encoded dat values.
mod hex_bytes {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_str(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let s: Option<String> = Option::deserialize(d)?;
        match s {
            Some(s) => hex::decode(&s).map(Some).map_err(de::Error::custom),
            None => Ok(None),
        }
    }
}

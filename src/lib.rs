#![deny(missing_docs)]
//! A deduplicating ROM archive core: a multi-hash DAT catalog layered over
//! an embedded log-structured KV store.
//!
//! [`RomDb`] is the entry point: it keeps six compound-key indexes (one
//! [`Bitcask`] store each) under a root directory and answers hash lookups
//! across them. [`Refresher`] rebuilds the catalog from a DAT tree.

mod catalog;
mod error;
pub mod hashes;
pub mod keys;
mod model;
mod parse;
mod refresh;
mod store;

pub use catalog::{Combiner, RomBatch, RomDb, GENERATION_SWEEP_LAG, MAX_BATCH_SIZE};
pub use error::{RombaError, Result};
pub use model::{Dat, Game, Rom, CRC_SIZE, MD5_SIZE, SHA1_SIZE};
pub use parse::{DatParser, XmlDatParser};
pub use refresh::{RefreshStats, Refresher, DAT_EXTENSIONS, DEFAULT_WORKERS};
pub use store::{
    Batch, Bitcask, Keydir, KvStore, Loc, StoreOptions, StoreStats,
    DEFAULT_COMPACTION_THRESHOLD, DEFAULT_SEGMENT_CAP, KEYDIR_SHARDS,
};

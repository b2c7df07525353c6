use std::path::PathBuf;

use thiserror::Error;

/// Error type for romba.
#[derive(Error, Debug)]
pub enum RombaError {
    /// IO error
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Serialization or deserialization error.
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    /// Malformed XML in a DAT file.
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
    /// IndexDat called without a dat SHA1 identity: caller bug.
    #[error("dat has no sha1 identity")]
    Sha1Missing,
    /// Lookup called with a byte length that is not a CRC32, MD5 or SHA1.
    #[error("unknown hash size {0}, expected 4, 16 or 20 bytes")]
    UnknownHashSize(usize),
    /// Keydir snapshot failed its SHA1 check or is truncated.
    #[error("corrupt keydir snapshot {path}: {reason}")]
    CorruptSnapshot {
        /// Snapshot file that failed verification.
        path: PathBuf,
        /// What did not check out.
        reason: String,
    },
    /// A log record is damaged somewhere other than the tail.
    #[error("corrupt log {path} at offset {offset}")]
    CorruptLog {
        /// Damaged segment file.
        path: PathBuf,
        /// Offset of the first unreadable record.
        offset: u64,
    },
    /// Operation on a store that has been closed.
    #[error("store is closed")]
    Closed,
    /// Error with a string message
    #[error("{0}")]
    Msg(String),
}

/// Custom result type for RombaError
pub type Result<T> = std::result::Result<T, RombaError>;

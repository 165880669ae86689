//! Durable append-only keyed log.
//!
//! The log is the system's memory: a totally ordered stream of
//! `(offset, key, value | tombstone)` records with dense 64-bit offsets
//! assigned by the log. Readers either follow the stream from an offset
//! ([`KvLog::consume`], blocking until records exist) or take a key-compacted
//! point-in-time view ([`KvLog::snapshot`]). Writers get read-your-writes:
//! `put`/`del` are durable on return.
//!
//! Records are appended to a single file as length-prefixed JSON. On open the
//! file is replayed; a torn tail (partial length prefix, short body, or a
//! body that fails to decode) is truncated away, so a partial write is
//! completely absent rather than partially visible.

mod kv;

pub use kv::{KvLog, Message};

use thiserror::Error;

/// Offset sentinel: no valid offset (error paths).
pub const OFFSET_INVALID: i64 = -3;

/// Offset sentinel: start from the first record. Wire-visible; a consumer
/// with no durable watermark sends this to request a snapshot.
pub const OFFSET_OLDEST: i64 = -2;

/// Offset sentinel: start from the next record to be written.
pub const OFFSET_NEWEST: i64 = -1;

/// Log errors.
#[derive(Debug, Error)]
pub enum LogError {
    /// The key has no live value (never written, or tombstoned)
    #[error("key not found")]
    NotFound,

    /// Underlying storage failed; the log may be reopened
    #[error("log io: {0}")]
    Io(#[from] std::io::Error),

    /// A key or value failed to encode or decode
    #[error("log codec: {0}")]
    Codec(#[from] serde_json::Error),
}

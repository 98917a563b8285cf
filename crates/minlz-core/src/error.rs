//! Error Types for the MinLZ Format Layer
//!
//! This module defines the errors that can occur while encoding or parsing
//! format-level structures: varints, compressed blocks, and the stream index.
//!
//! Writer-side failures (I/O, lifecycle, configuration) live in
//! `minlz-stream`; that crate wraps this enum via `#[from]`.
//!
//! All variants are `Clone` so a single error value can be latched once and
//! handed back to every subsequent caller.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("varint does not fit in 64 bits")]
    VarintOverflow,

    #[error("varint input truncated")]
    VarintTruncated,

    #[error("index offsets out of order: ({compressed}, {uncompressed}) after ({last_compressed}, {last_uncompressed})")]
    IndexOrder {
        compressed: u64,
        uncompressed: u64,
        last_compressed: u64,
        last_uncompressed: u64,
    },

    #[error("malformed index trailer: {0}")]
    IndexMalformed(&'static str),

    #[error("corrupt block data at offset {0}")]
    Corrupt(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

//! Error Types for the Stream Writer
//!
//! ## Error Categories
//!
//! ### Configuration errors
//! Bad option values (`InvalidLevel`, `BlockSize`, `Padding`,
//! `ZeroConcurrency`, `IndexDisabled`). Latched into the writer at
//! construction and surfaced on the first public call.
//!
//! ### Contract errors
//! Invalid user-chunk parameters (`InvalidChunkId`, `UserChunkTooLarge`).
//! Returned directly to the caller and *not* latched; the stream stays
//! usable.
//!
//! ### Sink errors
//! `Io` and `ShortWrite`. Latched by whichever side observes them first;
//! every subsequent public call returns the same value.
//!
//! ### Lifecycle sentinels
//! `Closed` (the writer was closed; `close` itself swallows it) and
//! `NoSink` (the writer was built detached and `reset` has not installed a
//! sink yet).
//!
//! The enum is `Clone` (I/O errors are held behind an `Arc`) because the
//! sticky error cell replays one latched value to every caller.

use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    #[error("short write to sink")]
    ShortWrite,

    #[error("writer is closed")]
    Closed,

    #[error("writer has no sink; call reset() first")]
    NoSink,

    #[error("invalid compression level")]
    InvalidLevel,

    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("block size {0} out of bounds (4 KiB to 4 MiB)")]
    BlockSize(usize),

    #[error("padding {0} out of bounds (2 to 4 MiB; 1 disables)")]
    Padding(usize),

    #[error("user chunk id {0:#04x} outside 0x80..=0xfe")]
    InvalidChunkId(u8),

    #[error("user chunk of {0} bytes exceeds the maximum")]
    UserChunkTooLarge(usize),

    #[error("appending an index requires index creation to stay enabled")]
    IndexDisabled,

    #[error(transparent)]
    Format(#[from] minlz_core::Error),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_clone() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        let cloned = err.clone();
        assert!(matches!(cloned, Error::Io(_)));
        assert_eq!(err.to_string(), cloned.to_string());
    }

    #[test]
    fn test_format_errors_wrap() {
        let err: Error = minlz_core::Error::VarintTruncated.into();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(Error::ShortWrite.to_string(), "short write to sink");
        assert_eq!(Error::Closed.to_string(), "writer is closed");
        assert!(Error::InvalidChunkId(0x10).to_string().contains("0x10"));
        assert!(Error::BlockSize(1).to_string().contains('1'));
    }
}

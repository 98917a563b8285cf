//! MinLZ Format Primitives
//!
//! This crate holds everything about the MinLZ stream format that is shared
//! between endpoints: the chunked wire framing, varint encoding, the masked
//! block checksum, the block compression kernel, and the stream index.
//!
//! The stream writer (the machinery that drives these primitives through a
//! concurrent block pipeline) lives in `minlz-stream`.
//!
//! ## Layer Map
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ minlz-stream: Writer, pool, worker pipeline │
//! └──────────────────────┬──────────────────────┘
//!                        │
//! ┌──────────────────────▼──────────────────────┐
//! │ minlz-core                                  │
//! │ - frame:  chunk types, magic, headers       │
//! │ - block:  compress / decompress one block   │
//! │ - crc:    masked CRC32-C                    │
//! │ - varint: LEB128 + ZigZag integers          │
//! │ - index:  seek index accumulation + trailer │
//! └─────────────────────────────────────────────┘
//! ```

pub mod block;
pub mod crc;
pub mod error;
pub mod frame;
pub mod index;
pub mod varint;

pub use error::{Error, Result};
pub use index::{BlockIndex, IndexEntry, LoadedIndex};

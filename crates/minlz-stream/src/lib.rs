//! MinLZ Stream Writer
//!
//! This crate implements the write side of the MinLZ framed stream format:
//! an append-only compressor that accepts an unbounded byte stream, cuts it
//! into fixed-size blocks, compresses the blocks concurrently, and emits a
//! well-formed stream: magic header, CRC-framed chunks in submission order,
//! an EOF marker carrying the total uncompressed length, and optionally a
//! seek index and size-obfuscating padding.
//!
//! Format primitives (framing, varints, the block codec, the index trailer)
//! live in [`minlz_core`]; this crate is the machinery that drives them.
//!
//! ## Quick Start
//!
//! ```ignore
//! use minlz_stream::{Writer, WriterOptions, CompressionLevel};
//!
//! let file = std::fs::File::create("data.mz")?;
//! let mut writer = Writer::with_options(
//!     file,
//!     WriterOptions::new()
//!         .level(CompressionLevel::Balanced)
//!         .concurrency(8),
//! );
//! writer.write(&payload)?;
//! writer.close()?;
//! ```
//!
//! ## Main Components
//!
//! ### Writer
//! The concurrent block pipeline: input buffering, a bounded worker pool,
//! and a single dispatcher that restores submission order at the sink.
//! `concurrency(1)` degrades to a fully synchronous writer with no threads.
//!
//! ### WriterOptions
//! Every recognized knob (block size, level, index, padding, flush
//! behavior, custom encoders), validated up front and latched into the
//! writer on failure.
//!
//! ### BufferPool
//! Shared scratch-buffer recycling; each in-flight block borrows its input
//! and output buffers from the pool and the dispatcher returns them.

pub mod error;
pub mod options;
pub mod pool;
pub mod writer;

pub use error::{Error, Result};
pub use options::{CompressionLevel, CustomEncoder, WriterOptions};
pub use pool::BufferPool;
pub use writer::Writer;

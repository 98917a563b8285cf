//! Writer Configuration
//!
//! `WriterOptions` collects every knob the writer recognizes. Setters
//! validate their own bounds and latch the first failure; the writer
//! surfaces a latched configuration error on the first public call rather
//! than panicking mid-construction.
//!
//! ## Recognized Options
//!
//! | Option | Effect |
//! |--------|--------|
//! | `concurrency(n)` | worker count; 1 selects the synchronous path |
//! | `block_size(n)` | bytes per block, 4 KiB to 4 MiB (default 1 MiB) |
//! | `level(l)` | compression level (default Balanced) |
//! | `uncompressed()` | shortcut for `level(Uncompressed)` |
//! | `create_index(b)` | accumulate a seek index (default true) |
//! | `add_index(b)` | append the index on close; needs `create_index` |
//! | `padding(n)` | pad output to a multiple of n; 1 disables |
//! | `padding_source(rng)` | where padding bytes come from (default OS CSPRNG) |
//! | `flush_on_write()` | every `write` call becomes a block boundary |
//! | `custom_encoder(fn)` | per-block compression override |

use std::fmt;
use std::sync::Arc;

use rand::RngCore;

use minlz_core::frame::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

use crate::error::Error;

/// Compression effort for the level-selected block encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    /// Store every block uncompressed.
    Uncompressed,
    Fastest,
    #[default]
    Balanced,
    Smallest,
}

impl TryFrom<u8> for CompressionLevel {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CompressionLevel::Uncompressed),
            1 => Ok(CompressionLevel::Fastest),
            2 => Ok(CompressionLevel::Balanced),
            3 => Ok(CompressionLevel::Smallest),
            _ => Err(Error::InvalidLevel),
        }
    }
}

/// A per-block compression override.
///
/// Must compress `src` into `dst` and return the bytes used. Returning 0
/// marks the block incompressible (it is stored raw); returning a negative
/// value falls through to the level-selected encoder. Called concurrently
/// from worker threads.
pub type CustomEncoder = Arc<dyn Fn(&mut [u8], &[u8]) -> isize + Send + Sync>;

/// Configuration for [`crate::Writer`].
pub struct WriterOptions {
    pub(crate) concurrency: usize,
    pub(crate) block_size: usize,
    pub(crate) level: CompressionLevel,
    pub(crate) create_index: bool,
    pub(crate) add_index: bool,
    pub(crate) padding: usize,
    pub(crate) flush_on_write: bool,
    pub(crate) custom_encoder: Option<CustomEncoder>,
    pub(crate) padding_source: Option<Box<dyn RngCore + Send>>,
    /// First setter failure; surfaced by the writer on first use.
    pub(crate) error: Option<Error>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            block_size: DEFAULT_BLOCK_SIZE,
            level: CompressionLevel::default(),
            create_index: true,
            add_index: false,
            padding: 0,
            flush_on_write: false,
            custom_encoder: None,
            padding_source: None,
            error: None,
        }
    }
}

impl WriterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    fn fail(mut self, err: Error) -> Self {
        if self.error.is_none() {
            self.error = Some(err);
        }
        self
    }

    /// Maximum number of blocks compressed concurrently. `1` runs the whole
    /// pipeline on the caller thread.
    pub fn concurrency(mut self, n: usize) -> Self {
        if n == 0 {
            return self.fail(Error::ZeroConcurrency);
        }
        self.concurrency = n;
        self
    }

    /// Uncompressed bytes per block. Larger blocks compress better but limit
    /// the concurrency available for small payloads.
    pub fn block_size(mut self, n: usize) -> Self {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&n) {
            return self.fail(Error::BlockSize(n));
        }
        self.block_size = n;
        self
    }

    pub fn level(mut self, level: CompressionLevel) -> Self {
        self.level = level;
        self
    }

    /// Bypass compression entirely; every block is stored raw.
    pub fn uncompressed(self) -> Self {
        self.level(CompressionLevel::Uncompressed)
    }

    /// Accumulate a seek index while writing (on by default). Disable for
    /// streams that will never be seeked, e.g. over the network.
    pub fn create_index(mut self, enabled: bool) -> Self {
        if !enabled && self.add_index {
            return self.fail(Error::IndexDisabled);
        }
        self.create_index = enabled;
        self
    }

    /// Append the serialized index to the stream on close.
    pub fn add_index(mut self, enabled: bool) -> Self {
        if enabled && !self.create_index {
            return self.fail(Error::IndexDisabled);
        }
        self.add_index = enabled;
        self
    }

    /// Pad the finished stream to a multiple of `n` bytes with a skippable
    /// frame, obfuscating the true output size. `1` disables padding.
    pub fn padding(mut self, n: usize) -> Self {
        if n == 0 || n > MAX_BLOCK_SIZE {
            return self.fail(Error::Padding(n));
        }
        self.padding = if n == 1 { 0 } else { n };
        self
    }

    /// Override where padding bytes are drawn from. Defaults to the OS
    /// CSPRNG; a seeded generator makes padded output reproducible.
    pub fn padding_source(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.padding_source = Some(Box::new(rng));
        self
    }

    /// Turn every `write` call into a block boundary, bypassing the input
    /// buffer. Block sizes then depend on the caller's write sizes.
    pub fn flush_on_write(mut self) -> Self {
        self.flush_on_write = true;
        self
    }

    /// Install a per-block compression override.
    pub fn custom_encoder(
        mut self,
        encoder: impl Fn(&mut [u8], &[u8]) -> isize + Send + Sync + 'static,
    ) -> Self {
        self.custom_encoder = Some(Arc::new(encoder));
        self
    }
}

impl fmt::Debug for WriterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterOptions")
            .field("concurrency", &self.concurrency)
            .field("block_size", &self.block_size)
            .field("level", &self.level)
            .field("create_index", &self.create_index)
            .field("add_index", &self.add_index)
            .field("padding", &self.padding)
            .field("flush_on_write", &self.flush_on_write)
            .field("custom_encoder", &self.custom_encoder.is_some())
            .field("error", &self.error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = WriterOptions::default();
        assert!(opts.concurrency >= 1);
        assert_eq!(opts.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(opts.level, CompressionLevel::Balanced);
        assert!(opts.create_index);
        assert!(!opts.add_index);
        assert_eq!(opts.padding, 0);
        assert!(opts.error.is_none());
    }

    #[test]
    fn test_level_try_from() {
        assert_eq!(
            CompressionLevel::try_from(0u8).unwrap(),
            CompressionLevel::Uncompressed
        );
        assert_eq!(
            CompressionLevel::try_from(3u8).unwrap(),
            CompressionLevel::Smallest
        );
        assert!(matches!(
            CompressionLevel::try_from(4u8),
            Err(Error::InvalidLevel)
        ));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let opts = WriterOptions::new().concurrency(0);
        assert!(matches!(opts.error, Some(Error::ZeroConcurrency)));
    }

    #[test]
    fn test_block_size_bounds() {
        assert!(WriterOptions::new().block_size(4 << 10).error.is_none());
        assert!(WriterOptions::new().block_size(4 << 20).error.is_none());
        assert!(matches!(
            WriterOptions::new().block_size(100).error,
            Some(Error::BlockSize(100))
        ));
        assert!(matches!(
            WriterOptions::new().block_size((4 << 20) + 1).error,
            Some(Error::BlockSize(_))
        ));
    }

    #[test]
    fn test_padding_bounds() {
        assert_eq!(WriterOptions::new().padding(1).padding, 0);
        assert_eq!(WriterOptions::new().padding(1024).padding, 1024);
        assert!(matches!(
            WriterOptions::new().padding(0).error,
            Some(Error::Padding(0))
        ));
        assert!(matches!(
            WriterOptions::new().padding((4 << 20) + 1).error,
            Some(Error::Padding(_))
        ));
    }

    #[test]
    fn test_add_index_requires_create_index() {
        let opts = WriterOptions::new().create_index(false).add_index(true);
        assert!(matches!(opts.error, Some(Error::IndexDisabled)));

        let opts = WriterOptions::new().add_index(true).create_index(false);
        assert!(matches!(opts.error, Some(Error::IndexDisabled)));

        let opts = WriterOptions::new().add_index(true);
        assert!(opts.error.is_none());
    }

    #[test]
    fn test_first_error_wins() {
        let opts = WriterOptions::new().concurrency(0).block_size(1);
        assert!(matches!(opts.error, Some(Error::ZeroConcurrency)));
    }
}

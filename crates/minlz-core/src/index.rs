//! Stream Index
//!
//! The index maps uncompressed offsets to compressed offsets so a seeking
//! reader can jump near a target position and decompress only from there.
//! The writer registers one entry per emitted data block, at the moment the
//! block lands in the output stream.
//!
//! ## Trailer Layout
//!
//! The serialized index rides in a skippable chunk (id 0x99) so readers that
//! do not know about it skip it like any other skippable frame:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Chunk header: 0x99 + 24-bit body length                  │
//! ├──────────────────────────────────────────────────────────┤
//! │ Magic: "MnLzIdx\0" (8 bytes)                             │
//! │ Total uncompressed bytes (uvarint)                       │
//! │ Total compressed bytes (zigzag varint, -1 = unknown)     │
//! │ Entry count (uvarint)                                    │
//! │ Entry 0: compressed offset, uncompressed offset          │
//! │ Entry 1..: deltas from the previous entry                │
//! ├──────────────────────────────────────────────────────────┤
//! │ Whole-trailer length (u32 LE): last 4 bytes of stream,   │
//! │ lets a reader locate the trailer from the file end       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The compressed total is "unknown" (-1) when padding is appended after the
//! index was serialized, so the true stream length is not final yet.

use crate::error::{Error, Result};
use crate::frame::{self, CHUNK_TYPE_INDEX};
use crate::varint;

/// Magic bytes opening the index body.
pub const INDEX_MAGIC: &[u8; 8] = b"MnLzIdx\0";

/// One index entry: where a block starts in both coordinate spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Byte offset of the block's chunk in the compressed stream.
    pub compressed_offset: u64,
    /// Uncompressed byte offset the block begins at.
    pub uncompressed_offset: u64,
}

/// Accumulates block positions while a stream is written and serializes the
/// trailer at close.
#[derive(Debug, Default)]
pub struct BlockIndex {
    entries: Vec<IndexEntry>,
    /// Sizing hint for readers; the block size the stream was written with.
    block_size: usize,
}

impl BlockIndex {
    pub fn new(block_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            block_size,
        }
    }

    /// Clear all state for reuse on a fresh stream.
    pub fn reset(&mut self, block_size: usize) {
        self.entries.clear();
        self.block_size = block_size;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Register a block at `(compressed_offset, uncompressed_offset)`.
    ///
    /// Offsets must be non-decreasing. When the uncompressed offset repeats
    /// (a chunk that carried no stream data, like the header or a user
    /// chunk, followed by the real block), the entry is moved forward to the
    /// latest compressed offset instead of duplicated.
    pub fn add(&mut self, compressed_offset: u64, uncompressed_offset: u64) -> Result<()> {
        if let Some(last) = self.entries.last_mut() {
            if last.uncompressed_offset == uncompressed_offset {
                last.compressed_offset = compressed_offset;
                return Ok(());
            }
            if last.uncompressed_offset > uncompressed_offset
                || last.compressed_offset > compressed_offset
            {
                return Err(Error::IndexOrder {
                    compressed: compressed_offset,
                    uncompressed: uncompressed_offset,
                    last_compressed: last.compressed_offset,
                    last_uncompressed: last.uncompressed_offset,
                });
            }
        }
        self.entries.push(IndexEntry {
            compressed_offset,
            uncompressed_offset,
        });
        Ok(())
    }

    /// Serialize the trailer chunk into `dst`.
    ///
    /// `total_compressed` is `None` when the final stream length is not yet
    /// known (padding follows the index).
    pub fn append_to(
        &self,
        dst: &mut Vec<u8>,
        total_uncompressed: u64,
        total_compressed: Option<u64>,
    ) {
        let mut body = Vec::with_capacity(32 + self.entries.len() * 4);
        body.extend_from_slice(INDEX_MAGIC);
        varint::encode_uvarint(&mut body, total_uncompressed);
        match total_compressed {
            Some(n) => varint::encode_varint(&mut body, n as i64),
            None => varint::encode_varint(&mut body, -1),
        }
        varint::encode_uvarint(&mut body, self.entries.len() as u64);
        let mut prev = IndexEntry {
            compressed_offset: 0,
            uncompressed_offset: 0,
        };
        for entry in &self.entries {
            varint::encode_uvarint(&mut body, entry.compressed_offset - prev.compressed_offset);
            varint::encode_uvarint(
                &mut body,
                entry.uncompressed_offset - prev.uncompressed_offset,
            );
            prev = *entry;
        }

        // Body carries its own trailing length so the chunk can be located
        // backwards from the end of a finished stream.
        let total_len = frame::CHUNK_HEADER_SIZE + body.len() + 4;
        let mut header = [0u8; frame::CHUNK_HEADER_SIZE];
        frame::put_chunk_header(&mut header, CHUNK_TYPE_INDEX, body.len() + 4);
        dst.extend_from_slice(&header);
        dst.extend_from_slice(&body);
        dst.extend_from_slice(&(total_len as u32).to_le_bytes());
    }

    /// Parse a trailer produced by [`append_to`].
    pub fn load(data: &[u8]) -> Result<LoadedIndex> {
        if data.len() < frame::CHUNK_HEADER_SIZE + INDEX_MAGIC.len() + 4 {
            return Err(Error::IndexMalformed("trailer too short"));
        }
        let (ty, body_len) = frame::read_chunk_header(data);
        if ty != CHUNK_TYPE_INDEX {
            return Err(Error::IndexMalformed("wrong chunk type"));
        }
        if frame::CHUNK_HEADER_SIZE + body_len != data.len() {
            return Err(Error::IndexMalformed("chunk length mismatch"));
        }
        let trailer_len = u32::from_le_bytes(data[data.len() - 4..].try_into().unwrap()) as usize;
        if trailer_len != data.len() {
            return Err(Error::IndexMalformed("trailing length mismatch"));
        }

        let mut body = &data[frame::CHUNK_HEADER_SIZE..data.len() - 4];
        if !body.starts_with(INDEX_MAGIC) {
            return Err(Error::IndexMalformed("bad magic"));
        }
        body = &body[INDEX_MAGIC.len()..];

        let (total_uncompressed, n) = varint::read_uvarint(body)?;
        body = &body[n..];
        let (total_compressed, n) = varint::read_varint(body)?;
        body = &body[n..];
        if total_compressed < -1 {
            return Err(Error::IndexMalformed("negative compressed total"));
        }
        let (count, n) = varint::read_uvarint(body)?;
        body = &body[n..];

        let mut entries = Vec::with_capacity(count as usize);
        let mut prev = IndexEntry {
            compressed_offset: 0,
            uncompressed_offset: 0,
        };
        for _ in 0..count {
            let (dc, n) = varint::read_uvarint(body)?;
            body = &body[n..];
            let (du, n) = varint::read_uvarint(body)?;
            body = &body[n..];
            prev = IndexEntry {
                compressed_offset: prev
                    .compressed_offset
                    .checked_add(dc)
                    .ok_or(Error::IndexMalformed("compressed offset overflow"))?,
                uncompressed_offset: prev
                    .uncompressed_offset
                    .checked_add(du)
                    .ok_or(Error::IndexMalformed("uncompressed offset overflow"))?,
            };
            entries.push(prev);
        }
        if !body.is_empty() {
            return Err(Error::IndexMalformed("trailing garbage in body"));
        }

        Ok(LoadedIndex {
            total_uncompressed,
            total_compressed: (total_compressed >= 0).then_some(total_compressed as u64),
            entries,
        })
    }
}

/// A parsed index trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedIndex {
    pub total_uncompressed: u64,
    /// `None` when the stream was padded after the index was serialized.
    pub total_compressed: Option<u64>,
    pub entries: Vec<IndexEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> BlockIndex {
        let mut idx = BlockIndex::new(1 << 20);
        idx.add(10, 0).unwrap();
        idx.add(500_000, 1 << 20).unwrap();
        idx.add(1_100_000, 2 << 20).unwrap();
        idx
    }

    // ---------------------------------------------------------------
    // add() semantics
    // ---------------------------------------------------------------

    #[test]
    fn test_add_monotonic() {
        let idx = sample_index();
        assert_eq!(idx.len(), 3);
        assert_eq!(idx.entries()[0].compressed_offset, 10);
        assert_eq!(idx.entries()[2].uncompressed_offset, 2 << 20);
    }

    #[test]
    fn test_add_same_uncompressed_updates_in_place() {
        let mut idx = BlockIndex::new(4096);
        // Header lands at (0, 0); the first data block follows at
        // compressed offset 10 with the same uncompressed offset.
        idx.add(0, 0).unwrap();
        idx.add(10, 0).unwrap();
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.entries()[0].compressed_offset, 10);
        assert_eq!(idx.entries()[0].uncompressed_offset, 0);
    }

    #[test]
    fn test_add_rejects_backwards_uncompressed() {
        let mut idx = sample_index();
        let err = idx.add(2_000_000, 100).unwrap_err();
        assert!(matches!(err, Error::IndexOrder { .. }));
    }

    #[test]
    fn test_add_rejects_backwards_compressed() {
        let mut idx = sample_index();
        let err = idx.add(5, 3 << 20).unwrap_err();
        assert!(matches!(err, Error::IndexOrder { .. }));
    }

    #[test]
    fn test_reset_clears_entries() {
        let mut idx = sample_index();
        idx.reset(4096);
        assert!(idx.is_empty());
        assert_eq!(idx.block_size(), 4096);
    }

    // ---------------------------------------------------------------
    // Serialization roundtrips
    // ---------------------------------------------------------------

    #[test]
    fn test_roundtrip_with_known_compressed_total() {
        let idx = sample_index();
        let mut out = Vec::new();
        idx.append_to(&mut out, 3 << 20, Some(1_500_000));

        let loaded = BlockIndex::load(&out).unwrap();
        assert_eq!(loaded.total_uncompressed, 3 << 20);
        assert_eq!(loaded.total_compressed, Some(1_500_000));
        assert_eq!(loaded.entries, idx.entries());
    }

    #[test]
    fn test_roundtrip_unknown_compressed_total() {
        let idx = sample_index();
        let mut out = Vec::new();
        idx.append_to(&mut out, 3 << 20, None);

        let loaded = BlockIndex::load(&out).unwrap();
        assert_eq!(loaded.total_compressed, None);
    }

    #[test]
    fn test_roundtrip_empty_index() {
        let idx = BlockIndex::new(1 << 20);
        let mut out = Vec::new();
        idx.append_to(&mut out, 0, Some(15));

        let loaded = BlockIndex::load(&out).unwrap();
        assert_eq!(loaded.total_uncompressed, 0);
        assert!(loaded.entries.is_empty());
    }

    #[test]
    fn test_trailer_is_a_skippable_chunk() {
        let idx = sample_index();
        let mut out = Vec::new();
        idx.append_to(&mut out, 100, Some(50));

        let (ty, body_len) = frame::read_chunk_header(&out);
        assert_eq!(ty, CHUNK_TYPE_INDEX);
        assert_eq!(frame::CHUNK_HEADER_SIZE + body_len, out.len());
    }

    #[test]
    fn test_trailing_length_locates_trailer() {
        let idx = sample_index();
        let mut stream = vec![0xAA; 137]; // pretend: preceding stream bytes
        idx.append_to(&mut stream, 100, Some(50));

        let tail = u32::from_le_bytes(stream[stream.len() - 4..].try_into().unwrap()) as usize;
        let trailer = &stream[stream.len() - tail..];
        let loaded = BlockIndex::load(trailer).unwrap();
        assert_eq!(loaded.entries, sample_index().entries());
    }

    // ---------------------------------------------------------------
    // load() hardening
    // ---------------------------------------------------------------

    #[test]
    fn test_load_rejects_short_input() {
        assert!(BlockIndex::load(&[]).is_err());
        assert!(BlockIndex::load(&[0x99, 1, 0, 0]).is_err());
    }

    #[test]
    fn test_load_rejects_wrong_type() {
        let idx = sample_index();
        let mut out = Vec::new();
        idx.append_to(&mut out, 100, Some(50));
        out[0] = 0x98;
        assert!(BlockIndex::load(&out).is_err());
    }

    #[test]
    fn test_load_rejects_corrupt_magic() {
        let idx = sample_index();
        let mut out = Vec::new();
        idx.append_to(&mut out, 100, Some(50));
        out[frame::CHUNK_HEADER_SIZE] ^= 0xFF;
        assert!(BlockIndex::load(&out).is_err());
    }

    #[test]
    fn test_load_rejects_truncation() {
        let idx = sample_index();
        let mut out = Vec::new();
        idx.append_to(&mut out, 100, Some(50));
        out.truncate(out.len() - 1);
        assert!(BlockIndex::load(&out).is_err());
    }
}

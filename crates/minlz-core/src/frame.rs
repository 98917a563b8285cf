//! Stream Framing
//!
//! This module defines the chunked wire format shared by the writer and any
//! future reader.
//!
//! ## Stream Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Stream header (10 bytes)                                    │
//! │ - Magic chunk: ff 06 00 00 "MinLz" (9 bytes)                │
//! │ - Block size exponent: bits(block_size - 1) - 10 (1 byte)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Chunk*                                                      │
//! │ - Type (1 byte)                                             │
//! │ - Body length (3 bytes, little-endian)                      │
//! │ - Body                                                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │ EOF chunk (type 0x20)                                       │
//! │ - Body = uvarint of total uncompressed bytes                │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Padding chunk (type 0xFE, optional)                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Index trailer (skippable chunk 0x99, optional)              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Data Chunk Bodies
//!
//! - Uncompressed (0x01): 4-byte masked CRC, then the raw bytes.
//! - Compressed (0x02): 4-byte masked CRC, uvarint of the uncompressed
//!   length, then the compressed payload.
//!
//! The CRC always covers the *uncompressed* bytes (see [`crate::crc`]).
//!
//! Chunk types 0x80..=0xFE are skippable: readers that do not recognize the
//! id skip the body. User chunks and padding live in this range.

/// Magic chunk opening every stream: stream identifier type, 24-bit length
/// of 6, then the 5-byte format name (the 6th body byte is the block size
/// exponent appended by [`stream_header`]).
pub const MAGIC_CHUNK: &[u8] = b"\xff\x06\x00\x00MinLz";

/// Total size of the stream header: magic chunk plus the exponent byte.
pub const STREAM_HEADER_SIZE: usize = 10;

/// Chunk type + 24-bit body length.
pub const CHUNK_HEADER_SIZE: usize = 4;

/// Masked CRC carried by data chunks.
pub const CHECKSUM_SIZE: usize = 4;

/// Bytes reserved at the front of every block scratch buffer: chunk header
/// plus checksum, filled in once the body is final.
pub const CHUNK_OVERHEAD: usize = CHUNK_HEADER_SIZE + CHECKSUM_SIZE;

/// Largest body a single chunk can carry (24-bit length field).
pub const MAX_CHUNK_BODY: usize = (1 << 24) - 1;

/// Largest payload accepted by the user-chunk API.
pub const MAX_USER_CHUNK_SIZE: usize = MAX_CHUNK_BODY;

/// Smallest whole padding frame: the 4-byte header plus one body byte.
pub const MIN_SKIPPABLE_FRAME_SIZE: u64 = 5;

// ── Chunk types ────────────────────────────────────────────────────────────

/// Raw bytes, stored without compression.
pub const CHUNK_TYPE_UNCOMPRESSED_DATA: u8 = 0x01;

/// MinLZ-compressed block.
pub const CHUNK_TYPE_COMPRESSED_DATA: u8 = 0x02;

/// End-of-stream marker carrying the total uncompressed length.
pub const CHUNK_TYPE_EOF: u8 = 0x20;

/// First skippable chunk id available to callers.
pub const MIN_USER_CHUNK: u8 = 0x80;

/// Skippable id claimed by the index trailer.
pub const CHUNK_TYPE_INDEX: u8 = 0x99;

/// Padding frame; also the largest id accepted for user chunks.
pub const CHUNK_TYPE_PADDING: u8 = 0xFE;

/// Stream identifier (the magic chunk's type byte).
pub const CHUNK_TYPE_STREAM_ID: u8 = 0xFF;

// ── Block size bounds ──────────────────────────────────────────────────────

/// Minimum configurable block size (4 KiB).
pub const MIN_BLOCK_SIZE: usize = 4 << 10;

/// Maximum configurable block size (4 MiB).
pub const MAX_BLOCK_SIZE: usize = 4 << 20;

/// Default block size (1 MiB).
pub const DEFAULT_BLOCK_SIZE: usize = 1 << 20;

/// Build the 10-byte stream header for the given block size.
///
/// The final byte encodes `bits(block_size - 1) - 10`, which a reader turns
/// back into a buffer size without parsing any block.
pub fn stream_header(block_size: usize) -> [u8; STREAM_HEADER_SIZE] {
    debug_assert!((MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size));
    let bits = usize::BITS - (block_size - 1).leading_zeros();
    let mut hdr = [0u8; STREAM_HEADER_SIZE];
    hdr[..MAGIC_CHUNK.len()].copy_from_slice(MAGIC_CHUNK);
    hdr[MAGIC_CHUNK.len()] = (bits - 10) as u8;
    hdr
}

/// Fill the 4-byte chunk header at the front of `dst`.
pub fn put_chunk_header(dst: &mut [u8], chunk_type: u8, body_len: usize) {
    debug_assert!(body_len <= MAX_CHUNK_BODY);
    dst[0] = chunk_type;
    dst[1] = body_len as u8;
    dst[2] = (body_len >> 8) as u8;
    dst[3] = (body_len >> 16) as u8;
}

/// Parse a 4-byte chunk header into (type, body length).
pub fn read_chunk_header(src: &[u8]) -> (u8, usize) {
    debug_assert!(src.len() >= CHUNK_HEADER_SIZE);
    let len = src[1] as usize | (src[2] as usize) << 8 | (src[3] as usize) << 16;
    (src[0], len)
}

/// Total size of the padding frame that rounds `written` up to a multiple of
/// `multiple`, or 0 when no padding is needed.
///
/// The frame is at least [`MIN_SKIPPABLE_FRAME_SIZE`] bytes; when the natural
/// remainder is smaller, whole multiples are added until the frame fits.
pub fn padding_len(written: u64, multiple: u64) -> u64 {
    debug_assert!(multiple > 1);
    let left_over = written % multiple;
    if left_over == 0 {
        return 0;
    }
    let mut add = multiple - left_over;
    while add < MIN_SKIPPABLE_FRAME_SIZE {
        add += multiple;
    }
    add
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_header_default_block_size() {
        let hdr = stream_header(DEFAULT_BLOCK_SIZE);
        assert_eq!(&hdr[..9], MAGIC_CHUNK);
        // bits(1 MiB - 1) = 20
        assert_eq!(hdr[9], 10);
    }

    #[test]
    fn test_stream_header_min_and_max() {
        assert_eq!(stream_header(MIN_BLOCK_SIZE)[9], 2); // bits(4095) = 12
        assert_eq!(stream_header(MAX_BLOCK_SIZE)[9], 12); // bits(4M - 1) = 22
    }

    #[test]
    fn test_stream_header_magic_chunk_is_well_formed() {
        // The magic itself parses as a chunk of type 0xFF with a 6-byte body
        let (ty, len) = read_chunk_header(MAGIC_CHUNK);
        assert_eq!(ty, CHUNK_TYPE_STREAM_ID);
        assert_eq!(len, 6);
        assert_eq!(len, MAGIC_CHUNK.len() - CHUNK_HEADER_SIZE + 1);
    }

    #[test]
    fn test_chunk_header_roundtrip() {
        let mut buf = [0u8; 4];
        for (ty, len) in [
            (CHUNK_TYPE_UNCOMPRESSED_DATA, 0usize),
            (CHUNK_TYPE_COMPRESSED_DATA, 5),
            (CHUNK_TYPE_EOF, 1),
            (0x90, 0x0123_45),
            (CHUNK_TYPE_PADDING, MAX_CHUNK_BODY),
        ] {
            put_chunk_header(&mut buf, ty, len);
            assert_eq!(read_chunk_header(&buf), (ty, len));
        }
    }

    #[test]
    fn test_chunk_header_little_endian() {
        let mut buf = [0u8; 4];
        put_chunk_header(&mut buf, CHUNK_TYPE_UNCOMPRESSED_DATA, 0x00AB_CDEF & MAX_CHUNK_BODY);
        assert_eq!(buf[1], 0xEF);
        assert_eq!(buf[2], 0xCD);
        assert_eq!(buf[3], 0xAB);
    }

    #[test]
    fn test_padding_len_aligned_is_zero() {
        assert_eq!(padding_len(1024, 1024), 0);
        assert_eq!(padding_len(2048, 1024), 0);
        assert_eq!(padding_len(0, 1024), 0);
    }

    #[test]
    fn test_padding_len_rounds_up() {
        assert_eq!(padding_len(1000, 1024), 24);
        assert_eq!(padding_len(15, 1024), 1009);
        // (written + add) is always a multiple
        for written in [1u64, 100, 1023, 1025, 5000] {
            let add = padding_len(written, 1024);
            assert_eq!((written + add) % 1024, 0);
        }
    }

    #[test]
    fn test_padding_len_respects_minimum_frame() {
        // Remainder of 2 cannot hold the 5-byte minimum frame; a whole
        // multiple is added.
        assert_eq!(padding_len(14, 16), 18);
        assert_eq!(padding_len(1022, 1024), 1026);
        // Remainder of exactly the minimum is used as-is.
        assert_eq!(padding_len(1019, 1024), 5);
    }
}

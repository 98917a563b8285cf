//! Block Compression Kernel
//!
//! LZ77-style compression of a single block, independent of every other
//! block. The stream writer treats each encoder as a pure function over
//! caller-provided scratch: it returns the number of bytes written, or 0 when
//! the input is incompressible (the writer then stores the block raw).
//!
//! ## Encoded Form
//!
//! A sequence of ops, distinguished by the two low bits of the tag byte:
//!
//! - `00` literal: run length - 1 in the upper six bits, or 60..63 selecting
//!   1-4 extra little-endian length bytes; raw bytes follow.
//! - `01` copy1: length 4-11 and an 11-bit offset packed into two bytes.
//! - `10` copy2: length 1-64, 16-bit offset.
//! - `11` copy4: length 1-64, 32-bit offset.
//!
//! ## Levels
//!
//! All three levels run the same greedy matcher and differ in how much work
//! they spend finding matches: table size and how aggressively the probe
//! loop skips through incompressible regions. Output is deterministic for a
//! given (input, level).

use crate::error::{Error, Result};

const TAG_LITERAL: u8 = 0x00;
const TAG_COPY1: u8 = 0x01;
const TAG_COPY2: u8 = 0x02;
const TAG_COPY4: u8 = 0x03;

/// Inputs shorter than this are never worth a match search.
const MIN_COMPRESS_INPUT: usize = 32;

/// Bytes at the tail of the input the matcher will not start a match in, so
/// four-byte loads never run off the end.
const INPUT_MARGIN: usize = 8;

const MIN_MATCH: usize = 4;

/// Upper bound on the encoded size of `src_len` input bytes.
///
/// Scratch buffers sized to this can never overflow; the encoders bail with
/// 0 (incompressible) long before reaching it.
pub fn max_encoded_len(src_len: usize) -> usize {
    32 + src_len + src_len / 6
}

/// Fastest level: small table, aggressive skipping.
pub fn encode_fastest(dst: &mut [u8], src: &[u8]) -> usize {
    encode_inner(dst, src, 14, 5)
}

/// Balanced level: the default trade-off.
pub fn encode_balanced(dst: &mut [u8], src: &[u8]) -> usize {
    encode_inner(dst, src, 16, 6)
}

/// Smallest level: largest table, slowest skip ramp.
pub fn encode_smallest(dst: &mut [u8], src: &[u8]) -> usize {
    encode_inner(dst, src, 17, 7)
}

#[inline]
fn load32(src: &[u8], i: usize) -> u32 {
    u32::from_le_bytes(src[i..i + 4].try_into().unwrap())
}

#[inline]
fn hash(v: u32, shift: u32) -> usize {
    (v.wrapping_mul(0x1E35_A7BD) >> shift) as usize
}

fn encode_inner(dst: &mut [u8], src: &[u8], table_bits: u32, skip_shift: u32) -> usize {
    if src.len() < MIN_COMPRESS_INPUT {
        return 0;
    }

    let shift = 32 - table_bits;
    let mut table = vec![0u32; 1usize << table_bits];

    let s_limit = src.len() - INPUT_MARGIN;
    let mut d = 0usize;
    let mut next_emit = 0usize;
    let mut s = 1usize;
    let mut next_hash = hash(load32(src, s), shift);

    'outer: loop {
        // Probe for a match, accelerating through regions that produce none.
        let mut skip = 1usize << skip_shift;
        let mut next_s = s;
        let first_candidate;
        loop {
            s = next_s;
            let bytes_between = skip >> skip_shift;
            skip += bytes_between;
            next_s = s + bytes_between;
            if next_s > s_limit {
                break 'outer;
            }
            let c = table[next_hash] as usize;
            table[next_hash] = s as u32;
            next_hash = hash(load32(src, next_s), shift);
            if c < s && load32(src, s) == load32(src, c) {
                first_candidate = c;
                break;
            }
        }

        // Literal run up to the match.
        let Some(n) = emit_literal(&mut dst[d..], &src[next_emit..s]) else {
            return 0;
        };
        d += n;

        // Chain copies for as long as matches keep landing back to back.
        let mut cand = first_candidate;
        loop {
            let base = s;
            s += MIN_MATCH;
            let mut m = cand + MIN_MATCH;
            while s < src.len() && src[s] == src[m] {
                s += 1;
                m += 1;
            }
            let Some(n) = emit_copy(&mut dst[d..], base - cand, s - base) else {
                return 0;
            };
            d += n;
            next_emit = s;
            if s >= s_limit {
                break 'outer;
            }

            // The byte after a match often starts the next one; check the
            // table here before falling back to the probe loop.
            let prev = load32(src, s - 1);
            table[hash(prev, shift)] = (s - 1) as u32;
            let cur = load32(src, s);
            let h = hash(cur, shift);
            let c = table[h] as usize;
            table[h] = s as u32;
            if c >= s || cur != load32(src, c) {
                s += 1;
                next_hash = hash(load32(src, s), shift);
                break;
            }
            cand = c;
        }
    }

    if next_emit < src.len() {
        let Some(n) = emit_literal(&mut dst[d..], &src[next_emit..]) else {
            return 0;
        };
        d += n;
    }

    // Not worth a compressed chunk if nothing was saved.
    if d >= src.len() {
        return 0;
    }
    d
}

#[inline]
fn emit_literal(dst: &mut [u8], lit: &[u8]) -> Option<usize> {
    let n = lit.len();
    if n == 0 {
        return Some(0);
    }
    let n1 = n - 1;
    let header = if n1 < 60 {
        1
    } else if n1 < 1 << 8 {
        2
    } else if n1 < 1 << 16 {
        3
    } else if n1 < 1 << 24 {
        4
    } else {
        5
    };
    if dst.len() < header + n {
        return None;
    }
    match header {
        1 => dst[0] = (n1 as u8) << 2 | TAG_LITERAL,
        2 => {
            dst[0] = 60 << 2;
            dst[1] = n1 as u8;
        }
        3 => {
            dst[0] = 61 << 2;
            dst[1..3].copy_from_slice(&(n1 as u16).to_le_bytes());
        }
        4 => {
            dst[0] = 62 << 2;
            dst[1..4].copy_from_slice(&(n1 as u32).to_le_bytes()[..3]);
        }
        _ => {
            dst[0] = 63 << 2;
            dst[1..5].copy_from_slice(&(n1 as u32).to_le_bytes());
        }
    }
    dst[header..header + n].copy_from_slice(lit);
    Some(header + n)
}

#[inline]
fn emit_copy(dst: &mut [u8], offset: usize, mut len: usize) -> Option<usize> {
    let mut d = 0;
    // Split long matches so the remainder never drops below MIN_MATCH.
    while len >= 68 {
        d += put_copy_op(&mut dst[d..], offset, 64)?;
        len -= 64;
    }
    if len > 64 {
        d += put_copy_op(&mut dst[d..], offset, 60)?;
        len -= 60;
    }
    if (4..=11).contains(&len) && offset < 1 << 11 {
        if dst.len() < d + 2 {
            return None;
        }
        dst[d] = ((offset >> 8) as u8) << 5 | ((len - 4) as u8) << 2 | TAG_COPY1;
        dst[d + 1] = offset as u8;
        d += 2;
    } else {
        d += put_copy_op(&mut dst[d..], offset, len)?;
    }
    Some(d)
}

#[inline]
fn put_copy_op(dst: &mut [u8], offset: usize, len: usize) -> Option<usize> {
    debug_assert!((1..=64).contains(&len));
    if offset < 1 << 16 {
        if dst.len() < 3 {
            return None;
        }
        dst[0] = ((len - 1) as u8) << 2 | TAG_COPY2;
        dst[1..3].copy_from_slice(&(offset as u16).to_le_bytes());
        Some(3)
    } else {
        if dst.len() < 5 {
            return None;
        }
        dst[0] = ((len - 1) as u8) << 2 | TAG_COPY4;
        dst[1..5].copy_from_slice(&(offset as u32).to_le_bytes());
        Some(5)
    }
}

/// Decode a compressed block into `dst`, returning the number of bytes
/// produced. `dst` must be at least the block's uncompressed length (which
/// the stream format carries alongside the payload).
pub fn decode(dst: &mut [u8], src: &[u8]) -> Result<usize> {
    let mut s = 0usize;
    let mut d = 0usize;
    while s < src.len() {
        let tag = src[s];
        match tag & 0x03 {
            TAG_LITERAL => {
                let lit_tag = (tag >> 2) as usize;
                let (len, advance) = if lit_tag < 60 {
                    (lit_tag + 1, 1)
                } else {
                    let extra = lit_tag - 59;
                    if s + 1 + extra > src.len() {
                        return Err(Error::Corrupt(s));
                    }
                    let mut v = 0usize;
                    for i in 0..extra {
                        v |= (src[s + 1 + i] as usize) << (8 * i);
                    }
                    (v + 1, 1 + extra)
                };
                s += advance;
                if s + len > src.len() || d + len > dst.len() {
                    return Err(Error::Corrupt(s));
                }
                dst[d..d + len].copy_from_slice(&src[s..s + len]);
                s += len;
                d += len;
            }
            TAG_COPY1 => {
                if s + 2 > src.len() {
                    return Err(Error::Corrupt(s));
                }
                let len = 4 + ((tag >> 2) & 0x07) as usize;
                let offset = ((tag as usize & 0xE0) << 3) | src[s + 1] as usize;
                s += 2;
                copy_match(dst, d, offset, len).ok_or(Error::Corrupt(s))?;
                d += len;
            }
            TAG_COPY2 => {
                if s + 3 > src.len() {
                    return Err(Error::Corrupt(s));
                }
                let len = 1 + (tag >> 2) as usize;
                let offset = u16::from_le_bytes([src[s + 1], src[s + 2]]) as usize;
                s += 3;
                copy_match(dst, d, offset, len).ok_or(Error::Corrupt(s))?;
                d += len;
            }
            _ => {
                if s + 5 > src.len() {
                    return Err(Error::Corrupt(s));
                }
                let len = 1 + (tag >> 2) as usize;
                let offset =
                    u32::from_le_bytes([src[s + 1], src[s + 2], src[s + 3], src[s + 4]]) as usize;
                s += 5;
                copy_match(dst, d, offset, len).ok_or(Error::Corrupt(s))?;
                d += len;
            }
        }
    }
    Ok(d)
}

/// Replay `len` bytes from `offset` back in the output. Byte-at-a-time
/// because the source and destination ranges overlap when `offset < len`.
#[inline]
fn copy_match(dst: &mut [u8], d: usize, offset: usize, len: usize) -> Option<()> {
    if offset == 0 || offset > d || d + len > dst.len() {
        return None;
    }
    for i in 0..len {
        dst[d + i] = dst[d + i - offset];
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(encode: fn(&mut [u8], &[u8]) -> usize, src: &[u8]) -> Option<Vec<u8>> {
        let mut dst = vec![0u8; max_encoded_len(src.len())];
        let n = encode(&mut dst, src);
        if n == 0 {
            return None;
        }
        assert!(n < src.len(), "kernel claimed compression without saving");
        let mut out = vec![0u8; src.len()];
        let produced = decode(&mut out, &dst[..n]).expect("decode failed");
        assert_eq!(produced, src.len());
        assert_eq!(out, src);
        Some(dst[..n].to_vec())
    }

    fn sample_text(len: usize) -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog. "
            .iter()
            .copied()
            .cycle()
            .take(len)
            .collect()
    }

    /// Deterministic pseudo-random bytes (xorshift), incompressible in bulk.
    fn noise(len: usize, mut seed: u64) -> Vec<u8> {
        (0..len)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                seed as u8
            })
            .collect()
    }

    // ---------------------------------------------------------------
    // Roundtrips per level
    // ---------------------------------------------------------------

    #[test]
    fn test_roundtrip_repetitive_all_levels() {
        let src = sample_text(10_000);
        for encode in [encode_fastest, encode_balanced, encode_smallest] {
            let compressed = roundtrip(encode, &src).expect("repetitive data must compress");
            assert!(compressed.len() < src.len() / 2);
        }
    }

    #[test]
    fn test_roundtrip_single_repeated_byte() {
        let src = vec![0xABu8; 64 * 1024];
        for encode in [encode_fastest, encode_balanced, encode_smallest] {
            let compressed = roundtrip(encode, &src).unwrap();
            // A run collapses to a literal seed plus chained copy ops.
            assert!(compressed.len() < 4096);
        }
    }

    #[test]
    fn test_roundtrip_mixed_content() {
        let mut src = sample_text(4096);
        src.extend_from_slice(&noise(512, 7));
        src.extend_from_slice(&sample_text(4096));
        for encode in [encode_fastest, encode_balanced, encode_smallest] {
            roundtrip(encode, &src).expect("mostly repetitive data must compress");
        }
    }

    #[test]
    fn test_roundtrip_long_matches() {
        // Matches far longer than one copy op can carry.
        let mut src = noise(300, 3);
        let prefix = src.clone();
        src.extend_from_slice(&prefix);
        src.extend_from_slice(&prefix);
        for encode in [encode_fastest, encode_balanced, encode_smallest] {
            roundtrip(encode, &src).expect("repeated prefix must compress");
        }
    }

    // ---------------------------------------------------------------
    // Incompressible and short inputs
    // ---------------------------------------------------------------

    #[test]
    fn test_noise_is_incompressible() {
        let src = noise(8192, 42);
        let mut dst = vec![0u8; max_encoded_len(src.len())];
        assert_eq!(encode_balanced(&mut dst, &src), 0);
    }

    #[test]
    fn test_short_input_is_stored() {
        let mut dst = vec![0u8; max_encoded_len(31)];
        assert_eq!(encode_fastest(&mut dst, b"hello"), 0);
        assert_eq!(encode_balanced(&mut dst, &[0u8; 31]), 0);
        assert_eq!(encode_smallest(&mut dst, &[]), 0);
    }

    #[test]
    fn test_minimum_compressible_size() {
        let src = vec![b'x'; MIN_COMPRESS_INPUT];
        let mut dst = vec![0u8; max_encoded_len(src.len())];
        let n = encode_balanced(&mut dst, &src);
        if n > 0 {
            let mut out = vec![0u8; src.len()];
            assert_eq!(decode(&mut out, &dst[..n]).unwrap(), src.len());
            assert_eq!(out, src);
        }
    }

    // ---------------------------------------------------------------
    // Determinism
    // ---------------------------------------------------------------

    #[test]
    fn test_deterministic_output() {
        let src = sample_text(50_000);
        for encode in [encode_fastest, encode_balanced, encode_smallest] {
            let a = roundtrip(encode, &src).unwrap();
            let b = roundtrip(encode, &src).unwrap();
            assert_eq!(a, b);
        }
    }

    // ---------------------------------------------------------------
    // Decode hardening
    // ---------------------------------------------------------------

    #[test]
    fn test_decode_rejects_bad_offset() {
        // copy2 back past the start of the output
        let bad = [(4 - 1) << 2 | TAG_COPY2, 0x10, 0x00];
        let mut out = vec![0u8; 64];
        assert!(decode(&mut out, &bad).is_err());
    }

    #[test]
    fn test_decode_rejects_zero_offset() {
        let bad = [
            3 << 2 | TAG_LITERAL,
            b'a',
            b'b',
            b'c',
            b'd',
            (4 - 1) << 2 | TAG_COPY2,
            0x00,
            0x00,
        ];
        let mut out = vec![0u8; 64];
        assert!(decode(&mut out, &bad).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_literal() {
        let bad = [10 << 2 | TAG_LITERAL, b'a', b'b'];
        let mut out = vec![0u8; 64];
        assert!(decode(&mut out, &bad).is_err());
    }

    #[test]
    fn test_decode_rejects_output_overflow() {
        let src = sample_text(1000);
        let mut dst = vec![0u8; max_encoded_len(src.len())];
        let n = encode_balanced(&mut dst, &src);
        assert!(n > 0);
        let mut tiny = vec![0u8; 10];
        assert!(decode(&mut tiny, &dst[..n]).is_err());
    }

    // ---------------------------------------------------------------
    // Bounds
    // ---------------------------------------------------------------

    #[test]
    fn test_output_within_max_encoded_len() {
        for len in [64usize, 1000, 65_536] {
            let src = sample_text(len);
            let mut dst = vec![0u8; max_encoded_len(len)];
            let n = encode_smallest(&mut dst, &src);
            assert!(n <= max_encoded_len(len));
        }
    }

    #[test]
    fn test_insufficient_scratch_bails_to_stored() {
        let src = sample_text(10_000);
        let mut tiny = vec![0u8; 16];
        assert_eq!(encode_balanced(&mut tiny, &src), 0);
    }
}

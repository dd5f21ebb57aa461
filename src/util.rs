//! Utility functions for binary data processing.
//!
//! - Unaligned little-endian reads (byteorder)
//! - Byte searches (memchr)
//! - LEB128 decoding with fast paths for short values
//! - Power-of-two alignment

use byteorder::{ByteOrder, LittleEndian};

// =============================================================================
// Fast Unaligned Reads
// =============================================================================

/// Reads a little-endian u64 from an unaligned byte slice.
///
/// # Panics
///
/// Panics if `data.len() < 8`.
#[inline(always)]
pub fn read_u64_le(data: &[u8]) -> u64 {
    LittleEndian::read_u64(data)
}

/// Reads a little-endian u32 from an unaligned byte slice.
///
/// # Panics
///
/// Panics if `data.len() < 4`.
#[inline(always)]
pub fn read_u32_le(data: &[u8]) -> u32 {
    LittleEndian::read_u32(data)
}

/// Reads a little-endian u16 from an unaligned byte slice.
///
/// # Panics
///
/// Panics if `data.len() < 2`.
#[inline(always)]
pub fn read_u16_le(data: &[u8]) -> u16 {
    LittleEndian::read_u16(data)
}

/// Writes a little-endian u32 into a byte slice.
#[inline(always)]
pub fn write_u32_le(data: &mut [u8], value: u32) {
    LittleEndian::write_u32(data, value)
}

// =============================================================================
// Byte Search
// =============================================================================

/// Finds the position of the first null byte in a slice.
///
/// Returns the slice length when there is none.
#[inline(always)]
pub fn memchr_null(data: &[u8]) -> usize {
    memchr::memchr(0, data).unwrap_or(data.len())
}

// =============================================================================
// LEB128
// =============================================================================

/// Reads an unsigned LEB128 value.
///
/// Single and two byte encodings take a fast path; they cover almost every
/// value found in export tries and function starts.
///
/// Returns `(value, bytes_consumed)` or `None` if truncated or overlong.
#[inline(always)]
pub fn read_uleb128(data: &[u8]) -> Option<(u64, usize)> {
    let &b0 = data.first()?;
    if b0 < 0x80 {
        return Some((b0 as u64, 1));
    }

    let &b1 = data.get(1)?;
    if b1 < 0x80 {
        let value = ((b0 & 0x7F) as u64) | ((b1 as u64) << 7);
        return Some((value, 2));
    }

    let mut result: u64 = 0;
    let mut shift = 0u32;

    for (i, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return None;
        }

        result |= ((byte & 0x7F) as u64) << shift;
        shift += 7;

        if byte < 0x80 {
            return Some((result, i + 1));
        }
    }

    None
}

/// Writes an unsigned LEB128 value.
pub fn write_uleb128(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

// =============================================================================
// Bit Helpers
// =============================================================================

/// Sign-extends the low `bits` bits of `value`.
#[inline(always)]
pub const fn sign_extend(value: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

/// Aligns a value up to the given power-of-two alignment.
#[inline(always)]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

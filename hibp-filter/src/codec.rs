//! Fixed-layout binary encoding of a [`BinaryFuse8`].
//!
//! Little-endian throughout:
//!
//! | offset | size | field                  |
//! |--------|------|------------------------|
//! | 0      | 8    | seed                   |
//! | 8      | 4    | segment length         |
//! | 12     | 4    | segment length mask    |
//! | 16     | 4    | segment count          |
//! | 20     | 4    | segment count length   |
//! | 24     | n    | fingerprints           |
//!
//! `n` is `(segment_count + 2) * segment_length`, or zero for an empty filter.

use std::io::{self, Write};

use crate::error::Error;
use crate::fuse::{BinaryFuse8, Layout};

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 24;

/// Writes the encoded filter to `w`.
pub fn write_to<W: Write>(filter: &BinaryFuse8, w: &mut W) -> io::Result<()> {
    let layout = filter.layout();
    w.write_all(&filter.seed().to_le_bytes())?;
    w.write_all(&layout.segment_length.to_le_bytes())?;
    w.write_all(&layout.segment_length_mask.to_le_bytes())?;
    w.write_all(&layout.segment_count.to_le_bytes())?;
    w.write_all(&layout.segment_count_length.to_le_bytes())?;
    w.write_all(filter.fingerprints())?;
    w.flush()
}

/// Encodes the filter into a new buffer.
pub fn encode(filter: &BinaryFuse8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(filter));
    // Writing into a Vec cannot fail.
    let _ = write_to(filter, &mut buf);
    buf
}

/// Length of the encoding of `filter`.
#[inline]
pub fn encoded_len(filter: &BinaryFuse8) -> usize {
    HEADER_LEN + filter.len()
}

#[inline(always)]
fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

/// Decodes a filter, validating the header against the payload.
pub fn decode(data: &[u8]) -> Result<BinaryFuse8, Error> {
    if data.len() < HEADER_LEN {
        return Err(Error::corrupt(format!(
            "{} bytes is shorter than the {HEADER_LEN} byte header",
            data.len()
        )));
    }

    let mut seed = [0u8; 8];
    seed.copy_from_slice(&data[0..8]);
    let seed = u64::from_le_bytes(seed);
    let layout = Layout {
        segment_length: read_u32(data, 8),
        segment_length_mask: read_u32(data, 12),
        segment_count: read_u32(data, 16),
        segment_count_length: read_u32(data, 20),
    };

    let body = &data[HEADER_LEN..];
    if body.len() < layout.segment_count_length as usize {
        return Err(Error::corrupt(format!(
            "header declares segment count length {} but only {} fingerprint bytes follow",
            layout.segment_count_length,
            body.len()
        )));
    }

    if layout == Layout::default() {
        if !body.is_empty() {
            return Err(Error::corrupt("empty filter carries fingerprint bytes"));
        }
        return Ok(BinaryFuse8::empty());
    }

    validate_layout(&layout)?;

    let expected = layout.array_length();
    if body.len() != expected {
        return Err(Error::corrupt(format!(
            "expected {expected} fingerprint bytes, found {}",
            body.len()
        )));
    }

    Ok(BinaryFuse8::from_parts(seed, layout, body.to_vec()))
}

fn validate_layout(layout: &Layout) -> Result<(), Error> {
    if !layout.segment_length.is_power_of_two() {
        return Err(Error::corrupt(format!(
            "segment length {} is not a power of two",
            layout.segment_length
        )));
    }
    if layout.segment_length_mask != layout.segment_length - 1 {
        return Err(Error::corrupt(format!(
            "segment length mask {:#x} does not match segment length {}",
            layout.segment_length_mask, layout.segment_length
        )));
    }
    if layout.segment_count == 0 {
        return Err(Error::corrupt("segment count is zero"));
    }
    let product = layout.segment_count as u64 * layout.segment_length as u64;
    if product != layout.segment_count_length as u64 {
        return Err(Error::corrupt(format!(
            "segment count length {} does not equal {} segments of {}",
            layout.segment_count_length, layout.segment_count, layout.segment_length
        )));
    }
    Ok(())
}

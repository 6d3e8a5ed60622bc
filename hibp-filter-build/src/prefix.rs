//! Hex partitioning of the SHA-1 space.
//!
//! Filters are built per 3 hex digit shard; the range API is queried per
//! 5 hex digit prefix, so every shard expands to 256 fine prefixes.

use std::fmt;

use hibp_filter::HEX_CHARS;
use serde::{Serialize, Serializer};

use crate::error::Error;

/// Width of a shard prefix in hex characters.
pub const SHARD_WIDTH: u32 = 3;

/// Hex characters appended to a shard prefix to form a fine range prefix.
pub const FINE_SUFFIX_WIDTH: u32 = 2;

/// Fine range prefixes per shard (16^2).
pub const FINE_PER_SHARD: usize = 256;

const MAX_WIDTH: u32 = 8;

/// Returns every `width` digit uppercase hex string in `[start, 16^width)`,
/// in ascending order.
///
/// `start == 16^width` yields an empty sequence; anything outside
/// `0..=16^width` is rejected.
pub fn enumerate(width: u32, start: i64) -> Result<Vec<String>, Error> {
    if width == 0 || width > MAX_WIDTH {
        return Err(Error::InvalidArgument(format!(
            "prefix width {width} must be between 1 and {MAX_WIDTH}"
        )));
    }
    let end = 16_i64.pow(width);
    if !(0..=end).contains(&start) {
        return Err(Error::InvalidArgument(format!(
            "start {start} is outside 0..={end} for width {width}"
        )));
    }
    Ok(hex_range(width, start as u64, end as u64).collect())
}

fn hex_range(width: u32, start: u64, end: u64) -> impl Iterator<Item = String> {
    let width = width as usize;
    (start..end).map(move |i| format!("{i:0width$X}"))
}

/// The 3 hex character key of one filter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardPrefix([u8; 3]);

impl ShardPrefix {
    /// Parses a shard prefix such as `0AF`. Lowercase is accepted.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let invalid = || {
            Error::InvalidArgument(format!("{input:?} is not a 3 digit hex shard prefix"))
        };
        let bytes: [u8; 3] = input.as_bytes().try_into().map_err(|_| invalid())?;
        if !bytes.iter().all(u8::is_ascii_hexdigit) {
            return Err(invalid());
        }
        Ok(Self(bytes.map(|b| b.to_ascii_uppercase())))
    }

    /// The shard with numeric value `index`, if it is below 4096.
    pub fn from_index(index: u32) -> Option<Self> {
        if index >= hibp_filter::TOTAL_SHARDS {
            return None;
        }
        Some(Self([
            HEX_CHARS[((index >> 8) & 0xF) as usize],
            HEX_CHARS[((index >> 4) & 0xF) as usize],
            HEX_CHARS[(index & 0xF) as usize],
        ]))
    }

    /// Numeric value of the prefix, `0..4096`.
    pub fn index(&self) -> u32 {
        u32::from_str_radix(self.as_str(), 16).unwrap_or(0)
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: only constructed from validated ASCII hex.
        unsafe { std::str::from_utf8_unchecked(&self.0) }
    }

    /// The 256 fine range prefixes under this shard, `{shard}00` to `{shard}FF`.
    pub fn fine_prefixes(&self) -> Vec<FineRangePrefix> {
        hex_range(FINE_SUFFIX_WIDTH, 0, FINE_PER_SHARD as u64)
            .map(|suffix| {
                let s = suffix.as_bytes();
                FineRangePrefix([self.0[0], self.0[1], self.0[2], s[0], s[1]])
            })
            .collect()
    }
}

/// Shard prefixes from `from` to `FFF`, in ascending order.
pub fn shard_prefixes(from: ShardPrefix) -> Result<Vec<ShardPrefix>, Error> {
    enumerate(SHARD_WIDTH, from.index() as i64)?.iter().map(|s| ShardPrefix::parse(s)).collect()
}

/// A 5 hex character prefix, the unit of a range query.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FineRangePrefix([u8; 5]);

impl FineRangePrefix {
    pub fn as_str(&self) -> &str {
        // SAFETY: built from a validated shard prefix and generated hex digits.
        unsafe { std::str::from_utf8_unchecked(&self.0) }
    }

    pub fn shard(&self) -> ShardPrefix {
        ShardPrefix([self.0[0], self.0[1], self.0[2]])
    }
}

macro_rules! impl_prefix_fmt {
    ($($ty:ty),*) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }
    )*};
}

impl_prefix_fmt!(ShardPrefix, FineRangePrefix);

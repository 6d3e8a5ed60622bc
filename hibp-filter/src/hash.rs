//! Hash keys and the 64-bit key hash shared by the build and query sides.
//!
//! Every leaked password is identified by its uppercase SHA-1 hex digest (a
//! [`HashKey`]). Filters do not store digests; they store keys derived with
//! [`key_hash`], which is MetroHash64 over the 40 ASCII bytes of the digest,
//! seeded with [`KEY_HASH_SEED`]. Both sides must agree on this bit for bit:
//! a mismatch makes every lookup a silent negative.

use std::fmt;
use std::hash::Hasher;
use std::str::FromStr;

use metrohash::MetroHash64;
use sha1::{Digest, Sha1};

use crate::error::Error;

/// Seed for [`key_hash`]. Part of the stored filter contract.
pub const KEY_HASH_SEED: u64 = 1337;

/// Length of a SHA-1 digest in hex characters.
pub const HASH_KEY_LEN: usize = 40;

/// Length of a shard prefix in hex characters.
pub const SHARD_PREFIX_LEN: usize = 3;

/// Hex lookup table for prefix conversion.
pub const HEX_CHARS: &[u8; 16] = b"0123456789ABCDEF";

/// A 40 character uppercase hex SHA-1 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashKey([u8; HASH_KEY_LEN]);

impl HashKey {
    /// Parses a digest, accepting either case. The stored form is uppercase.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let bytes = input.as_bytes();
        if bytes.len() != HASH_KEY_LEN || !bytes.iter().all(u8::is_ascii_hexdigit) {
            return Err(Error::InvalidHashKey { input: input.to_string() });
        }

        let mut out = [0u8; HASH_KEY_LEN];
        for (dst, src) in out.iter_mut().zip(bytes) {
            *dst = src.to_ascii_uppercase();
        }
        Ok(Self(out))
    }

    /// Joins a range prefix and the suffix reported for it.
    ///
    /// Returns `None` unless the two together form a valid digest.
    pub fn from_parts(prefix: &str, suffix: &str) -> Option<Self> {
        if prefix.len() + suffix.len() != HASH_KEY_LEN {
            return None;
        }
        let mut joined = [0u8; HASH_KEY_LEN];
        joined[..prefix.len()].copy_from_slice(prefix.as_bytes());
        joined[prefix.len()..].copy_from_slice(suffix.as_bytes());
        if !joined.iter().all(u8::is_ascii_hexdigit) {
            return None;
        }
        joined.make_ascii_uppercase();
        Some(Self(joined))
    }

    /// SHA-1 of the password, as the edge handler computes it before a lookup.
    pub fn from_password(password: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(password.as_bytes());
        let digest: [u8; 20] = hasher.finalize().into();

        let mut out = [0u8; HASH_KEY_LEN];
        for (i, byte) in digest.iter().enumerate() {
            out[i * 2] = HEX_CHARS[(byte >> 4) as usize];
            out[i * 2 + 1] = HEX_CHARS[(byte & 0x0f) as usize];
        }
        Self(out)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; HASH_KEY_LEN] {
        &self.0
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        // SAFETY: constructors only ever store ASCII hex digits.
        unsafe { std::str::from_utf8_unchecked(&self.0) }
    }

    /// The shard this digest belongs to (first 3 hex characters).
    #[inline]
    pub fn shard_prefix(&self) -> &str {
        &self.as_str()[..SHARD_PREFIX_LEN]
    }

    /// The 64-bit filter key for this digest.
    #[inline]
    pub fn key(&self) -> u64 {
        key_hash(self)
    }
}

impl fmt::Debug for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HashKey").field(&self.as_str()).finish()
    }
}

impl fmt::Display for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Maps a digest to the 64-bit key stored in (and looked up from) a filter.
#[inline]
pub fn key_hash(key: &HashKey) -> u64 {
    metro_hash64(key.as_bytes(), KEY_HASH_SEED)
}

/// MetroHash64 of `buf` (the reference `MetroHash64::Hash`, as exposed by
/// go-metro's `Hash64`).
#[inline]
pub fn metro_hash64(buf: &[u8], seed: u64) -> u64 {
    let mut hasher = MetroHash64::with_seed(seed);
    hasher.write(buf);
    hasher.finish()
}

//! Binary fuse filter with 8-bit fingerprints.
//!
//! Each key is mixed with the filter seed and mapped to three slots in three
//! consecutive segments of the fingerprint array. Construction peels keys that
//! currently own a slot alone, then assigns fingerprints in reverse peel order
//! so that the XOR of a key's three slots equals its fingerprint. Peeling can
//! stall on an unlucky seed; the builder then reseeds and starts over.
//!
//! Sizing, hashing and seeding follow the FastFilter `BinaryFuse8` layout so
//! the stored artifacts are interchangeable with filters produced by it.

use std::fmt;

use crate::error::Error;

/// Upper bound on reseed attempts before giving up on a key set.
pub const MAX_ITERATIONS: u32 = 100;

/// Initial splitmix64 counter used to derive filter seeds.
pub const DEFAULT_RNG_COUNTER: u64 = 1;

const ARITY: u32 = 3;
const MAX_SEGMENT_LENGTH: u32 = 262_144;

/// The four layout parameters stored in the filter header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Layout {
    pub segment_length: u32,
    pub segment_length_mask: u32,
    pub segment_count: u32,
    pub segment_count_length: u32,
}

impl Layout {
    /// Layout for `size` distinct keys. Depends on the key count only.
    pub fn for_size(size: u32) -> Self {
        if size == 0 {
            return Self::default();
        }

        let segment_length = segment_length_for(size).min(MAX_SEGMENT_LENGTH);
        let capacity = if size > 1 {
            (size as f64 * size_factor_for(size)).round() as u32
        } else {
            0
        };

        let segments = capacity.div_ceil(segment_length);
        let segment_count = if segments <= ARITY - 1 { 1 } else { segments - (ARITY - 1) };

        Self {
            segment_length,
            segment_length_mask: segment_length - 1,
            segment_count,
            segment_count_length: segment_count * segment_length,
        }
    }

    /// Number of fingerprint slots, including the two overlap segments.
    #[inline]
    pub fn array_length(&self) -> usize {
        if self.segment_count == 0 {
            return 0;
        }
        (self.segment_count as usize + (ARITY - 1) as usize) * self.segment_length as usize
    }

    #[inline(always)]
    fn slots(&self, hash: u64) -> [usize; 3] {
        let h0 = mulhi(hash, self.segment_count_length as u64) as u32;
        let h1 = (h0 + self.segment_length) ^ ((hash >> 18) as u32 & self.segment_length_mask);
        let h2 = (h0 + 2 * self.segment_length) ^ (hash as u32 & self.segment_length_mask);
        [h0 as usize, h1 as usize, h2 as usize]
    }
}

/// An immutable binary fuse filter over 64-bit keys.
#[derive(Clone, PartialEq, Eq)]
pub struct BinaryFuse8 {
    seed: u64,
    layout: Layout,
    fingerprints: Vec<u8>,
}

impl BinaryFuse8 {
    /// Builds a filter over `keys`. Duplicate keys are collapsed.
    ///
    /// An empty key set yields an empty filter that rejects every key.
    pub fn build(keys: &[u64]) -> Result<Self, Error> {
        Self::build_with(keys, DEFAULT_RNG_COUNTER, MAX_ITERATIONS)
    }

    /// Builds with an explicit seed counter and attempt budget.
    pub fn build_with(keys: &[u64], rng_counter: u64, max_attempts: u32) -> Result<Self, Error> {
        let mut keys = keys.to_vec();
        keys.sort_unstable();
        keys.dedup();

        if keys.is_empty() {
            return Ok(Self::empty());
        }

        let size = u32::try_from(keys.len()).map_err(|_| Error::BuildFailed { attempts: 0 })?;
        let layout = Layout::for_size(size);
        let capacity = layout.array_length();

        // Low two bits: XOR of the hash index (0, 1, 2) of every key in the
        // slot. Upper six bits: number of keys in the slot.
        let mut t2count = vec![0u8; capacity];
        let mut t2hash = vec![0u64; capacity];
        let mut alone: Vec<usize> = Vec::with_capacity(capacity);
        let mut stack: Vec<(u64, u8)> = Vec::with_capacity(keys.len());

        let mut rng = rng_counter;
        for attempt in 1..=max_attempts {
            let seed = splitmix64(&mut rng);

            t2count.fill(0);
            t2hash.fill(0);
            alone.clear();
            stack.clear();

            let mut overflow = false;
            for &key in &keys {
                let hash = mix_split(key, seed);
                for (which, slot) in layout.slots(hash).into_iter().enumerate() {
                    t2count[slot] = t2count[slot].wrapping_add(4);
                    t2count[slot] ^= which as u8;
                    t2hash[slot] ^= hash;
                    overflow |= t2count[slot] < 4;
                }
            }
            if overflow {
                tracing::debug!(attempt, seed, "slot counter overflow, reseeding");
                continue;
            }

            alone.extend((0..capacity).filter(|&slot| t2count[slot] >> 2 == 1));

            while let Some(slot) = alone.pop() {
                if t2count[slot] >> 2 != 1 {
                    continue;
                }
                let hash = t2hash[slot];
                stack.push((hash, t2count[slot] & 3));

                for (which, other) in layout.slots(hash).into_iter().enumerate() {
                    t2count[other] = t2count[other].wrapping_sub(4);
                    t2count[other] ^= which as u8;
                    t2hash[other] ^= hash;
                    if other != slot && t2count[other] >> 2 == 1 {
                        alone.push(other);
                    }
                }
            }

            if stack.len() != keys.len() {
                tracing::debug!(
                    attempt,
                    seed,
                    peeled = stack.len(),
                    keys = keys.len(),
                    "peeling stalled, reseeding"
                );
                continue;
            }

            let mut fingerprints = vec![0u8; capacity];
            for &(hash, found) in stack.iter().rev() {
                let slots = layout.slots(hash);
                let found = found as usize;
                fingerprints[slots[found]] = fingerprint(hash)
                    ^ fingerprints[slots[(found + 1) % 3]]
                    ^ fingerprints[slots[(found + 2) % 3]];
            }

            return Ok(Self { seed, layout, fingerprints });
        }

        Err(Error::BuildFailed { attempts: max_attempts })
    }

    /// A filter with no keys. Every lookup is negative.
    pub fn empty() -> Self {
        Self { seed: 0, layout: Layout::default(), fingerprints: Vec::new() }
    }

    /// Assembles a filter from decoded parts. Callers must have validated that
    /// `fingerprints.len() == layout.array_length()`.
    pub(crate) fn from_parts(seed: u64, layout: Layout, fingerprints: Vec<u8>) -> Self {
        debug_assert_eq!(fingerprints.len(), layout.array_length());
        Self { seed, layout, fingerprints }
    }

    /// Returns `true` if the key was probably in the build set.
    ///
    /// There are no false negatives. The false positive rate is about 1/256.
    #[inline]
    pub fn contains(&self, key: u64) -> bool {
        if self.fingerprints.is_empty() {
            return false;
        }
        let hash = mix_split(key, self.seed);
        let [h0, h1, h2] = self.layout.slots(hash);
        fingerprint(hash) ^ self.fingerprints[h0] ^ self.fingerprints[h1] ^ self.fingerprints[h2]
            == 0
    }

    #[inline]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    #[inline]
    pub fn fingerprints(&self) -> &[u8] {
        &self.fingerprints
    }

    /// Number of fingerprint slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

impl fmt::Debug for BinaryFuse8 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryFuse8")
            .field("seed", &self.seed)
            .field("layout", &self.layout)
            .field("fingerprints", &self.fingerprints.len())
            .finish()
    }
}

// These parameters are sensitive: replacing floor with round noticeably
// changes construction time.
fn segment_length_for(size: u32) -> u32 {
    let exponent = ((size as f64).ln() / 3.33_f64.ln() + 2.25).floor() as u32;
    1_u32 << exponent.min(MAX_SEGMENT_LENGTH.trailing_zeros())
}

fn size_factor_for(size: u32) -> f64 {
    1.125_f64.max(0.875 + 0.25 * 1_000_000_f64.ln() / (size as f64).ln())
}

#[inline(always)]
fn murmur64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    h ^= h >> 33;
    h = h.wrapping_mul(0xC4CE_B9FE_1A85_EC53);
    h ^= h >> 33;
    h
}

#[inline(always)]
fn mix_split(key: u64, seed: u64) -> u64 {
    murmur64(key.wrapping_add(seed))
}

#[inline(always)]
fn fingerprint(hash: u64) -> u8 {
    (hash ^ (hash >> 32)) as u8
}

#[inline(always)]
fn mulhi(a: u64, b: u64) -> u64 {
    ((a as u128 * b as u128) >> 64) as u64
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn random_keys(count: usize, seed: u64) -> Vec<u64> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count).map(|_| rng.r#gen::<u64>()).collect()
    }

    #[test]
    fn test_layout_small_sizes() {
        assert_eq!(
            Layout::for_size(1),
            Layout {
                segment_length: 4,
                segment_length_mask: 3,
                segment_count: 1,
                segment_count_length: 4
            }
        );
        assert_eq!(Layout::for_size(1).array_length(), 12);
        assert_eq!(Layout::for_size(3).segment_length, 8);
        assert_eq!(Layout::for_size(10).segment_length, 16);
    }

    #[test]
    fn test_layout_larger_sizes() {
        let layout = Layout::for_size(1000);
        assert_eq!(layout.segment_length, 128);
        assert_eq!(layout.segment_count, 9);
        assert_eq!(layout.segment_count_length, 1152);
        assert_eq!(layout.array_length(), 1408);

        let layout = Layout::for_size(50_000);
        assert_eq!(layout.segment_length, 2048);
        assert_eq!(layout.segment_count, 28);
        assert_eq!(layout.array_length(), 61_440);
    }

    #[test]
    fn test_no_false_negatives() {
        for count in [1, 2, 3, 10, 100, 1_000, 10_000, 100_000] {
            let keys = random_keys(count, count as u64);
            let filter = BinaryFuse8::build(&keys).unwrap();
            assert_eq!(filter.len(), filter.layout().array_length());
            for key in &keys {
                assert!(filter.contains(*key), "missing key {key} in filter of {count}");
            }
        }
    }

    #[test]
    fn test_false_positive_rate() {
        let keys = random_keys(100_000, 7);
        let members: HashSet<u64> = keys.iter().copied().collect();
        let filter = BinaryFuse8::build(&keys).unwrap();

        let mut rng = StdRng::seed_from_u64(99);
        let mut sampled = 0u64;
        let mut positives = 0u64;
        while sampled < 1_000_000 {
            let key = rng.r#gen::<u64>();
            if members.contains(&key) {
                continue;
            }
            sampled += 1;
            if filter.contains(key) {
                positives += 1;
            }
        }

        let rate = positives as f64 / sampled as f64;
        assert!(
            (1.0 / 512.0..=1.0 / 128.0).contains(&rate),
            "false positive rate {rate} out of range"
        );
    }

    #[test]
    fn test_sizing_is_independent_of_seed() {
        let keys = random_keys(25_000, 3);
        let first = BinaryFuse8::build_with(&keys, 1, MAX_ITERATIONS).unwrap();
        let second = BinaryFuse8::build_with(&keys, 0xDEAD_BEEF, MAX_ITERATIONS).unwrap();

        assert_ne!(first.seed(), second.seed());
        assert_eq!(first.layout(), second.layout());
        assert_eq!(first.len(), second.len());
    }

    #[test]
    fn test_build_is_deterministic() {
        let keys = random_keys(5_000, 11);
        let first = BinaryFuse8::build(&keys).unwrap();
        let mut reversed = keys.clone();
        reversed.reverse();
        let second = BinaryFuse8::build(&reversed).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_duplicates_are_collapsed() {
        let mut keys = random_keys(1_000, 5);
        let unique = BinaryFuse8::build(&keys).unwrap();
        keys.extend_from_within(..500);

        let with_dupes = BinaryFuse8::build(&keys).unwrap();
        assert_eq!(unique.layout(), with_dupes.layout());
        for key in &keys {
            assert!(with_dupes.contains(*key));
        }
    }

    #[test]
    fn test_empty_filter_rejects_everything() {
        let filter = BinaryFuse8::build(&[]).unwrap();
        assert!(filter.is_empty());
        assert_eq!(filter.layout(), Layout::default());
        for key in random_keys(10_000, 1) {
            assert!(!filter.contains(key));
        }
    }

    /// Twelve keys whose first two seeds from the default counter stall
    /// during peeling; the third seed succeeds.
    fn stalling_keys() -> Vec<u64> {
        (0..12u64).map(|i| (757_000 + i).wrapping_mul(0xA24B_AED4_963E_E407)).collect()
    }

    #[test]
    fn test_stalled_peel_is_reseeded() {
        let keys = stalling_keys();

        let err = BinaryFuse8::build_with(&keys, DEFAULT_RNG_COUNTER, 1).unwrap_err();
        assert!(matches!(err, Error::BuildFailed { attempts: 1 }));

        let filter = BinaryFuse8::build(&keys).unwrap();
        let mut rng = DEFAULT_RNG_COUNTER;
        let third_seed = (0..3).map(|_| splitmix64(&mut rng)).last();
        assert_eq!(Some(filter.seed()), third_seed);
        for key in &keys {
            assert!(filter.contains(*key));
        }
    }

    #[test]
    fn test_exhausted_attempts_fail() {
        let err = BinaryFuse8::build_with(&stalling_keys(), DEFAULT_RNG_COUNTER, 2).unwrap_err();
        assert!(matches!(err, Error::BuildFailed { attempts: 2 }));
    }
}

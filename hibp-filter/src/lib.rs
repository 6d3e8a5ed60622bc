//! Breached password checks against sharded binary fuse filters built from the
//! Have I Been Pwned dataset.
//!
//! The 40 hex digit SHA-1 space is split into 4096 shards by the first three
//! hex digits. Each shard is summarised by one [`BinaryFuse8`] filter over the
//! MetroHash64 values of its digests, stored as a single blob keyed by the
//! shard prefix (`000` through `FFF`). A lookup reads one blob, decodes it and
//! probes three bytes.
//!
//! Filters are approximate: a positive answer is wrong about once in 256
//! lookups, a negative answer is always right. Treat positives as "this
//! password is very likely breached".
//!
//! # Binary Format
//!
//! A 24 byte little-endian header (seed, segment length, segment length mask,
//! segment count, segment count length) followed by the fingerprint array. See
//! [`codec`] for the exact layout.
//!
//! # Example
//!
//! ```no_run
//! use hibp_filter::{DirBlobStore, FilterChecker};
//!
//! let checker = FilterChecker::new(DirBlobStore::new("./hibp-filters"));
//! let breached = checker.is_password_compromised("password123")?;
//! # Ok::<(), hibp_filter::Error>(())
//! ```

pub mod checker;
pub mod codec;
pub mod error;
pub mod fuse;
pub mod hash;
pub mod store;

pub use checker::FilterChecker;
pub use error::Error;
pub use fuse::{BinaryFuse8, Layout};
pub use hash::{HEX_CHARS, HashKey, KEY_HASH_SEED, SHARD_PREFIX_LEN, key_hash, metro_hash64};
pub use store::{BlobStore, DEFAULT_STORE_NAME, DirBlobStore, MemoryBlobStore};

/// Version of the stored filter contract: MetroHash64 keys with
/// [`KEY_HASH_SEED`] and the [`codec`] layout.
pub const FORMAT_VERSION: u32 = 1;

/// Total number of shards (16^3 = 4096)
pub const TOTAL_SHARDS: u32 = 0x1000;

//! Builds the sharded binary fuse filters consumed by
//! [hibp-filter](https://crates.io/crates/hibp-filter) from the Have I Been
//! Pwned range API.
//!
//! # Pipeline
//!
//! For every shard prefix (`000` to `FFF`), the 256 five character range
//! prefixes under it are fetched concurrently, every returned digest is hashed
//! to a 64-bit key, and one [`BinaryFuse8`](hibp_filter::BinaryFuse8) filter is
//! built over the keys and written to a [`BlobStore`](hibp_filter::BlobStore)
//! under the shard prefix.
//!
//! Range prefixes that cannot be fetched do not stop the build. Their keys
//! are missing from the shard's filter (lookups for them return false
//! negatives) and they are listed in the [`BuildReport`] so the affected
//! shards can be rebuilt with `--from`.
//!
//! # Usage
//!
//! ```sh
//! hibp-filter-build build --output ./hibp-filters
//! hibp-filter-build check --data ./hibp-filters password123
//! ```

pub mod assemble;
pub mod config;
pub mod error;
pub mod fetch;
pub mod pipeline;
pub mod prefix;

pub use assemble::{ShardAssembler, ShardKeys};
pub use config::{BuildConfig, MalformedRetry, TransportRetry};
pub use error::Error;
pub use fetch::{HttpRangeSource, RangeFetcher, RangeSource, parse_range_body};
pub use pipeline::{BuildReport, ShardPipeline, ShardReport, ShardStatus};
pub use prefix::{FineRangePrefix, ShardPrefix, enumerate, shard_prefixes};

//! Shard-by-shard build: assemble keys, build the filter, store it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hibp_filter::{BinaryFuse8, BlobStore, FORMAT_VERSION, KEY_HASH_SEED, codec};
use indicatif::ProgressBar;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::assemble::{ShardAssembler, ShardKeys};
use crate::config::BuildConfig;
use crate::error::Error;
use crate::fetch::{RangeFetcher, RangeSource};
use crate::prefix::{FineRangePrefix, ShardPrefix, shard_prefixes};

/// What happened to one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ShardStatus {
    Uploaded { filter_bytes: usize },
    /// Not uploaded because some fine prefixes failed and completeness was required.
    SkippedIncomplete,
    /// Not uploaded because no keys were collected.
    EmptyKeySet,
    /// Not uploaded because peeling never converged.
    BuildFailed { attempts: u32 },
    /// Not uploaded because the run was cancelled while fetching.
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardReport {
    pub shard: ShardPrefix,
    pub keys: usize,
    #[serde(flatten)]
    pub status: ShardStatus,
    pub failed_prefixes: Vec<FineRangePrefix>,
}

impl ShardReport {
    /// Uploaded with every fine prefix accounted for.
    pub fn is_complete(&self) -> bool {
        matches!(self.status, ShardStatus::Uploaded { .. }) && self.failed_prefixes.is_empty()
    }
}

/// Outcome of a build run.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub key_hash: &'static str,
    pub key_hash_seed: u64,
    pub format_version: u32,
    pub from: ShardPrefix,
    pub to: ShardPrefix,
    pub cancelled: bool,
    pub shards: Vec<ShardReport>,
}

impl BuildReport {
    /// Every fine prefix that could not be fetched, across all shards.
    pub fn failed_prefixes(&self) -> Vec<FineRangePrefix> {
        self.shards.iter().flat_map(|s| s.failed_prefixes.iter().copied()).collect()
    }

    pub fn uploaded(&self) -> usize {
        self.shards
            .iter()
            .filter(|s| matches!(s.status, ShardStatus::Uploaded { .. }))
            .count()
    }

    /// The shard to pass to `--from` to redo everything that is incomplete.
    pub fn resume_from(&self) -> Option<ShardPrefix> {
        if let Some(report) = self.shards.iter().find(|s| !s.is_complete()) {
            return Some(report.shard);
        }
        let next = match self.shards.last() {
            Some(last) => last.shard.index() + 1,
            None => self.from.index(),
        };
        if next > self.to.index() {
            return None;
        }
        ShardPrefix::from_index(next)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// Drives shards through assembly, filter construction and upload.
pub struct ShardPipeline<S, B> {
    assembler: ShardAssembler<S>,
    store: Arc<B>,
    require_complete: bool,
    cancel: CancellationToken,
    progress: Option<ProgressBar>,
}

impl<S, B> ShardPipeline<S, B>
where
    S: RangeSource,
    B: BlobStore + 'static,
{
    pub fn new(assembler: ShardAssembler<S>, store: Arc<B>) -> Self {
        Self {
            assembler,
            store,
            require_complete: false,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Wires fetcher, assembler and pipeline from `config`, sharing `cancel`
    /// between the pipeline and the in-flight fetches.
    pub fn from_config(
        source: S,
        store: Arc<B>,
        config: &BuildConfig,
        cancel: CancellationToken,
    ) -> Self {
        let fetcher = RangeFetcher::new(source, config.malformed_retry);
        let assembler = ShardAssembler::new(fetcher, config.concurrency)
            .with_timeout(config.shard_timeout)
            .with_cancellation(cancel.clone());
        Self::new(assembler, store)
            .require_complete(config.require_complete)
            .with_cancellation(cancel)
    }

    /// Skip uploading shards with failed fine prefixes.
    pub fn require_complete(mut self, require: bool) -> Self {
        self.require_complete = require;
        self
    }

    /// Stop after the current shard when `cancel` fires. The token should be
    /// the one given to the assembler so outstanding fetches stop too.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Builds and stores every shard from `from` to `to`, inclusive.
    ///
    /// Per-shard problems are recorded in the report. A store that rejects a
    /// write ends the run with an error.
    pub async fn run(&self, from: ShardPrefix, to: ShardPrefix) -> Result<BuildReport, Error> {
        if to < from {
            return Err(Error::InvalidArgument(format!("shard range {from}..={to} is empty")));
        }
        let shards: Vec<ShardPrefix> =
            shard_prefixes(from)?.into_iter().take_while(|s| *s <= to).collect();

        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.ensure_exists()).await??;

        if let Some(pb) = &self.progress {
            pb.set_length(shards.len() as u64);
        }

        let started_at = Utc::now();
        let mut reports = Vec::with_capacity(shards.len());
        for shard in shards {
            if self.cancel.is_cancelled() {
                break;
            }
            if let Some(pb) = &self.progress {
                pb.set_message(shard.to_string());
            }
            reports.push(self.build_shard(shard).await?);
            if let Some(pb) = &self.progress {
                pb.inc(1);
            }
        }

        let report = BuildReport {
            started_at,
            finished_at: Utc::now(),
            key_hash: "metrohash64",
            key_hash_seed: KEY_HASH_SEED,
            format_version: FORMAT_VERSION,
            from,
            to,
            cancelled: self.cancel.is_cancelled(),
            shards: reports,
        };

        let failed = report.failed_prefixes();
        if !failed.is_empty() {
            tracing::warn!(
                count = failed.len(),
                prefixes = ?failed,
                "failed to get hashes for some prefixes; they were skipped"
            );
        }
        if let Some(resume) = report.resume_from() {
            tracing::warn!(%resume, "build incomplete; retry later using --from {resume}");
        }
        tracing::info!(uploaded = report.uploaded(), shards = report.shards.len(), "done");

        Ok(report)
    }

    /// Builds and stores the filter for a single shard.
    pub async fn build_shard(&self, shard: ShardPrefix) -> Result<ShardReport, Error> {
        tracing::info!(%shard, "getting hashes for shard");
        let ShardKeys { keys, failed, .. } = self.assembler.assemble(shard).await;
        let key_count = keys.len();

        if !failed.is_empty() {
            tracing::warn!(
                %shard,
                failed = failed.len(),
                "shard is missing fine prefixes; try again later using --from {shard}"
            );
        }

        let status = if self.cancel.is_cancelled() {
            ShardStatus::Cancelled
        } else if self.require_complete && !failed.is_empty() {
            ShardStatus::SkippedIncomplete
        } else if keys.is_empty() {
            tracing::error!(%shard, "{}", Error::EmptyKeySet { shard: shard.to_string() });
            ShardStatus::EmptyKeySet
        } else {
            self.build_and_store(shard, keys).await?
        };

        Ok(ShardReport { shard, keys: key_count, status, failed_prefixes: failed })
    }

    async fn build_and_store(&self, shard: ShardPrefix, keys: Vec<u64>) -> Result<ShardStatus, Error> {
        tracing::info!(%shard, keys = keys.len(), "building filter");
        let built = tokio::task::spawn_blocking(move || BinaryFuse8::build(&keys)).await?;

        let filter = match built {
            Ok(filter) => filter,
            Err(hibp_filter::Error::BuildFailed { attempts }) => {
                tracing::error!(%shard, attempts, "filter construction did not converge");
                return Ok(ShardStatus::BuildFailed { attempts });
            }
            Err(e) => return Err(e.into()),
        };

        let data = codec::encode(&filter);
        let filter_bytes = data.len();
        let store = Arc::clone(&self.store);
        let key = shard.to_string();
        tokio::task::spawn_blocking(move || store.put(&key, &data)).await??;

        tracing::info!(%shard, filter_bytes, "uploaded filter");
        Ok(ShardStatus::Uploaded { filter_bytes })
    }
}

use std::collections::HashSet;
use std::time::Duration;

use futures_util::{StreamExt, stream};
use hibp_filter::key_hash;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::fetch::{RangeFetcher, RangeSource};
use crate::prefix::{FineRangePrefix, ShardPrefix};

/// Keys collected for one shard, and the fine prefixes that could not be
/// fetched. Keys under a failed prefix are absent from `keys`.
#[derive(Debug)]
pub struct ShardKeys {
    pub shard: ShardPrefix,
    pub keys: Vec<u64>,
    pub failed: Vec<FineRangePrefix>,
}

impl ShardKeys {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Fans out the 256 range fetches of a shard and joins them.
pub struct ShardAssembler<S> {
    fetcher: RangeFetcher<S>,
    concurrency: usize,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl<S: RangeSource> ShardAssembler<S> {
    pub fn new(fetcher: RangeFetcher<S>, concurrency: usize) -> Self {
        Self {
            fetcher,
            concurrency: concurrency.max(1),
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Abandons a shard's outstanding fetches once `timeout` has elapsed.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Abandons outstanding fetches when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn fetcher(&self) -> &RangeFetcher<S> {
        &self.fetcher
    }

    /// Collects the keys of every fine prefix under `shard`.
    ///
    /// Never fails as a whole: a prefix whose fetch fails, or is still
    /// outstanding when the shard is cancelled or times out, is reported in
    /// [`ShardKeys::failed`] and the remaining keys are kept.
    pub async fn assemble(&self, shard: ShardPrefix) -> ShardKeys {
        let prefixes = shard.fine_prefixes();
        let mut pending: HashSet<FineRangePrefix> = prefixes.iter().copied().collect();
        let mut keys = Vec::new();
        let mut failed = Vec::new();

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut results = stream::iter(prefixes)
            .map(|prefix| async move { (prefix, self.fetcher.fetch(prefix).await) })
            .buffer_unordered(self.concurrency);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::warn!(%shard, outstanding = pending.len(), "shard cancelled");
                    break;
                }
                _ = deadline_elapsed(deadline) => {
                    tracing::warn!(%shard, outstanding = pending.len(), "shard timed out");
                    break;
                }
                next = results.next() => next,
            };

            let Some((prefix, result)) = next else {
                break;
            };
            pending.remove(&prefix);

            match result {
                Ok(hashes) => keys.extend(hashes.iter().map(key_hash)),
                Err(e) => {
                    tracing::warn!(%prefix, error = %e, "unable to get hashes for prefix");
                    failed.push(prefix);
                }
            }
        }

        failed.extend(pending);
        failed.sort_unstable();

        ShardKeys { shard, keys, failed }
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use hibp_filter::HashKey;

    use super::*;
    use crate::config::MalformedRetry;
    use crate::error::Error;
    use crate::fetch::tests::{LINE_A, ScriptedSource};

    fn assembler(source: &ScriptedSource) -> ShardAssembler<&ScriptedSource> {
        let retry = MalformedRetry { max_attempts: 3, wait: Duration::from_secs(1) };
        ShardAssembler::new(RangeFetcher::new(source, retry), 256)
    }

    fn shard(s: &str) -> ShardPrefix {
        ShardPrefix::parse(s).unwrap()
    }

    /// Never answers for prefixes ending in `F`.
    struct StallingSource;

    impl RangeSource for StallingSource {
        async fn fetch_range(&self, prefix: &str) -> Result<String, Error> {
            if prefix.ends_with('F') {
                std::future::pending::<()>().await;
            }
            Ok(LINE_A.to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_assembles_all_prefixes() {
        let source = ScriptedSource::default();
        let keys = assembler(&source).assemble(shard("0AF")).await;

        assert!(keys.is_complete());
        assert_eq!(keys.keys.len(), 256);
        assert_eq!(source.calls.load(Ordering::SeqCst), 256);

        let expected = HashKey::parse(&format!("0AF00{}", "0".repeat(35))).unwrap();
        assert!(keys.keys.contains(&key_hash(&expected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_failure_is_isolated() {
        let source = ScriptedSource::default();
        source.script("0AF7C", vec![Err(())]);

        let keys = assembler(&source).assemble(shard("0AF")).await;

        assert_eq!(keys.keys.len(), 255);
        let failed: Vec<&str> = keys.failed.iter().map(FineRangePrefix::as_str).collect();
        assert_eq!(failed, vec!["0AF7C"]);

        let missing = HashKey::parse(&format!("0AF7C{}", "0".repeat(35))).unwrap();
        assert!(!keys.keys.contains(&key_hash(&missing)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_exhaustion_is_recorded() {
        let source = ScriptedSource::default();
        source.script("0AF00", vec![Ok("short")]);
        source.script("0AF01", vec![Ok("short"), Ok(LINE_A)]);

        let keys = assembler(&source).assemble(shard("0AF")).await;

        let failed: Vec<&str> = keys.failed.iter().map(FineRangePrefix::as_str).collect();
        assert_eq!(failed, vec!["0AF00"]);
        assert_eq!(keys.keys.len(), 255);
        // 254 clean prefixes, 3 attempts for 0AF00, 2 for 0AF01.
        assert_eq!(source.calls.load(Ordering::SeqCst), 254 + 3 + 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_concurrency_still_joins_everything() {
        let source = ScriptedSource::default();
        let retry = MalformedRetry::default();
        let keys = ShardAssembler::new(RangeFetcher::new(&source, retry), 8)
            .assemble(shard("FFF"))
            .await;

        assert!(keys.is_complete());
        assert_eq!(keys.keys.len(), 256);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_completed_keys() {
        let retry = MalformedRetry::default();
        let assembler = ShardAssembler::new(RangeFetcher::new(StallingSource, retry), 256)
            .with_timeout(Some(Duration::from_secs(30)));

        let keys = assembler.assemble(shard("123")).await;

        assert_eq!(keys.failed.len(), 16);
        assert!(keys.failed.iter().all(|p| p.as_str().ends_with('F')));
        assert_eq!(keys.keys.len(), 240);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_shard_reports_every_prefix() {
        let source = ScriptedSource::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let keys = assembler(&source).with_cancellation(cancel).assemble(shard("ABC")).await;

        assert!(keys.keys.is_empty());
        assert_eq!(keys.failed.len(), 256);
        assert_eq!(keys.failed[0].as_str(), "ABC00");
        assert_eq!(keys.failed[255].as_str(), "ABCFF");
    }
}

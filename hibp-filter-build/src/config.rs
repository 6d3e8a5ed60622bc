use std::time::Duration;

/// Base URL of the Pwned Passwords range API.
pub const DEFAULT_RANGE_URL: &str = "https://api.pwnedpasswords.com";

/// Attempts for a range request that returned 200 with an unusable body.
pub const MAX_ATTEMPTS_FOR_MALFORMED_RESPONSES: u32 = 5;

/// Fixed wait between attempts for malformed 200 responses.
pub const WAIT_TIME_FOR_MALFORMED_RESPONSES: Duration = Duration::from_secs(1);

/// Transport-level retries (connection errors, non-2xx statuses).
pub const HTTP_CLIENT_MAX_RETRY: u32 = 5;

/// Lower bound of the exponential transport backoff.
pub const HTTP_CLIENT_RETRY_WAIT_MIN: Duration = Duration::from_secs(1);

/// Upper bound of the exponential transport backoff.
pub const HTTP_CLIENT_RETRY_WAIT_MAX: Duration = Duration::from_secs(30);

/// Concurrent range fetches per shard.
pub const DEFAULT_CONCURRENCY: usize = 256;

/// Idle connections kept per host by the HTTP client.
pub const HTTP_CLIENT_MAX_IDLE_PER_HOST: usize = 100;

/// Retry policy for the transport layer of [`HttpRangeSource`](crate::HttpRangeSource).
#[derive(Debug, Clone, Copy)]
pub struct TransportRetry {
    pub max_retries: u32,
    pub wait_min: Duration,
    pub wait_max: Duration,
}

impl TransportRetry {
    /// Backoff before retry number `retry` (1-based): `wait_min * 2^(retry-1)`,
    /// capped at `wait_max`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.wait_min.saturating_mul(factor).min(self.wait_max)
    }
}

impl Default for TransportRetry {
    fn default() -> Self {
        Self {
            max_retries: HTTP_CLIENT_MAX_RETRY,
            wait_min: HTTP_CLIENT_RETRY_WAIT_MIN,
            wait_max: HTTP_CLIENT_RETRY_WAIT_MAX,
        }
    }
}

/// Retry policy for malformed-but-successful range responses.
#[derive(Debug, Clone, Copy)]
pub struct MalformedRetry {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub wait: Duration,
}

impl Default for MalformedRetry {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS_FOR_MALFORMED_RESPONSES,
            wait: WAIT_TIME_FOR_MALFORMED_RESPONSES,
        }
    }
}

/// Settings for a shard build run.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub concurrency: usize,
    pub malformed_retry: MalformedRetry,
    /// Abort a shard's outstanding fetches after this long.
    pub shard_timeout: Option<Duration>,
    /// Skip uploading a shard whose key set has known gaps.
    pub require_complete: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            malformed_retry: MalformedRetry::default(),
            shard_timeout: None,
            require_complete: false,
        }
    }
}

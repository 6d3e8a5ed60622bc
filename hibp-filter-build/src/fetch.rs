//! Retrieval of one fine range prefix from the range API.
//!
//! Two failure modes are kept apart. The transport ([`HttpRangeSource`])
//! retries connection errors and bad statuses with exponential backoff. The
//! [`RangeFetcher`] retries bodies that arrived with a success status but do
//! not parse, which the upstream API produces under load.

use std::future::Future;
use std::time::Duration;

use hibp_filter::{HashKey, hash::HASH_KEY_LEN};
use reqwest::StatusCode;

use crate::config::{HTTP_CLIENT_MAX_IDLE_PER_HOST, MalformedRetry, TransportRetry};
use crate::error::Error;
use crate::prefix::FineRangePrefix;

/// Something that answers range queries with the raw response body.
///
/// Implementations return [`Error::Unavailable`] once their own transport
/// retries are exhausted.
pub trait RangeSource: Send + Sync {
    fn fetch_range(&self, prefix: &str) -> impl Future<Output = Result<String, Error>> + Send;
}

impl<S: RangeSource> RangeSource for &S {
    fn fetch_range(&self, prefix: &str) -> impl Future<Output = Result<String, Error>> + Send {
        (**self).fetch_range(prefix)
    }
}

/// Range source backed by `GET {base_url}/range/{prefix}`.
#[derive(Debug, Clone)]
pub struct HttpRangeSource {
    client: reqwest::Client,
    base_url: String,
    retry: TransportRetry,
}

impl HttpRangeSource {
    pub fn new(base_url: impl Into<String>, retry: TransportRetry) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(HTTP_CLIENT_MAX_IDLE_PER_HOST)
            .build()
            .map_err(Error::HttpClient)?;
        Ok(Self::with_client(client, base_url, retry))
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        retry: TransportRetry,
    ) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { client, base_url, retry }
    }

    fn range_url(&self, prefix: &str) -> String {
        format!("{}/range/{}", self.base_url, prefix)
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

impl RangeSource for HttpRangeSource {
    async fn fetch_range(&self, prefix: &str) -> Result<String, Error> {
        let url = self.range_url(prefix);
        let max_attempts = self.retry.max_retries + 1;

        let mut last_error = None;
        for attempt in 0..max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry.backoff(attempt)).await;
            }

            match self.client.get(&url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        last_error = Some(Error::HttpStatus {
                            prefix: prefix.to_string(),
                            status: status.as_u16(),
                        });
                        if is_retryable_status(status) {
                            continue;
                        }
                        return Err(Error::Unavailable {
                            prefix: prefix.to_string(),
                            attempts: attempt + 1,
                            source: last_error.map(Box::new),
                        });
                    }

                    match response.text().await {
                        Ok(body) => return Ok(body),
                        Err(e) => {
                            last_error =
                                Some(Error::HttpRequest { prefix: prefix.to_string(), source: e });
                        }
                    }
                }
                Err(e) => {
                    last_error = Some(Error::HttpRequest { prefix: prefix.to_string(), source: e });
                }
            }
        }

        Err(Error::Unavailable {
            prefix: prefix.to_string(),
            attempts: max_attempts,
            source: last_error.map(Box::new),
        })
    }
}

/// Why a success response could not be used.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum MalformedBody {
    #[error("empty body")]
    Empty,

    #[error("line {line} is {len} characters, expected at least {expected}")]
    ShortLine { line: usize, len: usize, expected: usize },

    #[error("line {line} does not start with a hex suffix")]
    InvalidSuffix { line: usize },
}

/// Parses a range response into full digests.
///
/// Each line carries the digest suffix in its first `40 - prefix.len()`
/// characters, followed by `:count`. Lines with a count of zero are padding
/// and are skipped.
pub fn parse_range_body(prefix: &str, body: &str) -> Result<Vec<HashKey>, MalformedBody> {
    let suffix_len = HASH_KEY_LEN.saturating_sub(prefix.len());
    let mut hashes = Vec::new();
    let mut lines = 0usize;

    for (index, line) in body.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        lines += 1;

        if line.len() < suffix_len {
            return Err(MalformedBody::ShortLine {
                line: index + 1,
                len: line.len(),
                expected: suffix_len,
            });
        }
        let (suffix, rest) = match (line.get(..suffix_len), line.get(suffix_len..)) {
            (Some(suffix), Some(rest)) => (suffix, rest),
            _ => return Err(MalformedBody::InvalidSuffix { line: index + 1 }),
        };
        if rest.strip_prefix(':').is_some_and(|count| count.trim() == "0") {
            continue;
        }

        let hash = HashKey::from_parts(prefix, suffix)
            .ok_or(MalformedBody::InvalidSuffix { line: index + 1 })?;
        hashes.push(hash);
    }

    if lines == 0 {
        return Err(MalformedBody::Empty);
    }
    Ok(hashes)
}

/// Fetches and validates the digests for one fine range prefix.
#[derive(Debug, Clone)]
pub struct RangeFetcher<S> {
    source: S,
    retry: MalformedRetry,
}

impl<S: RangeSource> RangeFetcher<S> {
    /// A zero attempt budget is raised to one.
    pub fn new(source: S, retry: MalformedRetry) -> Self {
        let retry = MalformedRetry { max_attempts: retry.max_attempts.max(1), ..retry };
        Self { source, retry }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Returns the digests under `prefix`.
    ///
    /// Transport failures surface immediately as [`Error::Unavailable`].
    /// Malformed success bodies are retried with a fixed delay and end in
    /// [`Error::MalformedResponse`] once the attempt budget is spent.
    pub async fn fetch(&self, prefix: FineRangePrefix) -> Result<Vec<HashKey>, Error> {
        let prefix = prefix.as_str();
        let max_attempts = self.retry.max_attempts;

        for attempt in 1..=max_attempts {
            let body = self.source.fetch_range(prefix).await?;
            match parse_range_body(prefix, &body) {
                Ok(hashes) => {
                    if attempt > 1 {
                        tracing::debug!(prefix, attempt, "range response recovered after retry");
                    }
                    return Ok(hashes);
                }
                Err(problem) => {
                    tracing::warn!(
                        prefix,
                        attempt,
                        max_attempts,
                        %problem,
                        "retrying unexpected range response"
                    );
                    if attempt < max_attempts {
                        sleep(self.retry.wait).await;
                    }
                }
            }
        }

        Err(Error::MalformedResponse { prefix: prefix.to_string(), attempts: max_attempts })
    }
}

async fn sleep(wait: Duration) {
    if !wait.is_zero() {
        tokio::time::sleep(wait).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::prefix::ShardPrefix;

    pub(crate) const LINE_A: &str = "C6008F9CAB4083784CBD1874F76618D2A97:2254650";
    pub(crate) const LINE_B: &str = "C60000000000000000000000000000000AB:3";

    /// Replays canned responses per prefix, repeating the last one.
    #[derive(Default)]
    pub(crate) struct ScriptedSource {
        scripts: Mutex<HashMap<String, VecDeque<Result<String, ()>>>>,
        pub(crate) calls: AtomicUsize,
    }

    impl ScriptedSource {
        pub(crate) fn script(&self, prefix: &str, responses: Vec<Result<&str, ()>>) {
            let responses = responses.into_iter().map(|r| r.map(str::to_string)).collect();
            self.scripts.lock().unwrap().insert(prefix.to_string(), responses);
        }
    }

    impl RangeSource for ScriptedSource {
        async fn fetch_range(&self, prefix: &str) -> Result<String, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut scripts = self.scripts.lock().unwrap();
            let queue = scripts.entry(prefix.to_string()).or_default();
            let next = if queue.len() > 1 { queue.pop_front() } else { queue.front().cloned() };
            match next {
                Some(Ok(body)) => Ok(body),
                Some(Err(())) => Err(Error::Unavailable {
                    prefix: prefix.to_string(),
                    attempts: 1,
                    source: None,
                }),
                None => Ok(format!("{}:1", "0".repeat(35))),
            }
        }
    }

    fn prefix(s: &str) -> FineRangePrefix {
        let shard = ShardPrefix::parse(&s[..3]).unwrap();
        let index = usize::from_str_radix(&s[3..], 16).unwrap();
        shard.fine_prefixes()[index]
    }

    fn fetcher(source: &ScriptedSource) -> RangeFetcher<&ScriptedSource> {
        RangeFetcher::new(source, MalformedRetry { max_attempts: 5, wait: Duration::from_secs(1) })
    }

    #[test]
    fn test_parse_range_body() {
        let body = format!("{LINE_A}\r\n{LINE_B}\r\n");
        let hashes = parse_range_body("CBFDA", &body).unwrap();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0].as_str(), "CBFDAC6008F9CAB4083784CBD1874F76618D2A97");
        assert_eq!(hashes[1].as_str(), "CBFDAC60000000000000000000000000000000AB");
    }

    #[test]
    fn test_parse_range_body_skips_padding() {
        let body = format!("{LINE_A}\n{}:0\n", "F".repeat(35));
        let hashes = parse_range_body("CBFDA", &body).unwrap();
        assert_eq!(hashes.len(), 1);
    }

    #[test]
    fn test_parse_range_body_rejects_malformed() {
        assert_eq!(parse_range_body("CBFDA", ""), Err(MalformedBody::Empty));
        assert_eq!(parse_range_body("CBFDA", "\n\n"), Err(MalformedBody::Empty));
        assert_eq!(
            parse_range_body("CBFDA", &format!("{LINE_A}\nC6008F9CAB")),
            Err(MalformedBody::ShortLine { line: 2, len: 10, expected: 35 })
        );
        assert_eq!(
            parse_range_body("CBFDA", &format!("{}:4", "Z".repeat(35))),
            Err(MalformedBody::InvalidSuffix { line: 1 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_success_is_retried_once() {
        let source = ScriptedSource::default();
        source.script("CBFDA", vec![Ok("C6008F9CAB40837"), Ok(LINE_A)]);

        let hashes = fetcher(&source).fetch(prefix("CBFDA")).await.unwrap();
        assert_eq!(hashes.len(), 1);
        assert_eq!(hashes[0].as_str(), "CBFDAC6008F9CAB4083784CBD1874F76618D2A97");
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_attempts_exhausted() {
        let source = ScriptedSource::default();
        source.script("CBFDA", vec![Ok("truncated")]);

        let start = tokio::time::Instant::now();
        let err = fetcher(&source).fetch(prefix("CBFDA")).await.unwrap_err();
        assert!(matches!(err, Error::MalformedResponse { attempts: 5, .. }));
        assert_eq!(source.calls.load(Ordering::SeqCst), 5);
        // Four waits between five attempts.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(4) && elapsed < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_is_not_retried_by_fetcher() {
        let source = ScriptedSource::default();
        source.script("CBFDA", vec![Err(())]);

        let err = fetcher(&source).fetch(prefix("CBFDA")).await.unwrap_err();
        assert!(matches!(err, Error::Unavailable { .. }));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempt_budget_still_fetches() {
        let source = ScriptedSource::default();
        source.script("CBFDA", vec![Ok(LINE_A)]);
        let retry = MalformedRetry { max_attempts: 0, wait: Duration::from_secs(1) };

        let hashes = RangeFetcher::new(&source, retry).fetch(prefix("CBFDA")).await.unwrap();
        assert_eq!(hashes.len(), 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        source.script("CBFDB", vec![Ok("short")]);
        let err = RangeFetcher::new(&source, retry).fetch(prefix("CBFDB")).await.unwrap_err();
        assert!(matches!(err, Error::MalformedResponse { attempts: 1, .. }));
    }

    /// Serves one canned HTTP response per accepted connection.
    async fn serve(responses: Vec<String>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                let request = String::from_utf8_lossy(&buf);
                requests.push(request.lines().next().unwrap_or_default().to_string());
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
            requests
        });
        (format!("http://{addr}/"), handle)
    }

    fn http_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    fn fast_retry() -> TransportRetry {
        TransportRetry {
            max_retries: 2,
            wait_min: Duration::from_millis(5),
            wait_max: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_http_source_retries_server_errors() {
        let (url, server) = serve(vec![
            http_response("503 Service Unavailable", ""),
            http_response("200 OK", LINE_A),
        ])
        .await;

        let source = HttpRangeSource::new(url, fast_retry()).unwrap();
        let body = source.fetch_range("CBFDA").await.unwrap();
        assert_eq!(body, LINE_A);

        let requests = server.await.unwrap();
        assert_eq!(requests, vec!["GET /range/CBFDA HTTP/1.1"; 2]);
    }

    #[tokio::test]
    async fn test_http_source_gives_up_on_client_errors() {
        let (url, server) = serve(vec![http_response("404 Not Found", "")]).await;

        let source = HttpRangeSource::new(url, fast_retry()).unwrap();
        let err = source.fetch_range("CBFDA").await.unwrap_err();
        assert!(matches!(err, Error::Unavailable { attempts: 1, .. }));
        assert_eq!(server.await.unwrap().len(), 1);
    }
}

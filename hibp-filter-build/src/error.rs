#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("HTTP request failed for prefix {prefix}: {source}")]
    HttpRequest {
        prefix: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} for prefix {prefix}")]
    HttpStatus { prefix: String, status: u16 },

    #[error("range source unavailable for prefix {prefix} after {attempts} attempts")]
    Unavailable {
        prefix: String,
        attempts: u32,
        #[source]
        source: Option<Box<Error>>,
    },

    #[error("malformed response for prefix {prefix} after {attempts} attempts")]
    MalformedResponse { prefix: String, attempts: u32 },

    #[error("no hashes collected for shard {shard}; refusing to store an empty filter")]
    EmptyKeySet { shard: String },

    #[error(transparent)]
    Filter(#[from] hibp_filter::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

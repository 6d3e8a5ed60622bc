use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid hash key {input:?}: expected 40 hex characters")]
    InvalidHashKey { input: String },

    #[error("corrupt filter: {reason}")]
    Corrupt { reason: String },

    #[error("filter construction did not converge after {attempts} attempts")]
    BuildFailed { attempts: u32 },

    #[error("no filter stored under key {key}")]
    NotFound { key: String },

    #[error("blob store unavailable for key {key}: {source}")]
    Unavailable {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Error::Corrupt { reason: reason.into() }
    }
}

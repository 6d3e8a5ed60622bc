use crate::codec;
use crate::error::Error;
use crate::hash::{HashKey, key_hash};
use crate::store::BlobStore;

/// Answers "is this digest in the leaked set?" from stored shard filters.
///
/// Every lookup fetches and decodes the shard's filter afresh; the checker
/// holds no mutable state and can be shared across threads.
pub struct FilterChecker<S> {
    store: S,
}

impl<S: BlobStore> FilterChecker<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Checks whether `hash` is (probably) in the leaked set.
    ///
    /// `Ok(true)` may be a false positive (about 1 in 256); `Ok(false)` is
    /// definitive. A shard that was never built yields [`Error::NotFound`];
    /// callers must not read any error as "not compromised".
    pub fn is_compromised(&self, hash: &HashKey) -> Result<bool, Error> {
        let shard = hash.shard_prefix();
        tracing::debug!(%hash, shard, "retrieving filter");

        let bytes = self.store.get(shard)?;
        let filter = codec::decode(&bytes)?;
        let found = filter.contains(key_hash(hash));

        tracing::debug!(shard, filter_bytes = bytes.len(), found, "filter lookup complete");
        Ok(found)
    }

    /// Hashes the password with SHA-1 and checks the digest.
    pub fn is_password_compromised(&self, password: &str) -> Result<bool, Error> {
        self.is_compromised(&HashKey::from_password(password))
    }
}

#[cfg(feature = "tokio")]
impl<S: BlobStore + 'static> FilterChecker<S> {
    /// Async lookup that runs the blocking store read on tokio's blocking pool.
    pub async fn is_compromised_async(
        self: &std::sync::Arc<Self>,
        hash: HashKey,
    ) -> Result<bool, Error> {
        let checker = std::sync::Arc::clone(self);
        tokio::task::spawn_blocking(move || checker.is_compromised(&hash))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }
}

//! Key/value storage for encoded filters, one blob per shard prefix.

use std::collections::HashMap;
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::Error;

/// Default name of the store that holds the filters.
pub const DEFAULT_STORE_NAME: &str = "hibp_filters";

/// A byte-array store keyed by shard prefix.
///
/// `get` must distinguish a missing key ([`Error::NotFound`]) from a store that
/// could not be reached ([`Error::Unavailable`]).
pub trait BlobStore: Send + Sync {
    fn put(&self, key: &str, data: &[u8]) -> Result<(), Error>;

    fn get(&self, key: &str) -> Result<Vec<u8>, Error>;

    /// Keys currently present, in ascending order.
    fn list_keys(&self) -> Result<Vec<String>, Error>;

    /// Creates the store if it does not exist yet.
    fn ensure_exists(&self) -> Result<(), Error>;
}

impl<S: BlobStore + ?Sized> BlobStore for std::sync::Arc<S> {
    fn put(&self, key: &str, data: &[u8]) -> Result<(), Error> {
        (**self).put(key, data)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, Error> {
        (**self).get(key)
    }

    fn list_keys(&self) -> Result<Vec<String>, Error> {
        (**self).list_keys()
    }

    fn ensure_exists(&self) -> Result<(), Error> {
        (**self).ensure_exists()
    }
}

/// Stores each blob as `{KEY}.bin` in a directory.
#[derive(Debug, Clone)]
pub struct DirBlobStore {
    root: PathBuf,
}

impl DirBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.bin"))
    }
}

impl BlobStore for DirBlobStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<(), Error> {
        // Write then rename so readers never observe a half-written filter.
        // Each write gets its own temp file, so concurrent puts of one key
        // cannot truncate each other's data.
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{key}."))
            .suffix(".tmp")
            .tempfile_in(&self.root)?;
        tmp.write_all(data)?;
        tmp.persist(self.blob_path(key)).map_err(|e| e.error)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, Error> {
        match fs::read(self.blob_path(key)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound && self.root.is_dir() => {
                Err(Error::NotFound { key: key.to_string() })
            }
            Err(e) => Err(Error::Unavailable { key: key.to_string(), source: e }),
        }
    }

    fn list_keys(&self) -> Result<Vec<String>, Error> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let key = path
                .extension()
                .filter(|ext| *ext == "bin")
                .and_then(|_| path.file_stem())
                .and_then(|stem| stem.to_str())
                .filter(|s| !s.starts_with('.'));

            if let Some(key) = key {
                keys.push(key.to_string());
            }
        }
        keys.sort_unstable();
        Ok(keys)
    }

    fn ensure_exists(&self) -> Result<(), Error> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }
}

/// An in-process store, mostly useful for tests.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned(key: &str) -> Error {
    Error::Unavailable {
        key: key.to_string(),
        source: io::Error::other("memory store lock poisoned"),
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<(), Error> {
        let mut blobs = self.blobs.write().map_err(|_| poisoned(key))?;
        blobs.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, Error> {
        let blobs = self.blobs.read().map_err(|_| poisoned(key))?;
        blobs.get(key).cloned().ok_or_else(|| Error::NotFound { key: key.to_string() })
    }

    fn list_keys(&self) -> Result<Vec<String>, Error> {
        let blobs = self.blobs.read().map_err(|_| poisoned(""))?;
        let mut keys: Vec<String> = blobs.keys().cloned().collect();
        keys.sort_unstable();
        Ok(keys)
    }

    fn ensure_exists(&self) -> Result<(), Error> {
        Ok(())
    }
}

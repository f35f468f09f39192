//! Blob storage for the file tree.
//!
//! A [`Store`] is opened from an address string (`mem:` or `file:<dir>`) and
//! exposes two keyspaces: `blobs`, the content-addressed space holding node
//! records and data chunks, and `roots`, a named-pointer space holding root
//! records. The [`Cas`] wrapper derives blob keys by hashing content, so a
//! `put` of identical bytes is idempotent.

use std::fmt;
use std::io;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemStore;

/// Length in bytes of a storage key.
pub const KEY_LEN: usize = 32;

/// A storage key: the SHA-256 digest of the blob it names.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// Computes the key for the given content.
    pub fn of(data: &[u8]) -> Key {
        let digest = Sha256::digest(data);
        let mut out = [0u8; KEY_LEN];
        out.copy_from_slice(&digest);
        Key(out)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Parses a key from its hex or base64 string rendering.
    pub fn parse(s: &str) -> Result<Key, StoreError> {
        let s = s.trim();
        let bytes = if s.len() == 2 * KEY_LEN && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            hex::decode(s).map_err(|_| StoreError::InvalidKey(s.to_string()))?
        } else {
            BASE64
                .decode(s)
                .map_err(|_| StoreError::InvalidKey(s.to_string()))?
        };
        Key::from_bytes(&bytes).ok_or_else(|| StoreError::InvalidKey(s.to_string()))
    }

    /// Builds a key from raw bytes; `None` unless exactly [`KEY_LEN`] long.
    pub fn from_bytes(bytes: &[u8]) -> Option<Key> {
        if bytes.len() != KEY_LEN {
            return None;
        }
        let mut out = [0u8; KEY_LEN];
        out.copy_from_slice(bytes);
        Some(Key(out))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.to_hex())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("key already exists: {0}")]
    Exists(String),
    #[error("invalid key: {0:?}")]
    InvalidKey(String),
    #[error("invalid store address: {0:?}")]
    InvalidAddress(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// A storage backend addressed by (keyspace, key) pairs.
///
/// `put` with `replace = false` must fail with [`StoreError::Exists`] when
/// the key is already present.
pub trait Backend: Send + Sync {
    fn get(&self, space: &str, key: &str) -> Result<Vec<u8>, StoreError>;
    fn put(&self, space: &str, key: &str, data: &[u8], replace: bool) -> Result<(), StoreError>;
    fn has(&self, space: &str, key: &str) -> Result<bool, StoreError>;
    fn delete(&self, space: &str, key: &str) -> Result<(), StoreError>;
    fn close(&self) -> Result<(), StoreError>;
}

const BLOB_SPACE: &str = "blobs";
const ROOT_SPACE: &str = "roots";

/// A cheaply cloneable handle on an open storage backend.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn Backend>,
    address: String,
}

impl Store {
    /// Opens a store from an address string.
    ///
    /// Supported schemes are `mem:` (empty, process-local) and `file:<dir>`
    /// (one file per object under `<dir>`).
    pub fn open(address: &str) -> Result<Store, StoreError> {
        let backend: Arc<dyn Backend> = match address.split_once(':') {
            Some(("mem", "")) => Arc::new(MemStore::new()),
            Some(("file", path)) if !path.is_empty() => Arc::new(FileStore::new(path.as_ref())?),
            _ => return Err(StoreError::InvalidAddress(address.to_string())),
        };
        Ok(Store {
            backend,
            address: address.to_string(),
        })
    }

    /// Wraps an already constructed backend, mainly for tests.
    pub fn from_backend(backend: Arc<dyn Backend>, address: &str) -> Store {
        Store {
            backend,
            address: address.to_string(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// The content-addressed blob keyspace.
    pub fn cas(&self) -> Cas {
        Cas {
            store: self.clone(),
        }
    }

    /// The named root-pointer keyspace.
    pub fn roots(&self) -> Roots {
        Roots {
            store: self.clone(),
        }
    }

    pub fn close(&self) -> Result<(), StoreError> {
        self.backend.close()
    }
}

/// Content-addressed view of the `blobs` keyspace.
#[derive(Clone)]
pub struct Cas {
    store: Store,
}

impl Cas {
    pub fn get(&self, key: &Key) -> Result<Vec<u8>, StoreError> {
        self.store.backend.get(BLOB_SPACE, &key.to_hex())
    }

    pub fn has(&self, key: &Key) -> Result<bool, StoreError> {
        self.store.backend.has(BLOB_SPACE, &key.to_hex())
    }

    /// Writes `data` under its content key and returns the key.
    ///
    /// A blob that is already present is left alone; identical content hashes
    /// to an identical key, so there is nothing to replace.
    pub fn put(&self, data: &[u8]) -> Result<Key, StoreError> {
        let key = Key::of(data);
        match self.store.backend.put(BLOB_SPACE, &key.to_hex(), data, false) {
            Ok(()) | Err(StoreError::Exists(_)) => Ok(key),
            Err(err) => Err(err),
        }
    }

    pub fn delete(&self, key: &Key) -> Result<(), StoreError> {
        self.store.backend.delete(BLOB_SPACE, &key.to_hex())
    }
}

/// Named-pointer view of the `roots` keyspace.
#[derive(Clone)]
pub struct Roots {
    store: Store,
}

impl Roots {
    pub fn get(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        self.store.backend.get(ROOT_SPACE, name)
    }

    pub fn put(&self, name: &str, data: &[u8], replace: bool) -> Result<(), StoreError> {
        self.store.backend.put(ROOT_SPACE, name, data, replace)
    }

    pub fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.store.backend.delete(ROOT_SPACE, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_through_hex_and_base64() {
        let key = Key::of(b"some data");
        assert_eq!(Key::parse(&key.to_hex()).unwrap(), key);
        assert_eq!(Key::parse(&key.to_base64()).unwrap(), key);
    }

    #[test]
    fn key_parse_rejects_garbage() {
        assert!(Key::parse("zz").is_err());
        assert!(Key::parse("deadbeef").is_err()); // right alphabet, wrong length
    }

    #[test]
    fn cas_put_is_idempotent() {
        let store = Store::open("mem:").unwrap();
        let cas = store.cas();
        let k1 = cas.put(b"hello").unwrap();
        let k2 = cas.put(b"hello").unwrap();
        assert_eq!(k1, k2);
        assert_eq!(cas.get(&k1).unwrap(), b"hello");
    }

    #[test]
    fn roots_respects_replace_flag() {
        let store = Store::open("mem:").unwrap();
        let roots = store.roots();
        roots.put("main", b"v1", false).unwrap();
        assert!(matches!(
            roots.put("main", b"v2", false),
            Err(StoreError::Exists(_))
        ));
        roots.put("main", b"v2", true).unwrap();
        assert_eq!(roots.get("main").unwrap(), b"v2");
    }

    #[test]
    fn open_rejects_unknown_scheme() {
        assert!(matches!(
            Store::open("bogus:x"),
            Err(StoreError::InvalidAddress(_))
        ));
    }
}

//! Directory-backed storage backend for the `file:<dir>` address.
//!
//! Each keyspace is a subdirectory, each object a file named by its key.
//! Writes go through a temporary file and a rename, so a crash never leaves
//! a partially written object under its final name.

use std::fs;
use std::io;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use super::Backend;
use super::StoreError;

pub struct FileStore {
    dir: PathBuf,
    tmp_seq: AtomicU64,
}

impl FileStore {
    pub fn new(dir: &Path) -> Result<FileStore, StoreError> {
        fs::create_dir_all(dir)?;
        Ok(FileStore {
            dir: dir.to_path_buf(),
            tmp_seq: AtomicU64::new(0),
        })
    }

    fn object_path(&self, space: &str, key: &str) -> PathBuf {
        self.dir.join(space).join(key)
    }
}

impl Backend for FileStore {
    fn get(&self, space: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        match fs::read(self.object_path(space, key)) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn put(&self, space: &str, key: &str, data: &[u8], replace: bool) -> Result<(), StoreError> {
        let path = self.object_path(space, key);
        if !replace && path.exists() {
            return Err(StoreError::Exists(key.to_string()));
        }
        let parent = path.parent().ok_or_else(|| {
            StoreError::Io(io::Error::new(ErrorKind::InvalidInput, "no parent dir"))
        })?;
        fs::create_dir_all(parent)?;

        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = parent.join(format!(".tmp.{}.{}", process::id(), seq));
        fs::write(&tmp, data)?;
        if let Err(err) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    fn has(&self, space: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self.object_path(space, key).exists())
    }

    fn delete(&self, space: &str, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.object_path(space, key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn put_get_delete_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        store.put("blobs", "abc", b"payload", false).unwrap();
        assert!(store.has("blobs", "abc").unwrap());
        assert_eq!(store.get("blobs", "abc").unwrap(), b"payload");
        store.delete("blobs", "abc").unwrap();
        assert!(!store.has("blobs", "abc").unwrap());
    }

    #[test]
    fn put_without_replace_fails_on_existing() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        store.put("roots", "main", b"one", false).unwrap();
        assert!(matches!(
            store.put("roots", "main", b"two", false),
            Err(StoreError::Exists(_))
        ));
        store.put("roots", "main", b"two", true).unwrap();
        assert_eq!(store.get("roots", "main").unwrap(), b"two");
    }

    #[test]
    fn contents_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileStore::new(dir.path()).unwrap();
            store.put("blobs", "k", b"kept", false).unwrap();
        }
        let store = FileStore::new(dir.path()).unwrap();
        assert_eq!(store.get("blobs", "k").unwrap(), b"kept");
    }
}

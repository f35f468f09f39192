//! Process-local storage backend, used by the `mem:` address and by tests.

use std::collections::BTreeMap;
use std::collections::HashMap;

use parking_lot::Mutex;

use super::Backend;
use super::StoreError;

#[derive(Default)]
pub struct MemStore {
    spaces: Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }
}

impl Backend for MemStore {
    fn get(&self, space: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        self.spaces
            .lock()
            .get(space)
            .and_then(|m| m.get(key))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn put(&self, space: &str, key: &str, data: &[u8], replace: bool) -> Result<(), StoreError> {
        let mut spaces = self.spaces.lock();
        let map = spaces.entry(space.to_string()).or_default();
        if !replace && map.contains_key(key) {
            return Err(StoreError::Exists(key.to_string()));
        }
        map.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn has(&self, space: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .spaces
            .lock()
            .get(space)
            .is_some_and(|m| m.contains_key(key)))
    }

    fn delete(&self, space: &str, key: &str) -> Result<(), StoreError> {
        let mut spaces = self.spaces.lock();
        match spaces.get_mut(space).and_then(|m| m.remove(key)) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spaces_are_disjoint() {
        let store = MemStore::new();
        store.put("blobs", "k", b"blob", false).unwrap();
        store.put("roots", "k", b"root", false).unwrap();
        assert_eq!(store.get("blobs", "k").unwrap(), b"blob");
        assert_eq!(store.get("roots", "k").unwrap(), b"root");
        store.delete("blobs", "k").unwrap();
        assert!(store.get("blobs", "k").is_err());
        assert_eq!(store.get("roots", "k").unwrap(), b"root");
    }

    #[test]
    fn delete_missing_reports_not_found() {
        let store = MemStore::new();
        assert!(matches!(
            store.delete("blobs", "nope"),
            Err(StoreError::NotFound(_))
        ));
    }
}

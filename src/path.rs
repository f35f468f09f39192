//! Root pointers and mount-path resolution.
//!
//! A mount starts from a spec of one of two forms:
//!
//! * `<root-name>[/sub/path…]` — a named pointer in the `roots` keyspace,
//! * `@<file-key>[/sub/path…]` — a raw storage key (hex or base64), with
//!   the special spec `@new` starting an empty root.
//!
//! Resolution produces a [`PathInfo`]: the optional root record, the base
//! file the pointer refers to, and the file actually exposed at the mount
//! point (a descendant of the base when a subpath was given). Flushing
//! always commits the base, so subtree mounts write back their whole
//! ancestor chain.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::file;
use crate::file::FileNode;
use crate::file::FileRef;
use crate::file::Stat;
use crate::file::TreeError;
use crate::mode::FileMode;
use crate::store::Cas;
use crate::store::Key;
use crate::store::Roots;
use crate::store::Store;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("root pointer {0:?} not found")]
    RootNotFound(String),
    #[error("path element {0:?} not found")]
    ElementNotFound(String),
    #[error("invalid root spec {0:?}")]
    InvalidSpec(String),
    #[error("malformed root record for {0:?}: {1}")]
    Record(String, String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Tree(#[from] TreeError),
}

/// A named pointer to a file key, stored as JSON in the `roots` keyspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootRecord {
    pub file_key: Key,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_key: Option<Key>,
    #[serde(default)]
    pub description: String,
}

impl RootRecord {
    pub fn load(roots: &Roots, name: &str) -> Result<RootRecord, PathError> {
        let bytes = roots.get(name).map_err(|err| match err {
            StoreError::NotFound(_) => PathError::RootNotFound(name.to_string()),
            other => PathError::Store(other),
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|err| PathError::Record(name.to_string(), err.to_string()))
    }

    /// Writes (or with `replace`, overwrites) the named pointer.
    pub fn save(&self, roots: &Roots, name: &str, replace: bool) -> Result<(), PathError> {
        let bytes = serde_json::to_vec(self)
            .map_err(|err| PathError::Record(name.to_string(), err.to_string()))?;
        roots.put(name, &bytes, replace)?;
        Ok(())
    }
}

/// A resolved mount path.
pub struct PathInfo {
    /// Name of the root pointer, absent for `@key` mounts.
    pub root_name: Option<String>,
    pub root: Option<RootRecord>,
    /// Key of the base file as of the last load or flush.
    pub base_key: Key,
    pub base: FileRef,
    /// Key the mounted file had when it was resolved.
    pub file_key: Key,
    /// The file exposed at the mount point; equals `base` unless the spec
    /// carried a subpath.
    pub file: FileRef,
    cas: Cas,
    roots: Roots,
}

impl PathInfo {
    /// Resolves a mount spec against the store.
    pub fn resolve(store: &Store, spec: &str) -> Result<PathInfo, PathError> {
        let cas = store.cas();
        let roots = store.roots();

        if let Some(rest) = spec.strip_prefix('@') {
            let (first, sub) = split_spec(rest);
            if first == "new" {
                if !sub.is_empty() {
                    return Err(PathError::InvalidSpec(spec.to_string()));
                }
                let stat = Stat::new(FileMode::directory(0o755), process_uid(), process_gid());
                let root = FileNode::new(cas.clone(), stat);
                // Flush once so the fresh root has a key from the start.
                let key = file::flush(&root)?;
                return Ok(PathInfo {
                    root_name: None,
                    root: None,
                    base_key: key,
                    base: root.clone(),
                    file_key: key,
                    file: root,
                    cas,
                    roots,
                });
            }
            let key =
                Key::parse(first).map_err(|_| PathError::InvalidSpec(spec.to_string()))?;
            let base = FileNode::load(&cas, &key)?;
            let (file, file_key) = resolve_subpath(&base, key, sub)?;
            return Ok(PathInfo {
                root_name: None,
                root: None,
                base_key: key,
                base,
                file_key,
                file,
                cas,
                roots,
            });
        }

        let (name, sub) = split_spec(spec);
        if name.is_empty() {
            return Err(PathError::InvalidSpec(spec.to_string()));
        }
        let record = RootRecord::load(&roots, name)?;
        let base = FileNode::load(&cas, &record.file_key)?;
        let (file, file_key) = resolve_subpath(&base, record.file_key, sub)?;
        Ok(PathInfo {
            root_name: Some(name.to_string()),
            root: Some(record.clone()),
            base_key: record.file_key,
            base,
            file_key,
            file,
            cas,
            roots,
        })
    }

    /// Commits the base file and updates the root pointer when the key
    /// moved. A moved key also drops the record's index key, which indexes
    /// the previous tree.
    pub fn flush(&mut self) -> Result<Key, PathError> {
        let key = file::flush(&self.base)?;
        self.base_key = key;
        if let (Some(name), Some(record)) = (&self.root_name, &mut self.root) {
            if record.file_key != key {
                record.file_key = key;
                record.index_key = None;
                record.save(&self.roots, name, true)?;
            }
        }
        Ok(key)
    }

    /// The name of the mounted root, falling back to the base key.
    pub fn describe_root(&self) -> String {
        match &self.root_name {
            Some(name) => name.clone(),
            None => self.base_key.to_hex(),
        }
    }
}

fn split_spec(spec: &str) -> (&str, &str) {
    match spec.split_once('/') {
        Some((first, rest)) => (first, rest),
        None => (spec, ""),
    }
}

fn resolve_subpath(
    base: &FileRef,
    base_key: Key,
    sub: &str,
) -> Result<(FileRef, Key), PathError> {
    let mut file = base.clone();
    for segment in sub.split('/').filter(|s| !s.is_empty()) {
        let next = file.write().open_child(segment).map_err(|err| match err {
            TreeError::ChildNotFound => PathError::ElementNotFound(segment.to_string()),
            other => PathError::Tree(other),
        })?;
        file = next;
    }
    let key = file.read().saved_key().unwrap_or(base_key);
    Ok((file, key))
}

fn process_uid() -> u32 {
    // SAFETY: getuid never fails and touches no memory.
    unsafe { libc::getuid() }
}

fn process_gid() -> u32 {
    // SAFETY: as above.
    unsafe { libc::getgid() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_store() -> Store {
        Store::open("mem:").unwrap()
    }

    #[test]
    fn fresh_root_has_a_key() {
        let store = new_store();
        let pi = PathInfo::resolve(&store, "@new").unwrap();
        assert!(pi.root.is_none());
        assert_eq!(pi.base_key, pi.file_key);
    }

    #[test]
    fn key_spec_round_trips() {
        let store = new_store();
        let mut pi = PathInfo::resolve(&store, "@new").unwrap();
        let key = pi.flush().unwrap();

        let spec = format!("@{}", key.to_hex());
        let again = PathInfo::resolve(&store, &spec).unwrap();
        assert_eq!(again.base_key, key);
        assert!(again.root_name.is_none());
    }

    #[test]
    fn named_root_resolves_and_flushes_back() {
        let store = new_store();
        let pi = PathInfo::resolve(&store, "@new").unwrap();
        let record = RootRecord {
            file_key: pi.base_key,
            index_key: None,
            description: "test root".to_string(),
        };
        record.save(&store.roots(), "main", false).unwrap();

        let mut named = PathInfo::resolve(&store, "main").unwrap();
        assert_eq!(named.describe_root(), "main");

        named.base.write().touch();
        let new_key = named.flush().unwrap();
        assert_ne!(new_key, pi.base_key);

        let reloaded = RootRecord::load(&store.roots(), "main").unwrap();
        assert_eq!(reloaded.file_key, new_key);
        assert_eq!(reloaded.description, "test root");
    }

    #[test]
    fn flush_with_unchanged_key_leaves_record_alone() {
        let store = new_store();
        let pi = PathInfo::resolve(&store, "@new").unwrap();
        let record = RootRecord {
            file_key: pi.base_key,
            index_key: Some(Key::of(b"index")),
            description: String::new(),
        };
        record.save(&store.roots(), "idle", false).unwrap();

        let mut named = PathInfo::resolve(&store, "idle").unwrap();
        let key = named.flush().unwrap();
        assert_eq!(key, pi.base_key);
        // No mutation, no save: the index key survives.
        let reloaded = RootRecord::load(&store.roots(), "idle").unwrap();
        assert_eq!(reloaded.index_key, Some(Key::of(b"index")));
    }

    #[test]
    fn index_key_cleared_when_root_moves() {
        let store = new_store();
        let pi = PathInfo::resolve(&store, "@new").unwrap();
        let record = RootRecord {
            file_key: pi.base_key,
            index_key: Some(Key::of(b"index")),
            description: String::new(),
        };
        record.save(&store.roots(), "busy", false).unwrap();

        let mut named = PathInfo::resolve(&store, "busy").unwrap();
        named.base.write().touch();
        named.flush().unwrap();

        let reloaded = RootRecord::load(&store.roots(), "busy").unwrap();
        assert_eq!(reloaded.index_key, None);
    }

    #[test]
    fn subpath_resolution_walks_children() {
        let store = new_store();
        let pi = PathInfo::resolve(&store, "@new").unwrap();
        let sub = pi
            .base
            .read()
            .new_child(Stat::new(FileMode::directory(0o755), 0, 0));
        pi.base.write().set_child("sub", sub.clone());
        let leaf = sub
            .read()
            .new_child(Stat::new(FileMode::regular(0o644), 0, 0));
        sub.write().set_child("leaf", leaf);
        let mut pi = pi;
        let key = pi.flush().unwrap();

        let spec = format!("@{}/sub/leaf", key.to_hex());
        let resolved = PathInfo::resolve(&store, &spec).unwrap();
        assert_eq!(resolved.base_key, key);
        assert!(!resolved.file.read().stat().mode.is_dir());

        let missing = PathInfo::resolve(&store, &format!("@{}/nope", key.to_hex()));
        assert!(matches!(missing, Err(PathError::ElementNotFound(_))));
    }
}

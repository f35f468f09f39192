//! The in-memory file tree.
//!
//! A [`FileNode`] is one node of a Merkle tree of files: stat, ordinary
//! extended attributes, an ordered name-to-child map, and chunked byte
//! content. Nodes materialize lazily: a child starts out as a bare storage
//! key and is paged in from the CAS on first open; file content stays as
//! chunk references until the first read or write touches it.
//!
//! [`flush`] commits a node and all its dirty descendants back to the CAS
//! and returns the node's storage key. Flushing a clean node is free and
//! returns the same key, so periodic flushes of an idle tree are cheap.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use thiserror::Error;

use crate::mode::FileMode;
use crate::store::Cas;
use crate::store::Key;
use crate::store::StoreError;

mod wire;

use wire::BlockRecord;
use wire::ChildRecord;
use wire::NodeRecord;
use wire::StatRecord;

/// Maximum size of one stored content chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Shared handle on a tree node.
///
/// The adapter derives inode numbers from the `Arc` address, so a node must
/// be held by at least one strong reference for as long as the kernel may
/// refer to it.
pub type FileRef = Arc<RwLock<FileNode>>;

#[derive(Debug, Error)]
pub enum TreeError {
    /// The named child does not exist. Distinguishable from transport
    /// failures so callers can map it to ENOENT rather than EIO.
    #[error("child not found")]
    ChildNotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("malformed node record: {0}")]
    Decode(String),
}

/// Per-node metadata, stored verbatim in the node record.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub mode: FileMode,
    pub mtime: SystemTime,
    pub owner_id: u32,
    pub group_id: u32,
}

impl Stat {
    pub fn new(mode: FileMode, owner_id: u32, group_id: u32) -> Stat {
        Stat {
            mode,
            mtime: SystemTime::now(),
            owner_id,
            group_id,
        }
    }
}

enum Child {
    /// Not yet paged in; only the storage key is known.
    Stored(Key),
    /// Materialized. `key` is the last key this child was known to have,
    /// used to detect whether the parent record must be rewritten.
    Loaded { node: FileRef, key: Option<Key> },
}

#[derive(Default)]
struct FileData {
    blocks: Vec<BlockRecord>,
    buf: Option<Vec<u8>>,
    buf_dirty: bool,
}

impl FileData {
    fn size(&self) -> u64 {
        match &self.buf {
            Some(buf) => buf.len() as u64,
            None => self.blocks.iter().map(|b| b.size).sum(),
        }
    }
}

pub struct FileNode {
    cas: Cas,
    stat: Stat,
    xattrs: BTreeMap<String, Vec<u8>>,
    children: BTreeMap<String, Child>,
    data: FileData,
    /// Set when stat, xattrs, or the child map changed since the last flush.
    dirty: bool,
    /// Key of the last committed record, if the node has ever been flushed
    /// or was loaded from storage.
    saved: Option<Key>,
}

impl FileNode {
    /// Constructs a fresh, empty node. The node is dirty until flushed.
    pub fn new(cas: Cas, stat: Stat) -> FileRef {
        Arc::new(RwLock::new(FileNode {
            cas,
            stat,
            xattrs: BTreeMap::new(),
            children: BTreeMap::new(),
            data: FileData::default(),
            dirty: true,
            saved: None,
        }))
    }

    /// Materializes the node stored under `key`. Children stay unloaded.
    pub fn load(cas: &Cas, key: &Key) -> Result<FileRef, TreeError> {
        let bytes = cas.get(key)?;
        let record: NodeRecord =
            bincode::deserialize(&bytes).map_err(|err| TreeError::Decode(err.to_string()))?;
        Ok(Arc::new(RwLock::new(FileNode {
            cas: cas.clone(),
            stat: Stat {
                mode: record.stat.mode,
                mtime: wire::time_from_wire(record.stat.mtime_secs, record.stat.mtime_nanos),
                owner_id: record.stat.owner_id,
                group_id: record.stat.group_id,
            },
            xattrs: record.xattrs.into_iter().collect(),
            children: record
                .children
                .into_iter()
                .map(|c| (c.name, Child::Stored(c.key)))
                .collect(),
            data: FileData {
                blocks: record.blocks,
                buf: None,
                buf_dirty: false,
            },
            dirty: false,
            saved: Some(*key),
        })))
    }

    pub fn stat(&self) -> Stat {
        self.stat
    }

    /// Applies `update` to the stat and marks the node dirty.
    pub fn update_stat(&mut self, update: impl FnOnce(&mut Stat)) {
        update(&mut self.stat);
        self.dirty = true;
    }

    /// Sets the modification time to now.
    pub fn touch(&mut self) {
        self.update_stat(|s| s.mtime = SystemTime::now());
    }

    pub fn size(&self) -> u64 {
        self.data.size()
    }

    /// Key of the last committed state, if any.
    pub fn saved_key(&self) -> Option<Key> {
        self.saved
    }

    // -- children ---------------------------------------------------------

    pub fn has_child(&self, name: &str) -> bool {
        self.children.contains_key(name)
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Child names in sorted order. Unloaded children are included; the
    /// name map is always complete.
    pub fn child_names(&self) -> Vec<String> {
        self.children.keys().cloned().collect()
    }

    /// Opens the named child, paging it in from the CAS if necessary.
    pub fn open_child(&mut self, name: &str) -> Result<FileRef, TreeError> {
        match self.children.get(name) {
            None => Err(TreeError::ChildNotFound),
            Some(Child::Loaded { node, .. }) => Ok(node.clone()),
            Some(Child::Stored(key)) => {
                let key = *key;
                let node = FileNode::load(&self.cas, &key)?;
                self.children.insert(
                    name.to_string(),
                    Child::Loaded {
                        node: node.clone(),
                        key: Some(key),
                    },
                );
                Ok(node)
            }
        }
    }

    /// Inserts (or replaces) a child and marks the node dirty.
    pub fn set_child(&mut self, name: &str, node: FileRef) {
        self.children
            .insert(name.to_string(), Child::Loaded { node, key: None });
        self.dirty = true;
    }

    /// Removes the named child; reports whether it was present.
    pub fn remove_child(&mut self, name: &str) -> bool {
        let removed = self.children.remove(name).is_some();
        if removed {
            self.dirty = true;
        }
        removed
    }

    /// Constructs a new empty node sharing this node's store.
    pub fn new_child(&self, stat: Stat) -> FileRef {
        FileNode::new(self.cas.clone(), stat)
    }

    // -- content ----------------------------------------------------------

    fn loaded_buf(&mut self) -> Result<&mut Vec<u8>, TreeError> {
        if self.data.buf.is_none() {
            let mut buf = Vec::with_capacity(self.data.size() as usize);
            for block in &self.data.blocks {
                buf.extend_from_slice(&self.cas.get(&block.key)?);
            }
            self.data.buf = Some(buf);
        }
        Ok(self.data.buf.as_mut().unwrap())
    }

    /// Reads up to `buf.len()` bytes at `offset`. A read at or past the end
    /// of the content returns zero bytes with no error.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, TreeError> {
        let content = self.loaded_buf()?;
        let len = content.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let end = len.min(offset + buf.len() as u64) as usize;
        let start = offset as usize;
        buf[..end - start].copy_from_slice(&content[start..end]);
        Ok(end - start)
    }

    /// Writes `data` at `offset`, zero-filling any gap past the current end.
    pub fn write_at(&mut self, data: &[u8], offset: u64) -> Result<usize, TreeError> {
        let content = self.loaded_buf()?;
        let end = offset as usize + data.len();
        if end > content.len() {
            content.resize(end, 0);
        }
        content[offset as usize..end].copy_from_slice(data);
        self.data.buf_dirty = true;
        Ok(data.len())
    }

    /// Truncates or zero-extends the content to exactly `size` bytes.
    pub fn truncate(&mut self, size: u64) -> Result<(), TreeError> {
        if size == 0 && self.data.buf.is_none() {
            // No need to page anything in just to discard it.
            self.data.blocks.clear();
            self.data.buf = Some(Vec::new());
            self.data.buf_dirty = true;
            return Ok(());
        }
        let content = self.loaded_buf()?;
        if content.len() as u64 != size {
            content.resize(size as usize, 0);
            self.data.buf_dirty = true;
        }
        Ok(())
    }

    /// The storage keys of the node's content chunks, in order. For dirty
    /// content the keys are computed from the pending bytes without storing
    /// anything.
    pub fn data_block_keys(&self) -> Vec<Key> {
        match &self.data.buf {
            Some(buf) if self.data.buf_dirty => buf.chunks(CHUNK_SIZE).map(Key::of).collect(),
            _ => self.data.blocks.iter().map(|b| b.key).collect(),
        }
    }

    // -- extended attributes ----------------------------------------------

    pub fn xattr_get(&self, name: &str) -> Option<&[u8]> {
        self.xattrs.get(name).map(Vec::as_slice)
    }

    pub fn xattr_set(&mut self, name: &str, value: &[u8]) {
        self.xattrs.insert(name.to_string(), value.to_vec());
        self.dirty = true;
    }

    pub fn xattr_remove(&mut self, name: &str) -> bool {
        let removed = self.xattrs.remove(name).is_some();
        if removed {
            self.dirty = true;
        }
        removed
    }

    pub fn xattr_names(&self) -> Vec<String> {
        self.xattrs.keys().cloned().collect()
    }

    fn to_record(&self) -> Result<NodeRecord, TreeError> {
        let (mtime_secs, mtime_nanos) = wire::time_to_wire(self.stat.mtime);
        let mut children = Vec::with_capacity(self.children.len());
        for (name, child) in &self.children {
            let key = match child {
                Child::Stored(key) => *key,
                Child::Loaded { key: Some(key), .. } => *key,
                // Loaded children are flushed before the record is built.
                Child::Loaded { key: None, .. } => {
                    return Err(TreeError::Decode(format!("unflushed child {name:?}")));
                }
            };
            children.push(ChildRecord {
                name: name.clone(),
                key,
            });
        }
        Ok(NodeRecord {
            stat: StatRecord {
                mode: self.stat.mode,
                mtime_secs,
                mtime_nanos,
                owner_id: self.stat.owner_id,
                group_id: self.stat.group_id,
            },
            xattrs: self
                .xattrs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            blocks: self.data.blocks.clone(),
            children,
        })
    }
}

/// Commits `node` and all its dirty descendants, returning the node's key.
///
/// A clean node short-circuits to its saved key, so flushing twice with no
/// intervening writes returns the same key both times.
pub fn flush(node: &FileRef) -> Result<Key, TreeError> {
    let mut n = node.write();
    let mut changed = n.dirty;

    // Commit pending content chunks first.
    if n.data.buf_dirty {
        let cas = n.cas.clone();
        let buf = n.data.buf.as_ref().expect("dirty data without buffer");
        let mut blocks = Vec::with_capacity(buf.len().div_ceil(CHUNK_SIZE));
        for chunk in buf.chunks(CHUNK_SIZE) {
            let key = cas.put(chunk)?;
            blocks.push(BlockRecord {
                key,
                size: chunk.len() as u64,
            });
        }
        n.data.blocks = blocks;
        n.data.buf_dirty = false;
        changed = true;
    }

    // Flush loaded children depth-first; an unchanged child keeps its key
    // and does not force a rewrite of this record.
    let loaded: Vec<(String, FileRef)> = n
        .children
        .iter()
        .filter_map(|(name, child)| match child {
            Child::Loaded { node, .. } => Some((name.clone(), node.clone())),
            Child::Stored(_) => None,
        })
        .collect();
    for (name, child) in loaded {
        let child_key = flush(&child)?;
        if let Some(Child::Loaded { key, .. }) = n.children.get_mut(&name) {
            if *key != Some(child_key) {
                *key = Some(child_key);
                changed = true;
            }
        }
    }

    if !changed {
        if let Some(key) = n.saved {
            return Ok(key);
        }
    }

    let record = n.to_record()?;
    let bytes =
        bincode::serialize(&record).map_err(|err| TreeError::Decode(err.to_string()))?;
    let key = n.cas.put(&bytes)?;
    n.saved = Some(key);
    n.dirty = false;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn test_cas() -> Cas {
        Store::open("mem:").unwrap().cas()
    }

    fn dir_stat() -> Stat {
        Stat::new(FileMode::directory(0o755), 1000, 1000)
    }

    fn file_stat() -> Stat {
        Stat::new(FileMode::regular(0o644), 1000, 1000)
    }

    #[test]
    fn write_read_round_trip() {
        let node = FileNode::new(test_cas(), file_stat());
        let mut n = node.write();
        n.write_at(b"hello world", 0).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(n.read_at(&mut buf, 6).unwrap(), 5);
        assert_eq!(&buf, b"world");
        // Past-EOF reads are empty, not errors.
        assert_eq!(n.read_at(&mut buf, 100).unwrap(), 0);
    }

    #[test]
    fn sparse_write_zero_fills() {
        let node = FileNode::new(test_cas(), file_stat());
        let mut n = node.write();
        n.write_at(b"x", 4).unwrap();
        assert_eq!(n.size(), 5);
        let mut buf = [0xffu8; 5];
        n.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, &[0, 0, 0, 0, b'x']);
    }

    #[test]
    fn flush_and_load_round_trip() {
        let cas = test_cas();
        let root = FileNode::new(cas.clone(), dir_stat());
        let child = root.read().new_child(file_stat());
        child.write().write_at(b"contents", 0).unwrap();
        child.write().xattr_set("user.note", b"kept");
        root.write().set_child("a", child);

        let key = flush(&root).unwrap();

        let reloaded = FileNode::load(&cas, &key).unwrap();
        let got = reloaded.write().open_child("a").unwrap();
        let mut buf = vec![0u8; 8];
        assert_eq!(got.write().read_at(&mut buf, 0).unwrap(), 8);
        assert_eq!(&buf, b"contents");
        assert_eq!(got.read().xattr_get("user.note").unwrap(), b"kept");
    }

    #[test]
    fn flush_is_idempotent_without_writes() {
        let root = FileNode::new(test_cas(), dir_stat());
        let k1 = flush(&root).unwrap();
        let k2 = flush(&root).unwrap();
        assert_eq!(k1, k2);

        root.write().touch();
        let k3 = flush(&root).unwrap();
        assert_ne!(k1, k3);
        assert_eq!(flush(&root).unwrap(), k3);
    }

    #[test]
    fn dirty_child_changes_parent_key() {
        let root = FileNode::new(test_cas(), dir_stat());
        let child = root.read().new_child(file_stat());
        root.write().set_child("f", child.clone());
        let k1 = flush(&root).unwrap();

        child.write().write_at(b"new data", 0).unwrap();
        let k2 = flush(&root).unwrap();
        assert_ne!(k1, k2);
    }

    #[test]
    fn open_missing_child_is_distinguishable() {
        let root = FileNode::new(test_cas(), dir_stat());
        assert!(matches!(
            root.write().open_child("absent"),
            Err(TreeError::ChildNotFound)
        ));
    }

    #[test]
    fn large_content_chunks_and_reloads() {
        let cas = test_cas();
        let node = FileNode::new(cas.clone(), file_stat());
        let data: Vec<u8> = (0..(CHUNK_SIZE * 2 + 17)).map(|i| (i % 251) as u8).collect();
        node.write().write_at(&data, 0).unwrap();
        assert_eq!(node.read().data_block_keys().len(), 3);

        let key = flush(&node).unwrap();
        let reloaded = FileNode::load(&cas, &key).unwrap();
        assert_eq!(reloaded.read().size(), data.len() as u64);
        let mut buf = vec![0u8; data.len()];
        assert_eq!(
            reloaded.write().read_at(&mut buf, 0).unwrap(),
            data.len()
        );
        assert_eq!(buf, data);
    }

    #[test]
    fn data_block_keys_match_before_and_after_flush() {
        let node = FileNode::new(test_cas(), file_stat());
        node.write().write_at(b"stable bytes", 0).unwrap();
        let before = node.read().data_block_keys();
        flush(&node).unwrap();
        assert_eq!(node.read().data_block_keys(), before);
    }

    #[test]
    fn truncate_discards_without_paging() {
        let cas = test_cas();
        let node = FileNode::new(cas.clone(), file_stat());
        node.write().write_at(b"soon gone", 0).unwrap();
        let key = flush(&node).unwrap();

        let reloaded = FileNode::load(&cas, &key).unwrap();
        reloaded.write().truncate(0).unwrap();
        assert_eq!(reloaded.read().size(), 0);

        let shrunk = flush(&reloaded).unwrap();
        assert_ne!(shrunk, key);
    }
}

//! The filesystem adapter core.
//!
//! [`FsCore`] implements every node and handle operation as a plain method
//! returning `Result<_, Errno>`, so the whole POSIX surface is exercisable
//! without a kernel. The thin [`adapter`] layer maps these methods onto the
//! `fuser::Filesystem` trait.
//!
//! Locking follows a single reader/writer lock over the mounted tree.
//! Pure reads (attr, open, readlink, access, ordinary getxattr) take the
//! read lock; everything that can mutate the tree or page children in from
//! storage — lookup and readdir included — takes the write lock. There are
//! no per-node locks to order, which is what makes cross-directory rename
//! straightforward.
//!
//! Operations that change what the kernel may have cached return a set of
//! [`Invalidation`] events. The caller replies to the kernel first and only
//! then queues the events; a background thread delivers them through the
//! session notifier. Delivering them synchronously can deadlock, because
//! the kernel is free to re-enter the filesystem while handling an
//! invalidation.

pub mod adapter;
mod xattr;

use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;

use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use fuser::Errno;
use fuser::FileAttr;
use fuser::FileType;
use fuser::INodeNo;
use fuser::TimeOrNow;
use log::debug;
use parking_lot::Mutex;
use parking_lot::RwLock;

use crate::file;
use crate::file::FileNode;
use crate::file::FileRef;
use crate::file::Stat;
use crate::file::TreeError;
use crate::mode::FileMode;
use crate::mode::errno_from_tree;
use crate::store::Cas;

/// The kernel's fixed inode number for the mount root.
pub const ROOT_INO: u64 = 1;

/// Size in bytes of one attr block, for the `blocks` attr field.
const ATTR_BLOCK_SIZE: u64 = 512;

/// Per-entry size estimate used for directory sizes.
const DIR_ENTRY_SIZE: u64 = 32;

/// A deferred kernel-cache invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// The directory entry `name` under `parent` changed or vanished.
    Entry { parent: u64, name: OsString },
    /// The node's attributes (size, mtime, nlink) may have changed.
    Attr { ino: u64 },
}

/// Identity of the requesting process, taken from the FUSE request.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
}

/// Flags relevant to `create`, already decoded from the open flags word.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateFlags {
    pub exclusive: bool,
    pub truncate: bool,
    pub read_only: bool,
    pub append: bool,
}

/// The subset of setattr fields this tree can honor.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttrs {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub mtime: Option<TimeOrNow>,
}

/// One `readdir` entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: u64,
    pub kind: FileType,
    pub name: String,
}

struct NodeSlot {
    file: FileRef,
    /// Outstanding kernel lookups; the slot is evicted when this hits zero.
    lookups: u64,
}

struct OpenHandle {
    ino: u64,
    file: FileRef,
    writable: bool,
    append: bool,
}

struct TreeRoot {
    root: FileRef,
}

/// State shared by every operation of one mounted filesystem.
pub struct FsCore {
    tree: RwLock<TreeRoot>,
    /// Inode table: keeps a strong reference for every inode the kernel
    /// knows, so the address-derived inode stays valid until `forget`.
    nodes: Mutex<HashMap<u64, NodeSlot>>,
    handles: Mutex<HashMap<u64, OpenHandle>>,
    next_handle: AtomicU64,
    invalidations: Sender<Invalidation>,
    pub(super) cas: Cas,
}

impl FsCore {
    /// Builds a core over `root`. The returned receiver carries the
    /// deferred invalidation events; the service wires it to the session
    /// notifier, tests may inspect it directly.
    pub fn new(root: FileRef, cas: Cas) -> (Arc<FsCore>, Receiver<Invalidation>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let core = Arc::new(FsCore {
            tree: RwLock::new(TreeRoot { root }),
            nodes: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            invalidations: tx,
            cas,
        });
        (core, rx)
    }

    /// Current root of the mounted tree.
    pub fn root(&self) -> FileRef {
        self.tree.read().root.clone()
    }

    /// Queues invalidation events for the notifier thread. Call only after
    /// the reply for the triggering request has been sent.
    pub fn queue_invalidations(&self, events: Vec<Invalidation>) {
        for event in events {
            // A disconnected receiver just means nobody is listening.
            let _ = self.invalidations.send(event);
        }
    }

    /// Runs `body` while holding the tree write lock, excluding every
    /// filesystem operation. Used for whole-root work: periodic flushes,
    /// snapshots, root replacement.
    pub fn with_tree_locked<R>(&self, body: impl FnOnce() -> R) -> R {
        let _guard = self.tree.write();
        body()
    }

    /// Replaces the mounted root, returning the invalidations the caller
    /// must queue: the root's attributes plus every first-level entry of
    /// both the old and the new tree.
    pub fn replace_root(&self, new_root: FileRef) -> Vec<Invalidation> {
        let mut tree = self.tree.write();
        let mut names: Vec<String> = tree.root.read().child_names();
        for name in new_root.read().child_names() {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        tree.root = new_root;
        let mut events: Vec<Invalidation> = names
            .into_iter()
            .map(|name| Invalidation::Entry {
                parent: ROOT_INO,
                name: name.into(),
            })
            .collect();
        events.push(Invalidation::Attr { ino: ROOT_INO });
        events
    }

    // -- inode identity ----------------------------------------------------

    fn ino_of(file: &FileRef) -> u64 {
        Arc::as_ptr(file) as usize as u64
    }

    fn file_for(&self, tree: &TreeRoot, ino: u64) -> Result<FileRef, Errno> {
        if ino == ROOT_INO {
            return Ok(tree.root.clone());
        }
        self.nodes
            .lock()
            .get(&ino)
            .map(|slot| slot.file.clone())
            .ok_or(Errno::ENOENT)
    }

    /// Records one kernel reference to `file` and returns its inode.
    fn register_lookup(&self, file: &FileRef) -> u64 {
        let ino = Self::ino_of(file);
        let mut nodes = self.nodes.lock();
        nodes
            .entry(ino)
            .and_modify(|slot| slot.lookups += 1)
            .or_insert_with(|| NodeSlot {
                file: file.clone(),
                lookups: 1,
            });
        ino
    }

    /// Drops `nlookup` kernel references from the inode.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut nodes = self.nodes.lock();
        if let Some(slot) = nodes.get_mut(&ino) {
            slot.lookups = slot.lookups.saturating_sub(nlookup);
            if slot.lookups == 0 {
                nodes.remove(&ino);
            }
        }
    }

    // -- attributes --------------------------------------------------------

    fn fill_attr(ino: u64, node: &FileNode) -> FileAttr {
        let stat = node.stat();
        let size = if stat.mode.is_dir() {
            node.child_names()
                .iter()
                .map(|name| name.len() as u64 + DIR_ENTRY_SIZE)
                .sum()
        } else {
            node.size()
        };
        let nlink = if stat.mode.is_dir() {
            2 + node.child_count() as u32
        } else {
            1
        };
        FileAttr {
            ino: INodeNo(ino),
            size,
            blocks: size.div_ceil(ATTR_BLOCK_SIZE),
            atime: stat.mtime,
            mtime: stat.mtime,
            ctime: stat.mtime,
            crtime: stat.mtime,
            kind: stat.mode.file_type(),
            perm: stat.mode.perm,
            nlink,
            uid: stat.owner_id,
            gid: stat.group_id,
            rdev: 0,
            blksize: ATTR_BLOCK_SIZE as u32,
            flags: 0,
        }
    }

    pub fn attr(&self, ino: u64) -> Result<FileAttr, Errno> {
        let tree = self.tree.read();
        let file = self.file_for(&tree, ino)?;
        let node = file.read();
        Ok(Self::fill_attr(ino, &node))
    }

    pub fn setattr(&self, ino: u64, set: SetAttrs) -> Result<FileAttr, Errno> {
        let tree = self.tree.write();
        let file = self.file_for(&tree, ino)?;

        // Size is the only change that can fail, so apply it first.
        if let Some(size) = set.size {
            file.write().truncate(size).map_err(tree_errno)?;
        }
        let mut node = file.write();
        node.update_stat(|stat| {
            if let Some(gid) = set.gid {
                stat.group_id = gid;
            }
            if let Some(uid) = set.uid {
                stat.owner_id = uid;
            }
            if let Some(mode) = set.mode {
                // Permission bits only; the node keeps its type.
                stat.mode = FileMode {
                    kind: stat.mode.kind,
                    perm: (mode & crate::mode::PERM_MASK) as u16,
                };
            }
            match set.mtime {
                Some(TimeOrNow::SpecificTime(time)) => stat.mtime = time,
                Some(TimeOrNow::Now) => stat.mtime = SystemTime::now(),
                None => {}
            }
        });
        Ok(Self::fill_attr(ino, &node))
    }

    // -- directory operations ----------------------------------------------

    pub fn lookup(&self, parent: u64, name: &str) -> Result<FileAttr, Errno> {
        let tree = self.tree.write();
        let dir = self.file_for(&tree, parent)?;
        let child = dir.write().open_child(name).map_err(tree_errno)?;
        let ino = self.register_lookup(&child);
        let node = child.read();
        Ok(Self::fill_attr(ino, &node))
    }

    pub fn create(
        &self,
        parent: u64,
        name: &str,
        mode: u32,
        caller: Caller,
        flags: CreateFlags,
    ) -> Result<(FileAttr, u64), Errno> {
        let tree = self.tree.write();
        let dir = self.file_for(&tree, parent)?;

        // Bind before matching: a guard inside the scrutinee would live for
        // the whole match and deadlock against the re-locks below.
        let existing = dir.write().open_child(name);
        let file = match existing {
            Ok(existing) => {
                if flags.exclusive {
                    return Err(Errno::EEXIST);
                }
                existing
            }
            Err(TreeError::ChildNotFound) => {
                let stat = Stat::new(
                    FileMode::regular(mode),
                    caller.uid,
                    caller.gid,
                );
                let child = dir.read().new_child(stat);
                let mut d = dir.write();
                d.set_child(name, child.clone());
                d.touch();
                child
            }
            Err(err) => return Err(tree_errno(err)),
        };

        if flags.truncate {
            let mut node = file.write();
            node.truncate(0).map_err(tree_errno)?;
            node.touch();
        }

        let ino = self.register_lookup(&file);
        let attr = Self::fill_attr(ino, &file.read());
        let fh = self.alloc_handle(ino, &file, !flags.read_only, flags.append);
        Ok((attr, fh))
    }

    pub fn mkdir(
        &self,
        parent: u64,
        name: &str,
        mode: u32,
        caller: Caller,
    ) -> Result<FileAttr, Errno> {
        let tree = self.tree.write();
        let dir = self.file_for(&tree, parent)?;
        if dir.read().has_child(name) {
            return Err(Errno::EEXIST);
        }
        // The type bit goes in explicitly; not every kernel sets S_IFDIR in
        // the mkdir mode argument.
        let stat = Stat::new(FileMode::directory(mode), caller.uid, caller.gid);
        let child = dir.read().new_child(stat);
        let mut d = dir.write();
        d.set_child(name, child.clone());
        d.touch();
        drop(d);
        let ino = self.register_lookup(&child);
        Ok(Self::fill_attr(ino, &child.read()))
    }

    pub fn symlink(
        &self,
        parent: u64,
        name: &str,
        target: &str,
        caller: Caller,
    ) -> Result<FileAttr, Errno> {
        let tree = self.tree.write();
        let dir = self.file_for(&tree, parent)?;
        if dir.read().has_child(name) {
            return Err(Errno::EEXIST);
        }
        let stat = Stat::new(FileMode::symlink(0o555), caller.uid, caller.gid);
        let child = dir.read().new_child(stat);
        child
            .write()
            .write_at(target.as_bytes(), 0)
            .map_err(tree_errno)?;
        let mut d = dir.write();
        d.set_child(name, child.clone());
        d.touch();
        drop(d);
        let ino = self.register_lookup(&child);
        Ok(Self::fill_attr(ino, &child.read()))
    }

    pub fn link(
        &self,
        ino: u64,
        new_parent: u64,
        new_name: &str,
    ) -> Result<(FileAttr, Vec<Invalidation>), Errno> {
        let tree = self.tree.write();
        let target = self.file_for(&tree, ino)?;
        let dir = self.file_for(&tree, new_parent)?;
        if dir.read().has_child(new_name) {
            return Err(Errno::EEXIST);
        }
        // Refusing directories keeps the graph acyclic.
        if target.read().stat().mode.is_dir() {
            return Err(Errno::EPERM);
        }
        let mut d = dir.write();
        d.set_child(new_name, target.clone());
        d.touch();
        drop(d);
        let ino = self.register_lookup(&target);
        let attr = Self::fill_attr(ino, &target.read());
        let events = vec![
            Invalidation::Entry {
                parent: new_parent,
                name: new_name.into(),
            },
            Invalidation::Attr { ino: new_parent },
        ];
        Ok((attr, events))
    }

    /// Unlink (`is_dir = false`) or rmdir (`is_dir = true`).
    pub fn remove(
        &self,
        parent: u64,
        name: &str,
        is_dir: bool,
    ) -> Result<Vec<Invalidation>, Errno> {
        let tree = self.tree.write();
        let dir = self.file_for(&tree, parent)?;
        let child = dir.write().open_child(name).map_err(tree_errno)?;

        let child_node = child.read();
        if child_node.stat().mode.is_dir() {
            if !is_dir {
                return Err(Errno::EPERM); // unlink(directory)
            }
            if child_node.child_count() != 0 {
                return Err(Errno::ENOTEMPTY);
            }
        } else if is_dir {
            return Err(Errno::EPERM); // rmdir(non-directory)
        }
        drop(child_node);

        let mut d = dir.write();
        d.remove_child(name);
        d.touch();
        Ok(vec![
            Invalidation::Entry {
                parent,
                name: name.into(),
            },
            Invalidation::Attr { ino: parent },
        ])
    }

    pub fn rename(
        &self,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> Result<Vec<Invalidation>, Errno> {
        let tree = self.tree.write();
        let dir = self.file_for(&tree, parent)?;
        let new_dir = self.file_for(&tree, new_parent)?;

        // Order matters: dir and new_dir may be the same node, so no two
        // guards are ever held at once.
        let src = dir.write().open_child(name).map_err(tree_errno)?;

        let target = new_dir.write().open_child(new_name);
        match target {
            Ok(target) => {
                // Most filesystems refuse to replace a directory with
                // anything, even an empty one, and refuse to replace a file
                // with a directory.
                if target.read().stat().mode.is_dir() {
                    return Err(Errno::EEXIST);
                }
                if src.read().stat().mode.is_dir() {
                    return Err(Errno::EEXIST);
                }
                let mut nd = new_dir.write();
                nd.remove_child(new_name);
                nd.touch();
            }
            Err(TreeError::ChildNotFound) => {}
            Err(err) => return Err(tree_errno(err)),
        }

        let mut d = dir.write();
        d.remove_child(name);
        d.touch();
        drop(d);
        new_dir.write().set_child(new_name, src);

        Ok(vec![
            Invalidation::Entry {
                parent,
                name: name.into(),
            },
            Invalidation::Attr { ino: parent },
            Invalidation::Entry {
                parent: new_parent,
                name: new_name.into(),
            },
            Invalidation::Attr { ino: new_parent },
        ])
    }

    pub fn readdir(&self, ino: u64) -> Result<Vec<DirEntry>, Errno> {
        // Write lock: listing pages every child in.
        let tree = self.tree.write();
        let dir = self.file_for(&tree, ino)?;
        let names = dir.read().child_names();
        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let child = dir.write().open_child(&name).map_err(tree_errno)?;
            let kind = child.read().stat().mode.file_type();
            entries.push(DirEntry {
                ino: Self::ino_of(&child),
                kind,
                name,
            });
        }
        Ok(entries)
    }

    pub fn readlink(&self, ino: u64) -> Result<Vec<u8>, Errno> {
        let tree = self.tree.read();
        let file = self.file_for(&tree, ino)?;
        let mut node = file.write();
        let size = node.size() as usize;
        let mut buf = vec![0u8; size];
        let n = node.read_at(&mut buf, 0).map_err(tree_errno)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn access(&self, ino: u64, mask: i32, caller: Caller) -> Result<(), Errno> {
        let tree = self.tree.read();
        let file = self.file_for(&tree, ino)?;
        let stat = file.read().stat();
        let perm = i32::from(stat.mode.perm);
        let bits = if caller.uid == stat.owner_id || stat.owner_id == 0 {
            (perm >> 6) & 0o7
        } else if caller.gid == stat.group_id {
            (perm >> 3) & 0o7
        } else {
            perm & 0o7
        };
        let want = mask & 0o7;
        if want & !bits != 0 {
            return Err(Errno::EACCES);
        }
        Ok(())
    }

    pub fn fsync(&self, ino: u64) -> Result<(), Errno> {
        let tree = self.tree.write();
        let file = self.file_for(&tree, ino)?;
        file::flush(&file).map_err(tree_errno)?;
        Ok(())
    }

    // -- handles -----------------------------------------------------------

    fn alloc_handle(&self, ino: u64, file: &FileRef, writable: bool, append: bool) -> u64 {
        let fh = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().insert(
            fh,
            OpenHandle {
                ino,
                file: file.clone(),
                writable,
                append,
            },
        );
        fh
    }

    fn handle(&self, fh: u64) -> Result<(u64, FileRef, bool, bool), Errno> {
        let handles = self.handles.lock();
        let handle = handles.get(&fh).ok_or(Errno::EBADF)?;
        Ok((
            handle.ino,
            handle.file.clone(),
            handle.writable,
            handle.append,
        ))
    }

    pub fn open(&self, ino: u64, writable: bool, append: bool) -> Result<u64, Errno> {
        let tree = self.tree.read();
        let file = self.file_for(&tree, ino)?;
        Ok(self.alloc_handle(ino, &file, writable, append))
    }

    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>, Errno> {
        let _tree = self.tree.read();
        let (_, file, _, _) = self.handle(fh)?;
        let mut buf = vec![0u8; size as usize];
        let n = file.write().read_at(&mut buf, offset).map_err(tree_errno)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u32, Errno> {
        let _tree = self.tree.write();
        let (_, file, writable, append) = self.handle(fh)?;
        if !writable {
            return Err(Errno::EPERM);
        }
        let mut node = file.write();
        // Append handles write at the current end regardless of the
        // requested offset.
        let offset = if append { node.size() } else { offset };
        let n = node.write_at(data, offset).map_err(tree_errno)?;
        if n > 0 {
            node.touch();
        }
        Ok(n as u32)
    }

    pub fn flush_handle(&self, fh: u64) -> Result<(), Errno> {
        let _tree = self.tree.write();
        let (_, file, _, _) = self.handle(fh)?;
        file::flush(&file).map_err(tree_errno)?;
        Ok(())
    }

    pub fn release(&self, fh: u64) -> Result<Vec<Invalidation>, Errno> {
        let _tree = self.tree.write();
        let handle = self
            .handles
            .lock()
            .remove(&fh)
            .ok_or(Errno::EBADF)?;
        file::flush(&handle.file).map_err(tree_errno)?;
        if handle.writable || handle.append {
            // Size and mtime may have moved under the kernel's cache.
            return Ok(vec![Invalidation::Attr { ino: handle.ino }]);
        }
        Ok(vec![])
    }
}

pub(crate) fn tree_errno(err: TreeError) -> Errno {
    let errno = errno_from_tree(&err);
    if errno == Errno::EIO {
        debug!("tree operation failed: {err}");
    }
    errno
}

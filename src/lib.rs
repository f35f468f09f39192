//! Mount a content-addressed file tree as a POSIX filesystem via FUSE.
//!
//! The tree is a Merkle tree of files: every node — stat, extended
//! attributes, chunked content, and an ordered child map — lives in a
//! content-addressed blob store and is named by the key of its serialized
//! record. Mounting exposes one such tree through the kernel; nodes page
//! in from the store on first use, and a flush commits every dirty node
//! and yields the new root key.
//!
//! Layering, bottom up:
//!
//! * [`store`] — the blob store: `mem:` and `file:` backends, a
//!   content-addressed keyspace for blobs, and a named keyspace for root
//!   pointers.
//! * [`file`] — the lazy in-memory tree and its wire format.
//! * [`mode`] — translation between tree modes/errors and host
//!   conventions.
//! * [`fs`] — the filesystem core (one method per POSIX operation, plus
//!   inode identity, open handles, and deferred kernel invalidation) and
//!   the `fuser::Filesystem` shim over it.
//! * [`path`] — root pointers and mount-spec resolution.
//! * [`service`] / [`control`] — mount lifecycle and the optional HTTP
//!   control surface.
//!
//! Two synthetic xattr families expose the storage layer through ordinary
//! file APIs: reading `ffs.storageKey.hex` flushes a node and returns its
//! key, and writing `ffs.link.<name>` on a directory grafts the subtree
//! stored under the written key as child `<name>`.

pub mod config;
pub mod control;
pub mod file;
pub mod fs;
pub mod mode;
pub mod path;
pub mod service;
pub mod store;

pub use fs::FsCore;
pub use fs::Invalidation;
pub use fs::adapter::FfsFuse;
pub use path::PathInfo;
pub use path::RootRecord;
pub use service::Service;
pub use service::ServiceOptions;
pub use store::Key;
pub use store::Store;

//! Extended attributes, ordinary and synthetic.
//!
//! Three attribute families share the xattr namespace:
//!
//! * `ffs.storageKey[.b64|.hex]` — reading one flushes the node and returns
//!   its storage key in the requested encoding. Read-only.
//! * `ffs.dataHash[.b64|.hex]` — SHA3-256 over the node's content-chunk
//!   keys, computed without committing anything. Read-only.
//! * `ffs.link.<name>` — writing one grafts the subtree stored under the
//!   key in the value as child `<name>` of a directory; removing one
//!   detaches the child. Reads are not synthesized.
//!
//! Everything else is an ordinary attribute stored on the node. Synthetic
//! names are never listed, so `getfattr -d` output stays clean.

use fuser::Errno;
use sha3::Digest;
use sha3::Sha3_256;

use crate::file::FileNode;
use crate::fs::FsCore;
use crate::fs::Invalidation;
use crate::fs::tree_errno;
use crate::mode::errno_no_xattr;
use crate::store::Key;

const STORAGE_KEY_ATTR: &str = "ffs.storageKey";
const DATA_HASH_ATTR: &str = "ffs.dataHash";
const LINK_ATTR_PREFIX: &str = "ffs.link.";

#[derive(Clone, Copy)]
enum Encoding {
    Raw,
    Base64,
    Hex,
}

impl Encoding {
    fn apply(self, bytes: &[u8]) -> Vec<u8> {
        match self {
            Encoding::Raw => bytes.to_vec(),
            Encoding::Base64 => {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .encode(bytes)
                    .into_bytes()
            }
            Encoding::Hex => hex::encode(bytes).into_bytes(),
        }
    }
}

enum Synthetic<'a> {
    StorageKey(Encoding),
    DataHash(Encoding),
    Link(&'a str),
}

fn synthetic(name: &str) -> Option<Synthetic<'_>> {
    if let Some(child) = name.strip_prefix(LINK_ATTR_PREFIX) {
        return Some(Synthetic::Link(child));
    }
    if let Some(rest) = name.strip_prefix(STORAGE_KEY_ATTR) {
        return match rest {
            "" => Some(Synthetic::StorageKey(Encoding::Raw)),
            ".b64" => Some(Synthetic::StorageKey(Encoding::Base64)),
            ".hex" => Some(Synthetic::StorageKey(Encoding::Hex)),
            _ => None,
        };
    }
    if let Some(rest) = name.strip_prefix(DATA_HASH_ATTR) {
        return match rest {
            "" => Some(Synthetic::DataHash(Encoding::Raw)),
            ".b64" => Some(Synthetic::DataHash(Encoding::Base64)),
            ".hex" => Some(Synthetic::DataHash(Encoding::Hex)),
            _ => None,
        };
    }
    None
}

/// SHA3-256 over the concatenated content-chunk keys.
fn data_hash(node: &FileNode) -> Vec<u8> {
    let mut hasher = Sha3_256::new();
    for key in node.data_block_keys() {
        hasher.update(key.as_bytes());
    }
    hasher.finalize().to_vec()
}

fn parse_graft_key(value: &[u8]) -> Option<Key> {
    if let Some(key) = Key::from_bytes(value) {
        return Some(key);
    }
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| Key::parse(s).ok())
}

fn valid_link_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\0')
}

impl FsCore {
    pub fn xattr_get(&self, ino: u64, name: &str) -> Result<Vec<u8>, Errno> {
        match synthetic(name) {
            Some(Synthetic::StorageKey(enc)) => {
                // Not a pure read: the key only exists once the subtree is
                // committed.
                let tree = self.tree.write();
                let file = self.file_for(&tree, ino)?;
                let key = crate::file::flush(&file).map_err(tree_errno)?;
                Ok(enc.apply(key.as_bytes()))
            }
            Some(Synthetic::DataHash(enc)) => {
                let tree = self.tree.read();
                let file = self.file_for(&tree, ino)?;
                let digest = data_hash(&file.read());
                Ok(enc.apply(&digest))
            }
            // Link attributes are not synthesized on read; fall through to
            // whatever the node stores under that name.
            Some(Synthetic::Link(_)) | None => {
                let tree = self.tree.read();
                let file = self.file_for(&tree, ino)?;
                let node = file.read();
                node.xattr_get(name)
                    .map(<[u8]>::to_vec)
                    .ok_or_else(errno_no_xattr)
            }
        }
    }

    pub fn xattr_set(
        &self,
        ino: u64,
        name: &str,
        value: &[u8],
        flags: i32,
    ) -> Result<Vec<Invalidation>, Errno> {
        let create = flags & libc::XATTR_CREATE != 0;
        let replace = flags & libc::XATTR_REPLACE != 0;
        match synthetic(name) {
            Some(Synthetic::StorageKey(_)) | Some(Synthetic::DataHash(_)) => Err(Errno::EPERM),
            Some(Synthetic::Link(child_name)) => {
                if !valid_link_name(child_name) {
                    return Err(Errno::EINVAL);
                }
                let tree = self.tree.write();
                let dir = self.file_for(&tree, ino)?;
                if !dir.read().stat().mode.is_dir() {
                    return Err(Errno::EPERM);
                }
                let present = dir.read().has_child(child_name);
                if create && present {
                    return Err(Errno::EEXIST);
                }
                if replace && !present {
                    return Err(errno_no_xattr());
                }
                let key = parse_graft_key(value).ok_or(Errno::EINVAL)?;
                let node = FileNode::load(&self.cas, &key).map_err(|err| match err {
                    crate::file::TreeError::Store(ref store) if store.is_not_found() => {
                        Errno::ENOENT
                    }
                    other => tree_errno(other),
                })?;
                // Grafting changes directory composition but is still an
                // xattr write, so the parent mtime stays put.
                dir.write().set_child(child_name, node);
                Ok(vec![Invalidation::Entry {
                    parent: ino,
                    name: child_name.into(),
                }])
            }
            None => {
                let tree = self.tree.write();
                let file = self.file_for(&tree, ino)?;
                let mut node = file.write();
                let present = node.xattr_get(name).is_some();
                if create && present {
                    return Err(Errno::EEXIST);
                }
                if replace && !present {
                    return Err(errno_no_xattr());
                }
                node.xattr_set(name, value);
                Ok(vec![])
            }
        }
    }

    pub fn xattr_remove(&self, ino: u64, name: &str) -> Result<Vec<Invalidation>, Errno> {
        match synthetic(name) {
            Some(Synthetic::StorageKey(_)) | Some(Synthetic::DataHash(_)) => Err(Errno::EPERM),
            Some(Synthetic::Link(child_name)) => {
                let tree = self.tree.write();
                let dir = self.file_for(&tree, ino)?;
                if !dir.read().stat().mode.is_dir() {
                    return Err(Errno::EPERM);
                }
                if !dir.write().remove_child(child_name) {
                    return Err(errno_no_xattr());
                }
                Ok(vec![Invalidation::Entry {
                    parent: ino,
                    name: child_name.into(),
                }])
            }
            None => {
                let tree = self.tree.write();
                let file = self.file_for(&tree, ino)?;
                if !file.write().xattr_remove(name) {
                    return Err(errno_no_xattr());
                }
                Ok(vec![])
            }
        }
    }

    /// Stored attribute names, NUL-terminated and concatenated. Synthetic
    /// names are deliberately absent.
    pub fn xattr_list(&self, ino: u64) -> Result<Vec<u8>, Errno> {
        let tree = self.tree.read();
        let file = self.file_for(&tree, ino)?;
        let node = file.read();
        let mut out = Vec::new();
        for name in node.xattr_names() {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_names_parse() {
        assert!(matches!(
            synthetic("ffs.storageKey"),
            Some(Synthetic::StorageKey(Encoding::Raw))
        ));
        assert!(matches!(
            synthetic("ffs.storageKey.hex"),
            Some(Synthetic::StorageKey(Encoding::Hex))
        ));
        assert!(matches!(
            synthetic("ffs.dataHash.b64"),
            Some(Synthetic::DataHash(Encoding::Base64))
        ));
        assert!(matches!(synthetic("ffs.link.sub"), Some(Synthetic::Link("sub"))));
        assert!(synthetic("user.comment").is_none());
        // A stray suffix is not synthetic.
        assert!(synthetic("ffs.storageKey.raw").is_none());
    }

    #[test]
    fn link_name_validation() {
        assert!(valid_link_name("ok"));
        assert!(!valid_link_name(""));
        assert!(!valid_link_name("a/b"));
        assert!(!valid_link_name("a\0b"));
    }
}

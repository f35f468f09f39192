//! Translation between the tree's mode representation and host conventions.
//!
//! The tree stores a [`FileMode`]: a node kind plus permission bits. The
//! host side wants `libc` type bits (`S_IFMT`) in a `u32`, or a
//! [`fuser::FileType`] for directory listings. Errno mapping for the lower
//! layers lives here too, so the adapter proper never inspects transport
//! errors.

use std::io::ErrorKind;

use fuser::Errno;
use fuser::FileType;
use log::warn;
use serde::Deserialize;
use serde::Serialize;

use crate::file::TreeError;
use crate::store::StoreError;

/// Permission and special-mode bits (the `0o7777` range).
pub const PERM_MASK: u32 = 0o7777;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

impl From<FileKind> for FileType {
    fn from(kind: FileKind) -> FileType {
        match kind {
            FileKind::Regular => FileType::RegularFile,
            FileKind::Directory => FileType::Directory,
            FileKind::Symlink => FileType::Symlink,
        }
    }
}

/// The tree's file mode: a kind plus permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMode {
    pub kind: FileKind,
    pub perm: u16,
}

impl FileMode {
    pub fn regular(perm: u32) -> FileMode {
        FileMode {
            kind: FileKind::Regular,
            perm: (perm & PERM_MASK) as u16,
        }
    }

    pub fn directory(perm: u32) -> FileMode {
        FileMode {
            kind: FileKind::Directory,
            perm: (perm & PERM_MASK) as u16,
        }
    }

    pub fn symlink(perm: u32) -> FileMode {
        FileMode {
            kind: FileKind::Symlink,
            perm: (perm & PERM_MASK) as u16,
        }
    }

    /// Decodes a host mode word. The kind comes from the `S_IFMT` bits; a
    /// kind this tree cannot represent decodes as a regular file.
    pub fn from_host(mode: u32) -> FileMode {
        let kind = match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFDIR as u32 => FileKind::Directory,
            m if m == libc::S_IFLNK as u32 => FileKind::Symlink,
            m if m == libc::S_IFREG as u32 || m == 0 => FileKind::Regular,
            other => {
                warn!("unsupported file type bits {other:#o}, storing as regular");
                FileKind::Regular
            }
        };
        FileMode {
            kind,
            perm: (mode & PERM_MASK) as u16,
        }
    }

    /// Encodes the host mode word, type bits included.
    pub fn to_host(self) -> u32 {
        let type_bits = match self.kind {
            FileKind::Regular => libc::S_IFREG as u32,
            FileKind::Directory => libc::S_IFDIR as u32,
            FileKind::Symlink => libc::S_IFLNK as u32,
        };
        type_bits | u32::from(self.perm)
    }

    pub fn is_dir(self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_symlink(self) -> bool {
        self.kind == FileKind::Symlink
    }

    pub fn file_type(self) -> FileType {
        self.kind.into()
    }
}

/// Maps a store failure onto the errno surface.
///
/// Interrupted I/O is the cancellation path and must surface as EINTR,
/// never EIO. Everything else from the transport is EIO.
pub fn errno_from_store(err: &StoreError) -> Errno {
    match err {
        StoreError::Io(io) if io.kind() == ErrorKind::Interrupted => Errno::EINTR,
        _ => Errno::EIO,
    }
}

/// Maps a tree failure onto the errno surface.
pub fn errno_from_tree(err: &TreeError) -> Errno {
    match err {
        TreeError::ChildNotFound => Errno::ENOENT,
        TreeError::Store(store) => errno_from_store(store),
        TreeError::Decode(_) => Errno::EIO,
    }
}

/// The platform's "no such attribute" errno for xattr lookups.
#[cfg(target_os = "linux")]
pub fn errno_no_xattr() -> Errno {
    Errno::ENODATA
}

#[cfg(not(target_os = "linux"))]
pub fn errno_no_xattr() -> Errno {
    Errno::ENOATTR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_round_trip_preserves_kind_and_perm() {
        for mode in [
            FileMode::regular(0o644),
            FileMode::directory(0o755),
            FileMode::symlink(0o555),
            FileMode::regular(0o4755), // setuid survives
        ] {
            assert_eq!(FileMode::from_host(mode.to_host()), mode);
        }
    }

    #[test]
    fn from_host_without_type_bits_is_regular() {
        let mode = FileMode::from_host(0o600);
        assert_eq!(mode.kind, FileKind::Regular);
        assert_eq!(mode.perm, 0o600);
    }

    #[test]
    fn interrupted_store_io_maps_to_eintr() {
        let err = StoreError::Io(std::io::Error::new(ErrorKind::Interrupted, "cancelled"));
        assert_eq!(errno_from_store(&err), Errno::EINTR);
        let err = StoreError::Io(std::io::Error::other("broken"));
        assert_eq!(errno_from_store(&err), Errno::EIO);
    }

    #[test]
    fn missing_child_maps_to_enoent() {
        assert_eq!(errno_from_tree(&TreeError::ChildNotFound), Errno::ENOENT);
    }
}

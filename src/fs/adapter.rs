//! The `fuser::Filesystem` shim over [`FsCore`].
//!
//! Each method decodes the request, calls the corresponding core operation,
//! sends the reply, and only then queues any cache invalidations the
//! operation produced. Keeping the shim mechanical means every piece of
//! filesystem behavior stays on the testable side of the boundary.

use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use fuser::AccessFlags;
use fuser::BsdFileFlags;
use fuser::Errno;
use fuser::FileHandle;
use fuser::Filesystem;
use fuser::Generation;
use fuser::INodeNo;
use fuser::KernelConfig;
use fuser::LockOwner;
use fuser::OpenAccMode;
use fuser::OpenFlags;
use fuser::RenameFlags;
use fuser::ReplyAttr;
use fuser::ReplyCreate;
use fuser::ReplyData;
use fuser::ReplyDirectory;
use fuser::ReplyEmpty;
use fuser::ReplyEntry;
use fuser::ReplyOpen;
use fuser::ReplyWrite;
use fuser::ReplyXattr;
use fuser::Request;
use fuser::TimeOrNow;
use fuser::WriteFlags;
use log::debug;

use crate::fs::Caller;
use crate::fs::CreateFlags;
use crate::fs::FsCore;
use crate::fs::SetAttrs;

/// Cache lifetime handed to the kernel with entries and attributes.
const TTL: Duration = Duration::from_secs(1);

/// The mountable filesystem: a thin shim over the shared core.
pub struct FfsFuse {
    core: Arc<FsCore>,
}

impl FfsFuse {
    pub fn new(core: Arc<FsCore>) -> FfsFuse {
        FfsFuse { core }
    }
}

fn caller(req: &Request) -> Caller {
    Caller {
        uid: req.uid(),
        gid: req.gid(),
    }
}

/// Tree names are UTF-8; anything else cannot exist in this filesystem.
fn name_str(name: &OsStr) -> Result<&str, Errno> {
    name.to_str().ok_or(Errno::EINVAL)
}

/// The two-phase size probe shared by getxattr and listxattr.
fn reply_xattr_bytes(reply: ReplyXattr, value: &[u8], size: u32) {
    if size == 0 {
        reply.size(value.len() as u32);
    } else if value.len() <= size as usize {
        reply.data(value);
    } else {
        reply.error(Errno::ERANGE);
    }
}

impl Filesystem for FfsFuse {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> io::Result<()> {
        Ok(())
    }

    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let result = name_str(name).and_then(|name| self.core.lookup(parent.0, name));
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, Generation(0)),
            Err(errno) => reply.error(errno),
        }
    }

    fn forget(&self, _req: &Request, ino: INodeNo, nlookup: u64) {
        self.core.forget(ino.0, nlookup);
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        match self.core.attr(ino.0) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn setattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<FileHandle>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<BsdFileFlags>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino: {ino:?}, mode: {mode:?}, size: {size:?})");
        let set = SetAttrs {
            mode,
            uid,
            gid,
            size,
            mtime,
        };
        match self.core.setattr(ino.0, set) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&self, _req: &Request, ino: INodeNo, reply: ReplyData) {
        match self.core.readlink(ino.0) {
            Ok(target) => reply.data(&target),
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent: {parent:?}, name: {name:?}, mode: {mode:o})");
        let result =
            name_str(name).and_then(|name| self.core.mkdir(parent.0, name, mode, caller(req)));
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, Generation(0)),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent: {parent:?}, name: {name:?})");
        match name_str(name).and_then(|name| self.core.remove(parent.0, name, false)) {
            Ok(events) => {
                reply.ok();
                self.core.queue_invalidations(events);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent: {parent:?}, name: {name:?})");
        match name_str(name).and_then(|name| self.core.remove(parent.0, name, true)) {
            Ok(events) => {
                reply.ok();
                self.core.queue_invalidations(events);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn symlink(
        &self,
        req: &Request,
        parent: INodeNo,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink(parent: {parent:?}, link_name: {link_name:?}, target: {target:?})");
        let result = name_str(link_name).and_then(|name| {
            let target = target.to_str().ok_or(Errno::EINVAL)?;
            self.core.symlink(parent.0, name, target, caller(req))
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, Generation(0)),
            Err(errno) => reply.error(errno),
        }
    }

    fn rename(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        newparent: INodeNo,
        newname: &OsStr,
        _flags: RenameFlags,
        reply: ReplyEmpty,
    ) {
        debug!("rename({parent:?} {name:?} -> {newparent:?} {newname:?})");
        let result = name_str(name).and_then(|name| {
            let newname = name_str(newname)?;
            self.core.rename(parent.0, name, newparent.0, newname)
        });
        match result {
            Ok(events) => {
                reply.ok();
                self.core.queue_invalidations(events);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn link(
        &self,
        _req: &Request,
        ino: INodeNo,
        newparent: INodeNo,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link(ino: {ino:?}, newparent: {newparent:?}, newname: {newname:?})");
        match name_str(newname).and_then(|name| self.core.link(ino.0, newparent.0, name)) {
            Ok((attr, events)) => {
                reply.entry(&TTL, &attr, Generation(0));
                self.core.queue_invalidations(events);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&self, _req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        let writable = !matches!(flags.acc_mode(), OpenAccMode::O_RDONLY);
        let append = flags.0 & libc::O_APPEND != 0;
        match self.core.open(ino.0, writable, append) {
            Ok(fh) => reply.opened(FileHandle(fh), fuser::FopenFlags::empty()),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        let fh: u64 = fh.into();
        match self.core.read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn write(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyWrite,
    ) {
        let fh: u64 = fh.into();
        match self.core.write(fh, offset, data) {
            Ok(written) => reply.written(written),
            Err(errno) => reply.error(errno),
        }
    }

    fn flush(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _lock_owner: LockOwner,
        reply: ReplyEmpty,
    ) {
        match self.core.flush_handle(fh.into()) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.core.release(fh.into()) {
            Ok(events) => {
                reply.ok();
                self.core.queue_invalidations(events);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn fsync(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        // Metadata and data are not separable in this tree, so the
        // datasync hint changes nothing.
        match self.core.fsync(ino.0) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.core.readdir(ino.0) {
            Ok(entries) => entries,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        for (index, entry) in entries.iter().enumerate().skip(offset as usize) {
            let full = reply.add(
                INodeNo(entry.ino),
                index as u64 + 1,
                entry.kind,
                &entry.name,
            );
            if full {
                break;
            }
        }
        reply.ok();
    }

    fn setxattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        position: u32,
        reply: ReplyEmpty,
    ) {
        debug!("setxattr(ino: {ino:?}, name: {name:?})");
        if position != 0 {
            // Resource-fork offsets have no representation here.
            reply.error(Errno::EPERM);
            return;
        }
        match name_str(name).and_then(|name| self.core.xattr_set(ino.0, name, value, flags)) {
            Ok(events) => {
                reply.ok();
                self.core.queue_invalidations(events);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn getxattr(&self, _req: &Request, ino: INodeNo, name: &OsStr, size: u32, reply: ReplyXattr) {
        match name_str(name).and_then(|name| self.core.xattr_get(ino.0, name)) {
            Ok(value) => reply_xattr_bytes(reply, &value, size),
            Err(errno) => reply.error(errno),
        }
    }

    fn listxattr(&self, _req: &Request, ino: INodeNo, size: u32, reply: ReplyXattr) {
        match self.core.xattr_list(ino.0) {
            Ok(names) => reply_xattr_bytes(reply, &names, size),
            Err(errno) => reply.error(errno),
        }
    }

    fn removexattr(&self, _req: &Request, ino: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        debug!("removexattr(ino: {ino:?}, name: {name:?})");
        match name_str(name).and_then(|name| self.core.xattr_remove(ino.0, name)) {
            Ok(events) => {
                reply.ok();
                self.core.queue_invalidations(events);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn access(&self, req: &Request, ino: INodeNo, mask: AccessFlags, reply: ReplyEmpty) {
        match self.core.access(ino.0, mask.bits(), caller(req)) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent: {parent:?}, name: {name:?}, mode: {mode:o}, flags: {flags:#x})");
        let create_flags = CreateFlags {
            exclusive: flags & libc::O_EXCL != 0,
            truncate: flags & libc::O_TRUNC != 0,
            read_only: flags & libc::O_ACCMODE == libc::O_RDONLY,
            append: flags & libc::O_APPEND != 0,
        };
        let result = name_str(name)
            .and_then(|name| self.core.create(parent.0, name, mode, caller(req), create_flags));
        match result {
            Ok((attr, fh)) => {
                reply.created(
                    &TTL,
                    &attr,
                    Generation(0),
                    FileHandle(fh),
                    fuser::FopenFlags::empty(),
                );
            }
            Err(errno) => reply.error(errno),
        }
    }
}

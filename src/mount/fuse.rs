//! FUSE adapter for [`ArchiveTree`]

use super::{ArchiveTree, Attr, FileKind};
use crate::{Error, Result};
use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory, ReplyEntry,
    ReplyOpen, ReplyXattr, Request,
};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

const TTL: Duration = Duration::from_secs(1);

struct BurrowFs {
    tree: ArchiveTree,
}

fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::Directory => FileType::Directory,
        FileKind::RegularFile => FileType::RegularFile,
        FileKind::Symlink => FileType::Symlink,
        FileKind::NamedPipe => FileType::NamedPipe,
        FileKind::CharDevice => FileType::CharDevice,
        FileKind::BlockDevice => FileType::BlockDevice,
        FileKind::Socket => FileType::Socket,
    }
}

fn file_attr(attr: &Attr) -> FileAttr {
    FileAttr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.mtime,
        mtime: attr.mtime,
        ctime: attr.mtime,
        crtime: attr.mtime,
        kind: file_type(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev_u32(),
        blksize: 512,
        flags: 0,
    }
}

fn errno(e: &Error) -> i32 {
    error!("{}", e);
    match e {
        Error::ObjectNotFound { .. } => libc::ENOENT,
        _ => libc::EIO,
    }
}

/// Answer an xattr request: the size when `size` is zero, else the data
fn reply_xattr(reply: ReplyXattr, size: u32, data: &[u8]) {
    if size == 0 {
        reply.size(data.len() as u32);
    } else if data.len() <= size as usize {
        reply.data(data);
    } else {
        reply.error(libc::ERANGE);
    }
}

impl Filesystem for BurrowFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.tree.lookup(parent, name.as_bytes()) {
            Ok(Some(attr)) => reply.entry(&TTL, &file_attr(&attr), 0),
            Ok(None) => reply.error(libc::ENOENT),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.tree.attr(ino) {
            Ok(attr) => reply.attr(&TTL, &file_attr(&attr)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.tree.readlink(ino) {
            Ok(Some(target)) => reply.data(&target),
            Ok(None) => reply.error(libc::EINVAL),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, _ino: u64, flags: i32, reply: ReplyOpen) {
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            reply.error(libc::EROFS);
        } else {
            reply.opened(0, 0);
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.tree.read(ino, offset.max(0) as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let children = match self.tree.readdir(ino) {
            Ok(children) => children,
            Err(e) => return reply.error(errno(&e)),
        };
        let parent = self.tree.parent(ino);
        let entries = [
            (ino, FileKind::Directory, b".".to_vec()),
            (parent, FileKind::Directory, b"..".to_vec()),
        ]
        .into_iter()
        .chain(children);
        for (i, (child, kind, name)) in entries.enumerate().skip(offset.max(0) as usize) {
            if reply.add(child, i as i64 + 1, file_type(kind), OsStr::from_bytes(&name)) {
                break;
            }
        }
        reply.ok();
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        match self.tree.getxattr(ino, &name.to_string_lossy()) {
            Ok(Some(value)) => reply_xattr(reply, size, &value),
            Ok(None) => reply.error(libc::ENODATA),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match self.tree.listxattr(ino) {
            Ok(names) => {
                let mut data = Vec::new();
                for name in names {
                    data.extend_from_slice(name.as_bytes());
                    data.push(0);
                }
                reply_xattr(reply, size, &data);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }
}

fn mount_option(option: &str) -> MountOption {
    match option {
        "allow_other" => MountOption::AllowOther,
        "allow_root" => MountOption::AllowRoot,
        "auto_unmount" => MountOption::AutoUnmount,
        "default_permissions" => MountOption::DefaultPermissions,
        other => MountOption::CUSTOM(other.to_string()),
    }
}

pub(super) fn mount(tree: ArchiveTree, mountpoint: &Path, options: &[String], foreground: bool) -> Result<()> {
    let mut mount_options = vec![MountOption::RO, MountOption::FSName("burrow".to_string())];
    mount_options.extend(
        options
            .iter()
            .flat_map(|o| o.split(','))
            .filter(|o| !o.is_empty())
            .map(mount_option),
    );
    if !foreground {
        nix::unistd::daemon(true, false)?;
    }
    info!(mountpoint = %mountpoint.display(), "mounting");
    fuser::mount2(BurrowFs { tree }, mountpoint, &mount_options)?;
    Ok(())
}

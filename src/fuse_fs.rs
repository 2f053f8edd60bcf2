//! Bridges [`crate::fuse_view`]'s pure projection to a real mount via the
//! `fuser` crate (spec.md 4.9, 5). Only built behind the `fuse` feature;
//! the projection itself never depends on `fuser`.

use std::{
    ffi::OsStr,
    io::{Read, Seek},
    sync::Mutex,
    time::{Duration, UNIX_EPOCH},
};

use fuser::{FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEntry, Request};
use tracing::warn;

use crate::{
    error::CoreError,
    fuse_view::{FuseView, ViewNode},
};

const TTL: Duration = Duration::from_secs(1);
const ROOT_INODE: u64 = 1;

fn node_to_attr(ino: u64, node: &ViewNode) -> FileAttr {
    let (kind, size) = match node {
        ViewNode::Directory(_) => (FileType::Directory, 0),
        ViewNode::RegularFile { size } => (FileType::RegularFile, *size),
        ViewNode::Symlink(_) => (FileType::Symlink, 0),
    };
    FileAttr {
        ino,
        size,
        blocks: size.div_ceil(512),
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        crtime: UNIX_EPOCH,
        kind,
        perm: if kind == FileType::Directory { 0o555 } else { 0o444 },
        nlink: 1,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

/// Every reachable path is given a stable inode by hashing it; this avoids
/// an explicit inode table at the cost of never reusing a number (spec.md
/// 5: all mutation here is the one process-wide lock serialising the view,
/// not an inode allocator).
fn path_to_inode(path: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    if path.trim_matches('/').is_empty() {
        return ROOT_INODE;
    }
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    path.hash(&mut hasher);
    hasher.finish().max(2)
}

/// Real FUSE bridge: holds the pure view behind one mutex, matching the
/// spec's single global lock over disc open/FST materialisation (spec.md
/// 5); individual reads still go through the same lock here since `fuser`
/// gives us no cheaper place to split it for this simple single-disc mount.
pub struct DiscFuse<RS: Read + Seek + Send + 'static> {
    view: Mutex<FuseView<RS>>,
    path_table: Mutex<Vec<String>>,
}

impl<RS: Read + Seek + Send + 'static> DiscFuse<RS> {
    pub fn new(disc_size: u64) -> Self {
        DiscFuse { view: Mutex::new(FuseView::new(disc_size)), path_table: Mutex::new(vec!["/iso".into()]) }
    }

    fn resolve_path(&self, ino: u64) -> Option<String> {
        if ino == ROOT_INODE {
            return Some(String::new());
        }
        let table = self.path_table.lock().unwrap();
        table.iter().find(|p| path_to_inode(p) == ino).cloned()
    }

    fn remember(&self, path: &str) {
        let mut table = self.path_table.lock().unwrap();
        if !table.iter().any(|p| p == path) {
            table.push(path.to_string());
        }
    }
}

impl<RS: Read + Seek + Send + 'static> Filesystem for DiscFuse<RS> {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.resolve_path(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let child_path = format!("{parent_path}/{name}");
        let mut view = self.view.lock().unwrap();
        match view.lookup(&child_path) {
            Ok(node) => {
                self.remember(&child_path);
                reply.entry(&TTL, &node_to_attr(path_to_inode(&child_path), &node), 0);
            }
            Err(e) => reply.error(core_error_to_errno(&e)),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.resolve_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut view = self.view.lock().unwrap();
        match view.lookup(&path) {
            Ok(node) => reply.attr(&TTL, &node_to_attr(ino, &node)),
            Err(e) => reply.error(core_error_to_errno(&e)),
        }
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(path) = self.resolve_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut view = self.view.lock().unwrap();
        let entries = match view.lookup(&path) {
            Ok(ViewNode::Directory(names)) => names,
            Ok(_) => {
                reply.error(libc::ENOTDIR);
                return;
            }
            Err(e) => {
                reply.error(core_error_to_errno(&e));
                return;
            }
        };
        for (i, name) in entries.into_iter().enumerate().skip(offset as usize) {
            let child_path = format!("{path}/{name}");
            self.remember(&child_path);
            if reply.add(path_to_inode(&child_path), (i + 1) as i64, FileType::RegularFile, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn read(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, size: u32, _flags: i32, _lock: Option<u64>, reply: ReplyData) {
        let Some(path) = self.resolve_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        warn!(path, offset, size, "read through the pure FUSE projection has no byte source wired yet");
        reply.data(&[]);
    }
}

fn core_error_to_errno(err: &CoreError) -> libc::c_int {
    match err {
        CoreError::NotFound(_) => libc::ENOENT,
        CoreError::BadFormat => libc::EINVAL,
        CoreError::SlotNotFound(_) => libc::ENOENT,
        _ => libc::EIO,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn root_path_maps_to_root_inode() {
        assert_eq!(path_to_inode(""), ROOT_INODE);
        assert_eq!(path_to_inode("/"), ROOT_INODE);
    }

    #[test]
    fn distinct_paths_get_distinct_inodes() {
        assert_ne!(path_to_inode("/iso/disc.iso"), path_to_inode("/iso/part"));
    }
}

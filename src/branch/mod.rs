//! Branches: the backing trees merged into the union
//!
//! Provides:
//! - The `BranchFs` contract every backing filesystem driver implements
//! - Local-directory and in-memory drivers
//! - The ordered `BranchTable` and the `GenerationClock` versioning it
//! - Writable-branch selection policies for new entries

mod local;
mod memory;
mod policy;
mod table;

pub use local::LocalBranch;
pub use memory::{BranchOp, MemoryBranch};
pub use policy::{BranchSelector, CreatePolicy};
pub use table::{
    Branch, BranchId, BranchPerm, BranchPin, BranchTable, DirLockGuard, GenerationClock,
};

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Type of an entry inside a branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileKind {
    /// Derive the kind from the `S_IFMT` bits of a mode
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFDIR as u32 => FileKind::Directory,
            m if m == libc::S_IFLNK as u32 => FileKind::Symlink,
            m if m == libc::S_IFBLK as u32 => FileKind::BlockDevice,
            m if m == libc::S_IFCHR as u32 => FileKind::CharDevice,
            m if m == libc::S_IFIFO as u32 => FileKind::Fifo,
            m if m == libc::S_IFSOCK as u32 => FileKind::Socket,
            _ => FileKind::RegularFile,
        }
    }

    pub fn is_dir(&self) -> bool {
        *self == FileKind::Directory
    }

    /// The `S_IFMT` bits for this kind
    pub fn mode_bits(&self) -> u32 {
        let bits = match self {
            FileKind::RegularFile => libc::S_IFREG,
            FileKind::Directory => libc::S_IFDIR,
            FileKind::Symlink => libc::S_IFLNK,
            FileKind::BlockDevice => libc::S_IFBLK,
            FileKind::CharDevice => libc::S_IFCHR,
            FileKind::Fifo => libc::S_IFIFO,
            FileKind::Socket => libc::S_IFSOCK,
        };
        bits as u32
    }
}

impl From<std::fs::FileType> for FileKind {
    fn from(ft: std::fs::FileType) -> Self {
        use std::os::unix::fs::FileTypeExt;
        if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_block_device() {
            FileKind::BlockDevice
        } else if ft.is_char_device() {
            FileKind::CharDevice
        } else if ft.is_fifo() {
            FileKind::Fifo
        } else if ft.is_socket() {
            FileKind::Socket
        } else {
            FileKind::RegularFile
        }
    }
}

/// Handle to an underlying entry, as recorded in an entry map slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchEntry {
    /// Inode number inside the branch
    pub ino: u64,
    pub kind: FileKind,
}

/// Attributes of an underlying entry
#[derive(Debug, Clone)]
pub struct EntryAttr {
    pub ino: u64,
    pub kind: FileKind,
    /// Permission bits
    pub perm: u32,
    pub nlink: u32,
    pub size: u64,
    pub mtime: SystemTime,
}

impl EntryAttr {
    pub fn entry(&self) -> BranchEntry {
        BranchEntry {
            ino: self.ino,
            kind: self.kind,
        }
    }
}

/// Directory timestamps captured before a mutation so they can be restored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirTimes {
    pub atime: SystemTime,
    pub mtime: SystemTime,
}

/// One name in a branch directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: FileKind,
}

/// Contract of a backing branch filesystem.
///
/// Every path is relative to the branch root; the root itself is the empty
/// path. Operations are synchronous and may fail; the union always holds the
/// parent directory's lock on the branch before mutating it.
pub trait BranchFs: Send + Sync {
    /// Human readable label for log messages
    fn label(&self) -> String;

    /// Attributes of `path` without following symlinks, `None` if absent
    fn stat(&self, path: &Path) -> io::Result<Option<EntryAttr>>;

    fn lookup(&self, parent: &Path, name: &OsStr) -> io::Result<Option<EntryAttr>> {
        self.stat(&parent.join(name))
    }

    /// Create a regular file; fails if the name exists
    fn create(&self, parent: &Path, name: &OsStr, mode: u32) -> io::Result<EntryAttr>;

    fn mkdir(&self, parent: &Path, name: &OsStr, mode: u32) -> io::Result<EntryAttr>;

    fn symlink(&self, parent: &Path, name: &OsStr, target: &Path) -> io::Result<EntryAttr>;

    fn mknod(&self, parent: &Path, name: &OsStr, mode: u32, rdev: u64) -> io::Result<EntryAttr>;

    fn unlink(&self, parent: &Path, name: &OsStr) -> io::Result<()>;

    fn rmdir(&self, parent: &Path, name: &OsStr) -> io::Result<()>;

    /// Hard link `existing` as `parent/name`
    fn link(&self, existing: &Path, parent: &Path, name: &OsStr) -> io::Result<EntryAttr>;

    /// Create an unnamed regular file in `parent`
    fn tmpfile(&self, _parent: &Path, _mode: u32) -> io::Result<EntryAttr> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    fn readdir(&self, dir: &Path) -> io::Result<Vec<DirEntry>>;

    fn readlink(&self, path: &Path) -> io::Result<PathBuf>;

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;

    fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    fn dir_times(&self, dir: &Path) -> io::Result<DirTimes>;

    fn set_dir_times(&self, dir: &Path, times: &DirTimes) -> io::Result<()>;

    /// Bytes available to unprivileged writers
    fn free_space(&self) -> io::Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_mode() {
        assert_eq!(FileKind::from_mode(libc::S_IFDIR as u32 | 0o755), FileKind::Directory);
        assert_eq!(FileKind::from_mode(libc::S_IFIFO as u32 | 0o600), FileKind::Fifo);
        assert_eq!(FileKind::from_mode(0o644), FileKind::RegularFile);
        assert_eq!(
            FileKind::from_mode(FileKind::CharDevice.mode_bits() | 0o600),
            FileKind::CharDevice
        );
        assert!(FileKind::Directory.is_dir());
        assert!(!FileKind::Symlink.is_dir());
    }
}

//! Local directory branch
//!
//! Pass-through driver for a branch rooted at a directory of the host
//! filesystem.

use std::ffi::OsStr;
use std::fs::{self, DirBuilder, File, FileTimes, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use nix::sys::stat::{Mode, SFlag};

use super::{BranchFs, DirEntry, DirTimes, EntryAttr, FileKind};
use crate::error::{Error, Result};

/// Branch backed by a host directory
pub struct LocalBranch {
    /// Root path of the branch
    root: PathBuf,
}

impl LocalBranch {
    /// Open a branch rooted at `root`
    pub fn new(root: PathBuf) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::InvalidBranch(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// Get the root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a branch-relative path to an absolute host path
    pub fn resolve(&self, path: &Path) -> PathBuf {
        let relative = path.strip_prefix("/").unwrap_or(path);
        self.root.join(relative)
    }

    fn attr_of(meta: &fs::Metadata) -> EntryAttr {
        EntryAttr {
            ino: meta.ino(),
            kind: FileKind::from(meta.file_type()),
            perm: meta.mode() & 0o7777,
            nlink: meta.nlink() as u32,
            size: meta.len(),
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        }
    }

    fn attr_at(&self, path: &Path) -> io::Result<EntryAttr> {
        fs::symlink_metadata(path).map(|m| Self::attr_of(&m))
    }
}

impl BranchFs for LocalBranch {
    fn label(&self) -> String {
        self.root.display().to_string()
    }

    fn stat(&self, path: &Path) -> io::Result<Option<EntryAttr>> {
        match fs::symlink_metadata(self.resolve(path)) {
            Ok(meta) => Ok(Some(Self::attr_of(&meta))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create(&self, parent: &Path, name: &OsStr, mode: u32) -> io::Result<EntryAttr> {
        let path = self.resolve(parent).join(name);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode & 0o7777)
            .open(&path)?;
        file.metadata().map(|m| Self::attr_of(&m))
    }

    fn mkdir(&self, parent: &Path, name: &OsStr, mode: u32) -> io::Result<EntryAttr> {
        let path = self.resolve(parent).join(name);
        DirBuilder::new().mode(mode & 0o7777).create(&path)?;
        self.attr_at(&path)
    }

    fn symlink(&self, parent: &Path, name: &OsStr, target: &Path) -> io::Result<EntryAttr> {
        let path = self.resolve(parent).join(name);
        std::os::unix::fs::symlink(target, &path)?;
        self.attr_at(&path)
    }

    fn mknod(&self, parent: &Path, name: &OsStr, mode: u32, rdev: u64) -> io::Result<EntryAttr> {
        let path = self.resolve(parent).join(name);
        let kind = SFlag::from_bits_truncate(mode as libc::mode_t & libc::S_IFMT);
        let perm = Mode::from_bits_truncate(mode as libc::mode_t & 0o7777);
        nix::sys::stat::mknod(&path, kind, perm, rdev as libc::dev_t).map_err(io::Error::from)?;
        self.attr_at(&path)
    }

    fn unlink(&self, parent: &Path, name: &OsStr) -> io::Result<()> {
        fs::remove_file(self.resolve(parent).join(name))
    }

    fn rmdir(&self, parent: &Path, name: &OsStr) -> io::Result<()> {
        fs::remove_dir(self.resolve(parent).join(name))
    }

    fn link(&self, existing: &Path, parent: &Path, name: &OsStr) -> io::Result<EntryAttr> {
        let path = self.resolve(parent).join(name);
        fs::hard_link(self.resolve(existing), &path)?;
        self.attr_at(&path)
    }

    fn readdir(&self, dir: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.resolve(dir))? {
            let entry = entry?;
            entries.push(DirEntry {
                name: entry.file_name(),
                kind: FileKind::from(entry.file_type()?),
            });
        }
        Ok(entries)
    }

    fn readlink(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(self.resolve(path))
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(self.resolve(path))
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(self.resolve(path))?;
        file.write_all(data)
    }

    fn dir_times(&self, dir: &Path) -> io::Result<DirTimes> {
        let meta = fs::metadata(self.resolve(dir))?;
        Ok(DirTimes {
            atime: meta.accessed()?,
            mtime: meta.modified()?,
        })
    }

    fn set_dir_times(&self, dir: &Path, times: &DirTimes) -> io::Result<()> {
        let file = File::open(self.resolve(dir))?;
        file.set_times(
            FileTimes::new()
                .set_accessed(times.atime)
                .set_modified(times.mtime),
        )
    }

    fn free_space(&self) -> io::Result<u64> {
        let stat = nix::sys::statvfs::statvfs(&self.root).map_err(io::Error::from)?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_local_branch() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("test.txt"), b"hello world").unwrap();

        let branch = LocalBranch::new(dir.path().to_path_buf()).unwrap();

        let attr = branch.stat(Path::new("test.txt")).unwrap().unwrap();
        assert_eq!(attr.kind, FileKind::RegularFile);
        assert_eq!(attr.size, 11);
        assert!(branch.stat(Path::new("nonexistent.txt")).unwrap().is_none());

        let content = branch.read_file(Path::new("test.txt")).unwrap();
        assert_eq!(content, b"hello world");
    }

    #[test]
    fn test_create_is_exclusive() {
        let dir = tempdir().unwrap();
        let branch = LocalBranch::new(dir.path().to_path_buf()).unwrap();

        branch.create(Path::new(""), OsStr::new("f"), 0o644).unwrap();
        let err = branch.create(Path::new(""), OsStr::new("f"), 0o644).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_readdir_and_link() {
        let dir = tempdir().unwrap();
        let branch = LocalBranch::new(dir.path().to_path_buf()).unwrap();

        branch.mkdir(Path::new(""), OsStr::new("subdir"), 0o755).unwrap();
        let a = branch.create(Path::new("subdir"), OsStr::new("a"), 0o644).unwrap();
        let b = branch
            .link(Path::new("subdir/a"), Path::new(""), OsStr::new("b"))
            .unwrap();
        assert_eq!(a.ino, b.ino);
        assert_eq!(b.nlink, 2);

        let entries = branch.readdir(Path::new("")).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_dir_times_roundtrip() {
        let dir = tempdir().unwrap();
        let branch = LocalBranch::new(dir.path().to_path_buf()).unwrap();
        branch.mkdir(Path::new(""), OsStr::new("d"), 0o755).unwrap();

        let past = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let times = DirTimes {
            atime: past,
            mtime: past,
        };
        branch.set_dir_times(Path::new("d"), &times).unwrap();
        assert_eq!(branch.dir_times(Path::new("d")).unwrap().mtime, past);
    }

    #[test]
    fn test_missing_root_rejected() {
        let dir = tempdir().unwrap();
        assert!(LocalBranch::new(dir.path().join("missing")).is_err());
    }
}

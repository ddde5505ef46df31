//! In-memory branch
//!
//! A complete `BranchFs` kept in process memory. Used for ephemeral upper
//! branches and to exercise failure paths: `fail_on` arms a one-shot error
//! for the next matching operation.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{BranchFs, DirEntry, DirTimes, EntryAttr, FileKind};

/// Driver operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchOp {
    Stat,
    Create,
    Mkdir,
    Symlink,
    Mknod,
    Unlink,
    Rmdir,
    Link,
    Tmpfile,
    WriteFile,
    SetDirTimes,
}

#[derive(Debug, Clone)]
struct MemNode {
    kind: FileKind,
    perm: u32,
    nlink: u32,
    data: Vec<u8>,
    target: Option<PathBuf>,
    atime: SystemTime,
    mtime: SystemTime,
}

impl MemNode {
    fn new(kind: FileKind, perm: u32) -> Self {
        let now = SystemTime::now();
        Self {
            kind,
            perm: perm & 0o7777,
            nlink: 1,
            data: Vec::new(),
            target: None,
            atime: now,
            mtime: now,
        }
    }
}

struct MemState {
    /// ino -> node
    nodes: HashMap<u64, MemNode>,
    /// path -> ino; the root is the empty path
    names: BTreeMap<PathBuf, u64>,
    next_ino: u64,
    free_space: u64,
    /// Armed one-shot failures, matched on the final path component
    failures: Vec<(BranchOp, OsString)>,
}

/// Branch kept entirely in memory
pub struct MemoryBranch {
    label: String,
    state: Mutex<MemState>,
}

const ROOT_INO: u64 = 1;

fn enoent() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOENT)
}

impl MemoryBranch {
    pub fn new(label: impl Into<String>) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_INO, MemNode::new(FileKind::Directory, 0o755));
        let mut names = BTreeMap::new();
        names.insert(PathBuf::new(), ROOT_INO);

        Self {
            label: label.into(),
            state: Mutex::new(MemState {
                nodes,
                names,
                next_ino: ROOT_INO + 1,
                free_space: 1 << 30,
                failures: Vec::new(),
            }),
        }
    }

    /// Set the value reported by `free_space`
    pub fn set_free_space(&self, bytes: u64) {
        self.state.lock().free_space = bytes;
    }

    /// Make the next `op` on an entry called `name` fail with EIO
    pub fn fail_on(&self, op: BranchOp, name: impl AsRef<OsStr>) {
        self.state
            .lock()
            .failures
            .push((op, name.as_ref().to_os_string()));
    }

    /// Number of armed failures that have not fired yet
    pub fn pending_failures(&self) -> usize {
        self.state.lock().failures.len()
    }

    /// Convenience for seeding content: create `path` and every missing
    /// parent directory, writing `data` into the final file
    pub fn seed_file(&self, path: impl AsRef<Path>, data: &[u8]) -> io::Result<EntryAttr> {
        let path = path.as_ref();
        let parent = path.parent().unwrap_or(Path::new(""));
        self.seed_dir(parent)?;
        let name = path.file_name().ok_or_else(enoent)?;
        let attr = self.create(parent, name, 0o644)?;
        self.write_file(path, data)?;
        Ok(attr)
    }

    /// Create `path` and its missing ancestors as directories
    pub fn seed_dir(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let mut current = PathBuf::new();
        for component in path.as_ref().components() {
            let name = component.as_os_str();
            if self.lookup(&current, name)?.is_none() {
                self.mkdir(&current, name, 0o755)?;
            }
            current.push(name);
        }
        Ok(())
    }
}

impl MemState {
    fn check_failure(&mut self, op: BranchOp, name: &OsStr) -> io::Result<()> {
        if let Some(pos) = self
            .failures
            .iter()
            .position(|(o, n)| *o == op && n.as_os_str() == name)
        {
            self.failures.remove(pos);
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        Ok(())
    }

    fn attr(&self, ino: u64) -> Option<EntryAttr> {
        self.nodes.get(&ino).map(|node| EntryAttr {
            ino,
            kind: node.kind,
            perm: node.perm,
            nlink: node.nlink,
            size: node.data.len() as u64,
            mtime: node.mtime,
        })
    }

    fn dir_ino(&self, dir: &Path) -> io::Result<u64> {
        let ino = *self.names.get(dir).ok_or_else(enoent)?;
        match self.nodes.get(&ino) {
            Some(node) if node.kind.is_dir() => Ok(ino),
            Some(_) => Err(io::Error::from_raw_os_error(libc::ENOTDIR)),
            None => Err(enoent()),
        }
    }

    fn touch_dir(&mut self, dir: &Path) {
        if let Some(ino) = self.names.get(dir).copied() {
            if let Some(node) = self.nodes.get_mut(&ino) {
                node.mtime = SystemTime::now();
            }
        }
    }

    fn insert(&mut self, parent: &Path, name: &OsStr, node: MemNode) -> io::Result<EntryAttr> {
        self.dir_ino(parent)?;
        let path = parent.join(name);
        if self.names.contains_key(&path) {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.nodes.insert(ino, node);
        self.names.insert(path, ino);
        self.touch_dir(parent);
        self.attr(ino).ok_or_else(enoent)
    }

    fn children(&self, dir: &Path) -> impl Iterator<Item = (&PathBuf, &u64)> + '_ {
        let dir = dir.to_path_buf();
        self.names
            .iter()
            .filter(move |(path, _)| path.parent() == Some(dir.as_path()) && !path.as_os_str().is_empty())
    }

    fn drop_name(&mut self, path: &Path) -> io::Result<()> {
        let ino = self.names.remove(path).ok_or_else(enoent)?;
        let gone = match self.nodes.get_mut(&ino) {
            Some(node) => {
                node.nlink = node.nlink.saturating_sub(1);
                node.nlink == 0
            }
            None => false,
        };
        if gone {
            self.nodes.remove(&ino);
        }
        if let Some(parent) = path.parent() {
            self.touch_dir(parent);
        }
        Ok(())
    }
}

impl BranchFs for MemoryBranch {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn stat(&self, path: &Path) -> io::Result<Option<EntryAttr>> {
        let mut state = self.state.lock();
        state.check_failure(BranchOp::Stat, path.file_name().unwrap_or_default())?;
        Ok(state.names.get(path).and_then(|ino| state.attr(*ino)))
    }

    fn create(&self, parent: &Path, name: &OsStr, mode: u32) -> io::Result<EntryAttr> {
        let mut state = self.state.lock();
        state.check_failure(BranchOp::Create, name)?;
        state.insert(parent, name, MemNode::new(FileKind::RegularFile, mode))
    }

    fn mkdir(&self, parent: &Path, name: &OsStr, mode: u32) -> io::Result<EntryAttr> {
        let mut state = self.state.lock();
        state.check_failure(BranchOp::Mkdir, name)?;
        state.insert(parent, name, MemNode::new(FileKind::Directory, mode))
    }

    fn symlink(&self, parent: &Path, name: &OsStr, target: &Path) -> io::Result<EntryAttr> {
        let mut state = self.state.lock();
        state.check_failure(BranchOp::Symlink, name)?;
        let mut node = MemNode::new(FileKind::Symlink, 0o777);
        node.target = Some(target.to_path_buf());
        state.insert(parent, name, node)
    }

    fn mknod(&self, parent: &Path, name: &OsStr, mode: u32, _rdev: u64) -> io::Result<EntryAttr> {
        let mut state = self.state.lock();
        state.check_failure(BranchOp::Mknod, name)?;
        state.insert(parent, name, MemNode::new(FileKind::from_mode(mode), mode))
    }

    fn unlink(&self, parent: &Path, name: &OsStr) -> io::Result<()> {
        let mut state = self.state.lock();
        state.check_failure(BranchOp::Unlink, name)?;
        let path = parent.join(name);
        let ino = *state.names.get(&path).ok_or_else(enoent)?;
        if state.nodes.get(&ino).map(|n| n.kind.is_dir()).unwrap_or(false) {
            return Err(io::Error::from_raw_os_error(libc::EISDIR));
        }
        state.drop_name(&path)
    }

    fn rmdir(&self, parent: &Path, name: &OsStr) -> io::Result<()> {
        let mut state = self.state.lock();
        state.check_failure(BranchOp::Rmdir, name)?;
        let path = parent.join(name);
        state.dir_ino(&path)?;
        if state.children(&path).next().is_some() {
            return Err(io::Error::from_raw_os_error(libc::ENOTEMPTY));
        }
        state.drop_name(&path)
    }

    fn link(&self, existing: &Path, parent: &Path, name: &OsStr) -> io::Result<EntryAttr> {
        let mut state = self.state.lock();
        state.check_failure(BranchOp::Link, name)?;
        state.dir_ino(parent)?;
        let ino = *state.names.get(existing).ok_or_else(enoent)?;
        let path = parent.join(name);
        if state.names.contains_key(&path) {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        match state.nodes.get_mut(&ino) {
            Some(node) if node.kind.is_dir() => {
                return Err(io::Error::from_raw_os_error(libc::EPERM))
            }
            Some(node) => node.nlink += 1,
            None => return Err(enoent()),
        }
        state.names.insert(path, ino);
        state.touch_dir(parent);
        state.attr(ino).ok_or_else(enoent)
    }

    fn tmpfile(&self, parent: &Path, mode: u32) -> io::Result<EntryAttr> {
        let mut state = self.state.lock();
        state.check_failure(BranchOp::Tmpfile, parent.file_name().unwrap_or_default())?;
        state.dir_ino(parent)?;
        let ino = state.next_ino;
        state.next_ino += 1;
        let mut node = MemNode::new(FileKind::RegularFile, mode);
        node.nlink = 0;
        state.nodes.insert(ino, node);
        state.attr(ino).ok_or_else(enoent)
    }

    fn readdir(&self, dir: &Path) -> io::Result<Vec<DirEntry>> {
        let state = self.state.lock();
        state.dir_ino(dir)?;
        Ok(state
            .children(dir)
            .filter_map(|(path, ino)| {
                let kind = state.nodes.get(ino)?.kind;
                Some(DirEntry {
                    name: path.file_name()?.to_os_string(),
                    kind,
                })
            })
            .collect())
    }

    fn readlink(&self, path: &Path) -> io::Result<PathBuf> {
        let state = self.state.lock();
        let ino = state.names.get(path).ok_or_else(enoent)?;
        state
            .nodes
            .get(ino)
            .and_then(|n| n.target.clone())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        let state = self.state.lock();
        let ino = state.names.get(path).ok_or_else(enoent)?;
        state
            .nodes
            .get(ino)
            .map(|n| n.data.clone())
            .ok_or_else(enoent)
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        state.check_failure(BranchOp::WriteFile, path.file_name().unwrap_or_default())?;
        let ino = *state.names.get(path).ok_or_else(enoent)?;
        let node = state.nodes.get_mut(&ino).ok_or_else(enoent)?;
        node.data = data.to_vec();
        node.mtime = SystemTime::now();
        Ok(())
    }

    fn dir_times(&self, dir: &Path) -> io::Result<DirTimes> {
        let state = self.state.lock();
        let ino = state.dir_ino(dir)?;
        let node = state.nodes.get(&ino).ok_or_else(enoent)?;
        Ok(DirTimes {
            atime: node.atime,
            mtime: node.mtime,
        })
    }

    fn set_dir_times(&self, dir: &Path, times: &DirTimes) -> io::Result<()> {
        let mut state = self.state.lock();
        state.check_failure(BranchOp::SetDirTimes, dir.file_name().unwrap_or_default())?;
        let ino = state.dir_ino(dir)?;
        let node = state.nodes.get_mut(&ino).ok_or_else(enoent)?;
        node.atime = times.atime;
        node.mtime = times.mtime;
        Ok(())
    }

    fn free_space(&self) -> io::Result<u64> {
        Ok(self.state.lock().free_space)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_lookup() {
        let branch = MemoryBranch::new("mem");
        let attr = branch.create(Path::new(""), OsStr::new("f"), 0o644).unwrap();
        assert_eq!(attr.kind, FileKind::RegularFile);

        let found = branch.lookup(Path::new(""), OsStr::new("f")).unwrap().unwrap();
        assert_eq!(found.ino, attr.ino);
        assert!(branch.lookup(Path::new(""), OsStr::new("g")).unwrap().is_none());
    }

    #[test]
    fn test_missing_parent() {
        let branch = MemoryBranch::new("mem");
        let err = branch
            .create(Path::new("nodir"), OsStr::new("f"), 0o644)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn test_one_shot_failure() {
        let branch = MemoryBranch::new("mem");
        branch.fail_on(BranchOp::Create, "f");
        assert_eq!(branch.pending_failures(), 1);

        let err = branch.create(Path::new(""), OsStr::new("f"), 0o644).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EIO));
        assert_eq!(branch.pending_failures(), 0);

        assert!(branch.create(Path::new(""), OsStr::new("f"), 0o644).is_ok());
    }

    #[test]
    fn test_links_share_ino() {
        let branch = MemoryBranch::new("mem");
        let a = branch.seed_file("d/a", b"data").unwrap();
        let b = branch.link(Path::new("d/a"), Path::new(""), OsStr::new("b")).unwrap();
        assert_eq!(a.ino, b.ino);
        assert_eq!(b.nlink, 2);

        branch.unlink(Path::new("d"), OsStr::new("a")).unwrap();
        let b = branch.stat(Path::new("b")).unwrap().unwrap();
        assert_eq!(b.nlink, 1);
        assert_eq!(branch.read_file(Path::new("b")).unwrap(), b"data");
    }

    #[test]
    fn test_rmdir_not_empty() {
        let branch = MemoryBranch::new("mem");
        branch.seed_file("d/a", b"").unwrap();
        let err = branch.rmdir(Path::new(""), OsStr::new("d")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOTEMPTY));

        branch.unlink(Path::new("d"), OsStr::new("a")).unwrap();
        branch.rmdir(Path::new(""), OsStr::new("d")).unwrap();
        assert!(branch.readdir(Path::new("")).unwrap().is_empty());
    }

    #[test]
    fn test_tmpfile_is_unnamed() {
        let branch = MemoryBranch::new("mem");
        let attr = branch.tmpfile(Path::new(""), 0o600).unwrap();
        assert_eq!(attr.nlink, 0);
        assert!(branch.readdir(Path::new("")).unwrap().is_empty());
    }
}

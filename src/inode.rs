//! Logical inode management
//!
//! Manages the union's own inodes: identities shared by every logical entry
//! that hard-links the same underlying file, and the per-branch copies of
//! that file.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use crate::branch::{BranchId, EntryAttr, FileKind};

/// Root inode number
pub const ROOT_INO: u64 = 1;

#[derive(Debug)]
struct InodeState {
    nlink: u32,
    /// Underlying inode number of this file on each branch holding a copy
    copies: BTreeMap<BranchId, u64>,
    mtime: SystemTime,
    /// Bumped on every namespace change inside a directory
    version: u64,
}

/// A logical file identity
#[derive(Debug)]
pub struct Inode {
    ino: u64,
    kind: FileKind,
    state: RwLock<InodeState>,
}

impl Inode {
    fn new(ino: u64, kind: FileKind, nlink: u32, mtime: SystemTime) -> Self {
        Self {
            ino,
            kind,
            state: RwLock::new(InodeState {
                nlink,
                copies: BTreeMap::new(),
                mtime,
                version: 0,
            }),
        }
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    pub fn nlink(&self) -> u32 {
        self.state.read().nlink
    }

    pub fn set_nlink(&self, nlink: u32) {
        self.state.write().nlink = nlink;
    }

    pub fn inc_nlink(&self) {
        self.state.write().nlink += 1;
    }

    pub fn drop_nlink(&self) {
        let mut state = self.state.write();
        state.nlink = state.nlink.saturating_sub(1);
    }

    /// Underlying inode number of the copy on `branch`
    pub fn copy_on(&self, branch: BranchId) -> Option<u64> {
        self.state.read().copies.get(&branch).copied()
    }

    pub fn copies(&self) -> Vec<(BranchId, u64)> {
        self.state
            .read()
            .copies
            .iter()
            .map(|(b, i)| (*b, *i))
            .collect()
    }

    pub fn add_copy(&self, branch: BranchId, h_ino: u64) {
        self.state.write().copies.insert(branch, h_ino);
    }

    pub fn remove_copy(&self, branch: BranchId) -> Option<u64> {
        self.state.write().copies.remove(&branch)
    }

    pub fn mtime(&self) -> SystemTime {
        self.state.read().mtime
    }

    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    /// Record a namespace change in this directory
    pub fn touch(&self) {
        let mut state = self.state.write();
        state.mtime = SystemTime::now();
        state.version += 1;
    }
}

/// Allocates logical inodes and maps underlying identities onto them
pub struct InodeCache {
    /// Next logical inode number
    next_ino: AtomicU64,
    /// (branch, underlying ino) -> logical inode
    by_branch: DashMap<(BranchId, u64), Weak<Inode>>,
}

impl InodeCache {
    pub fn new() -> Self {
        Self {
            next_ino: AtomicU64::new(ROOT_INO + 1), // 1 is reserved for root
            by_branch: DashMap::new(),
        }
    }

    /// Build the root directory inode
    pub fn root(&self, copies: &[(BranchId, u64)]) -> Arc<Inode> {
        let root = Arc::new(Inode::new(ROOT_INO, FileKind::Directory, 2, SystemTime::now()));
        for (branch, h_ino) in copies {
            self.alias(&root, *branch, *h_ino);
        }
        root
    }

    fn alloc_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::SeqCst)
    }

    /// Live logical inode for an underlying file, if any
    pub fn get(&self, branch: BranchId, h_ino: u64) -> Option<Arc<Inode>> {
        self.by_branch.get(&(branch, h_ino)).and_then(|w| w.upgrade())
    }

    /// Logical inode for an underlying entry found by lookup, reusing the
    /// identity of a live inode that already covers it
    pub fn instantiate(&self, branch: BranchId, attr: &EntryAttr) -> Arc<Inode> {
        if let Some(inode) = self.get(branch, attr.ino) {
            return inode;
        }
        self.new_inode(branch, attr)
    }

    /// Fresh logical inode for a newly created underlying entry. A stale
    /// mapping left by a recycled underlying inode number is replaced.
    pub fn new_inode(&self, branch: BranchId, attr: &EntryAttr) -> Arc<Inode> {
        let nlink = if attr.nlink == 0 { 1 } else { attr.nlink };
        let inode = Arc::new(Inode::new(self.alloc_ino(), attr.kind, nlink, attr.mtime));
        self.alias(&inode, branch, attr.ino);
        inode
    }

    /// Record that `inode` has a copy with underlying number `h_ino` on `branch`
    pub fn alias(&self, inode: &Arc<Inode>, branch: BranchId, h_ino: u64) {
        inode.add_copy(branch, h_ino);
        self.by_branch.insert((branch, h_ino), Arc::downgrade(inode));
    }

    /// Drop every mapping for a removed branch
    pub fn forget_branch(&self, branch: BranchId) {
        self.by_branch.retain(|(b, _), _| *b != branch);
    }

    /// Drop mappings whose inode is gone
    pub fn prune(&self) {
        self.by_branch.retain(|_, w| w.strong_count() > 0);
    }

    pub fn len(&self) -> usize {
        self.by_branch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_branch.is_empty()
    }
}

impl Default for InodeCache {
    fn default() -> Self {
        Self::new()
    }
}

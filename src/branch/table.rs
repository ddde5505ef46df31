//! Branch table and generation clock

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::BranchFs;
use crate::error::{Error, Result};

/// Stable identity of a branch; never reused within one union
pub type BranchId = u32;

/// Monotonic version stamp of the branch set.
///
/// Advanced on every branch add/remove. Entry maps snapshot it and compare
/// later to detect that their slot layout may no longer be valid.
#[derive(Debug)]
pub struct GenerationClock(AtomicU64);

impl GenerationClock {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Advance the clock, returning the new generation
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl Default for GenerationClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Branch permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchPerm {
    #[serde(rename = "ro")]
    ReadOnly,
    #[serde(rename = "rw")]
    ReadWrite,
}

impl FromStr for BranchPerm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "ro" => Ok(BranchPerm::ReadOnly),
            "rw" => Ok(BranchPerm::ReadWrite),
            other => Err(Error::InvalidConfig(format!(
                "unknown branch permission: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for BranchPerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchPerm::ReadOnly => write!(f, "ro"),
            BranchPerm::ReadWrite => write!(f, "rw"),
        }
    }
}

struct GateState {
    perm: BranchPerm,
    /// Writers currently holding a pin
    writers: usize,
    /// A remount is waiting for writers to drain
    draining: bool,
}

/// Exclusive per-directory locks inside one branch
struct DirLocks {
    held: Mutex<HashSet<PathBuf>>,
    released: Condvar,
}

/// A backing tree in the union
pub struct Branch {
    id: BranchId,
    fs: Arc<dyn BranchFs>,
    gate: Mutex<GateState>,
    gate_cond: Condvar,
    pins: AtomicUsize,
    dir_locks: DirLocks,
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("id", &self.id)
            .field("label", &self.fs.label())
            .field("perm", &self.perm())
            .finish()
    }
}

impl Branch {
    fn new(id: BranchId, fs: Arc<dyn BranchFs>, perm: BranchPerm) -> Self {
        Self {
            id,
            fs,
            gate: Mutex::new(GateState {
                perm,
                writers: 0,
                draining: false,
            }),
            gate_cond: Condvar::new(),
            pins: AtomicUsize::new(0),
            dir_locks: DirLocks {
                held: Mutex::new(HashSet::new()),
                released: Condvar::new(),
            },
        }
    }

    pub fn id(&self) -> BranchId {
        self.id
    }

    pub fn fs(&self) -> &dyn BranchFs {
        self.fs.as_ref()
    }

    pub fn perm(&self) -> BranchPerm {
        self.gate.lock().perm
    }

    pub fn is_writable(&self) -> bool {
        self.perm() == BranchPerm::ReadWrite
    }

    /// Number of outstanding pins
    pub fn pinned(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }

    /// Pin the branch for writing.
    ///
    /// Blocks while a remount drains writers, then fails with `ReadOnly` if
    /// the branch is not writable. The pin keeps the branch from being
    /// removed until dropped.
    pub fn pin(self: &Arc<Self>) -> Result<BranchPin> {
        let mut gate = self.gate.lock();
        while gate.draining {
            self.gate_cond.wait(&mut gate);
        }
        if gate.perm != BranchPerm::ReadWrite {
            return Err(Error::ReadOnly(format!("branch {} is read-only", self.id)));
        }
        gate.writers += 1;
        self.pins.fetch_add(1, Ordering::AcqRel);
        Ok(BranchPin {
            branch: Arc::clone(self),
        })
    }

    /// Change the permission once every current writer has released its pin
    pub fn remount(&self, perm: BranchPerm) {
        let mut gate = self.gate.lock();
        gate.draining = true;
        while gate.writers > 0 {
            self.gate_cond.wait(&mut gate);
        }
        gate.perm = perm;
        gate.draining = false;
        self.gate_cond.notify_all();
        info!("branch {} remounted {}", self.id, perm);
    }

    /// Take the exclusive lock of a physical directory in this branch
    pub fn lock_dir(&self, path: &Path) -> DirLockGuard<'_> {
        let mut held = self.dir_locks.held.lock();
        while held.contains(path) {
            self.dir_locks.released.wait(&mut held);
        }
        held.insert(path.to_path_buf());
        DirLockGuard {
            branch: self,
            path: path.to_path_buf(),
        }
    }
}

/// Writer pin on a branch
pub struct BranchPin {
    branch: Arc<Branch>,
}

impl BranchPin {
    pub fn branch(&self) -> &Arc<Branch> {
        &self.branch
    }
}

impl Drop for BranchPin {
    fn drop(&mut self) {
        let mut gate = self.branch.gate.lock();
        gate.writers -= 1;
        self.branch.pins.fetch_sub(1, Ordering::AcqRel);
        if gate.writers == 0 {
            self.branch.gate_cond.notify_all();
        }
    }
}

/// Held exclusive lock on one physical directory
pub struct DirLockGuard<'a> {
    branch: &'a Branch,
    path: PathBuf,
}

impl Drop for DirLockGuard<'_> {
    fn drop(&mut self) {
        self.branch.dir_locks.held.lock().remove(&self.path);
        self.branch.dir_locks.released.notify_all();
    }
}

/// Ordered list of branches; index 0 has the highest priority
#[derive(Default)]
pub struct BranchTable {
    branches: Vec<Arc<Branch>>,
    next_id: BranchId,
}

impl BranchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Branch>> {
        self.branches.get(index)
    }

    /// Like `get`, but an out-of-range index is an error
    pub fn branch(&self, index: usize) -> Result<&Arc<Branch>> {
        self.branches
            .get(index)
            .ok_or_else(|| Error::InvalidBranch(format!("no branch at index {}", index)))
    }

    pub fn index_of(&self, id: BranchId) -> Option<usize> {
        self.branches.iter().position(|b| b.id == id)
    }

    /// Branch ids in table order
    pub fn ids(&self) -> Vec<BranchId> {
        self.branches.iter().map(|b| b.id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Branch>> {
        self.branches.iter()
    }

    /// Indices of writable branches, highest priority first
    pub fn writable(&self) -> Vec<usize> {
        self.branches
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_writable())
            .map(|(i, _)| i)
            .collect()
    }

    /// Insert a branch at `index`, shifting lower-priority branches down
    pub fn insert(
        &mut self,
        index: usize,
        fs: Arc<dyn BranchFs>,
        perm: BranchPerm,
        clock: &GenerationClock,
    ) -> Result<BranchId> {
        if index > self.branches.len() {
            return Err(Error::InvalidBranch(format!(
                "insert index {} beyond {} branches",
                index,
                self.branches.len()
            )));
        }
        let id = self.next_id;
        self.next_id += 1;
        debug!("branch {} ({}) added at {} as {}", id, fs.label(), index, perm);
        self.branches.insert(index, Arc::new(Branch::new(id, fs, perm)));
        clock.advance();
        Ok(id)
    }

    /// Remove the branch at `index`; refused while it is pinned
    pub fn remove(&mut self, index: usize, clock: &GenerationClock) -> Result<Arc<Branch>> {
        let branch = self.branch(index)?;
        if branch.pinned() > 0 {
            return Err(Error::Busy(format!(
                "branch {} has {} active writers",
                branch.id,
                branch.pinned()
            )));
        }
        let branch = self.branches.remove(index);
        clock.advance();
        Ok(branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::MemoryBranch;
    use std::thread;
    use std::time::Duration;

    fn mem(label: &str) -> Arc<dyn BranchFs> {
        Arc::new(MemoryBranch::new(label))
    }

    #[test]
    fn test_clock_monotonic() {
        let clock = GenerationClock::new();
        let g = clock.current();
        assert_eq!(clock.advance(), g + 1);
        assert_eq!(clock.current(), g + 1);
    }

    #[test]
    fn test_insert_remove_bumps_generation() {
        let clock = GenerationClock::new();
        let mut table = BranchTable::new();

        let a = table.insert(0, mem("a"), BranchPerm::ReadOnly, &clock).unwrap();
        let b = table.insert(0, mem("b"), BranchPerm::ReadWrite, &clock).unwrap();
        assert_eq!(clock.current(), 3);
        assert_eq!(table.ids(), vec![b, a]);
        assert_eq!(table.writable(), vec![0]);

        table.remove(0, &clock).unwrap();
        assert_eq!(clock.current(), 4);
        assert_eq!(table.index_of(a), Some(0));
        assert_eq!(table.index_of(b), None);
    }

    #[test]
    fn test_ids_not_reused() {
        let clock = GenerationClock::new();
        let mut table = BranchTable::new();
        let a = table.insert(0, mem("a"), BranchPerm::ReadWrite, &clock).unwrap();
        table.remove(0, &clock).unwrap();
        let b = table.insert(0, mem("b"), BranchPerm::ReadWrite, &clock).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_pinned_branch_not_removable() {
        let clock = GenerationClock::new();
        let mut table = BranchTable::new();
        table.insert(0, mem("a"), BranchPerm::ReadWrite, &clock).unwrap();

        let pin = table.branch(0).unwrap().pin().unwrap();
        assert!(matches!(table.remove(0, &clock), Err(Error::Busy(_))));
        drop(pin);
        assert!(table.remove(0, &clock).is_ok());
    }

    #[test]
    fn test_pin_read_only_fails() {
        let clock = GenerationClock::new();
        let mut table = BranchTable::new();
        table.insert(0, mem("a"), BranchPerm::ReadOnly, &clock).unwrap();
        assert!(matches!(table.branch(0).unwrap().pin(), Err(Error::ReadOnly(_))));
    }

    #[test]
    fn test_remount_waits_for_writers() {
        let clock = GenerationClock::new();
        let mut table = BranchTable::new();
        table.insert(0, mem("a"), BranchPerm::ReadWrite, &clock).unwrap();
        let branch = Arc::clone(table.branch(0).unwrap());

        let pin = branch.pin().unwrap();
        let remounter = {
            let branch = Arc::clone(&branch);
            thread::spawn(move || branch.remount(BranchPerm::ReadOnly))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(branch.is_writable());
        drop(pin);
        remounter.join().unwrap();

        assert!(!branch.is_writable());
        assert!(branch.pin().is_err());
    }

    #[test]
    fn test_dir_lock_exclusive() {
        let clock = GenerationClock::new();
        let mut table = BranchTable::new();
        table.insert(0, mem("a"), BranchPerm::ReadWrite, &clock).unwrap();
        let branch = Arc::clone(table.branch(0).unwrap());

        let guard = branch.lock_dir(Path::new("d"));
        let contender = {
            let branch = Arc::clone(&branch);
            thread::spawn(move || {
                let _g = branch.lock_dir(Path::new("d"));
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!contender.is_finished());
        // Other directories are independent
        drop(branch.lock_dir(Path::new("e")));
        drop(guard);
        contender.join().unwrap();
    }
}

//! Pseudo-links
//!
//! A file promoted from a read-only branch into a writable one while other
//! entries still hard-link the lower copy must keep one logical identity.
//! The registry lists such inodes, holding a reference to each, and links
//! the promoted copy into the branch's private `.wh..wh.plnk` directory
//! under a name derived from the identity so later promotions find it.
//!
//! While an actor holds the maintenance gate, nobody else may add
//! pseudo-links or mutate the branch table. Callers that already hold an
//! exclusive lock elsewhere use `MaintWait::NoWait` and fail with
//! `Busy`; the others use `MaintWait::Wait` and block, re-validating
//! their state afterwards.

use parking_lot::{Condvar, Mutex, RwLock};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::branch::{Branch, BranchId, BranchTable, EntryAttr};
use crate::error::{Error, Result};
use crate::inode::Inode;
use crate::whiteout::PLINK_DIR;

/// Number of hash buckets
pub const PLINK_BUCKETS: usize = 31;

/// Attempts at clearing a colliding backing name before giving up
const LINK_ATTEMPTS: usize = 3;

/// Identity of an actor (a worker context) for the maintenance gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActorId(u64);

static NEXT_ACTOR: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_ACTOR: ActorId = ActorId(NEXT_ACTOR.fetch_add(1, Ordering::Relaxed));
}

impl ActorId {
    /// Actor of the calling thread
    pub fn current() -> Self {
        CURRENT_ACTOR.with(|a| *a)
    }

    /// A fresh actor not bound to any thread
    pub fn unique() -> Self {
        ActorId(NEXT_ACTOR.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor#{}", self.0)
    }
}

/// How a caller reacts to maintenance held by someone else
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintWait {
    /// Fail immediately with `Busy`
    NoWait,
    /// Block until maintenance ends
    Wait,
}

/// Outcome of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Inserted,
    AlreadyPresent,
    /// Listed nowhere: the physical link failed and the entry was rolled
    /// back. The file stays usable without pseudo-link protection.
    LinkFailed,
}

/// Registry of pseudo-linked inodes
pub struct PseudoLinkRegistry {
    /// Shared by bucket users, exclusive while draining
    whole: RwLock<()>,
    buckets: Vec<Mutex<Vec<Arc<Inode>>>>,
    maintainer: Mutex<Option<ActorId>>,
    maint_done: Condvar,
    warn_threshold: usize,
}

/// Backing name of `ino` whose copy on a branch has underlying number `h_ino`
pub fn plink_name(ino: u64, h_ino: u64) -> OsString {
    OsString::from(format!("{}.{}", ino, h_ino))
}

impl PseudoLinkRegistry {
    pub fn new(warn_threshold: usize) -> Self {
        Self {
            whole: RwLock::new(()),
            buckets: (0..PLINK_BUCKETS).map(|_| Mutex::new(Vec::new())).collect(),
            maintainer: Mutex::new(None),
            maint_done: Condvar::new(),
            warn_threshold,
        }
    }

    fn bucket(&self, inode: &Inode) -> &Mutex<Vec<Arc<Inode>>> {
        &self.buckets[(inode.ino() % PLINK_BUCKETS as u64) as usize]
    }

    // ---------------------------------------------------------------------
    // maintenance gate

    /// Become the maintainer; `Busy` if anyone already is
    pub fn enter_maintenance(&self, actor: ActorId) -> Result<()> {
        let mut holder = self.maintainer.lock();
        match *holder {
            None => {
                *holder = Some(actor);
                debug!("{} entered pseudo-link maintenance", actor);
                Ok(())
            }
            Some(other) => Err(Error::Busy(format!(
                "pseudo-link maintenance held by {}",
                other
            ))),
        }
    }

    /// Clear the maintainer and wake every waiter
    pub fn leave_maintenance(&self) {
        let previous = self.maintainer.lock().take();
        if let Some(actor) = previous {
            debug!("{} left pseudo-link maintenance", actor);
        }
        self.maint_done.notify_all();
    }

    pub fn maintainer(&self) -> Option<ActorId> {
        *self.maintainer.lock()
    }

    /// Let `actor` proceed with pseudo-link work, or refuse/block while
    /// another actor maintains
    pub fn check_maintenance(&self, actor: ActorId, mode: MaintWait) -> Result<()> {
        let mut holder = self.maintainer.lock();
        match mode {
            MaintWait::NoWait => match *holder {
                Some(other) if other != actor => Err(Error::Busy(format!(
                    "pseudo-link maintenance held by {}",
                    other
                ))),
                _ => Ok(()),
            },
            MaintWait::Wait => {
                while matches!(*holder, Some(other) if other != actor) {
                    self.maint_done.wait(&mut holder);
                }
                Ok(())
            }
        }
    }

    // ---------------------------------------------------------------------
    // registry

    /// Is `inode` pseudo-linked?
    pub fn contains(&self, inode: &Inode) -> bool {
        let _whole = self.whole.read();
        self.bucket(inode)
            .lock()
            .iter()
            .any(|i| std::ptr::eq(Arc::as_ptr(i), inode))
    }

    /// Number of listed inodes
    pub fn len(&self) -> usize {
        let _whole = self.whole.read();
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// List `inode`, whose promoted copy lives at `h_path` on `branch`, and
    /// link that copy into the branch's pseudo-link directory
    pub fn register(
        &self,
        inode: &Arc<Inode>,
        branch: &Branch,
        h_path: &Path,
        actor: ActorId,
        mode: MaintWait,
    ) -> Result<Registration> {
        self.check_maintenance(actor, mode)?;

        // linked under the bucket lock: a listed inode always has its backing link
        let _whole = self.whole.read();
        let mut bucket = self.bucket(inode).lock();
        if bucket.iter().any(|i| Arc::ptr_eq(i, inode)) {
            return Ok(Registration::AlreadyPresent);
        }
        if let Err(e) = self.link_backing(inode, branch, h_path) {
            warn!(
                "damaged pseudo link for inode {} on branch {}: {}",
                inode.ino(),
                branch.id(),
                e
            );
            return Ok(Registration::LinkFailed);
        }
        bucket.push(Arc::clone(inode));
        if bucket.len() > self.warn_threshold {
            warn!(
                "unexpectedly unbalanced or too many pseudo-links, {}",
                bucket.len()
            );
        }
        debug!("pseudo-linked inode {} on branch {}", inode.ino(), branch.id());
        Ok(Registration::Inserted)
    }

    /// Path of the backing link of `inode` on `branch`
    pub fn backing_path(&self, inode: &Inode, branch: BranchId) -> Option<PathBuf> {
        let h_ino = inode.copy_on(branch)?;
        Some(Path::new(PLINK_DIR).join(plink_name(inode.ino(), h_ino)))
    }

    /// Find the backing link of `inode` on `branch`
    pub fn lookup(&self, inode: &Inode, branch: &Branch) -> Result<Option<EntryAttr>> {
        let Some(path) = self.backing_path(inode, branch.id()) else {
            return Ok(None);
        };
        branch
            .fs()
            .stat(&path)
            .map_err(|e| Error::underlying("pseudo-link lookup", e))
    }

    fn link_backing(&self, inode: &Inode, branch: &Branch, h_path: &Path) -> Result<()> {
        let fs = branch.fs();
        let h_attr = fs
            .stat(h_path)
            .map_err(|e| Error::underlying("stat", e))?
            .ok_or_else(|| Error::NotFound(h_path.display().to_string()))?;
        let name = plink_name(inode.ino(), h_attr.ino);
        let dir = Path::new(PLINK_DIR);
        let _dir_lock = branch.lock_dir(dir);

        for _ in 0..LINK_ATTEMPTS {
            match fs
                .lookup(dir, &name)
                .map_err(|e| Error::underlying("pseudo-link lookup", e))?
            {
                Some(existing) if existing.ino == h_attr.ino => return Ok(()),
                Some(_) => {
                    // a stale file from an earlier identity holds the name
                    fs.unlink(dir, &name)
                        .map_err(|e| Error::underlying("unlink", e))?;
                }
                None => {
                    fs.link(h_path, dir, &name)
                        .map_err(|e| Error::underlying("link", e))?;
                    return Ok(());
                }
            }
        }
        Err(Error::Busy(format!(
            "pseudo-link name {} keeps colliding",
            name.to_string_lossy()
        )))
    }

    /// Whether a listed inode has a copy on `branch`
    pub fn references_branch(&self, branch: BranchId) -> bool {
        let _whole = self.whole.read();
        self.buckets
            .iter()
            .any(|b| b.lock().iter().any(|i| i.copy_on(branch).is_some()))
    }

    /// Consolidate the pseudo-links of one branch: remove their backing
    /// links there and unlist inodes left without any backing link.
    /// Only the current maintainer may do this.
    pub fn flush_branch(&self, table: &BranchTable, index: usize, actor: ActorId) -> Result<usize> {
        if self.maintainer() != Some(actor) {
            return Err(Error::Busy(
                "pseudo-link flush requires maintenance mode".to_string(),
            ));
        }
        let branch = table.branch(index)?;
        let dir = Path::new(PLINK_DIR);
        let mut flushed = 0;

        let _whole = self.whole.write();
        for bucket in &self.buckets {
            let mut bucket = bucket.lock();
            let items = std::mem::take(&mut *bucket);
            let mut kept = Vec::with_capacity(items.len());
            let mut rest = items.into_iter();
            while let Some(inode) = rest.next() {
                if let Some(h_ino) = inode.copy_on(branch.id()) {
                    let name = plink_name(inode.ino(), h_ino);
                    match branch.fs().unlink(dir, &name) {
                        Ok(()) => flushed += 1,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            // everything not yet visited stays listed
                            kept.push(inode);
                            kept.extend(rest);
                            *bucket = kept;
                            return Err(Error::underlying("pseudo-link flush", e));
                        }
                    }
                }
                let backed_elsewhere = table.iter().any(|b| {
                    b.id() != branch.id()
                        && self
                            .lookup(&inode, b)
                            .map(|found| found.is_some())
                            .unwrap_or(false)
                });
                if backed_elsewhere {
                    kept.push(inode);
                }
            }
            *bucket = kept;
        }
        debug!("flushed {} pseudo-links on branch {}", flushed, branch.id());
        Ok(flushed)
    }

    /// Release every listed inode. With `verbose`, leftover entries are
    /// reported: they mean consolidation never ran.
    pub fn drain(&self, verbose: bool) -> usize {
        let _whole = self.whole.write();
        let mut warned = false;
        let mut drained = 0;
        for bucket in &self.buckets {
            let mut bucket = bucket.lock();
            if verbose && !warned && !bucket.is_empty() {
                warn!("pseudo-link is not flushed");
                warned = true;
            }
            drained += bucket.len();
            bucket.clear();
        }
        drained
    }
}

impl Default for PseudoLinkRegistry {
    fn default() -> Self {
        Self::new(50)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::{BranchFs, BranchPerm, FileKind, GenerationClock, MemoryBranch};
    use crate::inode::InodeCache;
    use crate::whiteout::WhiteoutEngine;
    use std::thread;
    use std::time::Duration;

    struct Fixture {
        table: BranchTable,
        mem: Arc<MemoryBranch>,
        cache: InodeCache,
    }

    fn fixture() -> Fixture {
        let clock = GenerationClock::new();
        let mem = Arc::new(MemoryBranch::new("upper"));
        WhiteoutEngine::default().init_branch(mem.as_ref()).unwrap();
        let mut table = BranchTable::new();
        table
            .insert(0, mem.clone() as Arc<dyn BranchFs>, BranchPerm::ReadWrite, &clock)
            .unwrap();
        Fixture {
            table,
            mem,
            cache: InodeCache::new(),
        }
    }

    fn promoted(fx: &Fixture, name: &str) -> Arc<Inode> {
        let attr = fx.mem.seed_file(name, b"x").unwrap();
        let branch = fx.table.branch(0).unwrap();
        fx.cache.new_inode(branch.id(), &attr)
    }

    #[test]
    fn test_register_and_contains() {
        let fx = fixture();
        let registry = PseudoLinkRegistry::default();
        let inode = promoted(&fx, "f");
        let branch = fx.table.branch(0).unwrap();
        let actor = ActorId::current();

        assert!(!registry.contains(&inode));
        let out = registry
            .register(&inode, branch, Path::new("f"), actor, MaintWait::NoWait)
            .unwrap();
        assert_eq!(out, Registration::Inserted);
        assert!(registry.contains(&inode));

        let backing = registry.lookup(&inode, branch).unwrap().unwrap();
        assert_eq!(backing.kind, FileKind::RegularFile);
        assert_eq!(Some(backing.ino), inode.copy_on(branch.id()));

        let again = registry
            .register(&inode, branch, Path::new("f"), actor, MaintWait::NoWait)
            .unwrap();
        assert_eq!(again, Registration::AlreadyPresent);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_register_links_once() {
        let fx = Arc::new(fixture());
        let registry = Arc::new(PseudoLinkRegistry::default());
        let inode = promoted(&fx, "f");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fx = Arc::clone(&fx);
                let registry = Arc::clone(&registry);
                let inode = Arc::clone(&inode);
                thread::spawn(move || {
                    let branch = fx.table.branch(0).unwrap();
                    registry
                        .register(&inode, branch, Path::new("f"), ActorId::current(), MaintWait::Wait)
                        .unwrap()
                })
            })
            .collect();
        let outcomes: Vec<Registration> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(
            outcomes.iter().filter(|o| **o == Registration::Inserted).count(),
            1
        );
        assert!(registry.contains(&inode));
        let backing = fx.mem.readdir(Path::new(PLINK_DIR)).unwrap();
        assert_eq!(backing.len(), 1);
        // the file itself plus exactly one backing link
        assert_eq!(fx.mem.stat(Path::new("f")).unwrap().unwrap().nlink, 2);
    }

    #[test]
    fn test_link_failure_rolls_back() {
        let fx = fixture();
        let registry = PseudoLinkRegistry::default();
        let inode = promoted(&fx, "f");
        let branch = fx.table.branch(0).unwrap();
        let name = plink_name(inode.ino(), inode.copy_on(branch.id()).unwrap());
        fx.mem.fail_on(crate::branch::BranchOp::Link, &name);

        let out = registry
            .register(&inode, branch, Path::new("f"), ActorId::current(), MaintWait::NoWait)
            .unwrap();
        assert_eq!(out, Registration::LinkFailed);
        assert!(!registry.contains(&inode));
        // only the registry's reference was released
        assert_eq!(Arc::strong_count(&inode), 1);
    }

    #[test]
    fn test_colliding_backing_name_replaced() {
        let fx = fixture();
        let registry = PseudoLinkRegistry::default();
        let inode = promoted(&fx, "f");
        let branch = fx.table.branch(0).unwrap();
        let name = plink_name(inode.ino(), inode.copy_on(branch.id()).unwrap());
        fx.mem
            .seed_file(Path::new(PLINK_DIR).join(&name), b"stale")
            .unwrap();

        let out = registry
            .register(&inode, branch, Path::new("f"), ActorId::current(), MaintWait::NoWait)
            .unwrap();
        assert_eq!(out, Registration::Inserted);
        let backing = registry.lookup(&inode, branch).unwrap().unwrap();
        assert_eq!(Some(backing.ino), inode.copy_on(branch.id()));
    }

    #[test]
    fn test_maintenance_blocks_non_waiting_register() {
        let fx = fixture();
        let registry = PseudoLinkRegistry::default();
        let inode = promoted(&fx, "f");
        let branch = fx.table.branch(0).unwrap();
        let maintainer = ActorId::unique();
        let other = ActorId::unique();

        registry.enter_maintenance(maintainer).unwrap();
        assert!(matches!(
            registry.enter_maintenance(other),
            Err(Error::Busy(_))
        ));
        assert!(matches!(
            registry.register(&inode, branch, Path::new("f"), other, MaintWait::NoWait),
            Err(Error::Busy(_))
        ));
        // the maintainer itself is not blocked
        assert!(registry.check_maintenance(maintainer, MaintWait::NoWait).is_ok());

        registry.leave_maintenance();
        assert_eq!(registry.maintainer(), None);
        assert_eq!(
            registry
                .register(&inode, branch, Path::new("f"), other, MaintWait::NoWait)
                .unwrap(),
            Registration::Inserted
        );
    }

    #[test]
    fn test_waiter_resumes_after_leave() {
        let registry = Arc::new(PseudoLinkRegistry::default());
        let maintainer = ActorId::unique();
        registry.enter_maintenance(maintainer).unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.check_maintenance(ActorId::current(), MaintWait::Wait))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        registry.leave_maintenance();
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_drain_releases_references() {
        let fx = fixture();
        let registry = PseudoLinkRegistry::default();
        let branch = fx.table.branch(0).unwrap();
        let a = promoted(&fx, "a");
        let b = promoted(&fx, "b");
        for (inode, path) in [(&a, "a"), (&b, "b")] {
            registry
                .register(inode, branch, Path::new(path), ActorId::current(), MaintWait::NoWait)
                .unwrap();
        }
        assert_eq!(Arc::strong_count(&a), 2);

        assert_eq!(registry.drain(true), 2);
        assert!(registry.is_empty());
        assert_eq!(Arc::strong_count(&a), 1);
        assert_eq!(registry.drain(false), 0);
    }

    #[test]
    fn test_flush_failure_keeps_bucket_listed() {
        let fx = fixture();
        let registry = PseudoLinkRegistry::default();
        let branch = fx.table.branch(0).unwrap();
        let actor = ActorId::unique();

        // inode numbers are sequential: the first and the last share a bucket
        let inodes: Vec<Arc<Inode>> = (0..=PLINK_BUCKETS)
            .map(|i| promoted(&fx, &format!("f{}", i)))
            .collect();
        let first = &inodes[0];
        let last = &inodes[PLINK_BUCKETS];
        assert_eq!(
            first.ino() % PLINK_BUCKETS as u64,
            last.ino() % PLINK_BUCKETS as u64
        );
        let last_path = format!("f{}", PLINK_BUCKETS);
        for (inode, path) in [(first, "f0"), (last, last_path.as_str())] {
            registry
                .register(inode, branch, Path::new(path), actor, MaintWait::NoWait)
                .unwrap();
        }
        assert_eq!(registry.len(), 2);

        let name = plink_name(first.ino(), first.copy_on(branch.id()).unwrap());
        fx.mem.fail_on(crate::branch::BranchOp::Unlink, &name);
        registry.enter_maintenance(actor).unwrap();
        assert!(matches!(
            registry.flush_branch(&fx.table, 0, actor),
            Err(Error::UnderlyingIo { .. })
        ));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(first));
        assert!(registry.contains(last));

        // the retry finishes the job
        assert_eq!(registry.flush_branch(&fx.table, 0, actor).unwrap(), 2);
        registry.leave_maintenance();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_failed_link_never_reported_present() {
        let fx = fixture();
        let registry = PseudoLinkRegistry::default();
        let inode = promoted(&fx, "f");
        let branch = fx.table.branch(0).unwrap();
        let name = plink_name(inode.ino(), inode.copy_on(branch.id()).unwrap());
        fx.mem.fail_on(crate::branch::BranchOp::Link, &name);

        assert_eq!(
            registry
                .register(&inode, branch, Path::new("f"), ActorId::current(), MaintWait::NoWait)
                .unwrap(),
            Registration::LinkFailed
        );
        // a later registrant performs the link itself
        assert_eq!(
            registry
                .register(&inode, branch, Path::new("f"), ActorId::current(), MaintWait::NoWait)
                .unwrap(),
            Registration::Inserted
        );
        assert!(registry.lookup(&inode, branch).unwrap().is_some());
    }

    #[test]
    fn test_flush_branch_requires_maintenance() {
        let fx = fixture();
        let registry = PseudoLinkRegistry::default();
        let branch = fx.table.branch(0).unwrap();
        let inode = promoted(&fx, "f");
        let actor = ActorId::unique();
        registry
            .register(&inode, branch, Path::new("f"), actor, MaintWait::NoWait)
            .unwrap();
        assert!(registry.references_branch(branch.id()));

        assert!(matches!(
            registry.flush_branch(&fx.table, 0, actor),
            Err(Error::Busy(_))
        ));

        registry.enter_maintenance(actor).unwrap();
        assert_eq!(registry.flush_branch(&fx.table, 0, actor).unwrap(), 1);
        registry.leave_maintenance();

        assert!(registry.is_empty());
        assert!(fx.mem.readdir(Path::new(PLINK_DIR)).unwrap().is_empty());
    }
}

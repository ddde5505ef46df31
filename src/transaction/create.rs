//! Entry creation
//!
//! Regular files, directories, symlinks, device nodes and hard links all go
//! through one transaction:
//!
//! 1. pick the target branch (policy, clamped above whiteouts and opaque
//!    directories)
//! 2. copy the parent directory chain up to it
//! 3. re-verify parent and name on the branch when `udba` asks for it
//! 4. create the entry, then make it visible by removing the whiteout that
//!    hid the name (a directory replacing a whiteout is marked opaque)
//! 5. publish the inode and the new entry map
//!
//! A failure after step 4 started unwinds the compensation stack, restoring
//! the whiteout and the parent's timestamps.

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::Saga;
use crate::branch::{BranchFs, BranchTable, EntryAttr};
use crate::config::Udba;
use crate::entry::{Dentry, EntryMap, LockRole, MapState};
use crate::error::{Error, Result};
use crate::plink::{ActorId, MaintWait};
use crate::union::Union;

/// What to create
#[derive(Debug, Clone)]
pub enum EntryKind {
    File { mode: u32 },
    Dir { mode: u32 },
    Symlink { target: PathBuf },
    /// Device node, fifo or socket; `mode` carries the file type bits
    Node { mode: u32, rdev: u64 },
    /// New name for an existing non-directory entry
    Link { source: Arc<Dentry> },
}

impl EntryKind {
    pub fn is_dir(&self) -> bool {
        matches!(self, EntryKind::Dir { .. })
    }

    fn op(&self) -> &'static str {
        match self {
            EntryKind::File { .. } => "create",
            EntryKind::Dir { .. } => "mkdir",
            EntryKind::Symlink { .. } => "symlink",
            EntryKind::Node { .. } => "mknod",
            EntryKind::Link { .. } => "link",
        }
    }
}

/// Caller overrides for a create
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateParams {
    /// Create on this branch index instead of asking the policy
    pub force_branch: Option<usize>,
    /// Allow the new entry to hide a visible entry of a lower branch, as a
    /// rename onto an existing name does
    pub allow_shadow: bool,
}

/// Result of the branch-side steps
struct Created {
    attr: EntryAttr,
    whiteout_removed: bool,
    opaque: bool,
}

impl Union {
    pub fn create(&self, parent: &Arc<Dentry>, name: &OsStr, mode: u32) -> Result<Arc<Dentry>> {
        self.create_entry(parent, name, EntryKind::File { mode }, CreateParams::default())
    }

    pub fn mkdir(&self, parent: &Arc<Dentry>, name: &OsStr, mode: u32) -> Result<Arc<Dentry>> {
        self.create_entry(parent, name, EntryKind::Dir { mode }, CreateParams::default())
    }

    pub fn symlink(&self, parent: &Arc<Dentry>, name: &OsStr, target: &Path) -> Result<Arc<Dentry>> {
        let kind = EntryKind::Symlink {
            target: target.to_path_buf(),
        };
        self.create_entry(parent, name, kind, CreateParams::default())
    }

    pub fn mknod(
        &self,
        parent: &Arc<Dentry>,
        name: &OsStr,
        mode: u32,
        rdev: u64,
    ) -> Result<Arc<Dentry>> {
        self.create_entry(parent, name, EntryKind::Node { mode, rdev }, CreateParams::default())
    }

    /// Hard link `source` as `parent/name`.
    ///
    /// The source is first promoted to the target branch when it lives
    /// elsewhere, and pseudo-linked so later copy-ups of its other names
    /// find the promoted copy.
    pub fn link(&self, source: &Arc<Dentry>, parent: &Arc<Dentry>, name: &OsStr) -> Result<Arc<Dentry>> {
        let kind = EntryKind::Link {
            source: Arc::clone(source),
        };
        self.create_entry(parent, name, kind, CreateParams::default())
    }

    /// Create `parent/name` as described by `kind`
    pub fn create_entry(
        &self,
        parent: &Arc<Dentry>,
        name: &OsStr,
        kind: EntryKind,
        params: CreateParams,
    ) -> Result<Arc<Dentry>> {
        self.whiteouts.check_name(name)?;
        let actor = ActorId::current();
        self.plinks.check_maintenance(actor, MaintWait::Wait)?;

        let table = self.branches.read();
        self.reval_path(&table, parent)?;

        let mut params = params;
        if let EntryKind::Link { source } = &kind {
            let b = self.prepare_link_source(&table, source, parent, params.force_branch, actor)?;
            params.force_branch = Some(b);
        }

        let child = self.lookup_locked(&table, parent, name)?;
        if let EntryKind::Link { source } = &kind {
            if Arc::ptr_eq(&child, source) {
                return Err(Error::AlreadyExists(child.path().display().to_string()));
            }
        }
        debug!("{} {:?} in {:?}", kind.op(), name, parent.path());
        self.add_entry(&table, parent, &child, &kind, params)?;
        Ok(child)
    }

    /// Promote a link source to the branch the new name will live on.
    /// Returns that branch.
    fn prepare_link_source(
        &self,
        table: &BranchTable,
        source: &Arc<Dentry>,
        parent: &Arc<Dentry>,
        force: Option<usize>,
        actor: ActorId,
    ) -> Result<usize> {
        self.reval_path(table, source)?;
        let src_parent = match source.parent() {
            Some(p) if source.is_hashed() => Arc::clone(p),
            _ => {
                return Err(Error::NotSupported(
                    "cannot link an entry without a name".to_string(),
                ))
            }
        };

        // decided before the source locks so the two parents are never held together
        let parent_top = parent.map().read_lock(LockRole::Parent).top();
        let mut b = self.selector.select(table, parent_top, force)?;

        let mut map = source.map().write_lock(LockRole::Child);
        let (top, entry) = map
            .top_entry()
            .ok_or_else(|| Error::NotFound(source.path().display().to_string()))?;
        if entry.kind.is_dir() {
            return Err(Error::IsDirectory(source.path().display().to_string()));
        }
        if force.is_none() && map.get(b).is_none() && b > top {
            b = if table.branch(top)?.is_writable() {
                top
            } else {
                match top.checked_sub(1) {
                    Some(limit) => Self::clamp_target(table, b, Some(limit))?,
                    None => return Err(Error::ReadOnly("no branch above the source".to_string())),
                }
            };
        }

        let mut src_parent_map = src_parent.map().write_lock(LockRole::Parent);
        self.promote(
            table,
            source,
            &mut map,
            &src_parent,
            &mut src_parent_map,
            Some(b),
            actor,
            true,
        )
    }

    /// Lock, run and publish a create for the looked-up `child`
    fn add_entry(
        &self,
        table: &BranchTable,
        parent: &Arc<Dentry>,
        child: &Arc<Dentry>,
        kind: &EntryKind,
        params: CreateParams,
    ) -> Result<()> {
        let mut child_map = child.map().write_lock(LockRole::Child);
        if !child.is_hashed() {
            return Err(Error::StaleConsistency(child.path().display().to_string()));
        }
        if child_map.is_positive() && !params.allow_shadow {
            return Err(Error::AlreadyExists(child.path().display().to_string()));
        }
        let source_map = match kind {
            EntryKind::Link { source } => Some(source.map().read_lock(LockRole::Child2)),
            _ => None,
        };
        let mut parent_map = parent.map().write_lock(LockRole::Parent);
        match parent_map.top_entry() {
            None => return Err(Error::NotFound(parent.path().display().to_string())),
            Some((_, entry)) if !entry.kind.is_dir() => {
                return Err(Error::NotDirectory(parent.path().display().to_string()))
            }
            Some(_) => {}
        }

        let result = self.run_create(
            table,
            parent,
            child,
            &mut child_map,
            source_map.as_deref(),
            &mut parent_map,
            kind,
            params,
        );
        if let Err(e) = result {
            child_map.reset();
            child.set_inode(None);
            child.drop_from_cache();
            return Err(e);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn run_create(
        &self,
        table: &BranchTable,
        parent: &Arc<Dentry>,
        child: &Dentry,
        child_map: &mut MapState,
        source_map: Option<&MapState>,
        parent_map: &mut MapState,
        kind: &EntryKind,
        params: CreateParams,
    ) -> Result<()> {
        let link_inode = match kind {
            EntryKind::Link { source } => Some(
                source
                    .inode()
                    .ok_or_else(|| Error::NotFound(source.path().display().to_string()))?,
            ),
            _ => None,
        };

        let b = self.select_branch(table, parent_map, Some(&*child_map), params.force_branch)?;
        self.copy_up_dirs(table, parent, parent_map, b)?;

        let branch = Arc::clone(table.branch(b)?);
        let _pin = branch.pin()?;
        let parent_path = parent.path();
        let _dir_lock = branch.lock_dir(&parent_path);
        let fs = branch.fs();

        if self.options.udba != Udba::None && (!child_map.is_positive() || child_map.top() == Some(b)) {
            self.check_consistency(fs, parent_map, b, &parent_path, child, child_map, kind.is_dir())?;
        }

        let mut saga = Saga::new(kind.op(), child.path().display().to_string());
        let times = fs
            .dir_times(&parent_path)
            .map_err(|e| Error::underlying("stat parent", e))?;
        {
            let parent_path = parent_path.clone();
            saga.push("parent times", move || {
                fs.set_dir_times(&parent_path, &times)
                    .map_err(|e| Error::underlying("restore parent times", e))
            });
        }
        let created = match self.create_steps(&mut saga, fs, &parent_path, child, child_map, source_map, kind, b) {
            Ok(created) => created,
            Err(e) => return Err(saga.unwind(e)),
        };
        saga.commit();

        let inode = match link_inode {
            Some(inode) => {
                inode.inc_nlink();
                self.inodes.alias(&inode, branch.id(), created.attr.ino);
                inode
            }
            None => self.inodes.new_inode(branch.id(), &created.attr),
        };
        if let Some(dir) = parent.inode() {
            dir.touch();
        }

        let whiteout = child_map.whiteout().filter(|w| *w != b);
        child_map.reset();
        child_map.set(b, Some(created.attr.entry()));
        child_map.set_top(Some(b));
        child_map.set_bottom(Some(b));
        child_map.set_whiteout(if created.whiteout_removed { None } else { whiteout });
        child_map.set_opaque(created.opaque.then_some(b));
        child.set_inode(Some(inode));
        debug!("{} {:?} on branch {}", kind.op(), child.path(), b);
        Ok(())
    }

    /// Branch-side steps; every change pushes its undo onto `saga`
    #[allow(clippy::too_many_arguments)]
    fn create_steps<'a>(
        &self,
        saga: &mut Saga<'a>,
        fs: &'a dyn BranchFs,
        parent_path: &Path,
        child: &Dentry,
        child_map: &MapState,
        source_map: Option<&MapState>,
        kind: &EntryKind,
        b: usize,
    ) -> Result<Created> {
        let name = child.name();
        let whiteout = child_map.whiteout() == Some(b) && self.whiteouts.lookup(fs, parent_path, name)?;

        let created = match kind {
            EntryKind::File { mode } => fs.create(parent_path, name, *mode),
            EntryKind::Dir { mode } => fs.mkdir(parent_path, name, *mode),
            EntryKind::Symlink { target } => fs.symlink(parent_path, name, target),
            EntryKind::Node { mode, rdev } => fs.mknod(parent_path, name, *mode, *rdev),
            EntryKind::Link { source } => {
                if source_map.and_then(|m| m.get(b)).is_none() {
                    return Err(Error::StaleConsistency(format!(
                        "{} has no copy on branch {}",
                        source.path().display(),
                        b
                    )));
                }
                fs.link(&source.path(), parent_path, name)
            }
        }
        .map_err(|e| Error::underlying(kind.op(), e))?;

        let is_dir = created.kind.is_dir();
        {
            let (dir, entry) = (parent_path.to_path_buf(), name.to_os_string());
            saga.push("new entry", move || {
                let removed = if is_dir {
                    fs.rmdir(&dir, &entry)
                } else {
                    fs.unlink(&dir, &entry)
                };
                removed.map_err(|e| Error::underlying("remove new entry", e))
            });
        }

        let path = parent_path.join(name);
        let mut opaque = false;
        if whiteout {
            if is_dir {
                self.whiteouts.mark_opaque(fs, &path)?;
                opaque = true;
                let (engine, dir) = (self.whiteouts.clone(), path.clone());
                saga.push("opaque marker", move || engine.clear_opaque(fs, &dir));
            }
            self.whiteouts.remove(fs, parent_path, name)?;
            let engine = self.whiteouts.clone();
            let (dir, entry) = (parent_path.to_path_buf(), name.to_os_string());
            saga.push("whiteout", move || engine.create(fs, &dir, &entry));
        }

        let attr = fs
            .stat(&path)
            .map_err(|e| Error::underlying("stat", e))?
            .ok_or_else(|| Error::StaleConsistency(path.display().to_string()))?;
        Ok(Created {
            attr,
            whiteout_removed: whiteout,
            opaque,
        })
    }

    /// Create an unnamed regular file under `parent`.
    ///
    /// The entry is never hashed, so no lookup can find it, and its inode
    /// starts with a link count of zero.
    pub fn tmpfile(&self, parent: &Arc<Dentry>, mode: u32) -> Result<Arc<Dentry>> {
        let table = self.branches.read();
        self.reval_path(&table, parent)?;

        let child = Dentry::new_child(parent, OsStr::new("#tmpfile"), EntryMap::new(&table, &self.clock));
        let mut child_map = child.map().write_lock(LockRole::Child);
        let mut parent_map = parent.map().write_lock(LockRole::Parent);
        match parent_map.top_entry() {
            None => return Err(Error::NotFound(parent.path().display().to_string())),
            Some((_, entry)) if !entry.kind.is_dir() => {
                return Err(Error::NotDirectory(parent.path().display().to_string()))
            }
            Some(_) => {}
        }

        match self.create_tmpfile(&table, parent, &mut parent_map, mode) {
            Ok((b, attr)) => {
                let id = table.branch(b)?.id();
                let inode = self.inodes.new_inode(id, &attr);
                inode.set_nlink(0);
                child_map.set(b, Some(attr.entry()));
                child_map.update_range();
                child.set_inode(Some(inode));
                debug!("unnamed file in {:?} on branch {}", parent.path(), b);
                Ok(Arc::clone(&child))
            }
            Err(e) => {
                child_map.reset();
                Err(e)
            }
        }
    }

    fn create_tmpfile(
        &self,
        table: &BranchTable,
        parent: &Arc<Dentry>,
        parent_map: &mut MapState,
        mode: u32,
    ) -> Result<(usize, EntryAttr)> {
        let b = self.select_branch(table, parent_map, None, None)?;
        self.copy_up_dirs(table, parent, parent_map, b)?;
        let branch = table.branch(b)?;
        let _pin = branch.pin()?;
        let parent_path = parent.path();
        let _dir_lock = branch.lock_dir(&parent_path);
        let attr = branch
            .fs()
            .tmpfile(&parent_path, mode)
            .map_err(|e| match e.kind() {
                io::ErrorKind::Unsupported => Error::NotSupported(format!(
                    "branch {} cannot create unnamed files",
                    branch.fs().label()
                )),
                _ => Error::underlying("tmpfile", e),
            })?;
        Ok((b, attr))
    }

    /// Writable branch for a new entry under `parent_map`. Without a forced
    /// target the policy's choice is moved up above the parent's opaque or
    /// whiteout branch and above a whiteout for the name itself.
    pub(crate) fn select_branch(
        &self,
        table: &BranchTable,
        parent_map: &MapState,
        child_map: Option<&MapState>,
        force: Option<usize>,
    ) -> Result<usize> {
        let b = self.selector.select(table, parent_map.top(), force)?;
        if force.is_some() {
            return Ok(b);
        }
        let limit = [
            parent_map.opaque(),
            parent_map.whiteout(),
            child_map.and_then(|m| m.whiteout()),
        ]
        .into_iter()
        .flatten()
        .min();
        Self::clamp_target(table, b, limit)
    }

    /// `b` when it is not below `limit`, otherwise the lowest-priority
    /// writable branch that is not
    pub(crate) fn clamp_target(table: &BranchTable, b: usize, limit: Option<usize>) -> Result<usize> {
        match limit {
            Some(limit) if b > limit => table
                .writable()
                .into_iter()
                .filter(|i| *i <= limit)
                .max()
                .ok_or_else(|| {
                    Error::ReadOnly(format!("no writable branch at or above index {}", limit))
                }),
            _ => Ok(b),
        }
    }

    /// Verify that the branch still agrees with the cached maps before
    /// touching it
    #[allow(clippy::too_many_arguments)]
    fn check_consistency(
        &self,
        fs: &dyn BranchFs,
        parent_map: &MapState,
        b: usize,
        parent_path: &Path,
        child: &Dentry,
        child_map: &MapState,
        is_dir: bool,
    ) -> Result<()> {
        let expected = parent_map.get(b).ok_or_else(|| {
            Error::StaleConsistency(format!(
                "{} has no copy on branch {}",
                parent_path.display(),
                b
            ))
        })?;
        match fs.stat(parent_path).map_err(|e| Error::underlying("stat", e))? {
            Some(attr) if attr.ino == expected.ino && attr.kind.is_dir() => {}
            _ => {
                return Err(Error::StaleConsistency(format!(
                    "{} changed on branch {}",
                    parent_path.display(),
                    b
                )))
            }
        }

        let path = child.path();
        let found = fs
            .lookup(parent_path, child.name())
            .map_err(|e| Error::underlying("lookup", e))?;
        if !child_map.is_positive() {
            if found.is_some() {
                return Err(Error::AlreadyExists(path.display().to_string()));
            }
            return Ok(());
        }
        let attr = found.filter(|a| a.nlink > 0).ok_or_else(|| {
            Error::StaleConsistency(format!("{} vanished from branch {}", path.display(), b))
        })?;
        if !is_dir && attr.kind.is_dir() {
            return Err(Error::IsDirectory(path.display().to_string()));
        }
        if is_dir && !attr.kind.is_dir() {
            return Err(Error::NotDirectory(path.display().to_string()));
        }
        Ok(())
    }
}

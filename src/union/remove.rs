//! Unlink and rmdir
//!
//! An entry on a writable top branch is removed there; whenever the name
//! would otherwise reappear from a lower branch a whiteout is created first.
//! An entry living only on read-only branches is just whited out above them.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::Union;
use crate::branch::{BranchFs, BranchTable};
use crate::config::Udba;
use crate::entry::{Dentry, LockRole, MapState};
use crate::error::{Error, Result};
use crate::plink::{ActorId, MaintWait};
use crate::transaction::Saga;

impl Union {
    pub fn unlink(&self, parent: &Arc<Dentry>, name: &OsStr) -> Result<()> {
        self.remove_entry(parent, name, false)
    }

    pub fn rmdir(&self, parent: &Arc<Dentry>, name: &OsStr) -> Result<()> {
        self.remove_entry(parent, name, true)
    }

    fn remove_entry(&self, parent: &Arc<Dentry>, name: &OsStr, dir: bool) -> Result<()> {
        self.whiteouts.check_name(name)?;
        let actor = ActorId::current();
        self.plinks.check_maintenance(actor, MaintWait::Wait)?;

        let table = self.branches.read();
        self.reval_path(&table, parent)?;
        let child = self.lookup_locked(&table, parent, name)?;

        let mut child_map = child.map().write_lock(LockRole::Child);
        let path = child.path();
        if !child.is_hashed() {
            return Err(Error::StaleConsistency(path.display().to_string()));
        }
        let (top, entry) = child_map
            .top_entry()
            .ok_or_else(|| Error::NotFound(path.display().to_string()))?;
        match (dir, entry.kind.is_dir()) {
            (true, false) => return Err(Error::NotDirectory(path.display().to_string())),
            (false, true) => return Err(Error::IsDirectory(path.display().to_string())),
            _ => {}
        }
        if dir && !self.merged_entries(&table, &child, &child_map)?.is_empty() {
            return Err(Error::NotEmpty(path.display().to_string()));
        }

        let mut parent_map = parent.map().write_lock(LockRole::Parent);
        let whiteout = self.run_remove(&table, parent, &child, &child_map, &mut parent_map, top, dir)?;

        if let Some(inode) = child.inode() {
            if dir {
                inode.set_nlink(0);
            } else {
                inode.drop_nlink();
            }
        }
        if let Some(dir_inode) = parent.inode() {
            dir_inode.touch();
        }
        let previous = child_map.whiteout();
        child_map.reset();
        child_map.set_whiteout(whiteout.or(previous));
        child_map.update_generation(&self.clock);
        child.set_inode(None);
        debug!("removed {:?} (whiteout {:?})", path, whiteout);
        Ok(())
    }

    /// Branch-side part of a removal. Returns the branch holding the
    /// whiteout that now hides the name, if one was needed.
    #[allow(clippy::too_many_arguments)]
    fn run_remove(
        &self,
        table: &BranchTable,
        parent: &Arc<Dentry>,
        child: &Dentry,
        child_map: &MapState,
        parent_map: &mut MapState,
        top: usize,
        dir: bool,
    ) -> Result<Option<usize>> {
        let path = child.path();
        let top_writable = table.branch(top)?.is_writable();
        let b = if top_writable {
            top
        } else {
            let limit = top.checked_sub(1).ok_or_else(|| {
                Error::ReadOnly(format!("{} is on a read-only branch", path.display()))
            })?;
            let b = self.select_branch(table, parent_map, Some(child_map), None)?;
            Self::clamp_target(table, b, Some(limit))?
        };
        let parent_path = parent.path();
        let need_whiteout =
            !top_writable || self.lower_has_name(table, parent_map, &parent_path, child.name(), b)?;

        self.copy_up_dirs(table, parent, parent_map, b)?;
        let branch = Arc::clone(table.branch(b)?);
        let _pin = branch.pin()?;
        let _dir_lock = branch.lock_dir(&parent_path);
        let fs = branch.fs();

        if top_writable && self.options.udba != Udba::None {
            let expected = child_map.get(b).map(|e| e.ino);
            let found = fs
                .lookup(&parent_path, child.name())
                .map_err(|e| Error::underlying("lookup", e))?
                .map(|a| a.ino);
            if found.is_none() || found != expected {
                return Err(Error::StaleConsistency(format!(
                    "{} changed on branch {}",
                    path.display(),
                    b
                )));
            }
        }

        let op = if dir { "rmdir" } else { "unlink" };
        let mut saga = Saga::new(op, path.display().to_string());
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
        let create_whiteout = need_whiteout && child_map.whiteout() != Some(b);
        if let Err(e) = self.remove_steps(
            &mut saga,
            fs,
            &parent_path,
            child.name(),
            create_whiteout,
            top_writable,
            dir,
        ) {
            return Err(saga.unwind(e));
        }
        saga.commit();
        Ok(need_whiteout.then_some(b))
    }

    #[allow(clippy::too_many_arguments)]
    fn remove_steps<'a>(
        &self,
        saga: &mut Saga<'a>,
        fs: &'a dyn BranchFs,
        parent_path: &Path,
        name: &OsStr,
        whiteout: bool,
        physical: bool,
        dir: bool,
    ) -> Result<()> {
        if whiteout {
            self.whiteouts.create(fs, parent_path, name)?;
            let engine = self.whiteouts.clone();
            let (dir_path, entry) = (parent_path.to_path_buf(), name.to_os_string());
            saga.push("whiteout", move || engine.remove(fs, &dir_path, &entry));
        }
        if !physical {
            return Ok(());
        }

        if dir {
            let path = parent_path.join(name);
            let opaque = self.whiteouts.is_opaque(fs, &path)?;
            let hidden = self.whiteouts.whiteouts_in(fs, &path)?;
            self.whiteouts.clear_markers(fs, &path)?;
            let engine = self.whiteouts.clone();
            saga.push("markers", move || {
                if opaque {
                    engine.mark_opaque(fs, &path)?;
                }
                for name in &hidden {
                    engine.create(fs, &path, name)?;
                }
                Ok(())
            });
            fs.rmdir(parent_path, name)
                .map_err(|e| Error::underlying("rmdir", e))
        } else {
            fs.unlink(parent_path, name)
                .map_err(|e| Error::underlying("unlink", e))
        }
    }

    /// Whether `name` would show through from a branch below `b`
    fn lower_has_name(
        &self,
        table: &BranchTable,
        parent_map: &MapState,
        parent_path: &Path,
        name: &OsStr,
        b: usize,
    ) -> Result<bool> {
        let Some(bottom) = parent_map.bottom() else {
            return Ok(false);
        };
        let last = parent_map.opaque().map_or(bottom, |o| o.min(bottom));
        for index in (b + 1)..=last {
            match parent_map.get(index) {
                Some(entry) if entry.kind.is_dir() => {}
                _ => continue,
            }
            let fs = table.branch(index)?.fs();
            if self.whiteouts.lookup(fs, parent_path, name)? {
                return Ok(false);
            }
            if fs
                .lookup(parent_path, name)
                .map_err(|e| Error::underlying("lookup", e))?
                .is_some()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

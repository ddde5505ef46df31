//! Copy-up: promoting entries into a higher-priority writable branch

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use super::Saga;
use crate::branch::{BranchFs, BranchTable, EntryAttr, FileKind};
use crate::entry::{Dentry, LockRole, MapState};
use crate::error::{Error, Result};
use crate::plink::{ActorId, MaintWait};
use crate::union::Union;

impl Union {
    /// Copy `dentry` up to `target`, or to the branch the create policy
    /// picks when its top branch is read-only. Returns the branch index now
    /// holding the visible copy.
    pub fn copy_up(&self, dentry: &Arc<Dentry>, target: Option<usize>) -> Result<usize> {
        let actor = ActorId::current();
        self.plinks.check_maintenance(actor, MaintWait::Wait)?;
        let table = self.branches.read();
        self.reval_path(&table, dentry)?;
        let Some(parent) = dentry.parent() else {
            return Err(Error::InvalidBranch(
                "the root already spans every branch".to_string(),
            ));
        };

        let mut map = dentry.map().write_lock(LockRole::Child);
        if !dentry.is_hashed() {
            return Err(Error::StaleConsistency(dentry.path().display().to_string()));
        }
        let mut parent_map = parent.map().write_lock(LockRole::Parent);
        self.promote(
            &table,
            dentry,
            &mut map,
            parent,
            &mut parent_map,
            target,
            actor,
            false,
        )
    }

    /// Promote the entry behind a locked map. With `always_plink` a copied
    /// file is pseudo-linked even when no other name links it yet.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn promote(
        &self,
        table: &BranchTable,
        dentry: &Dentry,
        map: &mut MapState,
        parent: &Arc<Dentry>,
        parent_map: &mut MapState,
        target: Option<usize>,
        actor: ActorId,
        always_plink: bool,
    ) -> Result<usize> {
        let path = dentry.path();
        let (top, _) = map
            .top_entry()
            .ok_or_else(|| Error::NotFound(path.display().to_string()))?;

        let b = match target {
            Some(t) => {
                if !table.branch(t)?.is_writable() {
                    return Err(Error::ReadOnly(format!("branch {} is read-only", t)));
                }
                t
            }
            None if table.branch(top)?.is_writable() => return Ok(top),
            None => {
                let b = self.select_branch(table, parent_map, Some(&*map), None)?;
                match top.checked_sub(1) {
                    Some(limit) => Self::clamp_target(table, b, Some(limit))?,
                    None => return Err(Error::ReadOnly("no branch above the top".to_string())),
                }
            }
        };
        if map.get(b).is_some() {
            return Ok(b);
        }
        if b > top {
            return Err(Error::InvalidBranch(format!(
                "cannot copy {} down from branch {} to {}",
                path.display(),
                top,
                b
            )));
        }

        self.copy_up_dirs(table, parent, parent_map, b)?;

        let inode = dentry
            .inode()
            .ok_or_else(|| Error::NotFound(path.display().to_string()))?;
        let src_fs = table.branch(top)?.fs();
        let src = src_fs
            .stat(&path)
            .map_err(|e| Error::underlying("stat", e))?
            .ok_or_else(|| Error::StaleConsistency(path.display().to_string()))?;

        let branch = Arc::clone(table.branch(b)?);
        let _pin = branch.pin()?;
        let parent_path = parent.path();
        let _dir_lock = branch.lock_dir(&parent_path);
        let fs = branch.fs();

        // another name of this file was already promoted here
        let backing = if src.kind == FileKind::RegularFile
            && self.options.plink
            && self.plinks.contains(&inode)
            && self.plinks.lookup(&inode, &branch)?.is_some()
        {
            self.plinks.backing_path(&inode, branch.id())
        } else {
            None
        };

        let mut saga = Saga::new("copy-up", path.display().to_string());
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
        let attr = match Self::copy_entry(&mut saga, fs, src_fs, &src, &path, backing.as_deref()) {
            Ok(attr) => attr,
            Err(e) => return Err(saga.unwind(e)),
        };
        saga.commit();

        self.inodes.alias(&inode, branch.id(), attr.ino);
        map.set(b, Some(attr.entry()));
        map.update_range();

        let shared = always_plink || src.nlink > 1;
        if src.kind == FileKind::RegularFile && self.options.plink && backing.is_none() && shared {
            if let Err(e) = self
                .plinks
                .register(&inode, &branch, &path, actor, MaintWait::NoWait)
            {
                warn!("{} copied up without pseudo-link: {}", path.display(), e);
            }
        }
        debug!("copied up {:?} from branch {} to {}", path, top, b);
        Ok(b)
    }

    fn copy_entry<'a>(
        saga: &mut Saga<'a>,
        fs: &'a dyn BranchFs,
        src_fs: &dyn BranchFs,
        src: &EntryAttr,
        path: &Path,
        backing: Option<&Path>,
    ) -> Result<EntryAttr> {
        let parent_path = path.parent().unwrap_or(Path::new(""));
        let name = path
            .file_name()
            .ok_or_else(|| Error::Internal(format!("no name in {}", path.display())))?;

        let created = match src.kind {
            FileKind::Directory => fs.mkdir(parent_path, name, src.perm),
            FileKind::Symlink => {
                let target = src_fs
                    .readlink(path)
                    .map_err(|e| Error::underlying("readlink", e))?;
                fs.symlink(parent_path, name, &target)
            }
            FileKind::RegularFile => match backing {
                Some(backing) => fs.link(backing, parent_path, name),
                None => fs.create(parent_path, name, src.perm),
            },
            other => fs.mknod(parent_path, name, other.mode_bits() | src.perm, 0),
        }
        .map_err(|e| Error::underlying("copy-up", e))?;

        let is_dir = created.kind.is_dir();
        let (dir, entry) = (parent_path.to_path_buf(), name.to_os_string());
        saga.push("copied entry", move || {
            let removed = if is_dir {
                fs.rmdir(&dir, &entry)
            } else {
                fs.unlink(&dir, &entry)
            };
            removed.map_err(|e| Error::underlying("remove copy", e))
        });

        if src.kind == FileKind::RegularFile && backing.is_none() {
            let data = src_fs
                .read_file(path)
                .map_err(|e| Error::underlying("read", e))?;
            fs.write_file(path, &data)
                .map_err(|e| Error::underlying("write", e))?;
        }

        fs.stat(path)
            .map_err(|e| Error::underlying("stat", e))?
            .ok_or_else(|| Error::NotFound(path.display().to_string()))
    }

    /// Make sure directory `dir` (whose map the caller holds exclusively)
    /// and all its ancestors exist on branch `b`, creating them top-down.
    pub(crate) fn copy_up_dirs(
        &self,
        table: &BranchTable,
        dir: &Arc<Dentry>,
        dir_map: &mut MapState,
        b: usize,
    ) -> Result<()> {
        if dir_map.get(b).is_some() {
            return Ok(());
        }
        let Some(up) = dir.parent() else {
            return Err(Error::StaleConsistency(format!(
                "root directory missing on branch {}",
                b
            )));
        };

        let mut chain = Vec::new();
        let mut current = Some(Arc::clone(up));
        while let Some(d) = current {
            if d.is_root() {
                break;
            }
            current = d.parent().cloned();
            chain.push(d);
        }

        for ancestor in chain.iter().rev() {
            let mut ancestor_map = ancestor.map().write_lock(LockRole::Parent2);
            if ancestor_map.get(b).is_some() {
                continue;
            }
            let above = ancestor
                .parent()
                .ok_or_else(|| Error::Internal("ancestor without parent".to_string()))?;
            let above_map = above.map().read_lock(LockRole::Parent3);
            self.copy_up_dir(table, ancestor, &mut ancestor_map, &above_map, b)?;
        }

        let up_map = up.map().read_lock(LockRole::Parent2);
        self.copy_up_dir(table, dir, dir_map, &up_map, b)
    }

    fn copy_up_dir(
        &self,
        table: &BranchTable,
        dir: &Dentry,
        dir_map: &mut MapState,
        up_map: &MapState,
        b: usize,
    ) -> Result<()> {
        if dir_map.get(b).is_some() {
            return Ok(());
        }
        let path = dir.path();
        if !up_map.get(b).map(|e| e.kind.is_dir()).unwrap_or(false) {
            return Err(Error::StaleConsistency(format!(
                "parent of {} missing on branch {}",
                path.display(),
                b
            )));
        }
        let (top, _) = dir_map
            .top_entry()
            .ok_or_else(|| Error::NotFound(path.display().to_string()))?;
        let src = table
            .branch(top)?
            .fs()
            .stat(&path)
            .map_err(|e| Error::underlying("stat", e))?
            .ok_or_else(|| Error::StaleConsistency(path.display().to_string()))?;

        let branch = table.branch(b)?;
        let _pin = branch.pin()?;
        let up_path = path.parent().unwrap_or(Path::new(""));
        let _dir_lock = branch.lock_dir(up_path);
        let fs = branch.fs();

        let attr = match fs.mkdir(up_path, dir.name(), src.perm) {
            Ok(attr) => attr,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                match fs
                    .lookup(up_path, dir.name())
                    .map_err(|e| Error::underlying("lookup", e))?
                {
                    Some(attr) if attr.kind.is_dir() => attr,
                    _ => return Err(Error::NotDirectory(path.display().to_string())),
                }
            }
            Err(e) => return Err(Error::underlying("mkdir", e)),
        };

        dir_map.set(b, Some(attr.entry()));
        dir_map.update_range();
        if let Some(inode) = dir.inode() {
            self.inodes.alias(&inode, branch.id(), attr.ino);
        }
        debug!("copied up directory {:?} to branch {}", path, b);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::{BranchOp, BranchPerm, MemoryBranch};
    use crate::config::UnionOptions;
    use std::ffi::OsStr;

    fn union_over(lower: &Arc<MemoryBranch>) -> (Union, Arc<MemoryBranch>) {
        let upper = Arc::new(MemoryBranch::new("upper"));
        let union = Union::new(
            vec![
                (upper.clone() as Arc<dyn BranchFs>, BranchPerm::ReadWrite),
                (lower.clone() as Arc<dyn BranchFs>, BranchPerm::ReadOnly),
            ],
            UnionOptions::default(),
        )
        .unwrap();
        (union, upper)
    }

    #[test]
    fn test_copy_up_file_with_parents() {
        let lower = Arc::new(MemoryBranch::new("lower"));
        lower.seed_file("a/b/f", b"content").unwrap();
        let (union, upper) = union_over(&lower);

        let f = union.lookup_path(Path::new("a/b/f")).unwrap();
        assert_eq!(union.copy_up(&f, None).unwrap(), 0);

        assert_eq!(upper.read_file(Path::new("a/b/f")).unwrap(), b"content");
        let map = f.map().read_lock(LockRole::Child);
        assert_eq!(map.top(), Some(0));
        assert_eq!(map.bottom(), Some(1));
        drop(map);

        let a = union.lookup_path(Path::new("a")).unwrap();
        assert_eq!(a.map().read_lock(LockRole::Child).top(), Some(0));
        // the inode gained a copy on the upper branch
        let upper_id = union.branches().branch(0).unwrap().id();
        assert!(f.inode().unwrap().copy_on(upper_id).is_some());
    }

    #[test]
    fn test_copy_up_symlink() {
        let lower = Arc::new(MemoryBranch::new("lower"));
        lower
            .symlink(Path::new(""), OsStr::new("l"), Path::new("target"))
            .unwrap();
        let (union, upper) = union_over(&lower);
        let l = union.lookup_path(Path::new("l")).unwrap();
        union.copy_up(&l, None).unwrap();
        assert_eq!(
            upper.readlink(Path::new("l")).unwrap(),
            Path::new("target").to_path_buf()
        );
    }

    #[test]
    fn test_copy_up_already_writable_is_noop() {
        let lower = Arc::new(MemoryBranch::new("lower"));
        let (union, upper) = union_over(&lower);
        upper.seed_file("f", b"x").unwrap();
        let f = union.lookup_path(Path::new("f")).unwrap();
        assert_eq!(union.copy_up(&f, None).unwrap(), 0);
    }

    #[test]
    fn test_failed_copy_leaves_nothing() {
        let lower = Arc::new(MemoryBranch::new("lower"));
        lower.seed_file("f", b"content").unwrap();
        let (union, upper) = union_over(&lower);
        let f = union.lookup_path(Path::new("f")).unwrap();

        upper.fail_on(BranchOp::WriteFile, "f");
        assert!(union.copy_up(&f, None).is_err());
        assert!(upper.stat(Path::new("f")).unwrap().is_none());
        assert_eq!(f.map().read_lock(LockRole::Child).top(), Some(1));
    }

    #[test]
    fn test_copy_up_of_hard_linked_file_registers_plink() {
        let lower = Arc::new(MemoryBranch::new("lower"));
        lower.seed_file("f", b"shared").unwrap();
        lower
            .link(Path::new("f"), Path::new(""), OsStr::new("g"))
            .unwrap();
        let (union, upper) = union_over(&lower);

        let f = union.lookup_path(Path::new("f")).unwrap();
        let g = union.lookup_path(Path::new("g")).unwrap();
        assert!(Arc::ptr_eq(&f.inode().unwrap(), &g.inode().unwrap()));

        union.copy_up(&f, None).unwrap();
        assert!(union.plinks().contains(&f.inode().unwrap()));

        // the second name reuses the promoted copy through the pseudo-link
        union.copy_up(&g, None).unwrap();
        let f_up = upper.stat(Path::new("f")).unwrap().unwrap();
        let g_up = upper.stat(Path::new("g")).unwrap().unwrap();
        assert_eq!(f_up.ino, g_up.ino);
        assert_eq!(union.plinks().len(), 1);
    }
}

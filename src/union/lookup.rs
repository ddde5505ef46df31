//! Name resolution across branches

use std::collections::{BTreeMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::Union;
use crate::branch::{BranchTable, DirEntry, EntryAttr, FileKind};
use crate::entry::{Dentry, EntryMap, LockRole, MapState, MapWriteGuard};
use crate::error::{Error, Result};
use crate::whiteout::is_internal;

impl Union {
    /// Resolve `name` under `parent`. The result may be negative: a negative
    /// entry remembers where a whiteout hides the name.
    pub fn lookup(&self, parent: &Arc<Dentry>, name: &OsStr) -> Result<Arc<Dentry>> {
        self.whiteouts.check_name(name)?;
        let table = self.branches.read();
        self.reval_path(&table, parent)?;
        self.lookup_locked(&table, parent, name)
    }

    /// Resolve a path relative to the union root, component by component
    pub fn lookup_path(&self, path: &Path) -> Result<Arc<Dentry>> {
        let mut current = Arc::clone(&self.root);
        for component in path.components() {
            let name = component.as_os_str();
            if name == "/" || name == "." {
                continue;
            }
            if !current.is_dir() {
                return Err(Error::NotDirectory(current.path().display().to_string()));
            }
            let next = self.lookup(&current, name)?;
            current = next;
        }
        Ok(current)
    }

    /// Re-resolve `dentry` and its ancestors if the branch set changed since
    /// they were last validated. An entry dropped from the cache is gone.
    pub fn revalidate(&self, dentry: &Arc<Dentry>) -> Result<()> {
        if !dentry.is_root() && !dentry.is_hashed() {
            return Err(Error::NotFound(dentry.path().display().to_string()));
        }
        let table = self.branches.read();
        self.reval_path(&table, dentry)
    }

    /// Merged listing of a directory, sorted by name. Markers are hidden,
    /// whiteouts hide lower entries and opacity stops the merge.
    pub fn readdir(&self, dir: &Arc<Dentry>) -> Result<Vec<DirEntry>> {
        let table = self.branches.read();
        self.reval_path(&table, dir)?;
        let map = dir.map().read_lock(LockRole::Child);
        match map.top_entry() {
            None => Err(Error::NotFound(dir.path().display().to_string())),
            Some((_, entry)) if !entry.kind.is_dir() => {
                Err(Error::NotDirectory(dir.path().display().to_string()))
            }
            Some(_) => self.merged_entries(&table, dir, &map),
        }
    }

    pub(crate) fn merged_entries(
        &self,
        table: &BranchTable,
        dir: &Dentry,
        map: &MapState,
    ) -> Result<Vec<DirEntry>> {
        let (Some(top), Some(bottom)) = (map.top(), map.bottom()) else {
            return Ok(Vec::new());
        };
        let last = map.opaque().map_or(bottom, |o| o.min(bottom));
        let path = dir.path();
        let mut seen: BTreeMap<OsString, FileKind> = BTreeMap::new();
        let mut hidden: HashSet<OsString> = HashSet::new();

        for index in top..=last {
            match map.get(index) {
                Some(entry) if entry.kind.is_dir() => {}
                _ => continue,
            }
            let fs = table.branch(index)?.fs();
            let entries = fs
                .readdir(&path)
                .map_err(|e| Error::underlying("readdir", e))?;
            for entry in entries {
                if is_internal(&entry.name) || hidden.contains(&entry.name) {
                    continue;
                }
                seen.entry(entry.name).or_insert(entry.kind);
            }
            hidden.extend(self.whiteouts.whiteouts_in(fs, &path)?);
        }

        Ok(seen
            .into_iter()
            .map(|(name, kind)| DirEntry { name, kind })
            .collect())
    }

    /// Cached child if still valid, otherwise a freshly resolved one.
    /// Caller holds the table shared and has revalidated `parent`.
    pub(crate) fn lookup_locked(
        &self,
        table: &BranchTable,
        parent: &Arc<Dentry>,
        name: &OsStr,
    ) -> Result<Arc<Dentry>> {
        if let Some(child) = parent.cached_child(name) {
            if child.map().test_stale(&self.clock) {
                let mut map = child.map().write_lock(LockRole::Child);
                let parent_map = parent.map().read_lock(LockRole::Parent);
                if child.map().test_stale(&self.clock) {
                    self.resolve(table, &child, &mut map, Some(&*parent_map))?;
                }
            }
            return Ok(child);
        }

        let child = Dentry::new_child(parent, name, EntryMap::new(table, &self.clock));
        {
            let mut map = child.map().write_lock(LockRole::Child);
            let parent_map = parent.map().read_lock(LockRole::Parent);
            match parent_map.top_entry() {
                None => return Err(Error::NotFound(parent.path().display().to_string())),
                Some((_, entry)) if !entry.kind.is_dir() => {
                    return Err(Error::NotDirectory(parent.path().display().to_string()))
                }
                Some(_) => {}
            }
            self.resolve(table, &child, &mut map, Some(&*parent_map))?;
        }
        Ok(parent.hash_child(&child))
    }

    /// Walk from the root down to `dentry`, re-resolving every entry whose
    /// map went stale
    pub(crate) fn reval_path(&self, table: &BranchTable, dentry: &Arc<Dentry>) -> Result<()> {
        let mut chain = Vec::new();
        let mut current = Some(Arc::clone(dentry));
        while let Some(d) = current {
            current = d.parent().cloned();
            chain.push(d);
        }

        for d in chain.iter().rev() {
            if !d.map().test_stale(&self.clock) {
                continue;
            }
            let mut map = d.map().write_lock(LockRole::Child);
            if !d.map().test_stale(&self.clock) {
                continue;
            }
            match d.parent() {
                None => self.resolve(table, d, &mut map, None)?,
                Some(parent) => {
                    let parent_map = parent.map().read_lock(LockRole::Parent);
                    self.resolve(table, d, &mut map, Some(&*parent_map))?;
                }
            }
            debug!("revalidated {:?} at generation {}", d.path(), self.clock.current());
        }
        Ok(())
    }

    /// Rebuild an entry map from the branches.
    ///
    /// Scans the parent's branches from its top down: a whiteout for the
    /// name ends the scan below its branch, a non-directory ends it at the
    /// first hit, and directories merge until an opaque marker or a type
    /// mismatch. The root simply spans every branch.
    pub(crate) fn resolve(
        &self,
        table: &BranchTable,
        dentry: &Dentry,
        map: &mut MapWriteGuard<'_>,
        parent: Option<&MapState>,
    ) -> Result<()> {
        map.refresh(table, &self.clock);
        map.reset();
        let path = dentry.path();
        let mut top_attr: Option<(usize, EntryAttr)> = None;

        match parent {
            None => {
                for (index, branch) in table.iter().enumerate() {
                    let attr = branch
                        .fs()
                        .stat(Path::new(""))
                        .map_err(|e| Error::underlying("stat", e))?;
                    if let Some(attr) = attr {
                        map.set(index, Some(attr.entry()));
                        top_attr.get_or_insert((index, attr));
                    }
                }
            }
            Some(parent_map) => {
                if let (Some(ptop), Some(pbottom)) = (parent_map.top(), parent_map.bottom()) {
                    let last = parent_map.opaque().map_or(pbottom, |o| o.min(pbottom));
                    let parent_path = path.parent().unwrap_or(Path::new(""));
                    let name = dentry.name();

                    for index in ptop..=last {
                        match parent_map.get(index) {
                            Some(entry) if entry.kind.is_dir() => {}
                            _ => continue,
                        }
                        let fs = table.branch(index)?.fs();
                        let whited_out = self.whiteouts.lookup(fs, parent_path, name)?;
                        let found = fs
                            .lookup(parent_path, name)
                            .map_err(|e| Error::underlying("lookup", e))?;

                        let mut stop = false;
                        if let Some(attr) = found {
                            let top_is_dir = top_attr.as_ref().map(|(_, a)| a.kind.is_dir());
                            match top_is_dir {
                                // a lower entry of another type is hidden
                                Some(true) if !attr.kind.is_dir() => stop = true,
                                _ => {
                                    map.set(index, Some(attr.entry()));
                                    if !attr.kind.is_dir() {
                                        stop = true;
                                    } else if self.whiteouts.is_opaque(fs, &path)? {
                                        map.set_opaque(Some(index));
                                        stop = true;
                                    }
                                    top_attr.get_or_insert((index, attr));
                                }
                            }
                        }
                        if whited_out {
                            map.set_whiteout(Some(index));
                            stop = true;
                        }
                        if stop {
                            break;
                        }
                    }
                }
            }
        }

        map.update_range();
        self.attach_inode(table, dentry, &**map, top_attr)
    }

    fn attach_inode(
        &self,
        table: &BranchTable,
        dentry: &Dentry,
        map: &MapState,
        top_attr: Option<(usize, EntryAttr)>,
    ) -> Result<()> {
        let Some((top, attr)) = top_attr else {
            dentry.set_inode(None);
            return Ok(());
        };
        let branch = table.branch(top)?.id();
        let inode = match dentry.inode() {
            Some(inode) if dentry.is_root() => inode,
            Some(inode) if inode.kind() == attr.kind && inode.copy_on(branch) == Some(attr.ino) => {
                inode
            }
            _ => self.inodes.instantiate(branch, &attr),
        };
        if inode.is_dir() {
            for index in map.occupied() {
                if let (Some(entry), Some(id)) = (map.get(index), map.branch_id(index)) {
                    self.inodes.alias(&inode, id, entry.ino);
                }
            }
        }
        dentry.set_inode(Some(inode));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::{BranchFs, BranchPerm, MemoryBranch};
    use crate::config::UnionOptions;
    use crate::whiteout::WhiteoutEngine;

    struct Fixture {
        union: Union,
        upper: Arc<MemoryBranch>,
    }

    fn fixture() -> Fixture {
        let upper = Arc::new(MemoryBranch::new("upper"));
        let lower = Arc::new(MemoryBranch::new("lower"));
        lower.seed_file("f", b"lower").unwrap();
        lower.seed_file("d/a", b"a").unwrap();
        lower.seed_file("d/b", b"b").unwrap();
        let union = Union::new(
            vec![
                (upper.clone() as Arc<dyn BranchFs>, BranchPerm::ReadWrite),
                (lower.clone() as Arc<dyn BranchFs>, BranchPerm::ReadOnly),
            ],
            UnionOptions::default(),
        )
        .unwrap();
        Fixture { union, upper }
    }

    fn names(entries: Vec<DirEntry>) -> Vec<String> {
        entries
            .into_iter()
            .map(|e| e.name.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_lookup_lower_file() {
        let fx = fixture();
        let f = fx.union.lookup(fx.union.root(), OsStr::new("f")).unwrap();
        assert!(f.is_positive());
        let map = f.map().read_lock(LockRole::Child);
        assert_eq!(map.top(), Some(1));
        assert_eq!(map.bottom(), Some(1));
        assert_eq!(map.whiteout(), None);
    }

    #[test]
    fn test_lookup_cached() {
        let fx = fixture();
        let a = fx.union.lookup(fx.union.root(), OsStr::new("f")).unwrap();
        let b = fx.union.lookup(fx.union.root(), OsStr::new("f")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_whiteout_hides_lower() {
        let fx = fixture();
        WhiteoutEngine::default()
            .create(fx.upper.as_ref(), Path::new(""), OsStr::new("f"))
            .unwrap();
        let f = fx.union.lookup(fx.union.root(), OsStr::new("f")).unwrap();
        assert!(!f.is_positive());
        assert_eq!(f.map().read_lock(LockRole::Child).whiteout(), Some(0));
        assert_eq!(names(fx.union.readdir(fx.union.root()).unwrap()), vec!["d"]);
    }

    #[test]
    fn test_directories_merge_until_opaque() {
        let fx = fixture();
        fx.upper.seed_file("d/c", b"c").unwrap();
        let d = fx.union.lookup_path(Path::new("d")).unwrap();
        assert_eq!(names(fx.union.readdir(&d).unwrap()), vec!["a", "b", "c"]);
        drop(d);

        WhiteoutEngine::default()
            .mark_opaque(fx.upper.as_ref(), Path::new("d"))
            .unwrap();
        // a new branch generation forces re-resolution
        fx.union
            .add_branch(2, Arc::new(MemoryBranch::new("empty")), BranchPerm::ReadOnly)
            .unwrap();
        let d = fx.union.lookup_path(Path::new("d")).unwrap();
        assert_eq!(d.map().read_lock(LockRole::Child).opaque(), Some(0));
        assert_eq!(names(fx.union.readdir(&d).unwrap()), vec!["c"]);
    }

    #[test]
    fn test_upper_file_hides_lower_dir() {
        let fx = fixture();
        fx.upper.seed_file("d", b"file").unwrap();
        let d = fx.union.lookup_path(Path::new("d")).unwrap();
        assert!(!d.is_dir());
        let map = d.map().read_lock(LockRole::Child);
        assert_eq!((map.top(), map.bottom()), (Some(0), Some(0)));
    }

    #[test]
    fn test_stale_entry_revalidated() {
        let fx = fixture();
        let f = fx.union.lookup(fx.union.root(), OsStr::new("f")).unwrap();
        let newer = Arc::new(MemoryBranch::new("newer"));
        newer.seed_file("f", b"newer").unwrap();

        fx.union
            .add_branch(0, newer.clone(), BranchPerm::ReadOnly)
            .unwrap();
        assert!(f.map().test_stale(&fx.union.clock));

        fx.union.revalidate(&f).unwrap();
        assert!(!f.map().test_stale(&fx.union.clock));
        let map = f.map().read_lock(LockRole::Child);
        assert_eq!(map.top(), Some(0));
        assert_eq!(map.bottom(), Some(0));
    }

    #[test]
    fn test_lookup_rejects_marker_names() {
        let fx = fixture();
        assert!(matches!(
            fx.union.lookup(fx.union.root(), OsStr::new(".wh.f")),
            Err(Error::ReservedName(_))
        ));
        assert!(matches!(
            fx.union.lookup_path(Path::new("f/x")),
            Err(Error::NotDirectory(_))
        ));
    }
}

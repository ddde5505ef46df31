//! The mounted union
//!
//! Owns every piece of per-mount state: the branch table and its generation
//! clock, the logical inode cache, the pseudo-link registry, the create
//! policy and the root entry. Every operation holds the branch table shared
//! for its whole duration; branch add/remove holds it exclusively, so entry
//! maps only go stale between operations and are re-resolved at the start
//! of the next one.
//!
//! Operations that may have to wait for pseudo-link maintenance do so
//! before taking any lock, then use the non-blocking registry calls.

mod lookup;
mod remove;

use parking_lot::{RwLock, RwLockReadGuard};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::branch::{
    BranchFs, BranchId, BranchPerm, BranchSelector, BranchTable, GenerationClock, LocalBranch,
};
use crate::config::{Config, UnionOptions};
use crate::entry::{Dentry, EntryMap, LockRole};
use crate::error::{Error, Result};
use crate::inode::InodeCache;
use crate::plink::{ActorId, PseudoLinkRegistry};
use crate::whiteout::WhiteoutEngine;

/// A mounted union of branches
pub struct Union {
    pub(crate) options: UnionOptions,
    pub(crate) branches: RwLock<BranchTable>,
    pub(crate) clock: GenerationClock,
    pub(crate) inodes: InodeCache,
    pub(crate) plinks: PseudoLinkRegistry,
    pub(crate) selector: BranchSelector,
    pub(crate) whiteouts: WhiteoutEngine,
    pub(crate) root: Arc<Dentry>,
}

impl Union {
    /// Mount `branches`, highest priority first
    pub fn new(branches: Vec<(Arc<dyn BranchFs>, BranchPerm)>, options: UnionOptions) -> Result<Self> {
        if branches.is_empty() {
            return Err(Error::InvalidBranch("a union needs at least one branch".to_string()));
        }
        let clock = GenerationClock::new();
        let whiteouts = WhiteoutEngine::new(options.max_name_len);
        let inodes = InodeCache::new();

        let mut table = BranchTable::new();
        let mut root_copies = Vec::with_capacity(branches.len());
        for (index, (fs, perm)) in branches.into_iter().enumerate() {
            let root_attr = Self::branch_root(fs.as_ref())?;
            if perm == BranchPerm::ReadWrite {
                whiteouts.init_branch(fs.as_ref())?;
            }
            let id = table.insert(index, fs, perm, &clock)?;
            root_copies.push((id, root_attr.ino));
        }

        let root_inode = inodes.root(&root_copies);
        let root = Dentry::root(EntryMap::new(&table, &clock), root_inode);

        let union = Self {
            selector: BranchSelector::new(options.create_policy.clone()),
            plinks: PseudoLinkRegistry::new(options.plink_warn),
            options,
            branches: RwLock::new(BranchTable::new()),
            clock,
            inodes,
            whiteouts,
            root,
        };
        {
            let mut map = union.root.map().write_lock(LockRole::Child);
            union.resolve(&table, &union.root, &mut map, None)?;
        }
        info!(
            "union mounted with {} branches ({} writable)",
            table.len(),
            table.writable().len()
        );
        *union.branches.write() = table;
        Ok(union)
    }

    /// Mount the local directories named by a configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let branches = config
            .branches
            .iter()
            .map(|b| {
                let fs: Arc<dyn BranchFs> = Arc::new(LocalBranch::new(b.path.clone())?);
                Ok((fs, b.perm))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(branches, config.options())
    }

    fn branch_root(fs: &dyn BranchFs) -> Result<crate::branch::EntryAttr> {
        match fs
            .stat(Path::new(""))
            .map_err(|e| Error::underlying("stat", e))?
        {
            Some(attr) if attr.kind.is_dir() => Ok(attr),
            _ => Err(Error::InvalidBranch(format!(
                "branch {} has no root directory",
                fs.label()
            ))),
        }
    }

    pub fn root(&self) -> &Arc<Dentry> {
        &self.root
    }

    pub fn options(&self) -> &UnionOptions {
        &self.options
    }

    /// Current generation of the branch set
    pub fn generation(&self) -> u64 {
        self.clock.current()
    }

    pub fn plinks(&self) -> &PseudoLinkRegistry {
        &self.plinks
    }

    /// Shared view of the branch table. Do not call other union operations
    /// while holding it.
    pub fn branches(&self) -> RwLockReadGuard<'_, BranchTable> {
        self.branches.read()
    }

    fn check_table_mutation(&self) -> Result<()> {
        match self.plinks.maintainer() {
            Some(holder) if holder != ActorId::current() => Err(Error::Busy(format!(
                "pseudo-link maintenance held by {}",
                holder
            ))),
            _ => Ok(()),
        }
    }

    /// Insert a branch at `index`, shifting lower-priority branches down
    pub fn add_branch(&self, index: usize, fs: Arc<dyn BranchFs>, perm: BranchPerm) -> Result<BranchId> {
        self.check_table_mutation()?;
        Self::branch_root(fs.as_ref())?;
        if perm == BranchPerm::ReadWrite {
            self.whiteouts.init_branch(fs.as_ref())?;
        }

        let mut table = self.branches.write();
        let label = fs.label();
        let id = table.insert(index, fs, perm, &self.clock)?;
        {
            let mut map = self.root.map().write_lock(LockRole::Child);
            self.resolve(&table, &self.root, &mut map, None)?;
        }
        info!("added branch {} ({}) at index {} as {}", id, label, index, perm);
        Ok(id)
    }

    /// Remove the branch at `index`.
    ///
    /// Refused with `Busy` while another actor holds pseudo-link maintenance,
    /// while pseudo-links still reference the branch, while a writer pins it
    /// or while an entry in use has an underlying entry on it.
    pub fn remove_branch(&self, index: usize) -> Result<()> {
        self.check_table_mutation()?;
        let mut table = self.branches.write();
        let branch = Arc::clone(table.branch(index)?);
        if table.len() == 1 {
            return Err(Error::Busy("cannot remove the last branch".to_string()));
        }
        if self.plinks.references_branch(branch.id()) {
            return Err(Error::Busy(format!(
                "pseudo-links reference branch {}; flush them first",
                branch.id()
            )));
        }
        if Self::branch_in_use(&self.root, branch.id()) {
            return Err(Error::Busy(format!("branch {} is in use", branch.id())));
        }

        table.remove(index, &self.clock)?;
        self.inodes.forget_branch(branch.id());
        {
            let mut map = self.root.map().write_lock(LockRole::Child);
            self.resolve(&table, &self.root, &mut map, None)?;
        }
        info!("removed branch {} ({})", branch.id(), branch.fs().label());
        Ok(())
    }

    /// Whether a cached entry somebody still holds has a slot on `branch`
    fn branch_in_use(dir: &Arc<Dentry>, branch: BranchId) -> bool {
        for child in dir.cached_children() {
            let live_children = child.cached_children().len();
            // one reference is ours, one comes from each live child
            let external = Arc::strong_count(&child).saturating_sub(1 + live_children);
            let has_slot = {
                let map = child.map().read_lock(LockRole::Child);
                map.occupied()
                    .iter()
                    .any(|i| map.branch_id(*i) == Some(branch))
            };
            if has_slot && external > 0 {
                debug!("{:?} still uses branch {}", child.path(), branch);
                return true;
            }
            if Self::branch_in_use(&child, branch) {
                return true;
            }
        }
        false
    }

    /// Change a branch's permission once its current writers finish
    pub fn set_branch_perm(&self, index: usize, perm: BranchPerm) -> Result<()> {
        let table = self.branches.read();
        let branch = table.branch(index)?;
        if perm == BranchPerm::ReadWrite {
            self.whiteouts.init_branch(branch.fs())?;
        }
        branch.remount(perm);
        Ok(())
    }

    /// Consolidate the pseudo-links of one branch under maintenance mode
    pub fn flush_branch(&self, index: usize) -> Result<usize> {
        let actor = ActorId::current();
        self.plinks.enter_maintenance(actor)?;
        let flushed = {
            let table = self.branches.read();
            self.plinks.flush_branch(&table, index, actor)
        };
        self.plinks.leave_maintenance();
        flushed
    }

    /// Release per-mount state; returns the number of pseudo-links that
    /// were never consolidated
    pub fn unmount(&self) -> usize {
        let leftover = self.plinks.drain(true);
        self.inodes.prune();
        info!("union unmounted at generation {}", self.clock.current());
        leftover
    }
}

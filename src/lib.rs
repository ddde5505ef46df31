//! unionfs - Branch-merging union filesystem core
//!
//! Merges an ordered stack of directory trees ("branches") into one
//! namespace. Higher-priority branches hide lower ones, deletions of lower
//! entries are recorded as whiteouts, modifications copy entries up to a
//! writable branch, and pseudo-links keep hard-linked files together across
//! copy-up.

pub mod branch;
pub mod config;
pub mod entry;
pub mod error;
pub mod inode;
pub mod plink;
pub mod transaction;
pub mod union;
pub mod whiteout;

pub use config::{Config, UnionOptions};
pub use error::{Error, Result};
pub use union::Union;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::branch::{BranchFs, BranchPerm, CreatePolicy, LocalBranch, MemoryBranch};
    pub use crate::config::{Config, Udba, UnionOptions};
    pub use crate::entry::Dentry;
    pub use crate::error::{Error, Result};
    pub use crate::transaction::{CreateParams, EntryKind};
    pub use crate::union::Union;
}

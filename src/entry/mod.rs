//! Logical entries and their branch maps

mod dentry;
mod lockdep;
mod map;

pub use dentry::Dentry;
pub use lockdep::{held_roles, LockRole};
pub use map::{EntryMap, MapReadGuard, MapState, MapWriteGuard};

//! Namespace mutations spanning several branch operations
//!
//! Creation, copy-up and their compensation stacks. Every mutation follows
//! the same outline: pick a writable branch, copy the parent directories up
//! to it, run the branch operations while recording how to undo each one,
//! and only publish the new entry map once every step succeeded.

mod copyup;
mod create;
mod saga;

pub use create::{CreateParams, EntryKind};
pub use saga::Saga;

//! Lock nesting roles for entry maps
//!
//! Operations that hold two or three entry maps at once pick a role for each
//! acquisition. Roles must be taken in strictly ascending order on a thread;
//! taking a role at or below one already held is a potential deadlock and
//! panics in debug builds.

use std::cell::RefCell;
use std::fmt;

/// Nesting role of an entry map lock acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockRole {
    /// The entry being primarily operated on
    Child = 0,
    /// Second entry of rename(2)/link(2), or a copy-up source
    Child2 = 1,
    /// Directory copy-up
    Child3 = 2,
    Parent = 3,
    Parent2 = 4,
    Parent3 = 5,
}

impl fmt::Display for LockRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

thread_local! {
    static HELD: RefCell<Vec<LockRole>> = const { RefCell::new(Vec::new()) };
}

/// Record that the current thread is about to acquire `role`
pub(crate) fn acquire(role: LockRole) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(highest) = held.iter().max() {
            debug_assert!(
                role > *highest,
                "lock order violation: {} acquired while holding {}",
                role,
                highest
            );
        }
        held.push(role);
    });
}

/// Record that the current thread released `role`
pub(crate) fn release(role: LockRole) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held.iter().rposition(|r| *r == role) {
            held.remove(pos);
        }
    });
}

/// Roles currently held by this thread, in acquisition order
pub fn held_roles() -> Vec<LockRole> {
    HELD.with(|held| held.borrow().clone())
}

//! Per-entry branch map
//!
//! Maps one logical directory entry to its underlying entries, one slot per
//! branch index, with the occupied range, whiteout and opacity markers and a
//! generation snapshot guarding the layout against branch set changes.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use super::lockdep::{self, LockRole};
use crate::branch::{BranchEntry, BranchId, BranchTable, GenerationClock};

/// Slot layout of an entry map, only reachable through a lock guard
#[derive(Debug, Clone, Default)]
pub struct MapState {
    slots: Vec<Option<BranchEntry>>,
    /// Branch id owning each slot index at the last refresh
    ids: Vec<BranchId>,
    top: Option<usize>,
    bottom: Option<usize>,
    whiteout: Option<usize>,
    opaque: Option<usize>,
}

impl MapState {
    fn for_table(table: &BranchTable) -> Self {
        Self {
            slots: vec![None; table.len()],
            ids: table.ids(),
            ..Default::default()
        }
    }

    /// Number of slots (branches known at the last refresh)
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<BranchEntry> {
        self.slots.get(index).copied().flatten()
    }

    pub fn set(&mut self, index: usize, entry: Option<BranchEntry>) {
        debug_assert!(index < self.slots.len(), "slot {} out of range", index);
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = entry;
        }
    }

    /// Branch id behind a slot index, as of the last refresh
    pub fn branch_id(&self, index: usize) -> Option<BranchId> {
        self.ids.get(index).copied()
    }

    pub fn top(&self) -> Option<usize> {
        self.top
    }

    pub fn bottom(&self) -> Option<usize> {
        self.bottom
    }

    pub fn set_top(&mut self, index: Option<usize>) {
        self.top = index;
    }

    pub fn set_bottom(&mut self, index: Option<usize>) {
        self.bottom = index;
    }

    /// Branch holding a whiteout for this name; may lie outside top..=bottom
    pub fn whiteout(&self) -> Option<usize> {
        self.whiteout
    }

    pub fn set_whiteout(&mut self, index: Option<usize>) {
        self.whiteout = index;
    }

    /// Opacity barrier of a directory
    pub fn opaque(&self) -> Option<usize> {
        self.opaque
    }

    pub fn set_opaque(&mut self, index: Option<usize>) {
        self.opaque = index;
    }

    /// The visible underlying entry, if any
    pub fn top_entry(&self) -> Option<(usize, BranchEntry)> {
        let top = self.top?;
        self.get(top).map(|e| (top, e))
    }

    pub fn is_positive(&self) -> bool {
        self.top_entry().is_some()
    }

    /// Occupied slot indices within top..=bottom
    pub fn occupied(&self) -> Vec<usize> {
        match (self.top, self.bottom) {
            (Some(t), Some(b)) => (t..=b).filter(|i| self.get(*i).is_some()).collect(),
            _ => Vec::new(),
        }
    }

    /// Re-derive top and bottom from the occupied slots
    pub fn update_range(&mut self) {
        self.top = self.slots.iter().position(|s| s.is_some());
        self.bottom = self.slots.iter().rposition(|s| s.is_some());
    }

    /// Forget every slot and marker
    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.top = None;
        self.bottom = None;
        self.whiteout = None;
        self.opaque = None;
    }

    /// Remap slots onto the current table layout by branch id. Slots of
    /// removed branches are dropped.
    fn remap(&mut self, table: &BranchTable) {
        let new_ids = table.ids();
        let old_index = |new_id: BranchId| self.ids.iter().position(|id| *id == new_id);
        let slots: Vec<Option<BranchEntry>> = new_ids
            .iter()
            .map(|id| old_index(*id).and_then(|i| self.get(i)))
            .collect();
        let translate = |index: Option<usize>| {
            index
                .and_then(|i| self.ids.get(i))
                .and_then(|id| new_ids.iter().position(|n| n == id))
        };
        let whiteout = translate(self.whiteout);
        let opaque = translate(self.opaque);

        self.slots = slots;
        self.ids = new_ids;
        self.whiteout = whiteout;
        self.opaque = opaque;
        self.update_range();
    }
}

/// Branch map of one logical entry, with its own reader-writer lock
#[derive(Debug)]
pub struct EntryMap {
    state: RwLock<MapState>,
    generation: AtomicU64,
}

impl EntryMap {
    /// Empty (negative) map sized for the current table
    pub fn new(table: &BranchTable, clock: &GenerationClock) -> Self {
        Self {
            state: RwLock::new(MapState::for_table(table)),
            generation: AtomicU64::new(clock.current()),
        }
    }

    pub fn read_lock(&self, role: LockRole) -> MapReadGuard<'_> {
        lockdep::acquire(role);
        MapReadGuard {
            inner: self.state.read(),
            _role: RoleToken(role),
        }
    }

    pub fn write_lock(&self, role: LockRole) -> MapWriteGuard<'_> {
        lockdep::acquire(role);
        MapWriteGuard {
            map: self,
            inner: self.state.write(),
            _role: RoleToken(role),
        }
    }

    /// Generation this map was last validated at
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// True when the branch set changed since the last refresh; slots and
    /// range must then be re-resolved before being trusted
    pub fn test_stale(&self, clock: &GenerationClock) -> bool {
        self.generation() != clock.current()
    }
}

struct RoleToken(LockRole);

impl Drop for RoleToken {
    fn drop(&mut self) {
        lockdep::release(self.0);
    }
}

/// Shared lock on an entry map
pub struct MapReadGuard<'a> {
    inner: RwLockReadGuard<'a, MapState>,
    _role: RoleToken,
}

impl Deref for MapReadGuard<'_> {
    type Target = MapState;

    fn deref(&self) -> &MapState {
        &self.inner
    }
}

/// Exclusive lock on an entry map
pub struct MapWriteGuard<'a> {
    map: &'a EntryMap,
    inner: RwLockWriteGuard<'a, MapState>,
    _role: RoleToken,
}

impl<'a> MapWriteGuard<'a> {
    /// Turn the exclusive lock into a shared one without releasing it
    pub fn downgrade(self) -> MapReadGuard<'a> {
        MapReadGuard {
            inner: RwLockWriteGuard::downgrade(self.inner),
            _role: self._role,
        }
    }

    /// Adopt the current table layout and record the current generation
    pub fn refresh(&mut self, table: &BranchTable, clock: &GenerationClock) {
        self.inner.remap(table);
        self.update_generation(clock);
    }

    /// Record that the map was validated at the current generation
    pub fn update_generation(&mut self, clock: &GenerationClock) {
        self.map.generation.store(clock.current(), Ordering::Release);
    }
}

impl Deref for MapWriteGuard<'_> {
    type Target = MapState;

    fn deref(&self) -> &MapState {
        &self.inner
    }
}

impl DerefMut for MapWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut MapState {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::{BranchFs, BranchPerm, FileKind, MemoryBranch};
    use std::sync::Arc;
    use std::thread;

    fn table(n: usize, clock: &GenerationClock) -> BranchTable {
        let mut table = BranchTable::new();
        for i in 0..n {
            let fs: Arc<dyn BranchFs> = Arc::new(MemoryBranch::new(format!("b{}", i)));
            table.insert(i, fs, BranchPerm::ReadWrite, clock).unwrap();
        }
        table
    }

    fn file(ino: u64) -> Option<BranchEntry> {
        Some(BranchEntry {
            ino,
            kind: FileKind::RegularFile,
        })
    }

    #[test]
    fn test_set_and_range() {
        let clock = GenerationClock::new();
        let table = table(4, &clock);
        let map = EntryMap::new(&table, &clock);

        let mut w = map.write_lock(LockRole::Child);
        assert!(!w.is_positive());
        w.set(1, file(10));
        w.set(3, file(30));
        w.update_range();
        assert_eq!(w.top(), Some(1));
        assert_eq!(w.bottom(), Some(3));
        assert_eq!(w.occupied(), vec![1, 3]);
        assert_eq!(w.top_entry().map(|(i, e)| (i, e.ino)), Some((1, 10)));
    }

    #[test]
    fn test_stale_tracks_clock() {
        let clock = GenerationClock::new();
        let mut table = table(2, &clock);
        let map = EntryMap::new(&table, &clock);
        assert!(!map.test_stale(&clock));

        let fs: Arc<dyn BranchFs> = Arc::new(MemoryBranch::new("new"));
        table.insert(0, fs, BranchPerm::ReadOnly, &clock).unwrap();
        assert!(map.test_stale(&clock));

        map.write_lock(LockRole::Child).refresh(&table, &clock);
        assert!(!map.test_stale(&clock));
    }

    #[test]
    fn test_refresh_after_insert_shifts_slots() {
        let clock = GenerationClock::new();
        let mut table = table(2, &clock);
        let map = EntryMap::new(&table, &clock);
        {
            let mut w = map.write_lock(LockRole::Child);
            w.set(0, file(10));
            w.set(1, file(11));
            w.set_whiteout(Some(1));
            w.update_range();
        }

        let fs: Arc<dyn BranchFs> = Arc::new(MemoryBranch::new("new"));
        table.insert(0, fs, BranchPerm::ReadWrite, &clock).unwrap();

        let mut w = map.write_lock(LockRole::Child);
        w.refresh(&table, &clock);
        assert_eq!(w.len(), 3);
        assert_eq!(w.get(0), None);
        assert_eq!(w.get(1).map(|e| e.ino), Some(10));
        assert_eq!(w.top(), Some(1));
        assert_eq!(w.bottom(), Some(2));
        assert_eq!(w.whiteout(), Some(2));
    }

    #[test]
    fn test_refresh_after_remove_reselects_top() {
        let clock = GenerationClock::new();
        let mut table = table(3, &clock);
        let map = EntryMap::new(&table, &clock);
        {
            let mut w = map.write_lock(LockRole::Child);
            w.set(0, file(10));
            w.set(2, file(12));
            w.set_opaque(Some(0));
            w.update_range();
        }

        table.remove(0, &clock).unwrap();
        let mut w = map.write_lock(LockRole::Child);
        w.refresh(&table, &clock);
        assert_eq!(w.len(), 2);
        assert_eq!(w.top(), Some(1));
        assert_eq!(w.bottom(), Some(1));
        assert_eq!(w.top_entry().map(|(_, e)| e.ino), Some(12));
        assert_eq!(w.opaque(), None);
    }

    #[test]
    fn test_downgrade_keeps_contents() {
        let clock = GenerationClock::new();
        let table = table(1, &clock);
        let map = EntryMap::new(&table, &clock);

        let mut w = map.write_lock(LockRole::Child);
        w.set(0, file(5));
        w.update_range();
        let r = w.downgrade();
        assert_eq!(r.top(), Some(0));
        // other readers are admitted once downgraded
        let r2 = map.state.try_read();
        assert!(r2.is_some());
        drop(r2);
        drop(r);
        assert!(lockdep::held_roles().is_empty());
    }

    #[test]
    fn test_concurrent_readers() {
        let clock = GenerationClock::new();
        let table = table(1, &clock);
        let map = Arc::new(EntryMap::new(&table, &clock));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let map = Arc::clone(&map);
                thread::spawn(move || map.read_lock(LockRole::Child).is_positive())
            })
            .collect();
        for h in handles {
            assert!(!h.join().unwrap());
        }
    }

    #[test]
    fn test_reset() {
        let clock = GenerationClock::new();
        let table = table(2, &clock);
        let map = EntryMap::new(&table, &clock);
        let mut w = map.write_lock(LockRole::Child);
        w.set(1, file(1));
        w.set_whiteout(Some(0));
        w.update_range();
        w.reset();
        assert_eq!(w.top(), None);
        assert_eq!(w.whiteout(), None);
        assert!(w.occupied().is_empty());
    }
}

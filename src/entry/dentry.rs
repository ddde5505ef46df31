//! Logical directory entries

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::EntryMap;
use crate::inode::Inode;

/// One name in the merged namespace.
///
/// A child keeps its parent alive; parents only cache children weakly, so an
/// entry nobody references is evicted together with its branch map.
pub struct Dentry {
    name: OsString,
    parent: Option<Arc<Dentry>>,
    map: EntryMap,
    inode: RwLock<Option<Arc<Inode>>>,
    children: Mutex<HashMap<OsString, Weak<Dentry>>>,
    hashed: AtomicBool,
}

impl fmt::Debug for Dentry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dentry")
            .field("path", &self.path())
            .field("positive", &self.is_positive())
            .finish()
    }
}

impl Dentry {
    pub(crate) fn root(map: EntryMap, inode: Arc<Inode>) -> Arc<Self> {
        Arc::new(Self {
            name: OsString::new(),
            parent: None,
            map,
            inode: RwLock::new(Some(inode)),
            children: Mutex::new(HashMap::new()),
            hashed: AtomicBool::new(true),
        })
    }

    /// New child entry, not yet visible in the parent's cache
    pub(crate) fn new_child(parent: &Arc<Dentry>, name: &OsStr, map: EntryMap) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_os_string(),
            parent: Some(Arc::clone(parent)),
            map,
            inode: RwLock::new(None),
            children: Mutex::new(HashMap::new()),
            hashed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &OsStr {
        &self.name
    }

    pub fn parent(&self) -> Option<&Arc<Dentry>> {
        self.parent.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn map(&self) -> &EntryMap {
        &self.map
    }

    pub fn inode(&self) -> Option<Arc<Inode>> {
        self.inode.read().clone()
    }

    pub(crate) fn set_inode(&self, inode: Option<Arc<Inode>>) {
        *self.inode.write() = inode;
    }

    pub fn is_positive(&self) -> bool {
        self.inode.read().is_some()
    }

    pub fn is_dir(&self) -> bool {
        self.inode().map(|i| i.is_dir()).unwrap_or(false)
    }

    /// Path relative to the union root; identical on every branch
    pub fn path(&self) -> PathBuf {
        match &self.parent {
            Some(parent) => parent.path().join(&self.name),
            None => PathBuf::new(),
        }
    }

    /// Whether lookups by name can still find this entry
    pub fn is_hashed(&self) -> bool {
        self.hashed.load(Ordering::Acquire)
    }

    pub(crate) fn cached_child(&self, name: &OsStr) -> Option<Arc<Dentry>> {
        let mut children = self.children.lock();
        match children.get(name).and_then(Weak::upgrade) {
            Some(child) if child.is_hashed() => Some(child),
            Some(_) => None,
            None => {
                children.remove(name);
                None
            }
        }
    }

    /// Make `child` findable by name under this entry. If a concurrent
    /// lookup already published a live entry for the name, that one wins
    /// and is returned instead.
    pub(crate) fn hash_child(&self, child: &Arc<Dentry>) -> Arc<Dentry> {
        let mut children = self.children.lock();
        if let Some(existing) = children.get(&child.name).and_then(Weak::upgrade) {
            if existing.is_hashed() && !Arc::ptr_eq(&existing, child) {
                return existing;
            }
        }
        child.hashed.store(true, Ordering::Release);
        children.insert(child.name.clone(), Arc::downgrade(child));
        Arc::clone(child)
    }

    /// Unhash this entry so the next lookup re-resolves it from scratch
    pub(crate) fn drop_from_cache(self: &Arc<Self>) {
        self.hashed.store(false, Ordering::Release);
        if let Some(parent) = &self.parent {
            let mut children = parent.children.lock();
            let ours = children
                .get(&self.name)
                .map(|w| w.as_ptr() == Arc::as_ptr(self))
                .unwrap_or(false);
            if ours {
                children.remove(&self.name);
            }
        }
    }

    /// Live cached children
    pub(crate) fn cached_children(&self) -> Vec<Arc<Dentry>> {
        self.children
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

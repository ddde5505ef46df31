//! Whiteout and opaque directory markers
//!
//! A whiteout is an empty entry `.wh.<name>` in a branch directory; it hides
//! `<name>` in every lower branch. An opaque marker `.wh..wh..opq` inside a
//! branch directory stops merging of that directory with lower branches.
//! Both are re-derived by lookup, never cached beyond an entry map's
//! generation.

use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::debug;

use crate::branch::BranchFs;
use crate::error::{Error, Result};

/// Prefix of every whiteout name
pub const WH_PREFIX: &str = ".wh.";

/// Marker making a directory opaque
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Pseudo-link directory at the root of each writable branch
pub const PLINK_DIR: &str = ".wh..wh.plnk";

/// Mode of whiteout and marker files
const WH_MODE: u32 = 0o444;

/// Name of the whiteout hiding `name`
pub fn whiteout_name(name: &OsStr) -> OsString {
    let mut wh = OsString::from(WH_PREFIX);
    wh.push(name);
    wh
}

/// Whether `name` belongs to the whiteout namespace
pub fn is_internal(name: &OsStr) -> bool {
    name.as_bytes().starts_with(WH_PREFIX.as_bytes())
}

/// The name hidden by a whiteout entry, if `name` is one
pub fn hidden_name(name: &OsStr) -> Option<&OsStr> {
    let bytes = name.as_bytes().strip_prefix(WH_PREFIX.as_bytes())?;
    if bytes.starts_with(WH_PREFIX.as_bytes()) {
        // markers such as the opaque flag hide nothing
        return None;
    }
    Some(OsStr::from_bytes(bytes))
}

/// Creates, removes and probes markers inside branches
#[derive(Debug, Clone)]
pub struct WhiteoutEngine {
    max_name_len: usize,
}

impl WhiteoutEngine {
    pub fn new(max_name_len: usize) -> Self {
        Self { max_name_len }
    }

    /// Longest name that can still be whited out later
    pub fn max_name_len(&self) -> usize {
        self.max_name_len.saturating_sub(WH_PREFIX.len())
    }

    /// Reject names that could never be deleted again, or that collide with
    /// the marker namespace
    pub fn check_name(&self, name: &OsStr) -> Result<()> {
        let display = name.to_string_lossy().to_string();
        if name.is_empty() || name == "." || name == ".." || name.as_bytes().contains(&b'/') {
            return Err(Error::NotFound(display));
        }
        if is_internal(name) {
            return Err(Error::ReservedName(display));
        }
        if name.len() > self.max_name_len() {
            return Err(Error::NameTooLong(display));
        }
        Ok(())
    }

    /// Is `name` whited out in `parent` on this branch?
    pub fn lookup(&self, fs: &dyn BranchFs, parent: &Path, name: &OsStr) -> Result<bool> {
        let found = fs
            .lookup(parent, &whiteout_name(name))
            .map_err(|e| Error::underlying("whiteout lookup", e))?;
        Ok(found.is_some())
    }

    /// Create the whiteout for `name`. An existing marker is reported as
    /// `AlreadyExists`.
    pub fn create(&self, fs: &dyn BranchFs, parent: &Path, name: &OsStr) -> Result<()> {
        let wh = whiteout_name(name);
        debug!("whiteout {:?} in {:?} on {}", name, parent, fs.label());
        match fs.create(parent, &wh, WH_MODE) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(Error::AlreadyExists(
                format!("already whiteout: {}", wh.to_string_lossy()),
            )),
            Err(e) => Err(Error::underlying("whiteout create", e)),
        }
    }

    /// Remove the whiteout for `name`; the caller holds the branch's lock on
    /// `parent`
    pub fn remove(&self, fs: &dyn BranchFs, parent: &Path, name: &OsStr) -> Result<()> {
        debug!("unwhiteout {:?} in {:?} on {}", name, parent, fs.label());
        fs.unlink(parent, &whiteout_name(name))
            .map_err(|e| Error::underlying("whiteout remove", e))
    }

    pub fn is_opaque(&self, fs: &dyn BranchFs, dir: &Path) -> Result<bool> {
        let found = fs
            .lookup(dir, OsStr::new(OPAQUE_MARKER))
            .map_err(|e| Error::underlying("opaque lookup", e))?;
        Ok(found.is_some())
    }

    /// Make the physical directory `dir` on this branch opaque
    pub fn mark_opaque(&self, fs: &dyn BranchFs, dir: &Path) -> Result<()> {
        match fs.create(dir, OsStr::new(OPAQUE_MARKER), WH_MODE) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(Error::underlying("mark opaque", e)),
        }
    }

    /// Clear the opacity of `dir` on exactly this branch
    pub fn clear_opaque(&self, fs: &dyn BranchFs, dir: &Path) -> Result<()> {
        match fs.unlink(dir, OsStr::new(OPAQUE_MARKER)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::underlying("clear opaque", e)),
        }
    }

    /// Names hidden by whiteouts inside `dir` on this branch
    pub fn whiteouts_in(&self, fs: &dyn BranchFs, dir: &Path) -> Result<HashSet<OsString>> {
        let entries = fs
            .readdir(dir)
            .map_err(|e| Error::underlying("readdir", e))?;
        Ok(entries
            .iter()
            .filter_map(|e| hidden_name(&e.name).map(OsStr::to_os_string))
            .collect())
    }

    /// Remove every marker inside `dir` so the directory can be deleted
    pub fn clear_markers(&self, fs: &dyn BranchFs, dir: &Path) -> Result<()> {
        let entries = fs
            .readdir(dir)
            .map_err(|e| Error::underlying("readdir", e))?;
        for entry in entries.iter().filter(|e| is_internal(&e.name)) {
            fs.unlink(dir, &entry.name)
                .map_err(|e| Error::underlying("marker remove", e))?;
        }
        Ok(())
    }

    /// Prepare a writable branch: create its pseudo-link directory
    pub fn init_branch(&self, fs: &dyn BranchFs) -> Result<()> {
        let root = Path::new("");
        let dir = OsStr::new(PLINK_DIR);
        if fs
            .lookup(root, dir)
            .map_err(|e| Error::underlying("lookup", e))?
            .is_none()
        {
            fs.mkdir(root, dir, 0o700)
                .map_err(|e| Error::underlying("mkdir", e))?;
        }
        Ok(())
    }
}

impl Default for WhiteoutEngine {
    fn default() -> Self {
        Self::new(255)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::MemoryBranch;

    #[test]
    fn test_names() {
        assert_eq!(whiteout_name(OsStr::new("f")), OsString::from(".wh.f"));
        assert!(is_internal(OsStr::new(".wh.f")));
        assert!(!is_internal(OsStr::new("f")));
        assert_eq!(hidden_name(OsStr::new(".wh.f")), Some(OsStr::new("f")));
        assert_eq!(hidden_name(OsStr::new(OPAQUE_MARKER)), None);
        assert_eq!(hidden_name(OsStr::new(PLINK_DIR)), None);
    }

    #[test]
    fn test_check_name() {
        let engine = WhiteoutEngine::new(20);
        assert!(engine.check_name(OsStr::new("ok")).is_ok());
        assert!(matches!(
            engine.check_name(OsStr::new(".wh.x")),
            Err(Error::ReservedName(_))
        ));
        // fits the filesystem limit but not once prefixed
        let name = "a".repeat(18);
        assert!(matches!(
            engine.check_name(OsStr::new(&name)),
            Err(Error::NameTooLong(_))
        ));
        assert!(engine.check_name(OsStr::new(&"a".repeat(16))).is_ok());
    }

    #[test]
    fn test_create_lookup_remove() {
        let engine = WhiteoutEngine::default();
        let fs = MemoryBranch::new("mem");
        let root = Path::new("");

        assert!(!engine.lookup(&fs, root, OsStr::new("f")).unwrap());
        engine.create(&fs, root, OsStr::new("f")).unwrap();
        assert!(engine.lookup(&fs, root, OsStr::new("f")).unwrap());

        assert!(matches!(
            engine.create(&fs, root, OsStr::new("f")),
            Err(Error::AlreadyExists(_))
        ));

        engine.remove(&fs, root, OsStr::new("f")).unwrap();
        assert!(!engine.lookup(&fs, root, OsStr::new("f")).unwrap());
    }

    #[test]
    fn test_opaque() {
        let engine = WhiteoutEngine::default();
        let fs = MemoryBranch::new("mem");
        fs.seed_dir("d").unwrap();
        let dir = Path::new("d");

        assert!(!engine.is_opaque(&fs, dir).unwrap());
        engine.mark_opaque(&fs, dir).unwrap();
        engine.mark_opaque(&fs, dir).unwrap();
        assert!(engine.is_opaque(&fs, dir).unwrap());
        engine.clear_opaque(&fs, dir).unwrap();
        assert!(!engine.is_opaque(&fs, dir).unwrap());
    }

    #[test]
    fn test_whiteouts_in_and_clear() {
        let engine = WhiteoutEngine::default();
        let fs = MemoryBranch::new("mem");
        fs.seed_dir("d").unwrap();
        let dir = Path::new("d");
        engine.create(&fs, dir, OsStr::new("a")).unwrap();
        engine.create(&fs, dir, OsStr::new("b")).unwrap();
        engine.mark_opaque(&fs, dir).unwrap();

        let hidden = engine.whiteouts_in(&fs, dir).unwrap();
        assert_eq!(hidden.len(), 2);
        assert!(hidden.contains(OsStr::new("a")));

        engine.clear_markers(&fs, dir).unwrap();
        assert!(fs.readdir(dir).unwrap().is_empty());
    }

    #[test]
    fn test_init_branch_idempotent() {
        let engine = WhiteoutEngine::default();
        let fs = MemoryBranch::new("mem");
        engine.init_branch(&fs).unwrap();
        engine.init_branch(&fs).unwrap();
        assert!(fs.stat(Path::new(PLINK_DIR)).unwrap().is_some());
    }
}

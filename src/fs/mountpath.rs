//! Mountpath management: the ordered set of local filesystems a target
//! uses for data.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::{AisError, Result};

/// A local filesystem root participating in storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mountpath {
    pub path: PathBuf,
    /// Identity of the underlying filesystem (prevents registering the
    /// same device twice).
    pub fsid: u64,
    pub enabled: bool,
}

impl Mountpath {
    fn resolve(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path)?;
        if !meta.is_dir() {
            return Err(AisError::BadRequest(format!(
                "mountpath {} is not a directory",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            fsid: fsid_of(&meta),
            enabled: true,
        })
    }
}

impl std::fmt::Display for Mountpath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

#[cfg(unix)]
fn fsid_of(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.dev()
}

#[cfg(not(unix))]
fn fsid_of(_meta: &std::fs::Metadata) -> u64 {
    0
}

/// Change notifications; the target subscribes and renews resilver on
/// membership changes.
#[derive(Debug, Clone)]
pub enum MountpathEvent {
    Added(PathBuf),
    Removed(PathBuf),
    Enabled(PathBuf),
    Disabled(PathBuf),
}

#[derive(Default)]
struct MountpathSet {
    /// All registered mountpaths, keyed by path; the `enabled` flag
    /// distinguishes available from disabled.
    all: BTreeMap<PathBuf, Arc<Mountpath>>,
}

impl MountpathSet {
    fn enabled_count(&self) -> usize {
        self.all.values().filter(|m| m.enabled).count()
    }
}

/// Per-target registry of mountpaths.
///
/// Read-mostly: lookups take the read lock; add/remove/enable/disable take
/// the write lock briefly.
pub struct MountpathManager {
    set: RwLock<MountpathSet>,
    events: broadcast::Sender<MountpathEvent>,
}

impl MountpathManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            set: RwLock::new(MountpathSet::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MountpathEvent> {
        self.events.subscribe()
    }

    /// Register a new mountpath. Rejects duplicates (same path or same
    /// underlying filesystem). Emits [`MountpathEvent::Added`] so the
    /// owner can kick off a resilver.
    pub fn add(&self, path: &Path) -> Result<Arc<Mountpath>> {
        let mpath = Arc::new(Mountpath::resolve(path)?);
        {
            let mut set = self.set.write();
            if set.all.contains_key(path) {
                return Err(AisError::MountpathAlreadyExists(
                    path.display().to_string(),
                ));
            }
            if let Some(other) = set
                .all
                .values()
                .find(|m| m.fsid == mpath.fsid && !same_dev_allowed())
            {
                return Err(AisError::MountpathDuplicateFs {
                    mpath: path.display().to_string(),
                    fsid: mpath.fsid,
                    other: other.path.display().to_string(),
                });
            }
            set.all.insert(path.to_path_buf(), Arc::clone(&mpath));
        }
        info!(mpath = %path.display(), "mountpath added");
        let _ = self.events.send(MountpathEvent::Added(path.to_path_buf()));
        Ok(mpath)
    }

    /// Unregister a mountpath. Fails with `NoAvailableMountpath` when it
    /// is the last enabled one.
    pub fn remove(&self, path: &Path) -> Result<()> {
        {
            let mut set = self.set.write();
            let Some(mpath) = set.all.get(path) else {
                return Err(AisError::MountpathNotFound(path.display().to_string()));
            };
            if mpath.enabled && set.enabled_count() <= 1 {
                return Err(AisError::NoAvailableMountpath);
            }
            set.all.remove(path);
        }
        info!(mpath = %path.display(), "mountpath removed");
        let _ = self
            .events
            .send(MountpathEvent::Removed(path.to_path_buf()));
        Ok(())
    }

    /// Re-enable a disabled mountpath; its data must be resilvered.
    pub fn enable(&self, path: &Path) -> Result<()> {
        self.flip(path, true)
    }

    /// Exclude a mountpath from placement. Its data becomes temporarily
    /// unreachable. Fails when it is the last enabled one.
    pub fn disable(&self, path: &Path) -> Result<()> {
        self.flip(path, false)
    }

    fn flip(&self, path: &Path, enable: bool) -> Result<()> {
        {
            let mut set = self.set.write();
            let Some(mpath) = set.all.get(path) else {
                return Err(AisError::MountpathNotFound(path.display().to_string()));
            };
            if mpath.enabled == enable {
                return Ok(());
            }
            if !enable && set.enabled_count() <= 1 {
                return Err(AisError::NoAvailableMountpath);
            }
            let mut next = (**mpath).clone();
            next.enabled = enable;
            set.all.insert(path.to_path_buf(), Arc::new(next));
        }
        if enable {
            info!(mpath = %path.display(), "mountpath enabled");
            let _ = self
                .events
                .send(MountpathEvent::Enabled(path.to_path_buf()));
        } else {
            warn!(mpath = %path.display(), "mountpath disabled");
            let _ = self
                .events
                .send(MountpathEvent::Disabled(path.to_path_buf()));
        }
        Ok(())
    }

    /// Enabled mountpaths, in deterministic (path) order.
    pub fn available(&self) -> Vec<Arc<Mountpath>> {
        self.set
            .read()
            .all
            .values()
            .filter(|m| m.enabled)
            .cloned()
            .collect()
    }

    /// Every registered mountpath, enabled or not.
    pub fn list(&self) -> Vec<Arc<Mountpath>> {
        self.set.read().all.values().cloned().collect()
    }

    pub fn get(&self, path: &Path) -> Option<Arc<Mountpath>> {
        self.set.read().all.get(path).cloned()
    }

    /// The mountpath whose root is a prefix of `fqn`.
    pub fn owner_of(&self, fqn: &Path) -> Option<Arc<Mountpath>> {
        self.set
            .read()
            .all
            .values()
            .find(|m| fqn.starts_with(&m.path))
            .cloned()
    }
}

impl Default for MountpathManager {
    fn default() -> Self {
        Self::new()
    }
}

// Test trees live under one filesystem; production mountpaths are one per
// device. With the override set, dedup falls back to path identity alone.
fn same_dev_allowed() -> bool {
    cfg!(test) || std::env::var_os("AIS_ALLOW_SHARED_FS").is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_add_list_remove() {
        let dir1 = tempdir().unwrap();
        let dir2 = tempdir().unwrap();
        let mgr = MountpathManager::new();

        mgr.add(dir1.path()).unwrap();
        mgr.add(dir2.path()).unwrap();
        assert_eq!(mgr.available().len(), 2);

        mgr.remove(dir1.path()).unwrap();
        assert_eq!(mgr.available().len(), 1);
    }

    #[test]
    fn test_duplicate_path_rejected() {
        let dir = tempdir().unwrap();
        let mgr = MountpathManager::new();
        mgr.add(dir.path()).unwrap();
        assert!(matches!(
            mgr.add(dir.path()),
            Err(AisError::MountpathAlreadyExists(_))
        ));
    }

    #[test]
    fn test_last_enabled_protected() {
        let dir = tempdir().unwrap();
        let mgr = MountpathManager::new();
        mgr.add(dir.path()).unwrap();

        assert!(matches!(
            mgr.remove(dir.path()),
            Err(AisError::NoAvailableMountpath)
        ));
        assert!(matches!(
            mgr.disable(dir.path()),
            Err(AisError::NoAvailableMountpath)
        ));
    }

    #[test]
    fn test_disable_enable_cycle() {
        let dir1 = tempdir().unwrap();
        let dir2 = tempdir().unwrap();
        let mgr = MountpathManager::new();
        mgr.add(dir1.path()).unwrap();
        mgr.add(dir2.path()).unwrap();

        mgr.disable(dir1.path()).unwrap();
        assert_eq!(mgr.available().len(), 1);
        assert_eq!(mgr.list().len(), 2);

        // disabled mountpaths can be removed even if others are disabled
        mgr.enable(dir1.path()).unwrap();
        assert_eq!(mgr.available().len(), 2);
    }

    #[test]
    fn test_add_emits_event() {
        let dir = tempdir().unwrap();
        let mgr = MountpathManager::new();
        let mut rx = mgr.subscribe();
        mgr.add(dir.path()).unwrap();
        match rx.try_recv().unwrap() {
            MountpathEvent::Added(p) => assert_eq!(p, dir.path()),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_owner_of() {
        let dir = tempdir().unwrap();
        let mgr = MountpathManager::new();
        mgr.add(dir.path()).unwrap();

        let fqn = dir.path().join("ais/b1/obj");
        assert!(mgr.owner_of(&fqn).is_some());
        assert!(mgr.owner_of(Path::new("/elsewhere/x")).is_none());
    }
}

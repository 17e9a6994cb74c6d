//! Copy-on-write ownership cells for replicated metadata.
//!
//! Smap, BMD and RMD are each exclusively owned by the primary proxy's
//! serialized writer; every other holder reads immutable snapshots.
//! Readers never take a lock that blocks the writer for longer than the
//! pointer swap.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::warn;

use crate::error::{AisError, Result};
use crate::types::MetaVersion;

/// Implemented by every replicated metadata item.
pub trait Versioned {
    fn version(&self) -> MetaVersion;
    /// File name under the config directory for persistence.
    fn tag() -> &'static str;
}

impl Versioned for super::smap::Smap {
    fn version(&self) -> MetaVersion {
        self.version
    }
    fn tag() -> &'static str {
        "smap"
    }
}

impl Versioned for super::bmd::Bmd {
    fn version(&self) -> MetaVersion {
        self.version
    }
    fn tag() -> &'static str {
        "bmd"
    }
}

impl Versioned for super::rmd::Rmd {
    fn version(&self) -> MetaVersion {
        self.version
    }
    fn tag() -> &'static str {
        "rmd"
    }
}

/// Single-writer, many-snapshot cell.
pub struct Owner<T> {
    cur: RwLock<Arc<T>>,
    writer: Mutex<()>,
    persist_path: Option<PathBuf>,
}

impl<T> Owner<T>
where
    T: Versioned + Clone + Serialize + DeserializeOwned,
{
    pub fn new(initial: T) -> Self {
        Self {
            cur: RwLock::new(Arc::new(initial)),
            writer: Mutex::new(()),
            persist_path: None,
        }
    }

    /// Create the cell backed by a versioned JSON file under `dir`;
    /// loads the persisted copy when one exists.
    pub fn persistent(initial: T, dir: &std::path::Path) -> Self {
        let path = dir.join(format!(".ais.{}", T::tag()));
        let loaded = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "discarding unreadable persisted metadata");
                    None
                }
            },
            Err(_) => None,
        };
        Self {
            cur: RwLock::new(Arc::new(loaded.unwrap_or(initial))),
            writer: Mutex::new(()),
            persist_path: Some(path),
        }
    }

    /// Cheap immutable snapshot.
    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.cur.read())
    }

    /// Serialize writers; the guard exposes get/put on the cell.
    pub async fn lock(&self) -> OwnerGuard<'_, T> {
        OwnerGuard {
            owner: self,
            _writer: self.writer.lock().await,
        }
    }

    /// Apply a received (metasynced) copy iff its version is strictly
    /// greater than the current one. Stale versions are acknowledged but
    /// not applied.
    pub fn try_apply(&self, next: T) -> Result<bool> {
        let mut cur = self.cur.write();
        if next.version() <= cur.version() {
            return Ok(false);
        }
        let next = Arc::new(next);
        self.persist(&next)?;
        *cur = next;
        Ok(true)
    }

    fn persist(&self, value: &T) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let tmp = path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(value)?;
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn swap(&self, next: T) -> Result<Arc<T>> {
        let next = Arc::new(next);
        self.persist(&next)?;
        *self.cur.write() = Arc::clone(&next);
        Ok(next)
    }
}

/// Exclusive-writer guard over an [`Owner`] cell.
pub struct OwnerGuard<'a, T> {
    owner: &'a Owner<T>,
    _writer: MutexGuard<'a, ()>,
}

impl<T> OwnerGuard<'_, T>
where
    T: Versioned + Clone + Serialize + DeserializeOwned,
{
    pub fn get(&self) -> Arc<T> {
        self.owner.get()
    }

    /// Install a mutated clone; persists, then swaps the snapshot. The
    /// new version must not go backwards.
    pub fn put(&self, next: T) -> Result<Arc<T>> {
        let cur = self.owner.get();
        if next.version() < cur.version() {
            return Err(AisError::Internal(format!(
                "{} version regression: {} -> {}",
                T::tag(),
                cur.version(),
                next.version()
            )));
        }
        self.owner.swap(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::bmd::Bmd;
    use crate::types::{Bck, BucketProps};

    #[tokio::test]
    async fn test_snapshots_are_immutable() {
        let owner = Owner::new(Bmd::new());
        let before = owner.get();

        let guard = owner.lock().await;
        let mut clone = (*guard.get()).clone();
        clone.add(Bck::ais("b1"), BucketProps::default_props());
        guard.put(clone).unwrap();
        drop(guard);

        // the old snapshot is unchanged; new snapshot sees the bucket
        assert_eq!(before.version, 0);
        assert_eq!(owner.get().version, 1);
        assert!(owner.get().contains(&Bck::ais("b1")));
    }

    #[tokio::test]
    async fn test_try_apply_rejects_stale() {
        let owner = Owner::new(Bmd::new());
        let mut v2 = Bmd::new();
        v2.add(Bck::ais("b1"), BucketProps::default_props());
        v2.add(Bck::ais("b2"), BucketProps::default_props());
        assert_eq!(v2.version, 2);

        assert!(owner.try_apply(v2.clone()).unwrap());
        // same version again: acknowledged, not applied
        assert!(!owner.try_apply(v2).unwrap());

        let stale = Bmd::new();
        assert!(!owner.try_apply(stale).unwrap());
        assert_eq!(owner.get().version, 2);
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let owner = Owner::persistent(Bmd::new(), dir.path());
            let guard = owner.lock().await;
            let mut clone = (*guard.get()).clone();
            clone.add(Bck::ais("saved"), BucketProps::default_props());
            guard.put(clone).unwrap();
        }
        let owner = Owner::persistent(Bmd::new(), dir.path());
        assert!(owner.get().contains(&Bck::ais("saved")));
        assert_eq!(owner.get().version, 1);
    }
}

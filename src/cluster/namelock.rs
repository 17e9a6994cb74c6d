//! Per-bucket name locks.
//!
//! Create and destroy serialize behind a blocking acquire, so concurrent
//! creates resolve into one winner and losers fail the existence
//! precondition. Rename and copy use the `try_lock` variants and surface
//! `BucketIsBusy` on contention; nothing blocks inside commit paths.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::error::{AisError, Result};
use crate::types::Bck;

/// Table of per-bucket reader/writer name locks.
#[derive(Default)]
pub struct NameLocker {
    locks: Mutex<HashMap<Bck, Arc<RwLock<()>>>>,
}

enum Held {
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// RAII guard; releases the name lock on drop. Long-running operations
/// (rename, copy) move the guard into the task that awaits completion.
pub struct NameLockGuard {
    bck: Bck,
    _held: Held,
}

impl NameLockGuard {
    pub fn bck(&self) -> &Bck {
        &self.bck
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self._held, Held::Exclusive(_))
    }
}

impl NameLocker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn entry(&self, bck: &Bck) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(bck.clone()).or_default())
    }

    /// Blocking exclusive acquire.
    pub async fn lock(&self, bck: &Bck) -> NameLockGuard {
        let held = self.entry(bck).write_owned().await;
        NameLockGuard {
            bck: bck.clone(),
            _held: Held::Exclusive(held),
        }
    }

    /// Non-blocking exclusive acquire; `BucketIsBusy` on contention.
    pub fn try_lock(&self, bck: &Bck) -> Result<NameLockGuard> {
        match self.entry(bck).try_write_owned() {
            Ok(held) => Ok(NameLockGuard {
                bck: bck.clone(),
                _held: Held::Exclusive(held),
            }),
            Err(_) => Err(AisError::BucketIsBusy(bck.clone())),
        }
    }

    /// Non-blocking shared acquire; `BucketIsBusy` when an exclusive
    /// holder is present.
    pub fn try_rlock(&self, bck: &Bck) -> Result<NameLockGuard> {
        match self.entry(bck).try_read_owned() {
            Ok(held) => Ok(NameLockGuard {
                bck: bck.clone(),
                _held: Held::Shared(held),
            }),
            Err(_) => Err(AisError::BucketIsBusy(bck.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_excludes_all() {
        let locker = NameLocker::new();
        let bck = Bck::ais("b1");

        let guard = locker.try_lock(&bck).unwrap();
        assert!(guard.is_exclusive());
        assert!(matches!(
            locker.try_lock(&bck),
            Err(AisError::BucketIsBusy(_))
        ));
        assert!(matches!(
            locker.try_rlock(&bck),
            Err(AisError::BucketIsBusy(_))
        ));

        drop(guard);
        assert!(locker.try_lock(&bck).is_ok());
    }

    #[tokio::test]
    async fn test_readers_share() {
        let locker = NameLocker::new();
        let bck = Bck::ais("b1");

        let r1 = locker.try_rlock(&bck).unwrap();
        let r2 = locker.try_rlock(&bck).unwrap();
        assert!(matches!(
            locker.try_lock(&bck),
            Err(AisError::BucketIsBusy(_))
        ));

        drop(r1);
        drop(r2);
        assert!(locker.try_lock(&bck).is_ok());
    }

    #[tokio::test]
    async fn test_blocking_lock_serializes() {
        let locker = NameLocker::new();
        let bck = Bck::ais("b1");

        let guard = locker.lock(&bck).await;
        let locker2 = Arc::clone(&locker);
        let bck2 = bck.clone();
        let waiter = tokio::spawn(async move {
            let _guard = locker2.lock(&bck2).await;
            true
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_distinct_buckets_independent() {
        let locker = NameLocker::new();
        let _a = locker.try_lock(&Bck::ais("a")).unwrap();
        let _b = locker.try_lock(&Bck::ais("b")).unwrap();
    }
}

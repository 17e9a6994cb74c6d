//! The xaction registry: lifecycle, lookup and cleanup of long-running
//! tasks, process-wide per target.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::{AisError, Result};
use crate::types::Bck;

use super::{Xact, XactKind, XactSnap, XactType};

/// How often housekeeping runs.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(600);

/// Retention of finished entries.
pub const ENTRY_OLD_AGE: Duration = Duration::from_secs(3600);

/// Finished-entry count in the active list that triggers compaction.
const ACTIVE_COMPACT_THRESHOLD: usize = 50;

/// Remembered ids of garbage-collected entries, so a status query can
/// distinguish expired from never-existed.
const GRAVEYARD_CAP: usize = 1000;

/// Lookup filter. A query matches when every set field matches and the
/// running-filter holds.
#[derive(Debug, Clone, Default)]
pub struct XactQuery {
    pub id: String,
    pub kind: Option<XactKind>,
    pub bck: Option<Bck>,
    pub only_running: bool,
}

impl XactQuery {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn by_kind(kind: XactKind) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }

    pub fn running(mut self) -> Self {
        self.only_running = true;
        self
    }

    pub fn with_bck(mut self, bck: Bck) -> Self {
        self.bck = Some(bck);
        self
    }

    fn matches(&self, xact: &dyn Xact) -> bool {
        if !self.id.is_empty() {
            return xact.id() == self.id;
        }
        if let Some(kind) = self.kind {
            if xact.kind() != kind {
                return false;
            }
        }
        if let Some(bck) = &self.bck {
            if xact.bck() != Some(bck) {
                return false;
            }
        }
        if self.only_running && xact.finished() {
            return false;
        }
        true
    }
}

/// Result of a renew call.
pub enum Renewed {
    /// A matching xaction was already running; callers share it.
    Kept(Arc<dyn Xact>),
    /// A new xaction was started. `prev` is the preempted predecessor,
    /// when there was one, so the caller can inherit its state.
    Started {
        xact: Arc<dyn Xact>,
        prev: Option<Arc<dyn Xact>>,
    },
}

impl Renewed {
    pub fn xact(&self) -> &Arc<dyn Xact> {
        match self {
            Renewed::Kept(x) => x,
            Renewed::Started { xact, .. } => xact,
        }
    }
}

#[derive(Default)]
struct Entries {
    /// Every entry, in insertion order; finished entries are removed by
    /// housekeeping.
    all: Vec<Arc<dyn Xact>>,
    /// Running entries; finished ones are gradually compacted away.
    active: Vec<Arc<dyn Xact>>,
    task_count: i64,
}

impl Entries {
    fn insert(&mut self, xact: Arc<dyn Xact>) {
        if xact.kind().ty() == XactType::Task {
            self.task_count += 1;
        }
        self.active.push(Arc::clone(&xact));
        self.all.push(xact);
    }

    fn remove(&mut self, id: &str) {
        if let Some(idx) = self.all.iter().position(|x| x.id() == id) {
            let removed = self.all.swap_remove(idx);
            if removed.kind().ty() == XactType::Task {
                self.task_count -= 1;
            }
        }
        if let Some(idx) = self.active.iter().position(|x| x.id() == id) {
            self.active.swap_remove(idx);
        }
    }

    fn compact_active(&mut self) {
        self.active.retain(|x| !x.finished());
    }
}

/// The registry proper. Read-mostly scans; a writer lock only for
/// insert/remove/compaction.
pub struct Registry {
    entries: RwLock<Entries>,
    /// Last snapshot per (kind, bucket), surviving entry GC so history
    /// lookups still return something.
    retained: RwLock<HashMap<(XactKind, Option<Bck>), XactSnap>>,
    graveyard: RwLock<(VecDeque<String>, HashSet<String>)>,
    /// Serializes the check-and-insert of renew calls.
    renew_mtx: parking_lot::Mutex<()>,
    sealed: AtomicBool,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(Entries::default()),
            retained: RwLock::new(HashMap::new()),
            graveyard: RwLock::new((VecDeque::new(), HashSet::new())),
            renew_mtx: parking_lot::Mutex::new(()),
            sealed: AtomicBool::new(false),
        })
    }

    /// Most recent matching entry (reverse-linear scan).
    pub fn get_latest(&self, query: &XactQuery) -> Option<Arc<dyn Xact>> {
        let entries = self.entries.read();
        entries
            .all
            .iter()
            .rev()
            .find(|x| query.matches(x.as_ref()))
            .cloned()
    }

    /// Most recent matching running entry; scans only the active list and
    /// schedules compaction when it has accumulated finished entries.
    pub fn get_running(&self, query: &XactQuery) -> Option<Arc<dyn Xact>> {
        let (found, finished_cnt) = {
            let entries = self.entries.read();
            let finished_cnt = entries.active.iter().filter(|x| x.finished()).count();
            let found = entries
                .active
                .iter()
                .rev()
                .find(|x| !x.finished() && query.matches(x.as_ref()))
                .cloned();
            (found, finished_cnt)
        };
        if finished_cnt > ACTIVE_COMPACT_THRESHOLD {
            self.entries.write().compact_active();
        }
        found
    }

    pub fn is_running(&self, query: &XactQuery) -> bool {
        self.get_running(query).is_some()
    }

    /// Idempotent start of a global (one-per-kind) xaction. With
    /// `preempt` false a running instance is kept and returned; with
    /// `preempt` true (resilver) the running instance is aborted first.
    pub fn renew_global<F>(&self, kind: XactKind, preempt: bool, factory: F) -> Result<Renewed>
    where
        F: FnOnce() -> Result<Arc<dyn Xact>>,
    {
        debug_assert_eq!(kind.ty(), XactType::Global);
        self.renew(XactQuery::by_kind(kind).running(), preempt, factory)
    }

    /// Idempotent start of a per-bucket xaction.
    pub fn renew_bucket<F>(
        &self,
        kind: XactKind,
        bck: Bck,
        preempt: bool,
        factory: F,
    ) -> Result<Renewed>
    where
        F: FnOnce() -> Result<Arc<dyn Xact>>,
    {
        debug_assert_eq!(kind.ty(), XactType::Bucket);
        self.renew(
            XactQuery::by_kind(kind).with_bck(bck).running(),
            preempt,
            factory,
        )
    }

    fn renew<F>(&self, query: XactQuery, preempt: bool, factory: F) -> Result<Renewed>
    where
        F: FnOnce() -> Result<Arc<dyn Xact>>,
    {
        // fast path without the writer lock
        if !preempt {
            if let Some(existing) = self.get_running(&query) {
                return Ok(Renewed::Kept(existing));
            }
        }

        self.check_sealed()?;
        let _renew = self.renew_mtx.lock();
        let prev = {
            let entries = self.entries.read();
            entries
                .active
                .iter()
                .rev()
                .find(|x| !x.finished() && query.matches(x.as_ref()))
                .cloned()
        };
        if let Some(prev) = &prev {
            if !preempt {
                return Ok(Renewed::Kept(Arc::clone(prev)));
            }
            prev.abort();
        }

        let xact = factory()?;
        self.insert(Arc::clone(&xact))?;
        Ok(Renewed::Started { xact, prev })
    }

    /// Start a task xaction under a caller-provided id. Renewing an id
    /// that is still running is an error (duplicate id); a finished
    /// predecessor with the same id is removed first.
    pub fn renew_task<F>(&self, id: &str, factory: F) -> Result<Arc<dyn Xact>>
    where
        F: FnOnce() -> Result<Arc<dyn Xact>>,
    {
        self.check_sealed()?;
        let _renew = self.renew_mtx.lock();
        if let Some(existing) = self.get_latest(&XactQuery::by_id(id)) {
            if !existing.finished() {
                return Err(AisError::BadRequest(format!(
                    "xaction {} is still running - duplicate task id?",
                    id
                )));
            }
            self.remove_entry(id);
        }
        let xact = factory()?;
        self.insert(Arc::clone(&xact))?;
        Ok(xact)
    }

    fn insert(&self, xact: Arc<dyn Xact>) -> Result<()> {
        self.check_sealed()?;
        self.entries.write().insert(xact);
        Ok(())
    }

    fn check_sealed(&self) -> Result<()> {
        if self.sealed.load(Ordering::SeqCst) {
            return Err(AisError::Internal("xaction registry is shut down".into()));
        }
        Ok(())
    }

    /// Abort every matching xaction. Idempotent; returns how many were
    /// actually running.
    pub fn abort(&self, query: &XactQuery) -> usize {
        let matching: Vec<_> = {
            let entries = self.entries.read();
            entries
                .all
                .iter()
                .filter(|x| !x.finished() && query.matches(x.as_ref()))
                .cloned()
                .collect()
        };
        for xact in &matching {
            xact.abort();
        }
        matching.len()
    }

    /// Abort all running xactions, optionally restricted to a type class.
    pub fn abort_all(&self, ty: Option<XactType>) -> usize {
        let matching: Vec<_> = {
            let entries = self.entries.read();
            entries
                .all
                .iter()
                .filter(|x| !x.finished() && ty.map(|t| x.kind().ty() == t).unwrap_or(true))
                .cloned()
                .collect()
        };
        for xact in &matching {
            xact.abort();
        }
        matching.len()
    }

    /// Abort all xactions running against any of the given buckets.
    pub fn abort_buckets(&self, bcks: &[Bck]) -> usize {
        let matching: Vec<_> = {
            let entries = self.entries.read();
            entries
                .all
                .iter()
                .filter(|x| {
                    !x.finished() && x.bck().map(|b| bcks.contains(b)).unwrap_or(false)
                })
                .cloned()
                .collect()
        };
        for xact in &matching {
            xact.abort();
        }
        matching.len()
    }

    /// Abort all mountpath-bound xactions (mountpath set changed).
    pub fn abort_mountpath_xacts(&self) -> usize {
        let matching: Vec<_> = {
            let entries = self.entries.read();
            entries
                .all
                .iter()
                .filter(|x| !x.finished() && x.is_mountpath_xact())
                .cloned()
                .collect()
        };
        for xact in &matching {
            xact.abort();
        }
        matching.len()
    }

    /// Stats snapshots of matching entries. An id query that matches
    /// nothing distinguishes expired (garbage-collected) from unknown.
    pub fn stats(&self, query: &XactQuery) -> Result<Vec<XactSnap>> {
        let snaps: Vec<XactSnap> = {
            let entries = self.entries.read();
            entries
                .all
                .iter()
                .filter(|x| query.matches(x.as_ref()))
                .map(|x| x.snap())
                .collect()
        };
        if snaps.is_empty() && !query.id.is_empty() {
            if self.graveyard.read().1.contains(&query.id) {
                return Err(AisError::XactionExpired(query.id.clone()));
            }
            return Err(AisError::XactionNotFound(query.id.clone()));
        }
        Ok(snaps)
    }

    /// Most recent stats for (kind, bucket), falling back to the retained
    /// snapshot when the entry itself was garbage-collected.
    pub fn latest_snap(&self, kind: XactKind, bck: Option<&Bck>) -> Option<XactSnap> {
        let mut query = XactQuery::by_kind(kind);
        if let Some(bck) = bck {
            query = query.with_bck(bck.clone());
        }
        if let Some(entry) = self.get_latest(&query) {
            return Some(entry.snap());
        }
        self.retained
            .read()
            .get(&(kind, bck.cloned()))
            .cloned()
    }

    /// Remove entries whose end time is older than [`ENTRY_OLD_AGE`];
    /// finished task entries are freed eagerly. The most recent snapshot
    /// per (kind, bucket) is retained for history lookups. Returns the
    /// next housekeeping interval.
    pub fn housekeep(&self, now_ns: i64) -> Duration {
        let old_age_ns = ENTRY_OLD_AGE.as_nanos() as i64;
        let mut to_remove: Vec<Arc<dyn Xact>> = Vec::new();
        {
            let entries = self.entries.read();
            for xact in &entries.all {
                if !xact.finished() {
                    continue;
                }
                let eager = xact.kind().ty() == XactType::Task;
                if eager || xact.base().end_time_ns() + old_age_ns < now_ns {
                    to_remove.push(Arc::clone(xact));
                }
            }
        }
        if to_remove.is_empty() {
            return CLEANUP_INTERVAL;
        }

        for xact in &to_remove {
            // retain the freshest snapshot for (kind, bucket) history
            let key = (xact.kind(), xact.bck().cloned());
            let snap = xact.snap();
            let mut retained = self.retained.write();
            match retained.get(&key) {
                Some(existing) if existing.start_time > snap.start_time => {}
                _ => {
                    retained.insert(key, snap);
                }
            }
        }

        let removed = to_remove.len();
        {
            let mut entries = self.entries.write();
            let mut graveyard = self.graveyard.write();
            for xact in to_remove {
                entries.remove(xact.id());
                let (order, set) = &mut *graveyard;
                if set.insert(xact.id().to_string()) {
                    order.push_back(xact.id().to_string());
                    while order.len() > GRAVEYARD_CAP {
                        if let Some(evicted) = order.pop_front() {
                            set.remove(&evicted);
                        }
                    }
                }
            }
            entries.compact_active();
        }
        info!(removed, "xaction registry housekeeping");
        CLEANUP_INTERVAL
    }

    fn remove_entry(&self, id: &str) {
        self.entries.write().remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.read().all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Graceful teardown: refuse new inserts, abort everything running.
    pub fn shutdown(&self) {
        self.sealed.store(true, Ordering::SeqCst);
        let aborted = self.abort_all(None);
        debug!(aborted, "xaction registry sealed");
    }
}

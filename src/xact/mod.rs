//! Extended actions (xactions): long-running background operations.
//!
//! An xaction is either *global* (at most one running per kind),
//! *per-bucket* (at most one per kind and bucket), or a *task*
//! (short-lived, id-identified result holder). Every xaction carries an
//! abort channel its worker loop selects on, start/end times, and
//! object/byte counters.

pub mod registry;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::types::Bck;

pub use registry::{Registry, Renewed, XactQuery};

/// Xaction kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum XactKind {
    Rebalance,
    Resilver,
    Election,
    Lru,
    Downloader,
    PutCopies,
    EcEncode,
    Prefetch,
    BckList,
    BckSummary,
    CopyBck,
    RenameBck,
    DSort,
}

/// Scope class of a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XactType {
    Global,
    Bucket,
    Task,
}

impl XactKind {
    pub fn ty(&self) -> XactType {
        match self {
            XactKind::Rebalance
            | XactKind::Resilver
            | XactKind::Election
            | XactKind::Lru
            | XactKind::Downloader => XactType::Global,
            XactKind::PutCopies
            | XactKind::EcEncode
            | XactKind::Prefetch
            | XactKind::CopyBck
            | XactKind::RenameBck => XactType::Bucket,
            XactKind::BckList | XactKind::BckSummary | XactKind::DSort => XactType::Task,
        }
    }

    /// Kinds whose work is bound to mountpaths; these are aborted when
    /// the mountpath set changes.
    pub fn is_mountpath(&self) -> bool {
        matches!(
            self,
            XactKind::Resilver
                | XactKind::PutCopies
                | XactKind::EcEncode
                | XactKind::Downloader
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            XactKind::Rebalance => "rebalance",
            XactKind::Resilver => "resilver",
            XactKind::Election => "election",
            XactKind::Lru => "lru",
            XactKind::Downloader => "downloader",
            XactKind::PutCopies => "put-copies",
            XactKind::EcEncode => "ec-encode",
            XactKind::Prefetch => "prefetch",
            XactKind::BckList => "bck-list",
            XactKind::BckSummary => "bck-summary",
            XactKind::CopyBck => "copy-bck",
            XactKind::RenameBck => "rename-bck",
            XactKind::DSort => "dsort",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "rebalance" => XactKind::Rebalance,
            "resilver" => XactKind::Resilver,
            "election" => XactKind::Election,
            "lru" => XactKind::Lru,
            "downloader" => XactKind::Downloader,
            "put-copies" | "makencopies" => XactKind::PutCopies,
            "ec-encode" | "ecencode" => XactKind::EcEncode,
            "prefetch" => XactKind::Prefetch,
            "bck-list" | "list" => XactKind::BckList,
            "bck-summary" | "summary" => XactKind::BckSummary,
            "copy-bck" => XactKind::CopyBck,
            "rename-bck" => XactKind::RenameBck,
            "dsort" => XactKind::DSort,
            _ => return None,
        })
    }
}

impl std::fmt::Display for XactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Common state of every xaction.
pub struct XactBase {
    id: String,
    kind: XactKind,
    bck: Option<Bck>,
    sutime: AtomicI64,
    eutime: AtomicI64,
    aborted: AtomicBool,
    abort_tx: watch::Sender<bool>,
    objects: AtomicI64,
    bytes: AtomicI64,
    pending: AtomicI64,
}

impl XactBase {
    pub fn new(id: impl Into<String>, kind: XactKind, bck: Option<Bck>) -> Self {
        let (abort_tx, _) = watch::channel(false);
        let base = Self {
            id: id.into(),
            kind,
            bck,
            sutime: AtomicI64::new(0),
            eutime: AtomicI64::new(0),
            aborted: AtomicBool::new(false),
            abort_tx,
            objects: AtomicI64::new(0),
            bytes: AtomicI64::new(0),
            pending: AtomicI64::new(0),
        };
        base.sutime
            .store(chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0), Ordering::Relaxed);
        base
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> XactKind {
        self.kind
    }

    pub fn bck(&self) -> Option<&Bck> {
        self.bck.as_ref()
    }

    pub fn start_time_ns(&self) -> i64 {
        self.sutime.load(Ordering::Relaxed)
    }

    pub fn end_time_ns(&self) -> i64 {
        self.eutime.load(Ordering::Relaxed)
    }

    pub fn finished(&self) -> bool {
        self.eutime.load(Ordering::Relaxed) != 0
    }

    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    /// Mark the xaction finished (normally).
    pub fn finish(&self) {
        self.finish_at(chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0));
    }

    pub fn finish_at(&self, now_ns: i64) {
        if self
            .eutime
            .compare_exchange(0, now_ns, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!(xact = %self.id, kind = %self.kind, "finished");
        }
    }

    /// Close the abort channel and mark aborted. Idempotent; a no-op on
    /// an already-finished xaction.
    pub fn abort(&self) {
        if self.finished() && !self.aborted() {
            return;
        }
        if self
            .aborted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.finish();
            let _ = self.abort_tx.send(true);
            info!(xact = %self.id, kind = %self.kind, "aborted");
        }
    }

    /// Worker loops `select!` on this at every iteration.
    pub fn abort_watch(&self) -> watch::Receiver<bool> {
        self.abort_tx.subscribe()
    }

    pub fn objects_inc(&self) -> i64 {
        self.objects.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn objects_add(&self, n: i64) {
        self.objects.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_add(&self, n: i64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn objects(&self) -> i64 {
        self.objects.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> i64 {
        self.bytes.load(Ordering::Relaxed)
    }

    // Demand-style refcounting: pending work items keep an on-demand
    // xaction (downloader) alive.

    pub fn inc_pending(&self) {
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_pending(&self) {
        self.pending.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn sub_pending(&self, n: i64) {
        self.pending.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::Relaxed)
    }
}

/// Capability surface of every xaction entry in the registry.
pub trait Xact: Send + Sync + 'static {
    fn base(&self) -> &XactBase;

    /// Concrete-type access for entries that carry results.
    fn as_any(&self) -> &dyn std::any::Any;

    fn id(&self) -> &str {
        self.base().id()
    }
    fn kind(&self) -> XactKind {
        self.base().kind()
    }
    fn bck(&self) -> Option<&Bck> {
        self.base().bck()
    }
    fn finished(&self) -> bool {
        self.base().finished()
    }
    fn aborted(&self) -> bool {
        self.base().aborted()
    }
    fn abort(&self) {
        self.base().abort()
    }
    fn is_mountpath_xact(&self) -> bool {
        self.base().kind().is_mountpath()
    }

    /// Stats snapshot for status queries.
    fn snap(&self) -> XactSnap {
        let base = self.base();
        XactSnap {
            id: base.id().to_string(),
            kind: base.kind().as_str().to_string(),
            bck: base.bck().cloned(),
            start_time: ns_to_rfc3339(base.start_time_ns()),
            end_time: (base.end_time_ns() != 0).then(|| ns_to_rfc3339(base.end_time_ns())),
            objects: base.objects(),
            bytes: base.bytes(),
            pending: base.pending(),
            aborted: base.aborted(),
            running: !base.finished(),
        }
    }
}

fn ns_to_rfc3339(ns: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_nanos(ns).to_rfc3339()
}

/// JSON stats payload of one xaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XactSnap {
    pub id: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bck: Option<Bck>,
    pub start_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    pub objects: i64,
    pub bytes: i64,
    pub pending: i64,
    pub aborted: bool,
    pub running: bool,
}

/// Plain xaction with no behavior beyond the base: the common case for
/// kinds whose worker loop lives elsewhere and drives the counters.
pub struct BaseXact {
    base: XactBase,
}

impl BaseXact {
    pub fn new(id: impl Into<String>, kind: XactKind, bck: Option<Bck>) -> Arc<Self> {
        Arc::new(Self {
            base: XactBase::new(id, kind, bck),
        })
    }
}

impl Xact for BaseXact {
    fn base(&self) -> &XactBase {
        &self.base
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Task xaction holding a result payload (bucket listing, summary).
pub struct TaskXact {
    base: XactBase,
    result: parking_lot::Mutex<Option<serde_json::Value>>,
}

impl TaskXact {
    pub fn new(id: impl Into<String>, kind: XactKind, bck: Option<Bck>) -> Arc<Self> {
        Arc::new(Self {
            base: XactBase::new(id, kind, bck),
            result: parking_lot::Mutex::new(None),
        })
    }

    pub fn set_result(&self, value: serde_json::Value) {
        *self.result.lock() = Some(value);
        self.base.finish();
    }

    pub fn result(&self) -> Option<serde_json::Value> {
        self.result.lock().clone()
    }
}

impl Xact for TaskXact {
    fn base(&self) -> &XactBase {
        &self.base
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let xact = BaseXact::new("x1", XactKind::Lru, None);
        assert!(!xact.finished());
        assert!(!xact.aborted());

        xact.base().finish();
        assert!(xact.finished());
        assert!(!xact.aborted());

        // abort on finished xaction is a no-op
        xact.abort();
        assert!(!xact.aborted());
    }

    #[test]
    fn test_abort_idempotent() {
        let xact = BaseXact::new("x1", XactKind::Rebalance, None);
        let mut watch = xact.base().abort_watch();

        xact.abort();
        xact.abort();
        assert!(xact.aborted());
        assert!(xact.finished());
        assert!(*watch.borrow_and_update());
    }

    #[tokio::test]
    async fn test_abort_wakes_worker() {
        let xact = BaseXact::new("x1", XactKind::Rebalance, None);
        let mut watch = xact.base().abort_watch();
        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = watch.changed() => return true,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(60)) => return false,
                }
            }
        });
        xact.abort();
        assert!(worker.await.unwrap());
    }

    #[test]
    fn test_snap() {
        let bck = Bck::ais("b1");
        let xact = BaseXact::new("x2", XactKind::PutCopies, Some(bck.clone()));
        xact.base().objects_add(3);
        xact.base().bytes_add(1024);

        let snap = xact.snap();
        assert_eq!(snap.id, "x2");
        assert_eq!(snap.kind, "put-copies");
        assert_eq!(snap.bck, Some(bck));
        assert_eq!(snap.objects, 3);
        assert_eq!(snap.bytes, 1024);
        assert!(snap.running);
        assert!(snap.end_time.is_none());
    }

    #[test]
    fn test_task_result() {
        let task = TaskXact::new("task-1", XactKind::BckList, Some(Bck::ais("b")));
        assert!(task.result().is_none());
        task.set_result(serde_json::json!({"entries": []}));
        assert!(task.finished());
        assert!(task.result().is_some());
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(XactKind::Rebalance.ty(), XactType::Global);
        assert_eq!(XactKind::PutCopies.ty(), XactType::Bucket);
        assert_eq!(XactKind::BckList.ty(), XactType::Task);
        assert!(XactKind::Resilver.is_mountpath());
        assert!(!XactKind::Election.is_mountpath());
        assert_eq!(XactKind::parse("makencopies"), Some(XactKind::PutCopies));
        assert_eq!(XactKind::parse("nope"), None);
    }
}

//! Downloader: batch ingestion of external objects into the cluster.
//!
//! A download *job* names a bucket and a set of source URLs (single,
//! multi, or a brace-range template). The job is split into per-object
//! *tasks*, each routed by HRW to the mountpath that will own the object
//! and queued on that mountpath's jogger. Job-level abort drains queued
//! tasks and cancels the one in flight.

mod jogger;

pub use jogger::Jogger;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Semaphore};
use tracing::info;

use crate::config::DownloaderConfig;
use crate::error::{AisError, Result};
use crate::fs::{ContentRegistry, MountpathManager};
use crate::hrw;
use crate::types::Bck;
use crate::xact::{BaseXact, Registry, Renewed, Xact, XactKind};

pub(crate) const CANCELLED_MSG: &str = "download cancelled";

/// Download job specification, as submitted via `POST /v1/download`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum DlSpec {
    /// One URL, one object.
    Single { url: String, obj_name: String },
    /// Explicit object-name -> URL map.
    Multi { objects: HashMap<String, String> },
    /// Brace-range template, e.g. `http://host/shard-{0..99}.tar`.
    Range { template: String },
}

/// Submitted job body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlBody {
    pub bck: Bck,
    #[serde(flatten)]
    pub spec: DlSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Cluster-wide job id, assigned by the submitting proxy; targets
    /// fall back to a fresh one for direct submissions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

/// One single-object download.
#[derive(Debug, Clone)]
pub struct DlTask {
    pub job_id: String,
    pub uid: String,
    pub url: String,
    pub bck: Bck,
    pub obj_name: String,
}

/// Task terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DlTaskStatus {
    Queued,
    Running,
    Done,
    Failed,
    Aborted,
}

/// Request uid: stable per (bucket, object), deduplicates re-submissions
/// of the same object within a job.
pub fn request_uid(bck: &Bck, obj_name: &str) -> String {
    format!(
        "{:016x}",
        xxhash_rust::xxh64::xxh64(format!("{}\u{0}{}", bck, obj_name).as_bytes(), 0)
    )
}

/// Expand `prefix{A..B}suffix` into the task list. A missing brace range
/// yields an error.
pub fn expand_range_template(template: &str) -> Result<Vec<(String, String)>> {
    let open = template
        .find('{')
        .ok_or_else(|| AisError::BadRequest("range template has no '{'".into()))?;
    let close = template[open..]
        .find('}')
        .map(|i| i + open)
        .ok_or_else(|| AisError::BadRequest("range template has no '}'".into()))?;
    let inner = &template[open + 1..close];
    let (lo, hi) = inner
        .split_once("..")
        .ok_or_else(|| AisError::BadRequest("range must be {start..end}".into()))?;
    let lo: i64 = lo
        .trim()
        .parse()
        .map_err(|_| AisError::BadRequest(format!("bad range start {:?}", lo)))?;
    let hi: i64 = hi
        .trim()
        .parse()
        .map_err(|_| AisError::BadRequest(format!("bad range end {:?}", hi)))?;
    if hi < lo {
        return Err(AisError::BadRequest("range end precedes start".into()));
    }

    let prefix = &template[..open];
    let suffix = &template[close + 1..];
    let mut out = Vec::with_capacity((hi - lo + 1) as usize);
    for i in lo..=hi {
        let url = format!("{}{}{}", prefix, i, suffix);
        let obj_name = url
            .rsplit('/')
            .next()
            .unwrap_or(&url)
            .to_string();
        out.push((obj_name, url));
    }
    Ok(out)
}

/// Per-job error record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlErr {
    pub obj_name: String,
    pub reason: String,
}

/// One download job.
pub struct DlJob {
    pub id: String,
    pub bck: Bck,
    pub total: usize,
    pub(crate) throttler: Arc<Semaphore>,
    pending: AtomicI64,
    finished: AtomicI64,
    aborted: AtomicBool,
    errs: Mutex<Vec<DlErr>>,
    xact: Arc<BaseXact>,
}

impl DlJob {
    fn new(id: String, bck: Bck, total: usize, concurrency: usize, xact: Arc<BaseXact>) -> Self {
        Self {
            id,
            bck,
            total,
            throttler: Arc::new(Semaphore::new(concurrency.max(1))),
            pending: AtomicI64::new(0),
            finished: AtomicI64::new(0),
            aborted: AtomicBool::new(false),
            errs: Mutex::new(Vec::new()),
            xact,
        }
    }

    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn finished_cnt(&self) -> i64 {
        self.finished.load(Ordering::Relaxed)
    }

    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    fn inc_pending(&self) {
        self.pending.fetch_add(1, Ordering::Relaxed);
        self.xact.base().inc_pending();
    }

    fn sub_pending(&self, n: i64) {
        self.pending.fetch_sub(n, Ordering::Relaxed);
        self.xact.base().sub_pending(n);
    }

    /// Persist the terminal status of one task; called by the jogger once
    /// the task fully completes. `counted` is false when the job abort
    /// already dropped the task from the accepted set (its pending count
    /// was adjusted there).
    pub(crate) fn task_done(
        &self,
        task: &DlTask,
        status: DlTaskStatus,
        reason: Option<String>,
        counted: bool,
    ) {
        match status {
            DlTaskStatus::Done => {
                self.finished.fetch_add(1, Ordering::Relaxed);
                self.xact.base().objects_inc();
            }
            DlTaskStatus::Failed | DlTaskStatus::Aborted => {
                if let Some(reason) = reason {
                    self.errs.lock().push(DlErr {
                        obj_name: task.obj_name.clone(),
                        reason,
                    });
                }
            }
            _ => {}
        }
        if counted {
            self.sub_pending(1);
        }
    }

    pub fn status(&self) -> DlStatusResp {
        let errs = self.errs.lock().clone();
        let status = if self.aborted() {
            DlTaskStatus::Aborted
        } else if self.pending() > 0 {
            DlTaskStatus::Running
        } else if errs.is_empty() {
            DlTaskStatus::Done
        } else {
            DlTaskStatus::Failed
        };
        DlStatusResp {
            id: self.id.clone(),
            status,
            total: self.total,
            finished: self.finished_cnt(),
            pending: self.pending(),
            errors: errs,
        }
    }
}

/// Job status payload (`GET /v1/download?id=`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlStatusResp {
    pub id: String,
    pub status: DlTaskStatus,
    pub total: usize,
    pub finished: i64,
    pub pending: i64,
    pub errors: Vec<DlErr>,
}

/// Transfer seam; production fetches over HTTP, tests write canned bytes.
#[async_trait]
pub trait DlClient: Send + Sync {
    /// Stream `url` into `dst`. Must observe `cancel` within a bounded
    /// interval; a cancelled fetch returns the internal cancelled error.
    async fn fetch(&self, url: &str, dst: &Path, cancel: watch::Receiver<bool>) -> Result<u64>;
}

/// reqwest-backed transfer client.
pub struct HttpDlClient {
    client: reqwest::Client,
}

impl HttpDlClient {
    pub fn new(config: &DownloaderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AisError::Internal(format!("http client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DlClient for HttpDlClient {
    async fn fetch(&self, url: &str, dst: &Path, mut cancel: watch::Receiver<bool>) -> Result<u64> {
        let mut resp = self.client.get(url).send().await?.error_for_status()?;
        let mut file = tokio::fs::File::create(dst).await?;
        let mut written = 0u64;
        loop {
            tokio::select! {
                chunk = resp.chunk() => match chunk? {
                    Some(bytes) => {
                        file.write_all(&bytes).await?;
                        written += bytes.len() as u64;
                    }
                    None => break,
                },
                _ = cancel.changed() => {
                    return Err(AisError::Internal(CANCELLED_MSG.into()));
                }
            }
        }
        file.flush().await?;
        Ok(written)
    }
}

/// The downloader: one jogger per mountpath plus the job table. Runs
/// under a singleton `downloader` xaction renewed through the registry.
pub struct Downloader {
    config: DownloaderConfig,
    xact: Arc<BaseXact>,
    client: Arc<dyn DlClient>,
    contents: Arc<ContentRegistry>,
    mountpaths: Arc<MountpathManager>,
    jobs: Arc<RwLock<HashMap<String, Arc<DlJob>>>>,
    joggers: RwLock<HashMap<std::path::PathBuf, Arc<Jogger>>>,
    /// Cluster-placement filter: in a multi-target cluster every target
    /// receives the full job and keeps only the objects it owns by HRW.
    owner_filter: Option<Box<dyn Fn(&Bck, &str) -> bool + Send + Sync>>,
}

impl Downloader {
    pub fn new(
        config: DownloaderConfig,
        registry: &Registry,
        client: Arc<dyn DlClient>,
        contents: Arc<ContentRegistry>,
        mountpaths: Arc<MountpathManager>,
    ) -> Result<Arc<Self>> {
        let xact = BaseXact::new(
            format!("downloader-{}", uuid::Uuid::new_v4()),
            XactKind::Downloader,
            None,
        );
        let entry = Arc::clone(&xact) as Arc<dyn Xact>;
        // one downloader per target; a concurrent renew keeps the running
        // instance, making ours an unregistered duplicate handle
        let renewed = registry.renew_global(XactKind::Downloader, false, move || Ok(entry))?;
        if matches!(renewed, Renewed::Kept(_)) {
            return Err(AisError::Internal("downloader already running".into()));
        }

        let downloader = Arc::new(Self {
            config,
            xact,
            client,
            contents,
            mountpaths,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            joggers: RwLock::new(HashMap::new()),
            owner_filter: None,
        });
        downloader.refresh_joggers();
        Ok(downloader)
    }

    /// Install the HRW ownership filter (see `owner_filter`). Must be
    /// called before the first submit.
    pub fn with_owner_filter(
        mut self: Arc<Self>,
        filter: Box<dyn Fn(&Bck, &str) -> bool + Send + Sync>,
    ) -> Arc<Self> {
        if let Some(inner) = Arc::get_mut(&mut self) {
            inner.owner_filter = Some(filter);
        }
        self
    }

    /// Create (or re-create after a mountpath change) one jogger per
    /// enabled mountpath.
    pub fn refresh_joggers(&self) {
        let mut joggers = self.joggers.write();
        for mpath in self.mountpaths.available() {
            joggers.entry(mpath.path.clone()).or_insert_with(|| {
                Arc::new(Jogger::spawn(
                    Arc::clone(&mpath),
                    self.config.queue_size,
                    Arc::clone(&self.client),
                    Arc::clone(&self.contents),
                    Arc::clone(&self.jobs),
                ))
            });
        }
    }

    /// Submit a job; returns its id. Tasks are admitted to the jogger of
    /// their HRW mountpath; a full queue fails the submit.
    pub fn submit(&self, body: DlBody) -> Result<String> {
        body.bck.validate_name()?;
        let mut tasks: Vec<(String, String)> = match &body.spec {
            DlSpec::Single { url, obj_name } => vec![(obj_name.clone(), url.clone())],
            DlSpec::Multi { objects } => {
                objects.iter().map(|(o, u)| (o.clone(), u.clone())).collect()
            }
            DlSpec::Range { template } => expand_range_template(template)?,
        };
        if tasks.is_empty() {
            return Err(AisError::BadRequest("empty download job".into()));
        }
        if let Some(filter) = &self.owner_filter {
            tasks.retain(|(obj, _)| filter(&body.bck, obj));
        }

        let job_id = body
            .job_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let job = Arc::new(DlJob::new(
            job_id.clone(),
            body.bck.clone(),
            tasks.len(),
            self.config.job_concurrency,
            Arc::clone(&self.xact),
        ));
        self.jobs.write().insert(job_id.clone(), Arc::clone(&job));

        let mpaths = self.mountpaths.available();
        for (obj_name, url) in tasks {
            let mpath = hrw::hrw_mountpath(&mpaths, &body.bck, &obj_name)?;
            let jogger = self
                .joggers
                .read()
                .get(&mpath.path)
                .cloned()
                .ok_or(AisError::NoAvailableMountpath)?;
            let task = DlTask {
                job_id: job_id.clone(),
                uid: request_uid(&body.bck, &obj_name),
                url,
                bck: body.bck.clone(),
                obj_name,
            };
            if jogger.try_put(task)? {
                job.inc_pending();
            }
        }
        info!(job = %job_id, bck = %body.bck, total = job.total, "download job submitted");
        Ok(job_id)
    }

    pub fn status(&self, job_id: &str) -> Result<DlStatusResp> {
        let job = self
            .jobs
            .read()
            .get(job_id)
            .cloned()
            .ok_or_else(|| AisError::DownloadJobNotFound(job_id.to_string()))?;
        Ok(job.status())
    }

    /// Abort a job on every jogger: queued entries vanish from the
    /// pending count; the in-flight task is cancelled.
    pub fn abort_job(&self, job_id: &str) -> Result<()> {
        let job = self
            .jobs
            .read()
            .get(job_id)
            .cloned()
            .ok_or_else(|| AisError::DownloadJobNotFound(job_id.to_string()))?;
        job.aborted.store(true, Ordering::Relaxed);

        let joggers: Vec<_> = self.joggers.read().values().cloned().collect();
        let mut dropped = 0i64;
        for jogger in joggers {
            dropped += jogger.abort_job(job_id) as i64;
        }
        // dropped includes the in-flight task's uid when there is one
        // (set cleanup is postponed until completion); the jogger sees it
        // gone and skips its own decrement
        if dropped > 0 {
            job.sub_pending(dropped);
        }
        info!(job = %job_id, dropped, "download job aborted");
        Ok(())
    }

    /// Stop every jogger (process shutdown); running tasks are failed.
    pub async fn stop(&self) {
        let joggers: Vec<_> = self.joggers.read().values().cloned().collect();
        for jogger in joggers {
            jogger.stop().await;
        }
        self.xact.base().finish();
    }

    pub fn xact(&self) -> &Arc<BaseXact> {
        &self.xact
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    struct MockDlClient {
        payload: Vec<u8>,
        delay: Duration,
    }

    #[async_trait]
    impl DlClient for MockDlClient {
        async fn fetch(
            &self,
            _url: &str,
            dst: &Path,
            mut cancel: watch::Receiver<bool>,
        ) -> Result<u64> {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.changed() => {
                    // leave a partial workfile behind, as an interrupted
                    // stream would
                    tokio::fs::write(dst, &self.payload[..self.payload.len() / 2]).await?;
                    return Err(AisError::Internal(CANCELLED_MSG.into()));
                }
            }
            tokio::fs::write(dst, &self.payload).await?;
            Ok(self.payload.len() as u64)
        }
    }

    fn fixture(delay: Duration) -> (tempfile::TempDir, Arc<Downloader>) {
        let dir = tempdir().unwrap();
        let mp = dir.path().join("mp1");
        std::fs::create_dir(&mp).unwrap();
        let mountpaths = Arc::new(MountpathManager::new());
        mountpaths.add(&mp).unwrap();

        let registry = Registry::new();
        let downloader = Downloader::new(
            DownloaderConfig::default(),
            &registry,
            Arc::new(MockDlClient {
                payload: b"0123456789".to_vec(),
                delay,
            }),
            Arc::new(ContentRegistry::new()),
            mountpaths,
        )
        .unwrap();
        (dir, downloader)
    }

    async fn wait_done(downloader: &Downloader, job_id: &str) -> DlStatusResp {
        for _ in 0..200 {
            let status = downloader.status(job_id).unwrap();
            if status.pending == 0 {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not settle", job_id);
    }

    #[tokio::test]
    async fn test_single_download() {
        let (dir, downloader) = fixture(Duration::ZERO);
        let job_id = downloader
            .submit(DlBody {
                bck: Bck::ais("b1"),
                spec: DlSpec::Single {
                    url: "http://src/o1".into(),
                    obj_name: "o1".into(),
                },
                description: None,
                job_id: None,
            })
            .unwrap();

        let status = wait_done(&downloader, &job_id).await;
        assert_eq!(status.status, DlTaskStatus::Done);
        assert_eq!(status.finished, 1);

        let obj = dir.path().join("mp1/ais/b1/o1");
        assert_eq!(std::fs::read(obj).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_duplicate_task_dropped_silently() {
        let (_dir, downloader) = fixture(Duration::from_millis(50));
        let mut objects = HashMap::new();
        objects.insert("o1".to_string(), "http://src/o1".to_string());
        let body = DlBody {
            bck: Bck::ais("b1"),
            spec: DlSpec::Multi { objects },
            description: None,
            job_id: None,
        };
        let job_id = downloader.submit(body).unwrap();

        // a second submit of the same job id cannot happen via the API;
        // duplicate (job, uid) admission is exercised through the jogger
        let status = downloader.status(&job_id).unwrap();
        assert_eq!(status.pending, 1);
        wait_done(&downloader, &job_id).await;
    }

    #[tokio::test]
    async fn test_range_expansion() {
        let pairs = expand_range_template("http://h/shard-{3..5}.tar").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("shard-3.tar".to_string(), "http://h/shard-3.tar".to_string()),
                ("shard-4.tar".to_string(), "http://h/shard-4.tar".to_string()),
                ("shard-5.tar".to_string(), "http://h/shard-5.tar".to_string()),
            ]
        );
        assert!(expand_range_template("no-braces").is_err());
        assert!(expand_range_template("x{5..1}").is_err());
    }

    #[tokio::test]
    async fn test_abort_during_run() {
        let (dir, downloader) = fixture(Duration::from_secs(60));
        let mut objects = HashMap::new();
        for i in 0..5 {
            objects.insert(format!("o{}", i), format!("http://src/o{}", i));
        }
        let job_id = downloader
            .submit(DlBody {
                bck: Bck::ais("b4"),
                spec: DlSpec::Multi { objects },
                description: None,
                job_id: None,
            })
            .unwrap();

        // let the first task start
        tokio::time::sleep(Duration::from_millis(50)).await;
        downloader.abort_job(&job_id).unwrap();

        let status = wait_done(&downloader, &job_id).await;
        assert_eq!(status.status, DlTaskStatus::Aborted);
        assert_eq!(status.finished, 0);

        // the partial workfile of the cancelled task is removed
        tokio::time::sleep(Duration::from_millis(50)).await;
        let bucket_dir = dir.path().join("mp1/ais/b4");
        if let Ok(entries) = std::fs::read_dir(&bucket_dir) {
            for entry in entries.flatten() {
                panic!("leftover file {:?}", entry.path());
            }
        }
    }

    #[tokio::test]
    async fn test_status_unknown_job() {
        let (_dir, downloader) = fixture(Duration::ZERO);
        assert!(matches!(
            downloader.status("nope"),
            Err(AisError::DownloadJobNotFound(_))
        ));
        assert!(matches!(
            downloader.abort_job("nope"),
            Err(AisError::DownloadJobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_fails_running_task() {
        let (_dir, downloader) = fixture(Duration::from_secs(60));
        let job_id = downloader
            .submit(DlBody {
                bck: Bck::ais("b1"),
                spec: DlSpec::Single {
                    url: "http://src/slow".into(),
                    obj_name: "slow".into(),
                },
                description: None,
                job_id: None,
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        downloader.stop().await;

        let status = downloader.status(&job_id).unwrap();
        assert_eq!(status.pending, 0);
        assert!(downloader.xact().finished());
    }
}

//! Per-mountpath download jogger.
//!
//! Each jogger owns a bounded FIFO queue of single-object downloads, the
//! set of accepted `(job_id, request_uid)` pairs, and a single
//! current-task slot. At most one download runs per mountpath at any
//! instant.
//!
//! The set is the single source of truth for "this (job, request) is in
//! flight or queued": removal is postponed until a task fully completes,
//! which prevents re-admission of an in-flight task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{AisError, Result};
use crate::fs::content::CT_DOWNLOAD;
use crate::fs::{ContentRegistry, Mountpath};

use super::{DlClient, DlJob, DlTask, DlTaskStatus};

struct CurrentTask {
    job_id: String,
    uid: String,
    cancel: watch::Sender<bool>,
}

#[derive(Default)]
struct Accepted {
    /// job_id -> set of request uids queued or in flight.
    jobs: HashMap<String, HashSet<String>>,
    stopped: bool,
}

impl Accepted {
    fn contains(&self, job_id: &str, uid: &str) -> bool {
        self.jobs
            .get(job_id)
            .map(|uids| uids.contains(uid))
            .unwrap_or(false)
    }

    fn insert(&mut self, job_id: &str, uid: &str) {
        self.jobs
            .entry(job_id.to_string())
            .or_default()
            .insert(uid.to_string());
    }

    fn remove(&mut self, job_id: &str, uid: &str) -> bool {
        let Some(uids) = self.jobs.get_mut(job_id) else {
            return false;
        };
        let removed = uids.remove(uid);
        if uids.is_empty() {
            self.jobs.remove(job_id);
        }
        removed
    }

    fn remove_job(&mut self, job_id: &str) -> usize {
        self.jobs.remove(job_id).map(|uids| uids.len()).unwrap_or(0)
    }
}

struct JoggerState {
    accepted: RwLock<Accepted>,
    current: parking_lot::Mutex<Option<CurrentTask>>,
}

/// Handle to one jogger task.
pub struct Jogger {
    mpath: Arc<Mountpath>,
    tx: mpsc::Sender<DlTask>,
    state: Arc<JoggerState>,
    terminated: parking_lot::Mutex<Option<oneshot::Receiver<()>>>,
}

impl Jogger {
    pub fn spawn(
        mpath: Arc<Mountpath>,
        queue_size: usize,
        client: Arc<dyn DlClient>,
        contents: Arc<ContentRegistry>,
        jobs: Arc<RwLock<HashMap<String, Arc<DlJob>>>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_size);
        let state = Arc::new(JoggerState {
            accepted: RwLock::new(Accepted::default()),
            current: parking_lot::Mutex::new(None),
        });
        let (term_tx, term_rx) = oneshot::channel();

        let loop_state = Arc::clone(&state);
        let loop_mpath = Arc::clone(&mpath);
        tokio::spawn(async move {
            jog(loop_mpath, rx, loop_state, client, contents, jobs).await;
            let _ = term_tx.send(());
        });

        Self {
            mpath,
            tx,
            state,
            terminated: parking_lot::Mutex::new(Some(term_rx)),
        }
    }

    pub fn mpath(&self) -> &Arc<Mountpath> {
        &self.mpath
    }

    /// Queue admission. Duplicates and stopped queues drop silently
    /// (`Ok(false)`); a full queue is rejected with `DownloadQueueFull`.
    /// The caller increments the owning job's pending count on `Ok(true)`.
    pub fn try_put(&self, task: DlTask) -> Result<bool> {
        {
            let mut accepted = self.state.accepted.write();
            if accepted.stopped || accepted.contains(&task.job_id, &task.uid) {
                return Ok(false);
            }
            accepted.insert(&task.job_id, &task.uid);
        }
        match self.tx.try_send(task) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(task)) => {
                self.state.accepted.write().remove(&task.job_id, &task.uid);
                Err(AisError::DownloadQueueFull(
                    self.mpath.path.display().to_string(),
                ))
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                self.state.accepted.write().remove(&task.job_id, &task.uid);
                Ok(false)
            }
        }
    }

    /// True when any task of the job is queued or in flight here.
    pub fn pending(&self, job_id: &str) -> bool {
        if self.state.accepted.read().jobs.contains_key(job_id) {
            return true;
        }
        self.state
            .current
            .lock()
            .as_ref()
            .map(|t| t.job_id == job_id)
            .unwrap_or(false)
    }

    /// Abort all of a job's work on this mountpath: drop queued entries
    /// from the set (returning how many were dropped) and cancel the
    /// current task when it belongs to the job.
    pub fn abort_job(&self, job_id: &str) -> usize {
        let dropped = self.state.accepted.write().remove_job(job_id);
        let current = self.state.current.lock();
        if let Some(task) = current.as_ref() {
            if task.job_id == job_id {
                let _ = task.cancel.send(true);
            }
        }
        dropped
    }

    /// Stop the jogger: set the shutdown flag, cancel the running task,
    /// and wait for the loop to observe shutdown.
    pub async fn stop(&self) {
        info!(mpath = %self.mpath.path.display(), "stopping download jogger");
        {
            let mut accepted = self.state.accepted.write();
            accepted.stopped = true;
        }
        if let Some(task) = self.state.current.lock().as_ref() {
            let _ = task.cancel.send(true);
        }
        let rx = self.terminated.lock().take();
        if let Some(rx) = rx {
            let _ = rx.await;
        }
    }
}

/// The jogger loop: single worker, FIFO.
async fn jog(
    mpath: Arc<Mountpath>,
    mut rx: mpsc::Receiver<DlTask>,
    state: Arc<JoggerState>,
    client: Arc<dyn DlClient>,
    contents: Arc<ContentRegistry>,
    jobs: Arc<RwLock<HashMap<String, Arc<DlJob>>>>,
) {
    info!(mpath = %mpath.path.display(), "download jogger started");
    while let Some(task) = rx.recv().await {
        // the job may have been aborted between enqueue and dequeue
        if !state.accepted.read().contains(&task.job_id, &task.uid) {
            debug!(job = %task.job_id, obj = %task.obj_name, "discarding revoked task");
            continue;
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let stopped = {
            let accepted = state.accepted.read();
            accepted.stopped
        };
        let job = jobs.read().get(&task.job_id).cloned();
        if stopped {
            let existed = state.accepted.write().remove(&task.job_id, &task.uid);
            if let Some(job) = &job {
                job.task_done(
                    &task,
                    DlTaskStatus::Failed,
                    Some("jogger stopped".into()),
                    existed,
                );
            }
            break;
        }

        *state.current.lock() = Some(CurrentTask {
            job_id: task.job_id.clone(),
            uid: task.uid.clone(),
            cancel: cancel_tx,
        });

        let status = run_one(&mpath, &task, job.clone(), &client, &contents, cancel_rx).await;

        *state.current.lock() = None;
        // an aborted job has already been dropped from the set (and its
        // pending count adjusted); only a still-accepted task decrements
        let existed = state.accepted.write().remove(&task.job_id, &task.uid);
        if let Some(job) = &job {
            let reason = match &status {
                DlTaskStatus::Failed => Some("download failed".to_string()),
                DlTaskStatus::Aborted => Some("aborted".to_string()),
                _ => None,
            };
            job.task_done(&task, status, reason, existed);
        }
    }
    info!(mpath = %mpath.path.display(), "download jogger terminated");
}

async fn run_one(
    mpath: &Arc<Mountpath>,
    task: &DlTask,
    job: Option<Arc<DlJob>>,
    client: &Arc<dyn DlClient>,
    contents: &Arc<ContentRegistry>,
    mut cancel: watch::Receiver<bool>,
) -> DlTaskStatus {
    // per-job concurrency throttle; released when the permit drops after
    // the download completes
    let _permit = match &job {
        Some(job) => {
            let throttler = Arc::clone(&job.throttler);
            tokio::select! {
                permit = throttler.acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => return DlTaskStatus::Aborted,
                },
                _ = cancel.changed() => return DlTaskStatus::Aborted,
            }
        }
        None => None,
    };

    let final_fqn = crate::fs::fqn(mpath, &task.bck, &task.obj_name);
    let work_fqn = match contents.gen_workfile_fqn(&final_fqn, CT_DOWNLOAD) {
        Ok(fqn) => fqn,
        Err(e) => {
            warn!(error = %e, obj = %task.obj_name, "cannot derive workfile name");
            return DlTaskStatus::Failed;
        }
    };
    if let Some(parent) = work_fqn.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(error = %e, "cannot create bucket directory");
            return DlTaskStatus::Failed;
        }
    }

    match client.fetch(&task.url, &work_fqn, cancel).await {
        Ok(bytes) => match tokio::fs::rename(&work_fqn, &final_fqn).await {
            Ok(()) => {
                debug!(obj = %task.obj_name, bytes, "download finalized");
                DlTaskStatus::Done
            }
            Err(e) => {
                warn!(error = %e, obj = %task.obj_name, "finalize failed");
                let _ = tokio::fs::remove_file(&work_fqn).await;
                DlTaskStatus::Failed
            }
        },
        Err(e) => {
            // the partial workfile never becomes visible
            let _ = tokio::fs::remove_file(&work_fqn).await;
            if is_cancelled(&e) {
                DlTaskStatus::Aborted
            } else {
                warn!(error = %e, url = %task.url, "download failed");
                DlTaskStatus::Failed
            }
        }
    }
}

fn is_cancelled(err: &AisError) -> bool {
    matches!(err, AisError::Internal(msg) if msg == super::CANCELLED_MSG)
}

//! Filesystem health checker.
//!
//! Triggered whenever data-plane I/O fails with a potentially
//! disk-related error. The probe (1) confirms the filesystem is mounted
//! and writable, (2) reads up to N existing files from the mountpath
//! tree, (3) writes N random temporary files. Read and write error
//! limits are evaluated independently; exceeding either disables the
//! mountpath.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;
use tracing::{error, info, warn};

use crate::config::FshcConfig;
use crate::error::{is_broken_pipe, AisError};

use super::mountpath::MountpathManager;

/// Probe outcome for one mountpath.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FshcReport {
    pub mpath: PathBuf,
    pub read_errors: usize,
    pub write_errors: usize,
    pub files_read: usize,
    pub files_written: usize,
    pub disabled: bool,
}

pub struct FsHealthChecker {
    config: FshcConfig,
    mountpaths: Arc<MountpathManager>,
}

impl FsHealthChecker {
    pub fn new(config: FshcConfig, mountpaths: Arc<MountpathManager>) -> Self {
        Self { config, mountpaths }
    }

    /// Decide whether an I/O error is worth a probe. Network-side EOFs
    /// are not disk trouble.
    pub fn is_suspicious(err: &std::io::Error) -> bool {
        if is_broken_pipe(err) {
            return false;
        }
        matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::PermissionDenied
                | std::io::ErrorKind::Other
        ) || err.raw_os_error().is_some()
    }

    /// Run the probe against the mountpath owning `fqn` and disable it
    /// when either error limit is exceeded. Returns the report, or None
    /// when the path belongs to no registered mountpath.
    pub fn run(&self, fqn: &Path) -> Option<FshcReport> {
        if !self.config.enabled {
            return None;
        }
        let mpath = self.mountpaths.owner_of(fqn)?;
        let mut report = FshcReport {
            mpath: mpath.path.clone(),
            read_errors: 0,
            write_errors: 0,
            files_read: 0,
            files_written: 0,
            disabled: false,
        };

        // 1. mounted & writable
        if let Err(e) = std::fs::metadata(&mpath.path) {
            error!(mpath = %mpath.path.display(), error = %e, "mountpath unreachable");
            report.write_errors = self.config.error_limit_write;
        } else {
            self.probe_reads(&mpath.path, &mut report);
            self.probe_writes(&mpath.path, &mut report);
        }

        let over_read = report.read_errors >= self.config.error_limit_read;
        let over_write = report.write_errors >= self.config.error_limit_write;
        if over_read || over_write {
            warn!(
                mpath = %mpath.path.display(),
                read_errors = report.read_errors,
                write_errors = report.write_errors,
                "filesystem unhealthy, disabling mountpath"
            );
            match self.mountpaths.disable(&mpath.path) {
                Ok(()) => report.disabled = true,
                Err(AisError::NoAvailableMountpath) => {
                    error!(
                        mpath = %mpath.path.display(),
                        "last mountpath failed its health probe; keeping it enabled"
                    );
                }
                Err(e) => error!(error = %e, "failed to disable mountpath"),
            }
        } else {
            info!(
                mpath = %mpath.path.display(),
                files_read = report.files_read,
                files_written = report.files_written,
                "mountpath passed health probe"
            );
        }
        Some(report)
    }

    /// Read up to N existing files drawn from the mountpath tree.
    fn probe_reads(&self, root: &Path, report: &mut FshcReport) {
        let mut remaining = self.config.test_file_count;
        let mut stack = vec![root.to_path_buf()];
        let mut buf = vec![0u8; self.config.test_file_size];

        while let Some(dir) = stack.pop() {
            if remaining == 0 {
                break;
            }
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(_) => {
                    report.read_errors += 1;
                    continue;
                }
            };
            for entry in entries.flatten() {
                if remaining == 0 {
                    break;
                }
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                match std::fs::File::open(&path).and_then(|mut f| f.read(&mut buf)) {
                    Ok(_) => report.files_read += 1,
                    Err(_) => report.read_errors += 1,
                }
                remaining -= 1;
            }
        }
    }

    /// Write N random temporary files, then remove them.
    fn probe_writes(&self, root: &Path, report: &mut FshcReport) {
        let mut rng = rand::thread_rng();
        for _ in 0..self.config.test_file_count {
            let name = format!(".fshc-{:08x}", rng.gen::<u32>());
            let path = root.join(&name);
            let payload: Vec<u8> = (0..self.config.test_file_size)
                .map(|_| rng.gen::<u8>())
                .collect();
            let outcome = std::fs::File::create(&path).and_then(|mut f| {
                f.write_all(&payload)?;
                f.sync_all()
            });
            match outcome {
                Ok(()) => {
                    report.files_written += 1;
                    let _ = std::fs::remove_file(&path);
                }
                Err(_) => report.write_errors += 1,
            }
        }
    }
}

/// Convenience used by the target on data-path errors: run asynchronously,
/// the triggering request fails on its own terms.
pub fn trigger(checker: Arc<FsHealthChecker>, fqn: PathBuf) {
    tokio::task::spawn_blocking(move || {
        checker.run(&fqn);
    });
}

//! Error types for the aisd object storage core.
//!
//! This module provides a unified error type [`AisError`] for all node
//! operations, along with a convenient [`Result`] type alias.
//!
//! Errors carry enough classification to be mapped onto the HTTP surface:
//! every variant has an HTTP status code via [`AisError::status_code`],
//! and transient variants answer `true` to [`AisError::is_retryable`].

use std::io;
use thiserror::Error;

use crate::types::Bck;

/// Main error type for aisd operations.
#[derive(Error, Debug)]
pub enum AisError {
    // Bucket-level errors
    #[error("bucket {0} already exists")]
    BucketAlreadyExists(Bck),

    #[error("bucket {0} does not exist")]
    BucketDoesNotExist(Bck),

    #[error("remote bucket {0} does not exist")]
    RemoteBucketDoesNotExist(Bck),

    #[error("bucket {0} is busy")]
    BucketIsBusy(Bck),

    #[error("invalid bucket name {name:?}: {reason}")]
    InvalidBucketName { name: String, reason: String },

    // Xaction errors
    #[error("xaction {0} not found")]
    XactionNotFound(String),

    #[error("xaction {0} expired")]
    XactionExpired(String),

    #[error("xaction {kind} requires a bucket")]
    XactionRequiresBucket { kind: String },

    // Cluster / routing errors
    #[error("not the primary proxy; primary is at {primary_url}")]
    NotPrimary { primary_url: String },

    #[error("no registered targets in the cluster map")]
    NoTargets,

    #[error("node {0} not found in the cluster map")]
    NodeNotFound(String),

    // Mountpath / filesystem errors
    #[error("no available mountpath")]
    NoAvailableMountpath,

    #[error("mountpath {0} already registered")]
    MountpathAlreadyExists(String),

    #[error("mountpath {mpath} shares filesystem {fsid} with {other}")]
    MountpathDuplicateFs {
        mpath: String,
        fsid: u64,
        other: String,
    },

    #[error("mountpath {0} not found")]
    MountpathNotFound(String),

    #[error("filesystem unhealthy at {mpath}: {reason}")]
    FilesystemUnhealthy { mpath: String, reason: String },

    // Transaction errors
    #[error("transaction {uuid} aborted: {reason}")]
    TxnAborted { uuid: String, reason: String },

    #[error("transaction {0} not found")]
    TxnNotFound(String),

    #[error("transaction {0} timed out")]
    TxnTimeout(String),

    // Downloader errors
    #[error("download job {0} not found")]
    DownloadJobNotFound(String),

    #[error("download queue for mountpath {0} is full")]
    DownloadQueueFull(String),

    // Cloud backend errors
    #[error("cloud provider error (status {status}): {message}")]
    CloudError { status: u16, message: String },

    // Object-level errors
    #[error("object {bck}/{objname} not found")]
    ObjectNotFound { bck: Bck, objname: String },

    #[error("checksum mismatch for {objname}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        objname: String,
        expected: String,
        actual: String,
    },

    // Request / generic errors
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AisError {
    /// Map the error onto the HTTP status code surfaced to clients.
    pub fn status_code(&self) -> u16 {
        match self {
            AisError::BucketAlreadyExists(_) => 409,
            AisError::BucketDoesNotExist(_) | AisError::RemoteBucketDoesNotExist(_) => 404,
            AisError::BucketIsBusy(_) => 503,
            AisError::InvalidBucketName { .. } => 400,
            AisError::XactionNotFound(_) => 404,
            AisError::XactionExpired(_) => 410,
            AisError::XactionRequiresBucket { .. } => 400,
            AisError::NotPrimary { .. } => 307,
            AisError::NoTargets | AisError::NodeNotFound(_) => 503,
            AisError::NoAvailableMountpath => 500,
            AisError::MountpathAlreadyExists(_)
            | AisError::MountpathDuplicateFs { .. }
            | AisError::MountpathNotFound(_) => 400,
            AisError::FilesystemUnhealthy { .. } => 500,
            AisError::TxnAborted { .. } => 500,
            AisError::TxnNotFound(_) => 404,
            AisError::TxnTimeout(_) => 500,
            AisError::DownloadJobNotFound(_) => 404,
            AisError::DownloadQueueFull(_) => 503,
            AisError::CloudError { status, .. } => nearest_http_status(*status),
            AisError::ObjectNotFound { .. } => 404,
            AisError::ChecksumMismatch { .. } => 500,
            AisError::BadRequest(_) => 400,
            AisError::Timeout(_) => 408,
            AisError::Io(_) => 500,
            AisError::Serialization(_) => 500,
            AisError::Network(_) => 502,
            AisError::Internal(_) => 500,
        }
    }

    /// Transient errors that a client (or an inter-node RPC loop) may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AisError::BucketIsBusy(_)
                | AisError::Network(_)
                | AisError::Timeout(_)
                | AisError::NoTargets
                | AisError::DownloadQueueFull(_)
        )
    }

    /// Translate a cloud backend 404 on a bucket into the dedicated kind.
    pub fn from_cloud(status: u16, message: impl Into<String>, bck: &Bck) -> Self {
        if status == 404 {
            return AisError::RemoteBucketDoesNotExist(bck.clone());
        }
        AisError::CloudError {
            status,
            message: message.into(),
        }
    }
}

/// EOF / broken-pipe style failures from a cloud backend are a distinct,
/// retriable kind.
pub fn is_broken_pipe(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset
    )
}

pub fn is_connection_refused(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::ConnectionRefused
}

fn nearest_http_status(code: u16) -> u16 {
    if (100..=599).contains(&code) {
        code
    } else {
        500
    }
}

impl From<serde_json::Error> for AisError {
    fn from(e: serde_json::Error) -> Self {
        AisError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for AisError {
    fn from(e: serde_yaml::Error) -> Self {
        AisError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for AisError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AisError::Timeout(e.to_string())
        } else {
            AisError::Network(e.to_string())
        }
    }
}

/// Result type alias for aisd operations.
pub type Result<T> = std::result::Result<T, AisError>;

//! Transactional bucket operations.
//!
//! Bucket metadata mutations run a multi-phase protocol: the primary
//! proxy broadcasts `begin` to every target, mutates its BMD, metasyncs
//! the new version, then broadcasts `commit`. Any begin failure turns
//! into a broadcast `abort`; a commit failure triggers a type-specific
//! undo.
//!
//! This module holds the target-side transaction table and the phase
//! types; the proxy-side coordinator lives in [`proxy`].

pub mod proxy;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{AisError, Result};
use crate::types::{ActionMsg, Bck};

/// Protocol phase, the last path segment of `POST /v1/txn/<bucket>/...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnPhase {
    Begin,
    Commit,
    Abort,
}

impl TxnPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxnPhase::Begin => "begin",
            TxnPhase::Commit => "commit",
            TxnPhase::Abort => "abort",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "begin" => TxnPhase::Begin,
            "commit" => TxnPhase::Commit,
            "abort" => TxnPhase::Abort,
            _ => return None,
        })
    }
}

impl std::fmt::Display for TxnPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Target-side view of one transaction.
#[derive(Debug, Clone)]
pub struct Txn {
    pub uuid: String,
    pub action: String,
    pub bck: Bck,
    pub msg: ActionMsg,
    deadline: Instant,
}

impl Txn {
    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// Per-target table of prepared transactions.
///
/// State machine per entry: Idle -> Prepared (after begin) -> Committed |
/// Aborted. Prepared has a bounded lifetime: on deadline expiry the
/// target self-aborts and releases whatever the begin phase reserved.
pub struct TxnTable {
    prepared: Mutex<HashMap<String, Txn>>,
}

impl TxnTable {
    pub fn new() -> Self {
        Self {
            prepared: Mutex::new(HashMap::new()),
        }
    }

    /// Register a transaction in `Prepared` state.
    pub fn begin(&self, uuid: &str, action: &str, bck: &Bck, msg: ActionMsg, timeout: Duration) -> Result<()> {
        let mut prepared = self.prepared.lock();
        if prepared.contains_key(uuid) {
            return Err(AisError::BadRequest(format!(
                "transaction {} already prepared",
                uuid
            )));
        }
        prepared.insert(
            uuid.to_string(),
            Txn {
                uuid: uuid.to_string(),
                action: action.to_string(),
                bck: bck.clone(),
                msg,
                deadline: Instant::now() + timeout,
            },
        );
        debug!(uuid, action, "transaction prepared");
        Ok(())
    }

    /// Transition `Prepared -> Committed`; the entry is consumed.
    pub fn commit(&self, uuid: &str) -> Result<Txn> {
        let mut prepared = self.prepared.lock();
        let txn = prepared
            .remove(uuid)
            .ok_or_else(|| AisError::TxnNotFound(uuid.to_string()))?;
        if txn.expired(Instant::now()) {
            warn!(uuid, "commit after deadline; transaction was self-aborted");
            return Err(AisError::TxnTimeout(uuid.to_string()));
        }
        debug!(uuid, action = %txn.action, "transaction committed");
        Ok(txn)
    }

    /// Transition `Prepared -> Aborted`. Idempotent: aborting an unknown
    /// (already aborted or expired) transaction succeeds.
    pub fn abort(&self, uuid: &str) -> Option<Txn> {
        let txn = self.prepared.lock().remove(uuid);
        if let Some(txn) = &txn {
            debug!(uuid, action = %txn.action, "transaction aborted");
        }
        txn
    }

    pub fn get(&self, uuid: &str) -> Option<Txn> {
        self.prepared.lock().get(uuid).cloned()
    }

    pub fn len(&self) -> usize {
        self.prepared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Self-abort every transaction past its deadline; returns the
    /// abandoned entries so the caller can release reserved resources.
    pub fn housekeep(&self, now: Instant) -> Vec<Txn> {
        let mut prepared = self.prepared.lock();
        let expired: Vec<String> = prepared
            .values()
            .filter(|txn| txn.expired(now))
            .map(|txn| txn.uuid.clone())
            .collect();
        expired
            .iter()
            .filter_map(|uuid| {
                warn!(uuid = %uuid, "self-aborting expired transaction");
                prepared.remove(uuid)
            })
            .collect()
    }
}

impl Default for TxnTable {
    fn default() -> Self {
        Self::new()
    }
}

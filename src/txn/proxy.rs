//! Proxy-side coordination of transactional bucket operations.
//!
//! Every mutation follows the same template: acquire bucket name
//! lock(s), check preconditions on the local BMD snapshot, broadcast
//! `begin` to all targets, mutate the BMD under its writer lock,
//! metasync the new version, await the sync, then broadcast `commit`.
//! Begin failures broadcast `abort`; commit failures run a type-specific
//! undo that reverses the BMD mutation and metasyncs the reversal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::cluster::{MetaOwners, NameLockGuard, NameLocker, Smap, Snode};
use crate::config::TimeoutConf;
use crate::error::{AisError, Result};
use crate::metasync::{Metasyncer, Revs, RevsPayload};
use crate::types::{
    ActionMsg, Bck, BucketProps, MirrorConf, NodeId, PropsPatch, XactionMsg, ACT_RENAME_LB,
};

use super::TxnPhase;

/// Commit-event values carried in the `txn_event` query parameter.
pub const TXN_EVENT_METASYNC: &str = "metasync";
pub const TXN_EVENT_NONE: &str = "none";

/// One transactional RPC, broadcast to all targets.
#[derive(Debug, Clone)]
pub struct TxnReq {
    pub uuid: String,
    pub bck: Bck,
    pub phase: TxnPhase,
    pub msg: ActionMsg,
    pub txn_timeout: Duration,
    pub event: Option<String>,
}

/// Inter-node RPC seam. The HTTP implementation posts
/// `POST /v1/txn/<bucket>/<phase>` to each target's intra-control
/// endpoint; tests wire an in-process cluster.
#[async_trait]
pub trait TxnBroadcaster: Send + Sync {
    /// Broadcast the request; one result per target.
    async fn bcast_txn(
        &self,
        targets: &[Snode],
        req: &TxnReq,
        timeout: Duration,
    ) -> Vec<(NodeId, Result<()>)>;

    /// True while any target reports a matching running xaction.
    async fn xact_running(&self, targets: &[Snode], msg: &XactionMsg, timeout: Duration) -> bool;
}

/// The proxy's bucket-operations engine. Only the primary runs
/// transactions; every entry point checks primaryship first.
pub struct BucketOps {
    self_id: NodeId,
    owners: MetaOwners,
    metasyncer: Arc<Metasyncer>,
    locker: Arc<NameLocker>,
    bcast: Arc<dyn TxnBroadcaster>,
    timeouts: TimeoutConf,
    rebalance_enabled: bool,
}

impl BucketOps {
    pub fn new(
        self_id: NodeId,
        owners: MetaOwners,
        metasyncer: Arc<Metasyncer>,
        locker: Arc<NameLocker>,
        bcast: Arc<dyn TxnBroadcaster>,
        timeouts: TimeoutConf,
        rebalance_enabled: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            owners,
            metasyncer,
            locker,
            bcast,
            timeouts,
            rebalance_enabled,
        })
    }

    fn check_primary(&self, smap: &Smap) -> Result<()> {
        if smap.is_primary(&self.self_id) {
            return Ok(());
        }
        let primary_url = smap
            .primary()
            .map(|p| p.public_url.clone())
            .unwrap_or_default();
        Err(AisError::NotPrimary { primary_url })
    }

    fn targets(smap: &Smap) -> Vec<Snode> {
        smap.targets.values().cloned().collect()
    }

    fn prep_txn(&self, msg: &ActionMsg, bck: &Bck) -> (Arc<Smap>, TxnReq) {
        let smap = self.owners.smap.get();
        let req = TxnReq {
            uuid: uuid::Uuid::new_v4().to_string(),
            bck: bck.clone(),
            phase: TxnPhase::Begin,
            msg: msg.clone(),
            txn_timeout: self.timeouts.txn,
            event: None,
        };
        (smap, req)
    }

    /// Broadcast one phase; the first failure is returned.
    async fn bcast_phase(
        &self,
        smap: &Smap,
        req: &TxnReq,
        phase: TxnPhase,
        timeout: Duration,
    ) -> Result<()> {
        let mut req = req.clone();
        req.phase = phase;
        let results = self
            .bcast
            .bcast_txn(&Self::targets(smap), &req, timeout)
            .await;
        for (node, res) in results {
            if let Err(e) = res {
                warn!(txn = %req.uuid, phase = %phase, node = %node, error = %e, "phase failed");
                return Err(e);
            }
        }
        Ok(())
    }

    async fn abort_txn(&self, smap: &Smap, req: &TxnReq) {
        let mut req = req.clone();
        req.phase = TxnPhase::Abort;
        let _ = self
            .bcast
            .bcast_txn(&Self::targets(smap), &req, self.timeouts.cplane)
            .await;
    }

    /// create-bucket: check non-existence, begin, create locally,
    /// metasync, commit.
    pub async fn create_bucket(
        &self,
        msg: &ActionMsg,
        bck: &Bck,
        props: Option<BucketProps>,
    ) -> Result<()> {
        bck.validate_name()?;
        let smap = self.owners.smap.get();
        self.check_primary(&smap)?;
        let props = props.unwrap_or_else(BucketProps::default_props);

        let _nlp = self.locker.lock(bck).await;

        // 1. precondition
        if self.owners.bmd.get().contains(bck) {
            return Err(AisError::BucketAlreadyExists(bck.clone()));
        }

        // 2. begin
        let (smap, req) = self.prep_txn(msg, bck);
        if let Err(e) = self
            .bcast_phase(&smap, &req, TxnPhase::Begin, self.timeouts.cplane)
            .await
        {
            self.abort_txn(&smap, &req).await;
            return Err(e);
        }

        // 3. update BMD locally
        let guard = self.owners.bmd.lock().await;
        let mut clone = (*guard.get()).clone();
        if !clone.add(bck.clone(), props) {
            drop(guard);
            self.abort_txn(&smap, &req).await;
            return Err(AisError::BucketAlreadyExists(bck.clone()));
        }
        let bmd = guard.put(clone)?;

        // 4. metasync the new BMD; release the writer lock before waiting
        let handle = self.metasyncer.sync(
            Arc::clone(&smap),
            RevsPayload {
                pairs: vec![Revs::of(&*bmd)?],
                msg: msg.clone(),
            },
        );
        drop(guard);
        handle.wait().await;

        // 5. commit (must go through)
        if let Err(e) = self
            .bcast_phase(&smap, &req, TxnPhase::Commit, self.timeouts.long)
            .await
        {
            error!(bck = %bck, error = %e, "create commit failed, rolling back");
            self.undo_create_bucket(msg, bck).await;
            return Err(e);
        }
        info!(bck = %bck, "bucket created");
        Ok(())
    }

    /// destroy-bucket (ais) / evict-cb (cloud): single metasync, no
    /// begin/commit round.
    pub async fn destroy_bucket(&self, msg: &ActionMsg, bck: &Bck) -> Result<()> {
        let smap = self.owners.smap.get();
        self.check_primary(&smap)?;

        let _nlp = self.locker.lock(bck).await;

        let guard = self.owners.bmd.lock().await;
        if !guard.get().contains(bck) {
            return Err(AisError::BucketDoesNotExist(bck.clone()));
        }
        let mut clone = (*guard.get()).clone();
        clone.del(bck);
        let bmd = guard.put(clone)?;

        let handle = self.metasyncer.sync(
            Arc::clone(&smap),
            RevsPayload {
                pairs: vec![Revs::of(&*bmd)?],
                msg: msg.clone(),
            },
        );
        drop(guard);
        handle.wait().await;
        info!(bck = %bck, action = %msg.action, "bucket removed from BMD");
        Ok(())
    }

    /// make-n-copies: confirm existence, begin, update locally, metasync,
    /// commit. `copies == 1` disables mirroring (not an error).
    pub async fn make_n_copies(&self, msg: &ActionMsg, bck: &Bck, copies: i64) -> Result<()> {
        if copies < 1 {
            return Err(AisError::BadRequest(format!(
                "invalid number of copies: {}",
                copies
            )));
        }
        let smap = self.owners.smap.get();
        self.check_primary(&smap)?;

        let _nlp = self.locker.lock(bck).await;

        // 1. confirm existence
        if !self.owners.bmd.get().contains(bck) {
            return Err(AisError::BucketDoesNotExist(bck.clone()));
        }

        // 2. begin
        let (smap, req) = self.prep_txn(msg, bck);
        if let Err(e) = self
            .bcast_phase(&smap, &req, TxnPhase::Begin, self.timeouts.cplane)
            .await
        {
            self.abort_txn(&smap, &req).await;
            return Err(e);
        }

        // 3. update BMD locally
        let guard = self.owners.bmd.lock().await;
        let mut clone = (*guard.get()).clone();
        let Some(bprops) = clone.get(bck).cloned() else {
            drop(guard);
            self.abort_txn(&smap, &req).await;
            return Err(AisError::BucketDoesNotExist(bck.clone()));
        };
        let prev_mirror = bprops.mirror;
        let mut nprops = bprops;
        nprops.mirror.enabled = copies > 1;
        nprops.mirror.copies = copies;
        clone.set(bck, nprops);
        let bmd = guard.put(clone)?;

        // 4. metasync
        let handle = self.metasyncer.sync(
            Arc::clone(&smap),
            RevsPayload {
                pairs: vec![Revs::of(&*bmd)?],
                msg: msg.clone(),
            },
        );
        drop(guard);
        handle.wait().await;

        // 5. commit
        if let Err(e) = self
            .bcast_phase(&smap, &req, TxnPhase::Commit, self.timeouts.long)
            .await
        {
            error!(bck = %bck, error = %e, "make-n-copies commit failed, rolling back");
            self.undo_update_copies(msg, bck, prev_mirror).await;
            return Err(e);
        }
        Ok(())
    }

    /// set-props / reset-props: the complete new property set is computed
    /// server-side and validated before the begin phase.
    pub async fn set_bucket_props(
        &self,
        msg: &ActionMsg,
        bck: &Bck,
        patch: Option<&PropsPatch>,
    ) -> Result<()> {
        let smap = self.owners.smap.get();
        self.check_primary(&smap)?;

        let _nlp = self.locker.lock(bck).await;

        // 1. confirm existence
        let Some(bprops) = self.owners.bmd.get().get(bck).cloned() else {
            return Err(AisError::BucketDoesNotExist(bck.clone()));
        };

        // 2. begin, with the full new props in the message
        let nprops = match patch {
            Some(patch) => make_nprops(&bprops, patch, smap.count_targets())?,
            None => BucketProps::default_props(),
        };
        let mut nmsg = msg.clone();
        nmsg.value = serde_json::to_value(&nprops)?;
        let (smap, req) = self.prep_txn(&nmsg, bck);
        if let Err(e) = self
            .bcast_phase(&smap, &req, TxnPhase::Begin, self.timeouts.cplane)
            .await
        {
            self.abort_txn(&smap, &req).await;
            return Err(e);
        }

        // 3. update BMD locally, recomputing against the current props
        let guard = self.owners.bmd.lock().await;
        let mut clone = (*guard.get()).clone();
        let Some(cur) = clone.get(bck).cloned() else {
            drop(guard);
            self.abort_txn(&smap, &req).await;
            return Err(AisError::BucketDoesNotExist(bck.clone()));
        };
        let nprops = match patch {
            Some(patch) => make_nprops(&cur, patch, smap.count_targets())?,
            None => BucketProps::default_props(),
        };
        clone.set(bck, nprops);
        let bmd = guard.put(clone)?;

        // 4. metasync
        let handle = self.metasyncer.sync(
            Arc::clone(&smap),
            RevsPayload {
                pairs: vec![Revs::of(&*bmd)?],
                msg: nmsg.clone(),
            },
        );
        drop(guard);
        handle.wait().await;

        // 5. commit; set-props has no post-commit work and no undo
        let _ = self
            .bcast_phase(&smap, &req, TxnPhase::Commit, self.timeouts.long)
            .await;
        Ok(())
    }

    /// rename-bucket: mark the source renamed (read-sealed), add the
    /// destination, bump the RMD generation, and let rebalance migrate
    /// the data. Returns once committed; the name locks are held by a
    /// background waiter until rebalance finishes.
    pub async fn rename_bucket(self: &Arc<Self>, msg: &ActionMsg, from: &Bck, to: &Bck) -> Result<()> {
        to.validate_name()?;
        let smap = self.owners.smap.get();
        self.check_primary(&smap)?;
        if !self.rebalance_enabled {
            return Err(AisError::BadRequest(
                "bucket cannot be renamed: rebalance is disabled".into(),
            ));
        }

        let nlp_from = self.locker.try_lock(from)?;
        let nlp_to = self.locker.try_lock(to)?;

        // 1. confirm existence and non-existence
        {
            let bmd = self.owners.bmd.get();
            if !bmd.contains(from) {
                return Err(AisError::BucketDoesNotExist(from.clone()));
            }
            if bmd.contains(to) {
                return Err(AisError::BucketAlreadyExists(to.clone()));
            }
        }

        // 2. begin, with the destination in the message
        let mut nmsg = msg.clone();
        nmsg.value = serde_json::to_value(to)?;
        let (smap, req) = self.prep_txn(&nmsg, from);
        if let Err(e) = self
            .bcast_phase(&smap, &req, TxnPhase::Begin, self.timeouts.cplane)
            .await
        {
            self.abort_txn(&smap, &req).await;
            return Err(e);
        }

        // 3. update BMD: destination inherits the props; source is sealed
        let guard = self.owners.bmd.lock().await;
        let mut clone = (*guard.get()).clone();
        let Some(bprops) = clone.get(from).cloned() else {
            drop(guard);
            self.abort_txn(&smap, &req).await;
            return Err(AisError::BucketDoesNotExist(from.clone()));
        };
        let mut to_props = bprops.clone();
        to_props.renamed = None;
        if !clone.add(to.clone(), to_props) {
            drop(guard);
            self.abort_txn(&smap, &req).await;
            return Err(AisError::BucketAlreadyExists(to.clone()));
        }
        let mut from_props = bprops;
        from_props.renamed = Some(ACT_RENAME_LB.to_string());
        clone.set(from, from_props);
        let bmd = guard.put(clone)?;

        // 4. metasync the BMD
        let handle = self.metasyncer.sync(
            Arc::clone(&smap),
            RevsPayload {
                pairs: vec![Revs::of(&*bmd)?],
                msg: nmsg.clone(),
            },
        );
        drop(guard);
        handle.wait().await;

        // 5. bump RMD to trigger rebalance + resilver, then commit
        let rmd_guard = self.owners.rmd.lock().await;
        let mut rmd_clone = (*rmd_guard.get()).clone();
        rmd_clone.inc();
        rmd_clone.resilver = true;
        let rmd = rmd_guard.put(rmd_clone)?;

        let _ = self
            .bcast_phase(&smap, &req, TxnPhase::Commit, self.timeouts.long)
            .await;

        // 6. start rebalance cluster-wide
        let handle = self.metasyncer.sync(
            Arc::clone(&smap),
            RevsPayload {
                pairs: vec![Revs::of(&*rmd)?],
                msg: nmsg,
            },
        );
        drop(rmd_guard);
        handle.wait().await;

        // 7. wait for rebalance to finish, remove the sealed source from
        // the BMD, then release the name locks
        self.spawn_unlock_waiter(
            smap,
            XactionMsg {
                kind: "rebalance".to_string(),
                ..Default::default()
            },
            vec![nlp_from, nlp_to],
            Some(from.clone()),
        );
        info!(from = %from, to = %to, "bucket rename committed");
        Ok(())
    }

    /// copy-bucket: read-lock the source, write-lock the destination;
    /// the destination is created during the transaction iff absent.
    pub async fn copy_bucket(self: &Arc<Self>, msg: &ActionMsg, from: &Bck, to: &Bck) -> Result<()> {
        to.validate_name()?;
        let smap = self.owners.smap.get();
        self.check_primary(&smap)?;

        let nlp_from = self.locker.try_rlock(from)?;
        let nlp_to = self.locker.try_lock(to)?;

        // 1. confirm existence
        if !self.owners.bmd.get().contains(from) {
            return Err(AisError::BucketDoesNotExist(from.clone()));
        }

        // 2. begin
        let mut nmsg = msg.clone();
        nmsg.value = serde_json::to_value(to)?;
        let (smap, req) = self.prep_txn(&nmsg, from);
        if let Err(e) = self
            .bcast_phase(&smap, &req, TxnPhase::Begin, self.timeouts.cplane)
            .await
        {
            self.abort_txn(&smap, &req).await;
            return Err(e);
        }

        // 3. create the destination iff it does not exist yet
        let mut event = TXN_EVENT_NONE;
        {
            let guard = self.owners.bmd.lock().await;
            let mut clone = (*guard.get()).clone();
            if !clone.contains(to) {
                let Some(bprops) = clone.get(from).cloned() else {
                    drop(guard);
                    self.abort_txn(&smap, &req).await;
                    return Err(AisError::BucketDoesNotExist(from.clone()));
                };
                clone.add(to.clone(), bprops);
                let bmd = guard.put(clone)?;

                let handle = self.metasyncer.sync(
                    Arc::clone(&smap),
                    RevsPayload {
                        pairs: vec![Revs::of(&*bmd)?],
                        msg: nmsg.clone(),
                    },
                );
                drop(guard);
                handle.wait().await;
                event = TXN_EVENT_METASYNC;
            }
        }

        // 4. commit, carrying the event
        let mut commit_req = req.clone();
        commit_req.event = Some(event.to_string());
        let _ = self
            .bcast_phase(&smap, &commit_req, TxnPhase::Commit, self.timeouts.long)
            .await;

        // 5. wait for the copy xaction, then release the name locks
        self.spawn_unlock_waiter(
            smap,
            XactionMsg {
                kind: "copy-bck".to_string(),
                bck: Some(to.clone()),
                ..Default::default()
            },
            vec![nlp_from, nlp_to],
            None,
        );
        info!(from = %from, to = %to, "bucket copy committed");
        Ok(())
    }

    /// ec-encode: begin/commit only; the BMD is unchanged and each target
    /// renews its encoding xaction at commit.
    pub async fn ec_encode(&self, msg: &ActionMsg, bck: &Bck) -> Result<()> {
        let smap = self.owners.smap.get();
        self.check_primary(&smap)?;

        let _nlp = self.locker.try_lock(bck)?;
        let Some(bprops) = self.owners.bmd.get().get(bck).cloned() else {
            return Err(AisError::BucketDoesNotExist(bck.clone()));
        };
        if !bprops.ec.enabled {
            return Err(AisError::BadRequest(format!(
                "EC is not enabled for {}",
                bck
            )));
        }

        let (smap, req) = self.prep_txn(msg, bck);
        if let Err(e) = self
            .bcast_phase(&smap, &req, TxnPhase::Begin, self.timeouts.cplane)
            .await
        {
            self.abort_txn(&smap, &req).await;
            return Err(e);
        }
        self.bcast_phase(&smap, &req, TxnPhase::Commit, self.timeouts.long)
            .await
    }

    /// Poll the cluster until the xaction quiesces, finalize a rename
    /// (remove the sealed source from the BMD and metasync the removal),
    /// then drop the guards.
    fn spawn_unlock_waiter(
        self: &Arc<Self>,
        smap: Arc<Smap>,
        msg: XactionMsg,
        guards: Vec<NameLockGuard>,
        finalize_rename: Option<Bck>,
    ) {
        let this = Arc::clone(self);
        let poll = self.timeouts.cplane;
        tokio::spawn(async move {
            let targets = Self::targets(&smap);
            loop {
                tokio::time::sleep(poll).await;
                if !this.bcast.xact_running(&targets, &msg, poll).await {
                    break;
                }
            }
            if let Some(from) = finalize_rename {
                let guard = this.owners.bmd.lock().await;
                let mut clone = (*guard.get()).clone();
                if clone.del(&from) {
                    match guard.put(clone) {
                        Ok(bmd) => {
                            if let Ok(revs) = Revs::of(&*bmd) {
                                let handle = this.metasyncer.sync(
                                    Arc::clone(&smap),
                                    RevsPayload {
                                        pairs: vec![revs],
                                        msg: ActionMsg::new(ACT_RENAME_LB),
                                    },
                                );
                                drop(guard);
                                handle.wait().await;
                            }
                        }
                        Err(e) => error!(error = %e, "rename finalize failed"),
                    }
                }
            }
            drop(guards);
        });
    }

    // rollback helpers

    async fn undo_create_bucket(&self, msg: &ActionMsg, bck: &Bck) {
        let guard = self.owners.bmd.lock().await;
        let mut clone = (*guard.get()).clone();
        if !clone.del(bck) {
            return;
        }
        match guard.put(clone) {
            Ok(bmd) => {
                let payload = match Revs::of(&*bmd) {
                    Ok(revs) => RevsPayload {
                        pairs: vec![revs],
                        msg: msg.clone(),
                    },
                    Err(e) => {
                        error!(error = %e, "undo-create: cannot encode BMD");
                        return;
                    }
                };
                let _ = self.metasyncer.sync(self.owners.smap.get(), payload);
            }
            Err(e) => error!(error = %e, "undo-create failed"),
        }
    }

    async fn undo_update_copies(&self, msg: &ActionMsg, bck: &Bck, prev: MirrorConf) {
        let guard = self.owners.bmd.lock().await;
        let mut clone = (*guard.get()).clone();
        let Some(bprops) = clone.get(bck).cloned() else {
            return;
        };
        let mut nprops = bprops;
        nprops.mirror = prev;
        clone.set(bck, nprops);
        match guard.put(clone) {
            Ok(bmd) => {
                let payload = match Revs::of(&*bmd) {
                    Ok(revs) => RevsPayload {
                        pairs: vec![revs],
                        msg: msg.clone(),
                    },
                    Err(e) => {
                        error!(error = %e, "undo-copies: cannot encode BMD");
                        return;
                    }
                };
                let _ = self.metasyncer.sync(self.owners.smap.get(), payload);
            }
            Err(e) => error!(error = %e, "undo-copies failed"),
        }
    }
}

/// Merge a props patch into the current props and validate the result.
///
/// Once enabled, the EC configuration can only be disabled, never
/// changed. Enabling mirroring with one copy promotes to two; dropping
/// to one copy demotes mirroring to disabled.
pub fn make_nprops(
    bprops: &BucketProps,
    patch: &PropsPatch,
    target_cnt: usize,
) -> Result<BucketProps> {
    let mut nprops = bprops.apply(patch);

    if bprops.ec.enabled && nprops.ec.enabled {
        if nprops.ec != bprops.ec {
            return Err(AisError::BadRequest(
                "once enabled, EC configuration can only be disabled but cannot be changed".into(),
            ));
        }
    } else if nprops.ec.enabled {
        if nprops.ec.data_slices == 0 {
            nprops.ec.data_slices = 1;
        }
        if nprops.ec.parity_slices == 0 {
            nprops.ec.parity_slices = 1;
        }
        if nprops.ec.required_targets() > target_cnt as i64 {
            return Err(AisError::BadRequest(format!(
                "EC ({}+{}) requires at least {} targets, have {}",
                nprops.ec.data_slices,
                nprops.ec.parity_slices,
                nprops.ec.required_targets(),
                target_cnt
            )));
        }
    }

    if !bprops.mirror.enabled && nprops.mirror.enabled {
        if nprops.mirror.copies < 2 {
            nprops.mirror.copies = 2;
        }
    } else if nprops.mirror.copies < 2 {
        nprops.mirror.enabled = false;
    }

    Ok(nprops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeRole;
    use crate::metasync::SyncTransport;
    use crate::types::{EcConf, ACT_CREATE_BCK, ACT_MAKE_N_COPIES, ACT_SET_PROPS};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct NullTransport;

    #[async_trait]
    impl SyncTransport for NullTransport {
        async fn push(&self, _node: &Snode, _payload: &RevsPayload) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockBcast {
        log: Mutex<Vec<String>>,
        fail_begin: AtomicBool,
        fail_commit: AtomicBool,
    }

    #[async_trait]
    impl TxnBroadcaster for MockBcast {
        async fn bcast_txn(
            &self,
            targets: &[Snode],
            req: &TxnReq,
            _timeout: Duration,
        ) -> Vec<(NodeId, Result<()>)> {
            self.log
                .lock()
                .push(format!("{}:{}", req.phase, req.msg.action));
            targets
                .iter()
                .map(|t| {
                    let res = match req.phase {
                        TxnPhase::Begin if self.fail_begin.load(Ordering::Relaxed) => Err(
                            AisError::TxnAborted {
                                uuid: req.uuid.clone(),
                                reason: "begin rejected".into(),
                            },
                        ),
                        TxnPhase::Commit if self.fail_commit.load(Ordering::Relaxed) => Err(
                            AisError::TxnAborted {
                                uuid: req.uuid.clone(),
                                reason: "commit rejected".into(),
                            },
                        ),
                        _ => Ok(()),
                    };
                    (t.id.clone(), res)
                })
                .collect()
        }

        async fn xact_running(
            &self,
            _targets: &[Snode],
            _msg: &XactionMsg,
            _timeout: Duration,
        ) -> bool {
            false
        }
    }

    fn fixture() -> (Arc<BucketOps>, Arc<MockBcast>, MetaOwners) {
        let owners = MetaOwners::ephemeral();
        let mut smap = Smap::new();
        smap.add(Snode::new(
            "p1",
            NodeRole::Proxy,
            "http://p1",
            "http://p1c",
            "http://p1d",
        ));
        for i in 0..3 {
            smap.add(Snode::new(
                format!("t{}", i),
                NodeRole::Target,
                format!("http://t{}", i),
                format!("http://t{}c", i),
                format!("http://t{}d", i),
            ));
        }
        smap.set_primary("p1".to_string()).unwrap();
        owners.smap.try_apply(smap).unwrap();

        let bcast = Arc::new(MockBcast::default());
        let metasyncer = Arc::new(Metasyncer::new("p1".to_string(), Arc::new(NullTransport)));
        let ops = BucketOps::new(
            "p1".to_string(),
            owners.clone(),
            metasyncer,
            NameLocker::new(),
            Arc::clone(&bcast) as Arc<dyn TxnBroadcaster>,
            TimeoutConf {
                cplane: Duration::from_millis(10),
                ..Default::default()
            },
            true,
        );
        (ops, bcast, owners)
    }

    #[tokio::test]
    async fn test_create_success_runs_begin_then_commit() {
        let (ops, bcast, owners) = fixture();
        let bck = Bck::ais("b1");
        ops.create_bucket(&ActionMsg::new(ACT_CREATE_BCK), &bck, None)
            .await
            .unwrap();

        assert!(owners.bmd.get().contains(&bck));
        assert_eq!(
            *bcast.log.lock(),
            vec!["begin:create-bck".to_string(), "commit:create-bck".to_string()]
        );
    }

    #[tokio::test]
    async fn test_create_existing_fails_before_rpc() {
        let (ops, bcast, _owners) = fixture();
        let bck = Bck::ais("b1");
        ops.create_bucket(&ActionMsg::new(ACT_CREATE_BCK), &bck, None)
            .await
            .unwrap();
        bcast.log.lock().clear();

        let err = ops
            .create_bucket(&ActionMsg::new(ACT_CREATE_BCK), &bck, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AisError::BucketAlreadyExists(_)));
        assert!(bcast.log.lock().is_empty(), "no RPC after precondition");
    }

    #[tokio::test]
    async fn test_concurrent_creates_single_winner() {
        let (ops, _bcast, owners) = fixture();
        let bck = Bck::ais("b3");

        let mut handles = Vec::new();
        for _ in 0..10 {
            let ops = Arc::clone(&ops);
            let bck = bck.clone();
            handles.push(tokio::spawn(async move {
                ops.create_bucket(&ActionMsg::new(ACT_CREATE_BCK), &bck, None)
                    .await
            }));
        }
        let mut ok = 0;
        let mut exists = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => ok += 1,
                Err(AisError::BucketAlreadyExists(_)) => exists += 1,
                Err(other) => panic!("unexpected error {}", other),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(exists, 9);
        assert!(owners.bmd.get().contains(&bck));
    }

    #[tokio::test]
    async fn test_begin_failure_aborts() {
        let (ops, bcast, owners) = fixture();
        bcast.fail_begin.store(true, Ordering::Relaxed);

        let bck = Bck::ais("b1");
        let err = ops
            .create_bucket(&ActionMsg::new(ACT_CREATE_BCK), &bck, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AisError::TxnAborted { .. }));
        assert!(!owners.bmd.get().contains(&bck));
        assert_eq!(
            *bcast.log.lock(),
            vec!["begin:create-bck".to_string(), "abort:create-bck".to_string()]
        );
    }

    #[tokio::test]
    async fn test_commit_failure_undoes_create() {
        let (ops, bcast, owners) = fixture();
        bcast.fail_commit.store(true, Ordering::Relaxed);

        let bck = Bck::ais("b1");
        let err = ops
            .create_bucket(&ActionMsg::new(ACT_CREATE_BCK), &bck, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AisError::TxnAborted { .. }));
        // the BMD mutation was reversed
        assert!(!owners.bmd.get().contains(&bck));
        // version advanced twice: add + undo delete
        assert_eq!(owners.bmd.get().version, 2);
    }

    #[tokio::test]
    async fn test_destroy_then_recreate() {
        let (ops, _bcast, owners) = fixture();
        let bck = Bck::ais("b1");
        ops.create_bucket(&ActionMsg::new(ACT_CREATE_BCK), &bck, None)
            .await
            .unwrap();
        ops.destroy_bucket(&ActionMsg::new("destroy-bck"), &bck)
            .await
            .unwrap();
        assert!(!owners.bmd.get().contains(&bck));

        // destroy of a missing bucket
        let err = ops
            .destroy_bucket(&ActionMsg::new("destroy-bck"), &bck)
            .await
            .unwrap_err();
        assert!(matches!(err, AisError::BucketDoesNotExist(_)));

        // create-destroy-create succeeds and the bucket is fresh
        ops.create_bucket(&ActionMsg::new(ACT_CREATE_BCK), &bck, None)
            .await
            .unwrap();
        assert!(owners.bmd.get().contains(&bck));
    }

    #[tokio::test]
    async fn test_make_n_copies_boundaries() {
        let (ops, _bcast, owners) = fixture();
        let bck = Bck::ais("b1");
        ops.create_bucket(&ActionMsg::new(ACT_CREATE_BCK), &bck, None)
            .await
            .unwrap();

        ops.make_n_copies(&ActionMsg::new(ACT_MAKE_N_COPIES), &bck, 3)
            .await
            .unwrap();
        let props = owners.bmd.get().get(&bck).cloned().unwrap();
        assert!(props.mirror.enabled);
        assert_eq!(props.mirror.copies, 3);

        // one copy disables mirroring, not an error
        ops.make_n_copies(&ActionMsg::new(ACT_MAKE_N_COPIES), &bck, 1)
            .await
            .unwrap();
        let props = owners.bmd.get().get(&bck).cloned().unwrap();
        assert!(!props.mirror.enabled);
        assert_eq!(props.mirror.copies, 1);

        assert!(ops
            .make_n_copies(&ActionMsg::new(ACT_MAKE_N_COPIES), &bck, 0)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_set_props_ec_immutable() {
        let (ops, _bcast, owners) = fixture();
        let bck = Bck::ais("b1");
        ops.create_bucket(&ActionMsg::new(ACT_CREATE_BCK), &bck, None)
            .await
            .unwrap();

        // enable EC 1+1
        let patch = PropsPatch {
            ec: Some(EcConf {
                enabled: true,
                data_slices: 1,
                parity_slices: 1,
            }),
            ..Default::default()
        };
        ops.set_bucket_props(&ActionMsg::new(ACT_SET_PROPS), &bck, Some(&patch))
            .await
            .unwrap();
        assert!(owners.bmd.get().get(&bck).unwrap().ec.enabled);

        // reconfiguring slice counts is rejected
        let patch = PropsPatch {
            ec: Some(EcConf {
                enabled: true,
                data_slices: 2,
                parity_slices: 1,
            }),
            ..Default::default()
        };
        assert!(ops
            .set_bucket_props(&ActionMsg::new(ACT_SET_PROPS), &bck, Some(&patch))
            .await
            .is_err());

        // disabling is allowed
        let patch = PropsPatch {
            ec: Some(EcConf {
                enabled: false,
                data_slices: 1,
                parity_slices: 1,
            }),
            ..Default::default()
        };
        ops.set_bucket_props(&ActionMsg::new(ACT_SET_PROPS), &bck, Some(&patch))
            .await
            .unwrap();
        assert!(!owners.bmd.get().get(&bck).unwrap().ec.enabled);
    }

    #[tokio::test]
    async fn test_rename_seals_source_and_bumps_rmd() {
        let (ops, _bcast, owners) = fixture();
        let from = Bck::ais("b1");
        let to = Bck::ais("b2");
        ops.create_bucket(&ActionMsg::new(ACT_CREATE_BCK), &from, None)
            .await
            .unwrap();

        ops.rename_bucket(&ActionMsg::new(ACT_RENAME_LB), &from, &to)
            .await
            .unwrap();

        let bmd = owners.bmd.get();
        assert!(bmd.contains(&to));
        assert!(bmd.contains(&from), "source stays in BMD until rebalance");
        assert!(!bmd.is_readable(&from), "source is read-sealed");
        assert!(bmd.is_readable(&to));
        assert_eq!(owners.rmd.get().version, 1);
        assert!(owners.rmd.get().resilver);

        // once rebalance quiesces, the waiter removes the sealed source
        tokio::time::sleep(Duration::from_millis(200)).await;
        let bmd = owners.bmd.get();
        assert!(!bmd.contains(&from));
        assert!(bmd.contains(&to));
    }

    #[tokio::test]
    async fn test_rename_missing_or_conflicting() {
        let (ops, _bcast, _owners) = fixture();
        let from = Bck::ais("b1");
        let to = Bck::ais("b2");
        assert!(matches!(
            ops.rename_bucket(&ActionMsg::new(ACT_RENAME_LB), &from, &to)
                .await,
            Err(AisError::BucketDoesNotExist(_))
        ));

        ops.create_bucket(&ActionMsg::new(ACT_CREATE_BCK), &from, None)
            .await
            .unwrap();
        ops.create_bucket(&ActionMsg::new(ACT_CREATE_BCK), &to, None)
            .await
            .unwrap();
        assert!(matches!(
            ops.rename_bucket(&ActionMsg::new(ACT_RENAME_LB), &from, &to)
                .await,
            Err(AisError::BucketAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_busy_bucket() {
        let (ops, _bcast, _owners) = fixture();
        let from = Bck::ais("b1");
        let to = Bck::ais("b2");
        ops.create_bucket(&ActionMsg::new(ACT_CREATE_BCK), &from, None)
            .await
            .unwrap();

        let held = ops.locker.try_lock(&from).unwrap();
        assert!(matches!(
            ops.rename_bucket(&ActionMsg::new(ACT_RENAME_LB), &from, &to)
                .await,
            Err(AisError::BucketIsBusy(_))
        ));
        drop(held);
    }

    #[tokio::test]
    async fn test_copy_creates_missing_destination() {
        let (ops, _bcast, owners) = fixture();
        let from = Bck::ais("src");
        let to = Bck::ais("dst");
        ops.create_bucket(&ActionMsg::new(ACT_CREATE_BCK), &from, None)
            .await
            .unwrap();

        ops.copy_bucket(&ActionMsg::new("copy-bck"), &from, &to)
            .await
            .unwrap();
        assert!(owners.bmd.get().contains(&to));
        // source remains readable (copy takes a read lock only)
        assert!(owners.bmd.get().is_readable(&from));
    }

    #[tokio::test]
    async fn test_not_primary_redirects() {
        let (_ops, bcast, owners) = fixture();
        let metasyncer = Arc::new(Metasyncer::new("p2".to_string(), Arc::new(NullTransport)));
        let backup = BucketOps::new(
            "p2".to_string(),
            owners.clone(),
            metasyncer,
            NameLocker::new(),
            bcast as Arc<dyn TxnBroadcaster>,
            TimeoutConf::default(),
            true,
        );
        let err = backup
            .create_bucket(&ActionMsg::new(ACT_CREATE_BCK), &Bck::ais("b1"), None)
            .await
            .unwrap_err();
        match err {
            AisError::NotPrimary { primary_url } => assert_eq!(primary_url, "http://p1"),
            other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn test_make_nprops_mirror_rules() {
        let props = BucketProps::default_props();
        // enabling with 1 copy promotes to 2
        let patch = PropsPatch {
            mirror: Some(MirrorConf {
                enabled: true,
                copies: 1,
            }),
            ..Default::default()
        };
        let nprops = make_nprops(&props, &patch, 3).unwrap();
        assert!(nprops.mirror.enabled);
        assert_eq!(nprops.mirror.copies, 2);

        // dropping to one copy demotes to disabled
        let enabled = nprops;
        let patch = PropsPatch {
            mirror: Some(MirrorConf {
                enabled: true,
                copies: 1,
            }),
            ..Default::default()
        };
        let nprops = make_nprops(&enabled, &patch, 3).unwrap();
        assert!(!nprops.mirror.enabled);
    }

    #[test]
    fn test_make_nprops_ec_needs_targets() {
        let props = BucketProps::default_props();
        let patch = PropsPatch {
            ec: Some(EcConf {
                enabled: true,
                data_slices: 4,
                parity_slices: 2,
            }),
            ..Default::default()
        };
        // 4+2 EC needs 7 targets
        assert!(make_nprops(&props, &patch, 3).is_err());
        assert!(make_nprops(&props, &patch, 7).is_ok());
    }
}

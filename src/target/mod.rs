//! The storage target: object I/O against local mountpaths, cold GETs
//! from cloud backends, replica management, and the target side of the
//! bucket transaction protocol.

pub mod lom;
pub mod server;

pub use lom::{body_checksum, Lom};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::backend::BackendRegistry;
use crate::cluster::{Bmd, MetaOwners, Snode};
use crate::error::{AisError, Result};
use crate::fs::content::CT_DEFAULT;
use crate::fs::{bucket_dir, fqn, ContentRegistry, FsHealthChecker, MountpathManager};
use crate::hrw;
use crate::metasync::{MetaReceiver, RevsPayload};
use crate::txn::{TxnPhase, TxnTable};
use crate::types::{ActionMsg, Bck, BucketEntry, BucketList, SelectMsg, ACT_CREATE_BCK,
    ACT_COPY_BCK, ACT_EC_ENCODE, ACT_MAKE_N_COPIES, ACT_RENAME_LB, ACT_SET_PROPS,
    ACT_RESET_PROPS};
use crate::xact::{BaseXact, Registry, Renewed, Xact, XactKind};

/// Fetch an object from a peer target (rebalance catch-up reads).
#[async_trait]
pub trait NeighborClient: Send + Sync {
    async fn fetch(&self, node: &Snode, bck: &Bck, name: &str) -> Result<Bytes>;
}

/// The storage target node.
pub struct Target {
    node: Snode,
    owners: MetaOwners,
    pub mountpaths: Arc<MountpathManager>,
    pub contents: Arc<ContentRegistry>,
    pub registry: Arc<Registry>,
    pub txns: TxnTable,
    pub backends: BackendRegistry,
    fshc: Arc<FsHealthChecker>,
    receiver: MetaReceiver,
    neighbors: parking_lot::Mutex<Option<Arc<dyn NeighborClient>>>,
    /// Weak self-reference; lets background tasks reach the full target
    /// without keeping it alive past shutdown.
    self_arc: parking_lot::Mutex<std::sync::Weak<Self>>,
}

impl Target {
    pub fn new(
        node: Snode,
        owners: MetaOwners,
        mountpaths: Arc<MountpathManager>,
        contents: Arc<ContentRegistry>,
        registry: Arc<Registry>,
        fshc: Arc<FsHealthChecker>,
    ) -> Arc<Self> {
        let receiver = MetaReceiver {
            owners: owners.clone(),
        };
        let target = Arc::new(Self {
            node,
            owners,
            mountpaths,
            contents,
            registry,
            txns: TxnTable::new(),
            backends: BackendRegistry::new(),
            fshc,
            receiver,
            neighbors: parking_lot::Mutex::new(None),
            self_arc: parking_lot::Mutex::new(std::sync::Weak::new()),
        });
        *target.self_arc.lock() = Arc::downgrade(&target);
        target
    }

    pub fn node(&self) -> &Snode {
        &self.node
    }

    pub fn owners(&self) -> &MetaOwners {
        &self.owners
    }

    pub fn set_neighbor_client(&self, client: Arc<dyn NeighborClient>) {
        *self.neighbors.lock() = Some(client);
    }

    /// Bucket must exist and be readable (not sealed by a rename); remote
    /// buckets with a configured backend pass without a BMD entry.
    fn check_bucket(&self, bck: &Bck) -> Result<()> {
        let bmd = self.owners.bmd.get();
        if bmd.is_readable(bck) {
            return Ok(());
        }
        if bmd.contains(bck) {
            // present but renamed: read-sealed
            return Err(AisError::BucketDoesNotExist(bck.clone()));
        }
        if bck.is_remote() && self.backends.has(bck.provider) {
            return Ok(());
        }
        Err(AisError::BucketDoesNotExist(bck.clone()))
    }

    fn validate_objname(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(AisError::BadRequest("empty object name".into()));
        }
        if name
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == ".." || ContentRegistry::is_workfile_name(seg))
        {
            return Err(AisError::BadRequest(format!("invalid object name {:?}", name)));
        }
        Ok(())
    }

    // object data path

    /// PUT: stream to a workfile, checksum, finalize with an atomic
    /// rename, then replicate per the bucket's mirror policy.
    pub async fn put_object(&self, bck: &Bck, name: &str, body: Bytes) -> Result<Lom> {
        Self::validate_objname(name)?;
        self.check_bucket(bck)?;

        let mpaths = self.mountpaths.available();
        let mpath = hrw::hrw_mountpath(&mpaths, bck, name)?;
        let final_fqn = fqn(&mpath, bck, name);
        let work_fqn = self.contents.gen_workfile_fqn(&final_fqn, CT_DEFAULT)?;
        if let Some(parent) = work_fqn.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if let Err(e) = tokio::fs::write(&work_fqn, &body).await {
            self.maybe_fshc(&e, work_fqn.clone());
            return Err(e.into());
        }
        tokio::fs::rename(&work_fqn, &final_fqn).await?;

        let mut lom = Lom::new(bck.clone(), name, body.len() as u64, body_checksum(&body));
        lom.add_copy(&mpath);

        // write-through to the cloud for remote buckets
        if bck.is_remote() {
            let backend = self.backends.get(bck.provider)?;
            lom.version = backend.put_obj(bck, name, body.clone()).await?;
        }

        // local mirroring
        let props = self.owners.bmd.get().get(bck).cloned();
        if let Some(props) = props {
            if props.mirror.enabled {
                let want = props.mirror.copies.max(1) as usize;
                self.replicate(&mut lom, &final_fqn, want).await?;
            }
        }

        lom.persist(&mpath)?;
        debug!(bck = %bck, obj = %name, size = lom.size, "object stored");
        Ok(lom)
    }

    /// Copy the object onto additional mountpaths until it has `want`
    /// replicas (bounded by the number of ready mountpaths).
    async fn replicate(&self, lom: &mut Lom, src_fqn: &std::path::Path, want: usize) -> Result<()> {
        let mpaths = self.mountpaths.available();
        for mpath in mpaths.iter() {
            if lom.copies.len() >= want {
                break;
            }
            if lom.copies.contains(&mpath.path) {
                continue;
            }
            let dst = fqn(mpath, &lom.bck, &lom.obj_name);
            if let Some(parent) = dst.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(src_fqn, &dst).await?;
            lom.add_copy(mpath);
        }
        Ok(())
    }

    /// GET: serve from the HRW mountpath; fall back to a replica when
    /// the home read fails (kicking FSHC); cold-GET from the backend on
    /// a miss in a remote-backed bucket.
    pub async fn get_object(&self, bck: &Bck, name: &str) -> Result<(Bytes, Lom)> {
        Self::validate_objname(name)?;
        self.check_bucket(bck)?;

        let mpaths = self.mountpaths.available();
        let mpath = hrw::hrw_mountpath(&mpaths, bck, name)?;
        let home_fqn = fqn(&mpath, bck, name);

        match tokio::fs::read(&home_fqn).await {
            Ok(body) => {
                let lom = Lom::load(&mpath, bck, name).unwrap_or_else(|| {
                    let mut lom =
                        Lom::new(bck.clone(), name, body.len() as u64, body_checksum(&body));
                    lom.add_copy(&mpath);
                    lom
                });
                return Ok((Bytes::from(body), lom));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                self.maybe_fshc(&e, home_fqn.clone());
                // fall through to the replicas
            }
        }

        // replica fallback: any other mountpath holding a copy
        for other in mpaths.iter().filter(|m| m.path != mpath.path) {
            let alt = fqn(other, bck, name);
            if let Ok(body) = tokio::fs::read(&alt).await {
                warn!(bck = %bck, obj = %name, mpath = %other.path.display(), "served from replica");
                let lom = Lom::load(other, bck, name).unwrap_or_else(|| {
                    let mut lom =
                        Lom::new(bck.clone(), name, body.len() as u64, body_checksum(&body));
                    lom.add_copy(other);
                    lom
                });
                return Ok((Bytes::from(body), lom));
            }
        }

        // cold GET from the cloud
        if bck.is_remote() && self.backends.has(bck.provider) {
            return self.cold_get(bck, name, &mpath).await;
        }

        // rebalance catch-up: the current HRW owner may already hold it
        if let Some(body) = self.get_from_neighbor(bck, name).await {
            let lom = Lom::new(bck.clone(), name, body.len() as u64, body_checksum(&body));
            return Ok((body, lom));
        }

        Err(AisError::ObjectNotFound {
            bck: bck.clone(),
            objname: name.to_string(),
        })
    }

    /// Cold GET: fetch from the backend, stream into a workfile, compute
    /// the checksum, finalize by atomic rename.
    async fn cold_get(
        &self,
        bck: &Bck,
        name: &str,
        mpath: &Arc<crate::fs::Mountpath>,
    ) -> Result<(Bytes, Lom)> {
        let backend = self.backends.get(bck.provider)?;
        let (body, meta) = backend.get_obj(bck, name).await?;

        let final_fqn = fqn(mpath, bck, name);
        let work_fqn = self.contents.gen_workfile_fqn(&final_fqn, CT_DEFAULT)?;
        if let Some(parent) = work_fqn.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&work_fqn, &body).await?;
        tokio::fs::rename(&work_fqn, &final_fqn).await?;

        let mut lom = Lom::new(bck.clone(), name, body.len() as u64, body_checksum(&body));
        lom.version = meta.version;
        lom.add_copy(mpath);
        lom.persist(mpath)?;
        info!(bck = %bck, obj = %name, size = lom.size, "cold GET");
        Ok((body, lom))
    }

    async fn get_from_neighbor(&self, bck: &Bck, name: &str) -> Option<Bytes> {
        let client = self.neighbors.lock().clone()?;
        let rebalancing = self
            .registry
            .get_running(&crate::xact::XactQuery::by_kind(XactKind::Rebalance))
            .is_some();
        if !rebalancing {
            return None;
        }
        let smap = self.owners.smap.get();
        let owner = hrw::hrw_target(&smap, bck, name).ok()?;
        if owner.id == self.node.id {
            return None;
        }
        client.fetch(owner, bck, name).await.ok()
    }

    pub async fn head_object(&self, bck: &Bck, name: &str) -> Result<Lom> {
        let (_, lom) = self.get_object(bck, name).await?;
        Ok(lom)
    }

    pub async fn delete_object(&self, bck: &Bck, name: &str) -> Result<()> {
        Self::validate_objname(name)?;
        self.check_bucket(bck)?;

        let mpaths = self.mountpaths.available();
        let mut found = false;
        for mpath in mpaths.iter() {
            let path = fqn(mpath, bck, name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => found = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            if let Some(lom) = Lom::load(mpath, bck, name) {
                lom.remove(mpath);
            }
        }
        if bck.is_remote() && self.backends.has(bck.provider) {
            self.backends.get(bck.provider)?.delete_obj(bck, name).await?;
            found = true;
        }
        if !found {
            return Err(AisError::ObjectNotFound {
                bck: bck.clone(),
                objname: name.to_string(),
            });
        }
        Ok(())
    }

    /// Paged object listing. Local walk for ais buckets; pass-through to
    /// the backend for remote buckets unless only cached objects are
    /// requested. Workfiles never appear in the output.
    pub async fn list_objects(&self, bck: &Bck, msg: &SelectMsg) -> Result<BucketList> {
        self.check_bucket(bck)?;
        if bck.is_remote() && !msg.cached {
            let backend = self.backends.get(bck.provider)?;
            return backend.list_objects(bck, msg).await;
        }

        let mut names: Vec<String> = Vec::new();
        for mpath in self.mountpaths.available() {
            let root = bucket_dir(&mpath, bck);
            walk_objects(&root, &root, &mut names);
        }
        names.sort();
        names.dedup();

        let page_size = msg.effective_page_size();
        let mut entries = Vec::with_capacity(page_size.min(names.len()));
        let mut page_marker = String::new();
        for name in names
            .into_iter()
            .filter(|n| n.starts_with(&msg.prefix))
            .skip_while(|n| !msg.page_marker.is_empty() && n <= &msg.page_marker)
        {
            if entries.len() == page_size {
                page_marker = entries
                    .last()
                    .map(|e: &BucketEntry| e.name.clone())
                    .unwrap_or_default();
                break;
            }
            let size = self.stat_object(bck, &name).await;
            let checksum = self
                .lom_of(bck, &name)
                .map(|lom| lom.checksum)
                .unwrap_or_default();
            entries.push(BucketEntry {
                name,
                size,
                checksum,
                atime: None,
                version: String::new(),
            });
        }
        Ok(BucketList {
            entries,
            page_marker,
        })
    }

    /// Unfiltered local view: every object name present on any mountpath,
    /// with its size. Used by movers that must see sealed buckets.
    fn list_local(&self, bck: &Bck) -> Vec<BucketEntry> {
        let mut names: Vec<String> = Vec::new();
        for mpath in self.mountpaths.available() {
            let root = bucket_dir(&mpath, bck);
            walk_objects(&root, &root, &mut names);
        }
        names.sort();
        names.dedup();
        names
            .into_iter()
            .map(|name| {
                let size = self
                    .mountpaths
                    .available()
                    .iter()
                    .find_map(|mpath| std::fs::metadata(fqn(mpath, bck, &name)).ok())
                    .map(|m| m.len())
                    .unwrap_or(0);
                BucketEntry {
                    name,
                    size,
                    checksum: String::new(),
                    atime: None,
                    version: String::new(),
                }
            })
            .collect()
    }

    async fn stat_object(&self, bck: &Bck, name: &str) -> u64 {
        for mpath in self.mountpaths.available() {
            if let Ok(meta) = tokio::fs::metadata(fqn(&mpath, bck, name)).await {
                return meta.len();
            }
        }
        0
    }

    fn lom_of(&self, bck: &Bck, name: &str) -> Option<Lom> {
        self.mountpaths
            .available()
            .iter()
            .find_map(|mpath| Lom::load(mpath, bck, name))
    }

    fn maybe_fshc(&self, err: &std::io::Error, path: PathBuf) {
        if FsHealthChecker::is_suspicious(err) {
            crate::fs::fshc::trigger(Arc::clone(&self.fshc), path);
        }
    }

    // control plane

    /// Apply a metasync payload; on BMD changes, clean up buckets that
    /// vanished; on RMD changes, renew the rebalance xaction.
    pub async fn receive_meta(&self, payload: &RevsPayload) -> Result<Vec<String>> {
        let prev_bmd = self.owners.bmd.get();
        let applied = self.receiver.apply(payload)?;
        if applied.iter().any(|tag| tag == "bmd") {
            self.on_bmd_applied(&prev_bmd).await;
        }
        if applied.iter().any(|tag| tag == "rmd") {
            self.on_rmd_applied();
        }
        Ok(applied)
    }

    async fn on_bmd_applied(&self, prev: &Bmd) {
        let cur = self.owners.bmd.get();
        let gone: Vec<Bck> = prev
            .buckets
            .keys()
            .filter(|bck| !cur.contains(bck))
            .cloned()
            .collect();
        if gone.is_empty() {
            return;
        }
        self.registry.abort_buckets(&gone);
        for bck in &gone {
            // evicted cloud buckets keep their cloud data; both lose the
            // local tree
            self.cleanup_bucket_data(bck).await;
            info!(bck = %bck, "bucket data removed");
        }
    }

    fn on_rmd_applied(&self) {
        let rmd = self.owners.rmd.get();
        let id = format!("reb-{}", rmd.version);
        let renewed = self.registry.renew_global(XactKind::Rebalance, false, || {
            Ok(BaseXact::new(id.clone(), XactKind::Rebalance, None) as Arc<dyn Xact>)
        });
        if let Ok(Renewed::Started { xact, .. }) = renewed {
            // object movement between targets is driven by the GET-side
            // catch-up; the generation completes once local sweeps finish
            let registry = Arc::clone(&self.registry);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                xact.base().finish();
                let _ = registry;
            });
        }
        if rmd.resilver {
            let id = format!("res-{}", rmd.version);
            let _ = self.registry.renew_global(XactKind::Resilver, true, || {
                let xact = BaseXact::new(id.clone(), XactKind::Resilver, None);
                xact.base().finish();
                Ok(xact as Arc<dyn Xact>)
            });
        }
    }

    async fn cleanup_bucket_data(&self, bck: &Bck) {
        for mpath in self.mountpaths.list() {
            let dir = bucket_dir(&mpath, bck);
            let _ = tokio::fs::remove_dir_all(&dir).await;
            let meta_dir = mpath
                .path
                .join("%meta")
                .join(bck.provider.fs_kind())
                .join(&bck.name);
            let _ = tokio::fs::remove_dir_all(&meta_dir).await;
        }
    }

    // the target side of the transaction protocol

    pub async fn handle_txn(
        &self,
        phase: TxnPhase,
        uuid: &str,
        bck: &Bck,
        msg: &ActionMsg,
        timeout: Duration,
    ) -> Result<()> {
        match phase {
            TxnPhase::Begin => self.txn_begin(uuid, bck, msg, timeout),
            TxnPhase::Commit => self.txn_commit(uuid).await,
            TxnPhase::Abort => {
                self.txns.abort(uuid);
                Ok(())
            }
        }
    }

    /// Validate preconditions and reserve the transaction.
    fn txn_begin(&self, uuid: &str, bck: &Bck, msg: &ActionMsg, timeout: Duration) -> Result<()> {
        let bmd = self.owners.bmd.get();
        match msg.action.as_str() {
            ACT_CREATE_BCK => {
                if bmd.contains(bck) {
                    return Err(AisError::BucketAlreadyExists(bck.clone()));
                }
            }
            ACT_MAKE_N_COPIES => {
                let copies: i64 = msg.parse_value()?;
                if copies < 1 {
                    return Err(AisError::BadRequest(format!(
                        "invalid number of copies: {}",
                        copies
                    )));
                }
                if !bmd.contains(bck) {
                    return Err(AisError::BucketDoesNotExist(bck.clone()));
                }
            }
            ACT_RENAME_LB | ACT_COPY_BCK | ACT_SET_PROPS | ACT_RESET_PROPS | ACT_EC_ENCODE => {
                if !bmd.contains(bck) {
                    return Err(AisError::BucketDoesNotExist(bck.clone()));
                }
            }
            other => {
                return Err(AisError::BadRequest(format!(
                    "unknown transaction action {:?}",
                    other
                )))
            }
        }
        self.txns.begin(uuid, &msg.action, bck, msg.clone(), timeout)
    }

    /// Commit the prepared transaction and start the post-commit work.
    async fn txn_commit(&self, uuid: &str) -> Result<()> {
        let txn = self.txns.commit(uuid)?;
        match txn.action.as_str() {
            ACT_CREATE_BCK => {
                // reserve the directory tree
                for mpath in self.mountpaths.available() {
                    tokio::fs::create_dir_all(bucket_dir(&mpath, &txn.bck)).await?;
                }
            }
            ACT_MAKE_N_COPIES => {
                self.spawn_reconcile_copies(txn.bck.clone());
            }
            ACT_RENAME_LB => {
                let to: Bck = txn.msg.parse_value()?;
                self.spawn_local_move(txn.bck.clone(), to, true);
            }
            ACT_COPY_BCK => {
                let to: Bck = txn.msg.parse_value()?;
                self.spawn_local_move(txn.bck.clone(), to, false);
            }
            ACT_EC_ENCODE => {
                let bck = txn.bck.clone();
                let _ = self
                    .registry
                    .renew_bucket(XactKind::EcEncode, bck.clone(), false, || {
                        let xact = BaseXact::new(
                            format!("ec-{}", uuid::Uuid::new_v4()),
                            XactKind::EcEncode,
                            Some(bck.clone()),
                        );
                        xact.base().finish();
                        Ok(xact as Arc<dyn Xact>)
                    });
            }
            _ => {}
        }
        Ok(())
    }

    /// Reconcile every object's replica count with the bucket's mirror
    /// policy, under a put-copies xaction.
    fn spawn_reconcile_copies(&self, bck: Bck) {
        let renewed = self
            .registry
            .renew_bucket(XactKind::PutCopies, bck.clone(), true, || {
                Ok(BaseXact::new(
                    format!("putcopies-{}", uuid::Uuid::new_v4()),
                    XactKind::PutCopies,
                    Some(bck.clone()),
                ) as Arc<dyn Xact>)
            });
        let Ok(renewed) = renewed else { return };
        let xact = Arc::clone(renewed.xact());
        let this = self.clone_refs();
        tokio::spawn(async move {
            let mut abort = xact.base().abort_watch();
            tokio::select! {
                _ = this.reconcile_copies(&xact) => {}
                _ = abort.changed() => {}
            }
            xact.base().finish();
        });
    }

    async fn reconcile_copies(self: &Arc<Self>, xact: &Arc<dyn Xact>) {
        let Some(bck) = xact.bck().cloned() else { return };
        let props = self.owners.bmd.get().get(&bck).cloned();
        let Some(props) = props else { return };

        let mpaths = self.mountpaths.available();
        let want = if props.mirror.enabled {
            (props.mirror.copies.max(1) as usize).min(mpaths.len())
        } else {
            1
        };

        let listing = match self
            .list_objects(&bck, &SelectMsg { cached: true, ..Default::default() })
            .await
        {
            Ok(listing) => listing,
            Err(_) => return,
        };
        for entry in listing.entries {
            let Ok(home) = hrw::hrw_mountpath(&mpaths, &bck, &entry.name) else {
                continue;
            };
            let home_fqn = fqn(&home, &bck, &entry.name);
            let mut lom = Lom::load(&home, &bck, &entry.name).unwrap_or_else(|| {
                let mut lom = Lom::new(bck.clone(), entry.name.clone(), entry.size, String::new());
                lom.add_copy(&home);
                lom
            });

            // grow
            if lom.copies.len() < want {
                let _ = self.replicate(&mut lom, &home_fqn, want).await;
            }
            // shrink: drop extra replicas, never the home copy
            while lom.copies.len() > want {
                let Some(extra) = lom.copies.iter().rev().find(|p| **p != home.path).cloned()
                else {
                    break;
                };
                if let Some(mpath) = mpaths.iter().find(|m| m.path == extra) {
                    let _ = tokio::fs::remove_file(fqn(mpath, &bck, &entry.name)).await;
                    lom.drop_copy(mpath);
                } else {
                    lom.copies.retain(|p| p != &extra);
                }
            }
            let _ = lom.persist(&home);
            xact.base().objects_inc();
            xact.base().bytes_add(entry.size as i64);
        }
    }

    /// Local data move for rename (move) and copy (keep source). The
    /// cluster-wide migration is rebalance's job; this handles the data
    /// this target owns.
    fn spawn_local_move(&self, from: Bck, to: Bck, is_rename: bool) {
        let kind = if is_rename {
            XactKind::RenameBck
        } else {
            XactKind::CopyBck
        };
        let renewed = self.registry.renew_bucket(kind, to.clone(), false, || {
            Ok(BaseXact::new(
                format!("{}-{}", kind, uuid::Uuid::new_v4()),
                kind,
                Some(to.clone()),
            ) as Arc<dyn Xact>)
        });
        let Ok(renewed) = renewed else { return };
        let xact = Arc::clone(renewed.xact());
        let this = self.clone_refs();
        tokio::spawn(async move {
            this.local_move(&from, &to, is_rename, &xact).await;
            xact.base().finish();
        });
    }

    async fn local_move(self: &Arc<Self>, from: &Bck, to: &Bck, is_rename: bool, xact: &Arc<dyn Xact>) {
        let mpaths = self.mountpaths.available();
        // walk directly: the rename source is read-sealed for clients but
        // its data still has to move
        for entry in self.list_local(from) {
            let Ok(src_mp) = hrw::hrw_mountpath(&mpaths, from, &entry.name) else {
                continue;
            };
            let Ok(dst_mp) = hrw::hrw_mountpath(&mpaths, to, &entry.name) else {
                continue;
            };
            let src = fqn(&src_mp, from, &entry.name);
            let dst = fqn(&dst_mp, to, &entry.name);
            if let Some(parent) = dst.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            let moved = if is_rename && src_mp.path == dst_mp.path {
                tokio::fs::rename(&src, &dst).await.is_ok()
            } else {
                let copied = tokio::fs::copy(&src, &dst).await.is_ok();
                if copied && is_rename {
                    let _ = tokio::fs::remove_file(&src).await;
                }
                copied
            };
            if moved {
                if let Some(lom) = Lom::load(&src_mp, from, &entry.name) {
                    let mut moved_lom = lom.clone();
                    moved_lom.bck = to.clone();
                    moved_lom.copies = vec![dst_mp.path.clone()];
                    let _ = moved_lom.persist(&dst_mp);
                    if is_rename {
                        lom.remove(&src_mp);
                    }
                }
                xact.base().objects_inc();
                xact.base().bytes_add(entry.size as i64);
            }
        }
        if is_rename {
            // the local tree of the renamed source is gone once its
            // objects moved; the primary removes the BMD entry after
            // rebalance and metasyncs the removal
            self.cleanup_bucket_data(from).await;
        }
    }

    fn clone_refs(&self) -> Arc<Self> {
        self.self_arc
            .lock()
            .upgrade()
            .expect("target arc installed at creation")
    }

    /// Start an xaction by kind (`PUT /v1/xactions {action: start}`).
    /// Kinds whose start goes through a dedicated API are rejected, like
    /// the download and transaction paths do for theirs.
    pub fn start_xaction(&self, kind: XactKind, bck: Option<Bck>) -> Result<()> {
        match kind {
            XactKind::Resilver => {
                self.spawn_resilver();
                Ok(())
            }
            XactKind::Lru => {
                let renewed = self.registry.renew_global(XactKind::Lru, false, || {
                    Ok(BaseXact::new(
                        format!("lru-{}", uuid::Uuid::new_v4()),
                        XactKind::Lru,
                        None,
                    ) as Arc<dyn Xact>)
                })?;
                if let Renewed::Started { xact, .. } = renewed {
                    let this = self.clone_refs();
                    tokio::spawn(async move {
                        this.lru_sweep(&xact).await;
                        xact.base().finish();
                    });
                }
                Ok(())
            }
            XactKind::Prefetch => {
                let bck = bck.ok_or(AisError::XactionRequiresBucket {
                    kind: kind.as_str().to_string(),
                })?;
                let renewed =
                    self.registry
                        .renew_bucket(XactKind::Prefetch, bck.clone(), false, || {
                            Ok(BaseXact::new(
                                format!("prefetch-{}", uuid::Uuid::new_v4()),
                                XactKind::Prefetch,
                                Some(bck.clone()),
                            ) as Arc<dyn Xact>)
                        })?;
                if let Renewed::Started { xact, .. } = renewed {
                    let this = self.clone_refs();
                    tokio::spawn(async move {
                        this.prefetch_sweep(&xact).await;
                        xact.base().finish();
                    });
                }
                Ok(())
            }
            XactKind::PutCopies => Err(AisError::BadRequest(
                "put-copies is invoked automatically by PUTs into a mirrored bucket".into(),
            )),
            XactKind::Downloader | XactKind::EcEncode | XactKind::RenameBck | XactKind::CopyBck => {
                Err(AisError::BadRequest(format!(
                    "starting {} must be done via its dedicated API",
                    kind
                )))
            }
            other => Err(AisError::BadRequest(format!(
                "starting {} is unsupported",
                other
            ))),
        }
    }

    /// Renew the resilver xaction (always preempting a running one) and
    /// re-place local objects whose HRW mountpath changed.
    pub fn spawn_resilver(&self) {
        let renewed = self.registry.renew_global(XactKind::Resilver, true, || {
            Ok(BaseXact::new(
                format!("resilver-{}", uuid::Uuid::new_v4()),
                XactKind::Resilver,
                None,
            ) as Arc<dyn Xact>)
        });
        let Ok(renewed) = renewed else { return };
        let xact = Arc::clone(renewed.xact());
        let this = self.clone_refs();
        tokio::spawn(async move {
            let mut abort = xact.base().abort_watch();
            tokio::select! {
                _ = this.resilver_sweep(&xact) => {}
                _ = abort.changed() => {}
            }
            xact.base().finish();
        });
    }

    /// Move every object sitting on a non-home mountpath to its HRW home.
    async fn resilver_sweep(self: &Arc<Self>, xact: &Arc<dyn Xact>) {
        let mpaths = self.mountpaths.available();
        let buckets: Vec<Bck> = self.owners.bmd.get().buckets.keys().cloned().collect();
        for bck in buckets {
            for entry in self.list_local(&bck) {
                let Ok(home) = hrw::hrw_mountpath(&mpaths, &bck, &entry.name) else {
                    continue;
                };
                let home_fqn = fqn(&home, &bck, &entry.name);
                let mirror = self
                    .owners
                    .bmd
                    .get()
                    .get(&bck)
                    .map(|p| p.mirror.enabled)
                    .unwrap_or(false);
                for mpath in mpaths.iter().filter(|m| m.path != home.path) {
                    let stray = fqn(mpath, &bck, &entry.name);
                    if !stray.exists() {
                        continue;
                    }
                    if home_fqn.exists() {
                        // replicas of mirrored buckets are legitimate
                        if !mirror {
                            let _ = tokio::fs::remove_file(&stray).await;
                        }
                        continue;
                    }
                    if let Some(parent) = home_fqn.parent() {
                        let _ = tokio::fs::create_dir_all(parent).await;
                    }
                    if tokio::fs::rename(&stray, &home_fqn).await.is_ok() {
                        if let Some(mut lom) = Lom::load(mpath, &bck, &entry.name) {
                            lom.copies = vec![home.path.clone()];
                            let _ = lom.persist(&home);
                            lom.remove(mpath);
                        }
                        xact.base().objects_inc();
                        xact.base().bytes_add(entry.size as i64);
                    }
                }
            }
        }
    }

    /// Count (and age-check) locally cached copies of remote objects;
    /// eviction follows the bucket's LRU watermarks.
    async fn lru_sweep(self: &Arc<Self>, xact: &Arc<dyn Xact>) {
        let bmd = self.owners.bmd.get();
        for (bck, props) in bmd.buckets.iter() {
            if !bck.is_remote() || !props.lru.enabled {
                continue;
            }
            let cutoff = chrono::Utc::now()
                - chrono::Duration::from_std(props.lru.dont_evict_time).unwrap_or_default();
            for entry in self.list_local(bck) {
                let Some(lom) = self.lom_of(bck, &entry.name) else {
                    continue;
                };
                if lom.mtime < cutoff {
                    let _ = self.evict_cached(bck, &entry.name).await;
                    xact.base().objects_inc();
                    xact.base().bytes_add(entry.size as i64);
                }
            }
        }
    }

    /// Drop the local copy of a remote object; the cloud-side original
    /// stays.
    async fn evict_cached(&self, bck: &Bck, name: &str) -> Result<()> {
        for mpath in self.mountpaths.available() {
            let _ = tokio::fs::remove_file(fqn(&mpath, bck, name)).await;
            if let Some(lom) = Lom::load(&mpath, bck, name) {
                lom.remove(&mpath);
            }
        }
        Ok(())
    }

    /// Cold-GET everything the backend lists that is not cached yet.
    async fn prefetch_sweep(self: &Arc<Self>, xact: &Arc<dyn Xact>) {
        let Some(bck) = xact.bck().cloned() else { return };
        if !bck.is_remote() || !self.backends.has(bck.provider) {
            return;
        }
        let Ok(backend) = self.backends.get(bck.provider) else {
            return;
        };
        let mut msg = SelectMsg::default();
        loop {
            let Ok(page) = backend.list_objects(&bck, &msg).await else {
                return;
            };
            for entry in &page.entries {
                if self.lom_of(&bck, &entry.name).is_some() {
                    continue;
                }
                if self.get_object(&bck, &entry.name).await.is_ok() {
                    xact.base().bytes_add(entry.size as i64);
                }
            }
            if page.page_marker.is_empty() {
                break;
            }
            msg.page_marker = page.page_marker;
        }
    }
}

fn walk_objects(root: &std::path::Path, dir: &std::path::Path, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(base) = path.file_name().and_then(|b| b.to_str()) else {
            continue;
        };
        if path.is_dir() {
            walk_objects(root, &path, out);
        } else if !ContentRegistry::is_workfile_name(base) {
            if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CloudProvider, MemBackend};
    use crate::config::{FshcConfig, NodeRole};
    use crate::types::{BucketProps, Provider};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        target: Arc<Target>,
    }

    fn fixture(n_mpaths: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mountpaths = Arc::new(MountpathManager::new());
        for i in 0..n_mpaths {
            let mp = dir.path().join(format!("mp{}", i));
            std::fs::create_dir(&mp).unwrap();
            mountpaths.add(&mp).unwrap();
        }
        let owners = MetaOwners::ephemeral();
        let fshc = Arc::new(FsHealthChecker::new(
            FshcConfig::default(),
            Arc::clone(&mountpaths),
        ));
        let node = Snode::new(
            "t1",
            NodeRole::Target,
            "http://t1",
            "http://t1c",
            "http://t1d",
        );
        let target = Target::new(
            node,
            owners,
            mountpaths,
            Arc::new(ContentRegistry::new()),
            Registry::new(),
            fshc,
        );
        Fixture { _dir: dir, target }
    }

    fn add_bucket(target: &Target, bck: &Bck, props: BucketProps) {
        let guard = target.owners.bmd.get();
        let mut clone = (*guard).clone();
        clone.add(bck.clone(), props);
        target.owners.bmd.try_apply(clone).unwrap();
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let fx = fixture(2);
        let bck = Bck::ais("b1");
        add_bucket(&fx.target, &bck, BucketProps::default_props());

        let body = Bytes::from_static(b"0123456789\n");
        let lom = fx.target.put_object(&bck, "o1", body.clone()).await.unwrap();
        assert_eq!(lom.size, 11);
        assert_eq!(lom.checksum, body_checksum(&body));

        let (read, lom2) = fx.target.get_object(&bck, "o1").await.unwrap();
        assert_eq!(read, body);
        assert_eq!(lom2.checksum, lom.checksum);
    }

    #[tokio::test]
    async fn test_get_missing_bucket_or_object() {
        let fx = fixture(1);
        let bck = Bck::ais("nope");
        assert!(matches!(
            fx.target.get_object(&bck, "o").await,
            Err(AisError::BucketDoesNotExist(_))
        ));

        add_bucket(&fx.target, &bck, BucketProps::default_props());
        assert!(matches!(
            fx.target.get_object(&bck, "o").await,
            Err(AisError::ObjectNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_workfiles_never_listed() {
        let fx = fixture(1);
        let bck = Bck::ais("b1");
        add_bucket(&fx.target, &bck, BucketProps::default_props());
        fx.target
            .put_object(&bck, "visible", Bytes::from_static(b"x"))
            .await
            .unwrap();

        // plant a workfile next to the object
        let mpath = fx.target.mountpaths.available()[0].clone();
        let dir = bucket_dir(&mpath, &bck);
        std::fs::write(dir.join(".~~~.dl.part.0000aaaa.1f"), b"partial").unwrap();

        let listing = fx
            .target
            .list_objects(&bck, &SelectMsg::default())
            .await
            .unwrap();
        let names: Vec<_> = listing.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["visible"]);
    }

    #[tokio::test]
    async fn test_listing_prefix_and_paging() {
        let fx = fixture(2);
        let bck = Bck::ais("b1");
        add_bucket(&fx.target, &bck, BucketProps::default_props());
        for i in 0..5 {
            fx.target
                .put_object(&bck, &format!("dir/o{}", i), Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        fx.target
            .put_object(&bck, "other", Bytes::from_static(b"x"))
            .await
            .unwrap();

        let msg = SelectMsg {
            prefix: "dir/".into(),
            page_size: 2,
            ..Default::default()
        };
        let page1 = fx.target.list_objects(&bck, &msg).await.unwrap();
        assert_eq!(page1.entries.len(), 2);
        assert_eq!(page1.entries[0].name, "dir/o0");
        assert_eq!(page1.page_marker, "dir/o1");

        let msg = SelectMsg {
            prefix: "dir/".into(),
            page_size: 10,
            page_marker: page1.page_marker,
            ..Default::default()
        };
        let page2 = fx.target.list_objects(&bck, &msg).await.unwrap();
        let names: Vec<_> = page2.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["dir/o2", "dir/o3", "dir/o4"]);
        assert!(page2.page_marker.is_empty());
    }

    #[tokio::test]
    async fn test_delete_object() {
        let fx = fixture(2);
        let bck = Bck::ais("b1");
        add_bucket(&fx.target, &bck, BucketProps::default_props());
        fx.target
            .put_object(&bck, "o1", Bytes::from_static(b"x"))
            .await
            .unwrap();

        fx.target.delete_object(&bck, "o1").await.unwrap();
        assert!(matches!(
            fx.target.get_object(&bck, "o1").await,
            Err(AisError::ObjectNotFound { .. })
        ));
        assert!(matches!(
            fx.target.delete_object(&bck, "o1").await,
            Err(AisError::ObjectNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_cold_get_from_backend() {
        let fx = fixture(1);
        let bck = Bck::new(Provider::Aws, "remote");
        let backend = MemBackend::with_bucket(Provider::Aws, "remote");
        backend
            .put_obj(&bck, "o1", Bytes::from_static(b"cloud-bytes"))
            .await
            .unwrap();
        fx.target.backends.register(backend);

        // first GET is cold
        let (body, lom) = fx.target.get_object(&bck, "o1").await.unwrap();
        assert_eq!(&body[..], b"cloud-bytes");
        assert_eq!(lom.version, "v1");

        // now cached on disk: listing with cached=true sees it locally
        let listing = fx
            .target
            .list_objects(
                &bck,
                &SelectMsg {
                    cached: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(listing.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_mirror_replicas_and_fallback() {
        let fx = fixture(3);
        let bck = Bck::ais("b1");
        let mut props = BucketProps::default_props();
        props.mirror.enabled = true;
        props.mirror.copies = 2;
        add_bucket(&fx.target, &bck, props);

        let lom = fx
            .target
            .put_object(&bck, "o1", Bytes::from_static(b"replicated"))
            .await
            .unwrap();
        assert_eq!(lom.copies.len(), 2);

        // kill the home mountpath; the replica still serves the GET
        let mpaths = fx.target.mountpaths.available();
        let home = hrw::hrw_mountpath(&mpaths, &bck, "o1").unwrap();
        fx.target.mountpaths.disable(&home.path).unwrap();

        let (body, _) = fx.target.get_object(&bck, "o1").await.unwrap();
        assert_eq!(&body[..], b"replicated");
    }

    #[tokio::test]
    async fn test_txn_create_and_reconcile_copies() {
        let fx = fixture(2);
        let bck = Bck::ais("b1");

        // begin validates non-existence
        let msg = ActionMsg::new(ACT_CREATE_BCK);
        fx.target
            .handle_txn(TxnPhase::Begin, "u1", &bck, &msg, Duration::from_secs(5))
            .await
            .unwrap();
        add_bucket(&fx.target, &bck, BucketProps::default_props());
        fx.target
            .handle_txn(TxnPhase::Commit, "u1", &bck, &msg, Duration::from_secs(5))
            .await
            .unwrap();
        // bucket dirs were reserved
        for mpath in fx.target.mountpaths.available() {
            assert!(bucket_dir(&mpath, &bck).exists());
        }

        // begin on an existing bucket is rejected
        assert!(matches!(
            fx.target
                .handle_txn(TxnPhase::Begin, "u2", &bck, &msg, Duration::from_secs(5))
                .await,
            Err(AisError::BucketAlreadyExists(_))
        ));

        // makencopies with more copies than mountpaths clamps
        fx.target
            .put_object(&bck, "o1", Bytes::from_static(b"x"))
            .await
            .unwrap();
        let mut clone = (*fx.target.owners.bmd.get()).clone();
        let mut props = clone.get(&bck).cloned().unwrap();
        props.mirror.enabled = true;
        props.mirror.copies = 5;
        clone.set(&bck, props);
        fx.target.owners.bmd.try_apply(clone).unwrap();

        let msg = ActionMsg::with_value(ACT_MAKE_N_COPIES, &5i64).unwrap();
        fx.target
            .handle_txn(TxnPhase::Begin, "u3", &bck, &msg, Duration::from_secs(5))
            .await
            .unwrap();
        fx.target
            .handle_txn(TxnPhase::Commit, "u3", &bck, &msg, Duration::from_secs(5))
            .await
            .unwrap();

        // the reconcile xaction runs in the background
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(lom) = fx.target.lom_of(&bck, "o1") {
                if lom.copies.len() == 2 {
                    return;
                }
            }
        }
        panic!("copies were not reconciled to the mountpath count");
    }

    #[tokio::test]
    async fn test_txn_abort_is_idempotent() {
        let fx = fixture(1);
        let bck = Bck::ais("b1");
        let msg = ActionMsg::new(ACT_CREATE_BCK);
        fx.target
            .handle_txn(TxnPhase::Begin, "u1", &bck, &msg, Duration::from_secs(5))
            .await
            .unwrap();
        fx.target
            .handle_txn(TxnPhase::Abort, "u1", &bck, &msg, Duration::from_secs(5))
            .await
            .unwrap();
        fx.target
            .handle_txn(TxnPhase::Abort, "u1", &bck, &msg, Duration::from_secs(5))
            .await
            .unwrap();
        // commit after abort: unknown transaction
        assert!(matches!(
            fx.target
                .handle_txn(TxnPhase::Commit, "u1", &bck, &msg, Duration::from_secs(5))
                .await,
            Err(AisError::TxnNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_destroyed_bucket_data_removed() {
        let fx = fixture(2);
        let bck = Bck::ais("doomed");
        add_bucket(&fx.target, &bck, BucketProps::default_props());
        fx.target
            .put_object(&bck, "o1", Bytes::from_static(b"x"))
            .await
            .unwrap();

        // primary's BMD without the bucket arrives via metasync
        let mut next = (*fx.target.owners.bmd.get()).clone();
        next.del(&bck);
        let payload = RevsPayload {
            pairs: vec![crate::metasync::Revs::of(&next).unwrap()],
            msg: ActionMsg::new("destroy-bck"),
        };
        fx.target.receive_meta(&payload).await.unwrap();

        assert!(matches!(
            fx.target.get_object(&bck, "o1").await,
            Err(AisError::BucketDoesNotExist(_))
        ));
        for mpath in fx.target.mountpaths.available() {
            assert!(!bucket_dir(&mpath, &bck).exists());
        }
    }

    #[tokio::test]
    async fn test_rename_moves_local_data() {
        let fx = fixture(2);
        let from = Bck::ais("b1");
        let to = Bck::ais("b2");
        add_bucket(&fx.target, &from, BucketProps::default_props());
        for i in 0..5 {
            fx.target
                .put_object(&from, &format!("o{}", i), Bytes::from_static(b"payload"))
                .await
                .unwrap();
        }

        // the BMD after the rename transaction: destination added, source
        // sealed
        let mut next = (*fx.target.owners.bmd.get()).clone();
        let mut from_props = next.get(&from).cloned().unwrap();
        next.add(to.clone(), from_props.clone());
        from_props.renamed = Some(ACT_RENAME_LB.to_string());
        next.set(&from, from_props);
        fx.target.owners.bmd.try_apply(next).unwrap();

        let msg = ActionMsg::with_value(ACT_RENAME_LB, &to).unwrap();
        fx.target
            .handle_txn(TxnPhase::Begin, "u1", &from, &msg, Duration::from_secs(5))
            .await
            .unwrap();
        fx.target
            .handle_txn(TxnPhase::Commit, "u1", &from, &msg, Duration::from_secs(5))
            .await
            .unwrap();

        // data shows up under the new name
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let listing = fx
                .target
                .list_objects(&to, &SelectMsg::default())
                .await
                .unwrap();
            if listing.entries.len() == 5 {
                // reads against the sealed source fail
                assert!(matches!(
                    fx.target.get_object(&from, "o0").await,
                    Err(AisError::BucketDoesNotExist(_))
                ));
                return;
            }
        }
        panic!("rename did not move the objects");
    }
}

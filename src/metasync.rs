//! Metasync: reliable fan-out of replicated metadata from the primary
//! proxy to every peer.
//!
//! Guarantees:
//! 1. at-least-once delivery (bounded retry with exponential backoff);
//! 2. version monotonicity per key: recipients apply only strictly
//!    greater versions, acknowledging stale ones;
//! 3. pair atomicity: a payload carrying several items is applied
//!    together on each recipient, or not at all.
//!
//! On sustained failure of a minority the sync still completes; lagging
//! nodes catch up on the next sync carrying a higher version.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::cluster::{Bmd, MetaOwners, Rmd, Smap, Snode, Versioned};
use crate::error::{AisError, Result};
use crate::types::{ActionMsg, MetaVersion, NodeId};

const SYNC_RETRIES: usize = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// One versioned metadata item in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revs {
    pub tag: String,
    pub version: MetaVersion,
    pub data: serde_json::Value,
}

impl Revs {
    pub fn of<T: Versioned + Serialize>(value: &T) -> Result<Self> {
        Ok(Self {
            tag: T::tag().to_string(),
            version: value.version(),
            data: serde_json::to_value(value)?,
        })
    }
}

/// The unit of dissemination: metadata clones plus the triggering message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevsPayload {
    pub pairs: Vec<Revs>,
    pub msg: ActionMsg,
}

/// Delivery seam; the HTTP implementation posts to the peer's
/// intra-control endpoint, tests swap in an in-process transport.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn push(&self, node: &Snode, payload: &RevsPayload) -> Result<()>;
}

/// Production transport: `POST /v1/metasync` on the peer.
pub struct HttpSyncTransport {
    client: reqwest::Client,
}

impl HttpSyncTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AisError::Internal(format!("http client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SyncTransport for HttpSyncTransport {
    async fn push(&self, node: &Snode, payload: &RevsPayload) -> Result<()> {
        let url = format!("{}/v1/metasync", node.intra_control_url);
        let resp = self.client.post(&url).json(payload).send().await?;
        if !resp.status().is_success() {
            return Err(AisError::Network(format!(
                "metasync to {} failed with {}",
                node, resp.status()
            )));
        }
        Ok(())
    }
}

/// Outcome of one sync round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub acked: usize,
    pub failed: usize,
}

/// Await-able handle returned by [`Metasyncer::sync`]; transactions wait
/// on it before broadcasting commit.
pub struct SyncHandle {
    rx: oneshot::Receiver<SyncOutcome>,
}

impl SyncHandle {
    pub async fn wait(self) -> SyncOutcome {
        self.rx.await.unwrap_or(SyncOutcome { acked: 0, failed: 0 })
    }

    fn immediate(outcome: SyncOutcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self { rx }
    }
}

/// Primary-side fan-out machinery.
pub struct Metasyncer {
    self_id: NodeId,
    transport: Arc<dyn SyncTransport>,
}

impl Metasyncer {
    pub fn new(self_id: NodeId, transport: Arc<dyn SyncTransport>) -> Self {
        Self { self_id, transport }
    }

    /// Disseminate `payload` to every peer in `smap`. Returns
    /// immediately with a handle the caller awaits.
    pub fn sync(&self, smap: Arc<Smap>, payload: RevsPayload) -> SyncHandle {
        let peers: Vec<Snode> = smap.peers_except(&self.self_id).cloned().collect();
        if peers.is_empty() {
            return SyncHandle::immediate(SyncOutcome { acked: 0, failed: 0 });
        }

        let transport = Arc::clone(&self.transport);
        let payload = Arc::new(payload);
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut tasks = Vec::with_capacity(peers.len());
            for peer in peers {
                let transport = Arc::clone(&transport);
                let payload = Arc::clone(&payload);
                tasks.push(tokio::spawn(async move {
                    push_with_retry(transport.as_ref(), &peer, &payload).await
                }));
            }

            let mut outcome = SyncOutcome { acked: 0, failed: 0 };
            for task in tasks {
                match task.await {
                    Ok(Ok(())) => outcome.acked += 1,
                    Ok(Err(e)) => {
                        warn!(error = %e, "metasync delivery failed; peer will catch up");
                        outcome.failed += 1;
                    }
                    Err(_) => outcome.failed += 1,
                }
            }
            let _ = tx.send(outcome);
        });

        SyncHandle { rx }
    }
}

async fn push_with_retry(
    transport: &dyn SyncTransport,
    peer: &Snode,
    payload: &RevsPayload,
) -> Result<()> {
    let mut last_err = None;
    for attempt in 0..SYNC_RETRIES {
        match transport.push(peer, payload).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() || attempt + 1 < SYNC_RETRIES => {
                let jitter = rand::thread_rng().gen_range(0..50);
                let backoff = BACKOFF_BASE * 2u32.pow(attempt as u32)
                    + Duration::from_millis(jitter);
                debug!(peer = %peer, attempt, "metasync retry after {:?}", backoff);
                tokio::time::sleep(backoff).await;
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| AisError::Internal("metasync retries exhausted".into())))
}

/// Recipient-side application of a payload onto the local ownership cells.
pub struct MetaReceiver {
    pub owners: MetaOwners,
}

impl MetaReceiver {
    /// Apply every item of the payload, atomically with respect to
    /// decoding: nothing is applied unless every item decodes. Stale
    /// versions are acknowledged without effect. Returns the tags that
    /// actually advanced local state.
    pub fn apply(&self, payload: &RevsPayload) -> Result<Vec<String>> {
        enum Decoded {
            Smap(Smap),
            Bmd(Bmd),
            Rmd(Rmd),
        }

        let mut decoded = Vec::with_capacity(payload.pairs.len());
        for revs in &payload.pairs {
            let item = match revs.tag.as_str() {
                "smap" => Decoded::Smap(serde_json::from_value(revs.data.clone())?),
                "bmd" => Decoded::Bmd(serde_json::from_value(revs.data.clone())?),
                "rmd" => Decoded::Rmd(serde_json::from_value(revs.data.clone())?),
                other => {
                    return Err(AisError::BadRequest(format!(
                        "unknown metasync tag {:?}",
                        other
                    )))
                }
            };
            decoded.push((revs.tag.clone(), item));
        }

        let mut applied = Vec::new();
        for (tag, item) in decoded {
            let advanced = match item {
                Decoded::Smap(v) => self.owners.smap.try_apply(v)?,
                Decoded::Bmd(v) => self.owners.bmd.try_apply(v)?,
                Decoded::Rmd(v) => self.owners.rmd.try_apply(v)?,
            };
            if advanced {
                applied.push(tag);
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeRole;
    use crate::types::{Bck, BucketProps};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct MemTransport {
        receivers: Mutex<HashMap<NodeId, Arc<MetaReceiver>>>,
        fail_first: Mutex<HashMap<NodeId, usize>>,
    }

    impl MemTransport {
        fn new() -> Self {
            Self {
                receivers: Mutex::new(HashMap::new()),
                fail_first: Mutex::new(HashMap::new()),
            }
        }

        fn attach(&self, id: &str, receiver: Arc<MetaReceiver>) {
            self.receivers.lock().insert(id.to_string(), receiver);
        }
    }

    #[async_trait]
    impl SyncTransport for MemTransport {
        async fn push(&self, node: &Snode, payload: &RevsPayload) -> Result<()> {
            {
                let mut failures = self.fail_first.lock();
                if let Some(remaining) = failures.get_mut(&node.id) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(AisError::Network("injected".into()));
                    }
                }
            }
            let receiver = self
                .receivers
                .lock()
                .get(&node.id)
                .cloned()
                .ok_or_else(|| AisError::NodeNotFound(node.id.clone()))?;
            receiver.apply(payload)?;
            Ok(())
        }
    }

    fn receiver() -> Arc<MetaReceiver> {
        Arc::new(MetaReceiver {
            owners: MetaOwners::ephemeral(),
        })
    }

    fn cluster(n_targets: usize) -> Smap {
        let mut smap = Smap::new();
        smap.add(Snode::new(
            "p1",
            NodeRole::Proxy,
            "http://p1",
            "http://p1c",
            "http://p1d",
        ));
        for i in 0..n_targets {
            smap.add(Snode::new(
                format!("t{}", i),
                NodeRole::Target,
                format!("http://t{}", i),
                format!("http://t{}c", i),
                format!("http://t{}d", i),
            ));
        }
        smap.set_primary("p1".to_string()).unwrap();
        smap
    }

    fn bmd_with(names: &[&str]) -> Bmd {
        let mut bmd = Bmd::new();
        for name in names {
            bmd.add(Bck::ais(*name), BucketProps::default_props());
        }
        bmd
    }

    #[tokio::test]
    async fn test_fanout_reaches_all_peers() {
        let transport = Arc::new(MemTransport::new());
        let r0 = receiver();
        let r1 = receiver();
        transport.attach("t0", Arc::clone(&r0));
        transport.attach("t1", Arc::clone(&r1));

        let smap = Arc::new(cluster(2));
        let syncer = Metasyncer::new("p1".to_string(), transport);

        let bmd = bmd_with(&["b1"]);
        let payload = RevsPayload {
            pairs: vec![Revs::of(&bmd).unwrap()],
            msg: ActionMsg::new("create-bck"),
        };
        let outcome = syncer.sync(Arc::clone(&smap), payload).wait().await;
        assert_eq!(outcome, SyncOutcome { acked: 2, failed: 0 });
        assert!(r0.owners.bmd.get().contains(&Bck::ais("b1")));
        assert!(r1.owners.bmd.get().contains(&Bck::ais("b1")));
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let transport = Arc::new(MemTransport::new());
        let r0 = receiver();
        transport.attach("t0", Arc::clone(&r0));
        transport.fail_first.lock().insert("t0".to_string(), 2);

        let smap = Arc::new(cluster(1));
        let syncer = Metasyncer::new("p1".to_string(), transport);
        let payload = RevsPayload {
            pairs: vec![Revs::of(&bmd_with(&["b1"])).unwrap()],
            msg: ActionMsg::new("create-bck"),
        };
        let outcome = syncer.sync(smap, payload).wait().await;
        assert_eq!(outcome.acked, 1);
        assert!(r0.owners.bmd.get().contains(&Bck::ais("b1")));
    }

    #[tokio::test]
    async fn test_minority_failure_does_not_block() {
        let transport = Arc::new(MemTransport::new());
        let r0 = receiver();
        transport.attach("t0", Arc::clone(&r0));
        // t1 has no receiver attached: permanently unreachable

        let smap = Arc::new(cluster(2));
        let syncer = Metasyncer::new("p1".to_string(), transport);
        let payload = RevsPayload {
            pairs: vec![Revs::of(&bmd_with(&["b1"])).unwrap()],
            msg: ActionMsg::new("create-bck"),
        };
        let outcome = syncer.sync(smap, payload).wait().await;
        assert_eq!(outcome.acked, 1);
        assert_eq!(outcome.failed, 1);
    }

    #[tokio::test]
    async fn test_receiver_rejects_stale_versions() {
        let r = receiver();
        let v2 = bmd_with(&["b1", "b2"]);
        let payload = RevsPayload {
            pairs: vec![Revs::of(&v2).unwrap()],
            msg: ActionMsg::new("create-bck"),
        };
        assert_eq!(r.apply(&payload).unwrap(), vec!["bmd".to_string()]);

        // replay: acknowledged, nothing advances
        assert!(r.apply(&payload).unwrap().is_empty());

        let stale = bmd_with(&["other"]);
        let payload = RevsPayload {
            pairs: vec![Revs::of(&stale).unwrap()],
            msg: ActionMsg::new("create-bck"),
        };
        assert!(r.apply(&payload).unwrap().is_empty());
        assert!(r.owners.bmd.get().contains(&Bck::ais("b1")));
    }

    #[tokio::test]
    async fn test_pair_applied_together() {
        let r = receiver();
        let smap = cluster(1);
        let bmd = bmd_with(&["b1"]);
        let payload = RevsPayload {
            pairs: vec![Revs::of(&smap).unwrap(), Revs::of(&bmd).unwrap()],
            msg: ActionMsg::new("create-bck"),
        };
        let applied = r.apply(&payload).unwrap();
        assert_eq!(applied, vec!["smap".to_string(), "bmd".to_string()]);

        // a payload with an undecodable item applies nothing
        let bad = RevsPayload {
            pairs: vec![
                Revs {
                    tag: "bmd".into(),
                    version: 99,
                    data: serde_json::json!({"version": "not-a-number"}),
                },
                Revs::of(&bmd_with(&["b1", "b2", "b3"])).unwrap(),
            ],
            msg: ActionMsg::new("create-bck"),
        };
        assert!(r.apply(&bad).is_err());
        assert_eq!(r.owners.bmd.get().version, bmd.version);
    }
}

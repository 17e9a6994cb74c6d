//! aisd - distributed, horizontally-scalable object storage for AI
//! workloads.
//!
//! A cluster is a dynamic membership of equal-peer **proxies** (stateless
//! HTTP routers; one elected primary holds the authoritative metadata)
//! and **targets** (stateful data plane). Together they present a unified
//! object namespace backed by local filesystems on every target,
//! optionally fronting third-party cloud object stores.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          aisd                                │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Proxy: request router | txn coordinator | metasync fan-out  │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Metadata: Smap | BMD | RMD  (versioned, copy-on-write)      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Target: HRW placement | LOM | cold GET | mirror | xactions  │
//! ├──────────────────────────────────────────────────────────────┤
//! │  FS layer: mountpaths | FSHC | workfiles | download joggers  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use aisd::config::{AisConfig, NodeRole};
//!
//! #[tokio::main]
//! async fn main() -> aisd::Result<()> {
//!     let config = AisConfig::development(NodeRole::Target, vec!["/tmp/ais/mp1".into()]);
//!     aisd::run(config).await
//! }
//! ```

pub mod api;
pub mod backend;
pub mod cluster;
pub mod config;
pub mod downloader;
pub mod error;
pub mod fs;
pub mod housekeep;
pub mod hrw;
pub mod metasync;
pub mod proxy;
pub mod target;
pub mod txn;
pub mod types;
pub mod xact;

// Re-exports
pub use error::{AisError, Result};

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use cluster::{gen_node_id, MetaOwners, NameLocker, Snode};
use config::{AisConfig, NodeRole};
use downloader::{Downloader, HttpDlClient};
use fs::{ContentRegistry, FsHealthChecker, MountpathManager, MountpathEvent};
use housekeep::Housekeeper;
use metasync::{HttpSyncTransport, MetaReceiver, Metasyncer};
use proxy::{proxy_router, HttpNeighborClient, HttpTxnBroadcaster, ProxyState};
use target::server::{target_router, TargetState};
use target::Target;
use txn::proxy::BucketOps;
use xact::Registry;

/// A node assembled from a configuration, ready to serve.
pub struct Node {
    pub snode: Snode,
    pub router: axum::Router,
    pub housekeeper: Arc<Housekeeper>,
    /// Target-role handles, `None` on proxies.
    pub target: Option<Arc<Target>>,
    pub downloader: Option<Arc<Downloader>>,
    pub owners: MetaOwners,
}

/// Build a node (either role) without binding a listener; callers serve
/// `node.router` wherever they want. Test fixtures use this directly.
pub fn build_node(config: AisConfig) -> Result<Node> {
    let config = Arc::new(config);
    let node_id = gen_node_id(config.node.role, &format!("http://{}", config.net.public_addr));
    let snode = Snode::new(
        node_id.clone(),
        config.node.role,
        format!("http://{}", config.net.public_addr),
        format!("http://{}", config.net.intra_control_addr),
        format!("http://{}", config.net.intra_data_addr),
    );
    let housekeeper = Arc::new(Housekeeper::new());

    match config.node.role {
        NodeRole::Proxy => {
            let owners = match &config.node.confdir {
                Some(dir) => {
                    std::fs::create_dir_all(dir)?;
                    MetaOwners::persistent(dir)
                }
                None => MetaOwners::ephemeral(),
            };
            let transport = Arc::new(HttpSyncTransport::new(config.timeouts.max_keepalive)?);
            let metasyncer = Arc::new(Metasyncer::new(node_id.clone(), transport));
            let ops = BucketOps::new(
                node_id,
                owners.clone(),
                Arc::clone(&metasyncer),
                NameLocker::new(),
                Arc::new(HttpTxnBroadcaster::new()?),
                config.timeouts.clone(),
                config.rebalance.enabled,
            );
            let receiver = Arc::new(MetaReceiver {
                owners: owners.clone(),
            });
            let state = ProxyState {
                node: snode.clone(),
                owners: owners.clone(),
                ops,
                metasyncer,
                receiver,
                config: Arc::clone(&config),
                client: reqwest::Client::new(),
            };
            Ok(Node {
                snode,
                router: proxy_router(state),
                housekeeper,
                target: None,
                downloader: None,
                owners,
            })
        }
        NodeRole::Target => {
            let mountpaths = Arc::new(MountpathManager::new());
            for mpath in &config.fs.mountpaths {
                std::fs::create_dir_all(mpath)?;
                mountpaths.add(mpath)?;
            }
            let meta_dir = config
                .fs
                .mountpaths
                .first()
                .cloned()
                .ok_or(AisError::NoAvailableMountpath)?;
            let owners = MetaOwners::persistent(&meta_dir);
            let contents = Arc::new(ContentRegistry::new());
            let registry = Registry::new();
            let fshc = Arc::new(FsHealthChecker::new(
                config.fs.fshc.clone(),
                Arc::clone(&mountpaths),
            ));

            let target = Target::new(
                snode.clone(),
                owners.clone(),
                Arc::clone(&mountpaths),
                Arc::clone(&contents),
                Arc::clone(&registry),
                fshc,
            );
            target.set_neighbor_client(Arc::new(HttpNeighborClient::new()?));

            let downloader = Downloader::new(
                config.downloader.clone(),
                &registry,
                Arc::new(HttpDlClient::new(&config.downloader)?),
                contents,
                Arc::clone(&mountpaths),
            )?;
            let filter_owners = owners.clone();
            let filter_id = snode.id.clone();
            let downloader = downloader.with_owner_filter(Box::new(move |bck, obj| {
                let smap = filter_owners.smap.get();
                match hrw::hrw_target(&smap, bck, obj) {
                    Ok(owner) => owner.id == filter_id,
                    // an empty cluster map means single-node operation
                    Err(_) => true,
                }
            }));

            // registry cleanup and transaction expiry
            let hk_registry = Arc::clone(&registry);
            housekeeper.register(
                "xactions",
                xact::registry::CLEANUP_INTERVAL,
                Box::new(move || {
                    hk_registry.housekeep(chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0))
                }),
            );
            let hk_target = Arc::clone(&target);
            housekeeper.register(
                "txns",
                Duration::from_secs(30),
                Box::new(move || {
                    let abandoned = hk_target.txns.housekeep(std::time::Instant::now());
                    if !abandoned.is_empty() {
                        warn!(count = abandoned.len(), "transactions self-aborted");
                    }
                    Duration::from_secs(30)
                }),
            );

            // mountpath changes trigger resilver and refresh the joggers
            let ev_target = Arc::clone(&target);
            let ev_downloader = Arc::clone(&downloader);
            let mut events = mountpaths.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    ev_downloader.refresh_joggers();
                    match event {
                        MountpathEvent::Added(_) | MountpathEvent::Enabled(_) => {
                            ev_target.spawn_resilver();
                        }
                        MountpathEvent::Removed(_) | MountpathEvent::Disabled(_) => {
                            ev_target.registry.abort_mountpath_xacts();
                            ev_target.spawn_resilver();
                        }
                    }
                }
            });

            let state = TargetState {
                target: Arc::clone(&target),
                downloader: Arc::clone(&downloader),
                config: Arc::clone(&config),
            };
            Ok(Node {
                snode,
                router: target_router(state),
                housekeeper,
                target: Some(target),
                downloader: Some(downloader),
                owners,
            })
        }
    }
}

/// Run a node until SIGINT/SIGTERM.
pub async fn run(config: AisConfig) -> Result<()> {
    config.validate()?;
    let public_addr = config.net.public_addr;
    let node = build_node(config)?;
    info!(node = %node.snode, addr = %public_addr, "starting");

    // a fresh node knows itself; the rest of the membership arrives via
    // metasync
    {
        let mut smap = (*node.owners.smap.get()).clone();
        smap.add(node.snode.clone());
        if node.snode.is_proxy() && smap.primary_id.is_empty() {
            smap.set_primary(node.snode.id.clone())?;
        }
        node.owners.smap.try_apply(smap)?;
    }

    let listener = tokio::net::TcpListener::bind(public_addr).await?;
    let router = node.router.clone();
    let serve = tokio::spawn(async move {
        if let Err(e) = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        {
            error!(error = %e, "server error");
        }
    });

    shutdown_signal().await;
    info!("shutting down");

    if let Some(downloader) = &node.downloader {
        downloader.stop().await;
    }
    if let Some(target) = &node.target {
        target.registry.shutdown();
    }
    node.housekeeper.stop().await;
    serve.abort();
    info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler");
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

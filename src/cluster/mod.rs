//! Cluster-level metadata: membership, bucket catalog, rebalance
//! generation, and the ownership cells that replicate them.

pub mod bmd;
pub mod namelock;
pub mod node;
pub mod owner;
pub mod rmd;
pub mod smap;

pub use bmd::Bmd;
pub use namelock::{NameLockGuard, NameLocker};
pub use node::{gen_node_id, Snode, SnodeState};
pub use owner::{Owner, Versioned};
pub use rmd::Rmd;
pub use smap::Smap;

use std::sync::Arc;

/// The three replicated metadata cells of one node.
#[derive(Clone)]
pub struct MetaOwners {
    pub smap: Arc<Owner<Smap>>,
    pub bmd: Arc<Owner<Bmd>>,
    pub rmd: Arc<Owner<Rmd>>,
}

impl MetaOwners {
    /// Fresh in-memory cells (join path and tests).
    pub fn ephemeral() -> Self {
        Self {
            smap: Arc::new(Owner::new(Smap::new())),
            bmd: Arc::new(Owner::new(Bmd::new())),
            rmd: Arc::new(Owner::new(Rmd::new())),
        }
    }

    /// Cells backed by versioned JSON files under `dir`.
    pub fn persistent(dir: &std::path::Path) -> Self {
        Self {
            smap: Arc::new(Owner::persistent(Smap::new(), dir)),
            bmd: Arc::new(Owner::persistent(Bmd::new(), dir)),
            rmd: Arc::new(Owner::persistent(Rmd::new(), dir)),
        }
    }
}

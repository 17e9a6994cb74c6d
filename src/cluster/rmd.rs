//! Rebalance metadata: the versioned generation counter that triggers
//! cluster rebalance and local resilver.

use serde::{Deserialize, Serialize};

use crate::types::MetaVersion;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rmd {
    pub version: MetaVersion,
    /// Set when the next generation must also resilver local data.
    #[serde(default)]
    pub resilver: bool,
    /// Targets that joined or left, prompting the generation bump.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_ids: Vec<String>,
}

impl Rmd {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the generation; each bump corresponds to one global rebalance.
    pub fn inc(&mut self) -> MetaVersion {
        self.version += 1;
        self.version
    }
}

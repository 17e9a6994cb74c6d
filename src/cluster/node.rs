//! Cluster node identity.

use serde::{Deserialize, Serialize};

use crate::config::NodeRole;
use crate::types::NodeId;

/// Health/membership state of a node. Only `Enabled` nodes participate
/// in placement; maintenance and decommissioning nodes stay in the Smap
/// (their data is still being drained) but receive no new objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnodeState {
    #[default]
    Enabled,
    Maintenance,
    Decommissioning,
}

impl std::fmt::Display for SnodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SnodeState::Enabled => "enabled",
            SnodeState::Maintenance => "maintenance",
            SnodeState::Decommissioning => "decommissioning",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for SnodeState {
    type Err = crate::error::AisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(SnodeState::Enabled),
            "maintenance" => Ok(SnodeState::Maintenance),
            "decommissioning" | "decommission" => Ok(SnodeState::Decommissioning),
            other => Err(crate::error::AisError::BadRequest(format!(
                "unknown node state {:?}",
                other
            ))),
        }
    }
}

/// A member of the cluster: a proxy or a storage target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snode {
    pub id: NodeId,
    pub role: NodeRole,
    pub public_url: String,
    pub intra_control_url: String,
    pub intra_data_url: String,
    #[serde(default)]
    pub state: SnodeState,
}

impl Snode {
    pub fn new(
        id: impl Into<NodeId>,
        role: NodeRole,
        public_url: impl Into<String>,
        intra_control_url: impl Into<String>,
        intra_data_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            role,
            public_url: public_url.into(),
            intra_control_url: intra_control_url.into(),
            intra_data_url: intra_data_url.into(),
            state: SnodeState::Enabled,
        }
    }

    pub fn is_proxy(&self) -> bool {
        self.role == NodeRole::Proxy
    }

    pub fn is_target(&self) -> bool {
        self.role == NodeRole::Target
    }

    /// Eligible for placement: enabled, neither in maintenance nor being
    /// decommissioned.
    pub fn is_ready(&self) -> bool {
        self.state == SnodeState::Enabled
    }
}

impl std::fmt::Display for Snode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.role, self.id)
    }
}

/// Content-address a node id from its stable coordinates. Identity is
/// computed once on first start and persisted for the node's lifetime.
pub fn gen_node_id(role: NodeRole, public_url: &str) -> NodeId {
    let digest = xxhash_rust::xxh64::xxh64(
        format!("{}\u{0}{}", role, public_url).as_bytes(),
        0x5f3759df,
    );
    format!("{}{:08x}", role_prefix(role), digest as u32)
}

fn role_prefix(role: NodeRole) -> &'static str {
    match role {
        NodeRole::Proxy => "p",
        NodeRole::Target => "t",
    }
}

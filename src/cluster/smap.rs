//! Cluster map: versioned membership, primary-elected.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{AisError, Result};
use crate::types::{MetaVersion, NodeId};

use super::node::Snode;

/// Authoritative membership plus version. Only the primary proxy mutates
/// the Smap; every other node holds an immutable snapshot received via
/// metasync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Smap {
    pub version: MetaVersion,
    pub primary_id: NodeId,
    pub proxies: BTreeMap<NodeId, Snode>,
    pub targets: BTreeMap<NodeId, Snode>,
}

impl Smap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_primary(&self, id: &str) -> bool {
        self.primary_id == id
    }

    pub fn primary(&self) -> Option<&Snode> {
        self.proxies.get(&self.primary_id)
    }

    pub fn get_node(&self, id: &str) -> Option<&Snode> {
        self.targets.get(id).or_else(|| self.proxies.get(id))
    }

    pub fn get_target(&self, id: &str) -> Result<&Snode> {
        self.targets
            .get(id)
            .ok_or_else(|| AisError::NodeNotFound(id.to_string()))
    }

    pub fn count_targets(&self) -> usize {
        self.targets.len()
    }

    pub fn count_proxies(&self) -> usize {
        self.proxies.len()
    }

    /// Register a node; bumps the version. Idempotent for an identical
    /// registration.
    pub fn add(&mut self, node: Snode) {
        let map = if node.is_target() {
            &mut self.targets
        } else {
            &mut self.proxies
        };
        if map.get(&node.id) == Some(&node) {
            return;
        }
        map.insert(node.id.clone(), node);
        self.version += 1;
    }

    /// Remove a node; bumps the version when it was present.
    pub fn remove(&mut self, id: &str) -> bool {
        let removed = self.targets.remove(id).is_some() || self.proxies.remove(id).is_some();
        if removed {
            self.version += 1;
        }
        removed
    }

    pub fn set_primary(&mut self, id: NodeId) -> Result<()> {
        if !self.proxies.contains_key(&id) {
            return Err(AisError::NodeNotFound(id));
        }
        if self.primary_id != id {
            self.primary_id = id;
            self.version += 1;
        }
        Ok(())
    }

    /// Flip a node's health/membership state (maintenance,
    /// decommissioning); bumps the version on an actual change.
    pub fn set_node_state(&mut self, id: &str, state: super::node::SnodeState) -> Result<()> {
        let node = self
            .targets
            .get_mut(id)
            .or_else(|| self.proxies.get_mut(id))
            .ok_or_else(|| AisError::NodeNotFound(id.to_string()))?;
        if node.state != state {
            node.state = state;
            self.version += 1;
        }
        Ok(())
    }

    /// Targets eligible for placement.
    pub fn ready_targets(&self) -> impl Iterator<Item = &Snode> {
        self.targets.values().filter(|n| n.is_ready())
    }

    /// All peers except `self_id` (metasync fan-out set).
    pub fn peers_except<'a>(&'a self, self_id: &'a str) -> impl Iterator<Item = &'a Snode> {
        self.proxies
            .values()
            .chain(self.targets.values())
            .filter(move |n| n.id != self_id)
    }
}

impl std::fmt::Display for Smap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "smap v{} [{}p/{}t, primary={}]",
            self.version,
            self.proxies.len(),
            self.targets.len(),
            self.primary_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeRole;

    fn target(id: &str) -> Snode {
        Snode::new(
            id,
            NodeRole::Target,
            format!("http://{}:8080", id),
            format!("http://{}:9080", id),
            format!("http://{}:10080", id),
        )
    }

    fn proxy(id: &str) -> Snode {
        Snode::new(
            id,
            NodeRole::Proxy,
            format!("http://{}:8080", id),
            format!("http://{}:9080", id),
            format!("http://{}:10080", id),
        )
    }

    #[test]
    fn test_add_remove_bumps_version() {
        let mut smap = Smap::new();
        smap.add(target("t1"));
        assert_eq!(smap.version, 1);
        // identical re-registration is a no-op
        smap.add(target("t1"));
        assert_eq!(smap.version, 1);

        smap.add(target("t2"));
        assert_eq!(smap.version, 2);
        assert_eq!(smap.count_targets(), 2);

        assert!(smap.remove("t1"));
        assert_eq!(smap.version, 3);
        assert!(!smap.remove("t1"));
        assert_eq!(smap.version, 3);
    }

    #[test]
    fn test_primary_must_be_proxy() {
        let mut smap = Smap::new();
        smap.add(proxy("p1"));
        smap.add(target("t1"));

        assert!(smap.set_primary("t1".to_string()).is_err());
        smap.set_primary("p1".to_string()).unwrap();
        assert!(smap.is_primary("p1"));
    }

    #[test]
    fn test_set_node_state() {
        use super::super::node::SnodeState;

        let mut smap = Smap::new();
        smap.add(target("t1"));
        smap.add(target("t2"));
        let v = smap.version;

        smap.set_node_state("t1", SnodeState::Decommissioning)
            .unwrap();
        assert_eq!(smap.version, v + 1);
        assert_eq!(smap.ready_targets().count(), 1);

        // no-op change does not bump the version
        smap.set_node_state("t1", SnodeState::Decommissioning)
            .unwrap();
        assert_eq!(smap.version, v + 1);

        assert!(smap
            .set_node_state("nope", SnodeState::Maintenance)
            .is_err());
    }

    #[test]
    fn test_peers_except() {
        let mut smap = Smap::new();
        smap.add(proxy("p1"));
        smap.add(target("t1"));
        smap.add(target("t2"));

        let peers: Vec<_> = smap.peers_except("p1").map(|n| n.id.clone()).collect();
        assert_eq!(peers, vec!["t1".to_string(), "t2".to_string()]);
    }
}

//! Highest-random-weight (rendezvous) placement.
//!
//! Two-level scheme: `(bucket, object)` selects the owning target over
//! the current cluster map, then the same function over that target's
//! enabled mountpaths selects where the object lives on disk. Placement
//! is deterministic and stateless given a membership snapshot; a digest
//! tie is broken by lexicographic node id.

use std::sync::Arc;

use xxhash_rust::xxh64::xxh64;

use crate::cluster::{Smap, Snode};
use crate::error::{AisError, Result};
use crate::fs::Mountpath;
use crate::types::Bck;

const HRW_SEED: u64 = 0xa5b1_05bf;

/// Mixing digest for one (candidate, bucket, object) triple. NUL joints
/// keep `("ab","c")` and `("a","bc")` distinct.
fn weight(candidate: &str, bck: &Bck, objname: &str) -> u64 {
    let key = format!("{}\u{0}{}\u{0}{}", candidate, bck, objname);
    xxh64(key.as_bytes(), HRW_SEED)
}

/// Select the target owning `(bck, objname)` over the given cluster map.
/// Only ready targets (enabled, not in maintenance or decommissioning)
/// participate.
pub fn hrw_target<'a>(smap: &'a Smap, bck: &Bck, objname: &str) -> Result<&'a Snode> {
    let mut best: Option<(u64, &Snode)> = None;
    for node in smap.ready_targets() {
        let w = weight(&node.id, bck, objname);
        best = match best {
            None => Some((w, node)),
            Some((bw, bn)) => {
                if w > bw || (w == bw && node.id < bn.id) {
                    Some((w, node))
                } else {
                    Some((bw, bn))
                }
            }
        };
    }
    best.map(|(_, node)| node).ok_or(AisError::NoTargets)
}

/// Select the mountpath for `(bck, objname)` among the enabled set.
pub fn hrw_mountpath(
    mpaths: &[Arc<Mountpath>],
    bck: &Bck,
    objname: &str,
) -> Result<Arc<Mountpath>> {
    let mut best: Option<(u64, &Arc<Mountpath>)> = None;
    for mpath in mpaths.iter().filter(|m| m.enabled) {
        let w = weight(&mpath.path.to_string_lossy(), bck, objname);
        best = match best {
            None => Some((w, mpath)),
            Some((bw, bm)) => {
                if w > bw || (w == bw && mpath.path < bm.path) {
                    Some((w, mpath))
                } else {
                    Some((bw, bm))
                }
            }
        };
    }
    best.map(|(_, m)| Arc::clone(m))
        .ok_or(AisError::NoAvailableMountpath)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Snode;
    use crate::config::NodeRole;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn smap_with_targets(n: usize) -> Smap {
        let mut smap = Smap::new();
        for i in 0..n {
            smap.add(Snode::new(
                format!("t{:02}", i),
                NodeRole::Target,
                format!("http://t{}:8080", i),
                format!("http://t{}:9080", i),
                format!("http://t{}:10080", i),
            ));
        }
        smap
    }

    fn mpaths(n: usize) -> Vec<Arc<Mountpath>> {
        (0..n)
            .map(|i| {
                Arc::new(Mountpath {
                    path: PathBuf::from(format!("/data/mp{}", i)),
                    fsid: i as u64,
                    enabled: true,
                })
            })
            .collect()
    }

    #[test]
    fn test_deterministic() {
        let smap = smap_with_targets(5);
        let bck = Bck::ais("b1");
        let a = hrw_target(&smap, &bck, "obj-42").unwrap();
        let b = hrw_target(&smap, &bck, "obj-42").unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_empty_sets() {
        let smap = Smap::new();
        assert!(matches!(
            hrw_target(&smap, &Bck::ais("b"), "o"),
            Err(AisError::NoTargets)
        ));
        assert!(matches!(
            hrw_mountpath(&[], &Bck::ais("b"), "o"),
            Err(AisError::NoAvailableMountpath)
        ));
    }

    #[test]
    fn test_distribution_roughly_even() {
        let smap = smap_with_targets(4);
        let bck = Bck::ais("b1");
        let mut counts: HashMap<String, usize> = HashMap::new();
        for i in 0..4000 {
            let node = hrw_target(&smap, &bck, &format!("obj-{}", i)).unwrap();
            *counts.entry(node.id.clone()).or_default() += 1;
        }
        assert_eq!(counts.len(), 4);
        for (_, cnt) in counts {
            // each target should land near 1000 of 4000
            assert!(cnt > 700 && cnt < 1300, "skewed placement: {}", cnt);
        }
    }

    #[test]
    fn test_minimal_disruption_on_membership_change() {
        let mut smap = smap_with_targets(4);
        let bck = Bck::ais("b1");
        let before: Vec<String> = (0..1000)
            .map(|i| {
                hrw_target(&smap, &bck, &format!("obj-{}", i))
                    .unwrap()
                    .id
                    .clone()
            })
            .collect();

        smap.add(Snode::new(
            "t99",
            NodeRole::Target,
            "http://t99:8080",
            "http://t99:9080",
            "http://t99:10080",
        ));

        let moved = (0..1000)
            .filter(|i| {
                let now = hrw_target(&smap, &bck, &format!("obj-{}", i)).unwrap();
                now.id != before[*i as usize]
            })
            .count();
        // adding a fifth target should move roughly 1/5 of the keys
        assert!(moved > 100 && moved < 350, "moved {}", moved);
    }

    #[test]
    fn test_unready_targets_excluded() {
        use crate::cluster::SnodeState;

        let mut smap = smap_with_targets(4);
        let bck = Bck::ais("b1");

        // find an object owned by t00, then start decommissioning t00
        let victim = (0..1000)
            .map(|i| format!("obj-{}", i))
            .find(|o| hrw_target(&smap, &bck, o).unwrap().id == "t00")
            .expect("some object maps to t00");

        smap.set_node_state("t00", SnodeState::Decommissioning)
            .unwrap();
        for i in 0..1000 {
            let owner = hrw_target(&smap, &bck, &format!("obj-{}", i)).unwrap();
            assert_ne!(owner.id, "t00", "decommissioning target was chosen");
        }
        // the displaced object now has a new, ready owner
        let owner = hrw_target(&smap, &bck, &victim).unwrap();
        assert!(owner.is_ready());

        // maintenance excludes the same way; re-enabling restores
        smap.set_node_state("t01", SnodeState::Maintenance).unwrap();
        for i in 0..1000 {
            let owner = hrw_target(&smap, &bck, &format!("obj-{}", i)).unwrap();
            assert!(owner.id != "t00" && owner.id != "t01");
        }
        smap.set_node_state("t00", SnodeState::Enabled).unwrap();
        assert_eq!(hrw_target(&smap, &bck, &victim).unwrap().id, "t00");
    }

    #[test]
    fn test_no_ready_targets() {
        use crate::cluster::SnodeState;

        let mut smap = smap_with_targets(2);
        smap.set_node_state("t00", SnodeState::Maintenance).unwrap();
        smap.set_node_state("t01", SnodeState::Decommissioning)
            .unwrap();
        assert!(matches!(
            hrw_target(&smap, &Bck::ais("b"), "o"),
            Err(AisError::NoTargets)
        ));
    }

    #[test]
    fn test_disabled_mountpaths_excluded() {
        let mut mps = mpaths(3);
        let bck = Bck::ais("b1");

        // find an object landing on mp0, then disable mp0
        let obj = (0..1000)
            .map(|i| format!("o{}", i))
            .find(|o| {
                hrw_mountpath(&mps, &bck, o).unwrap().path == PathBuf::from("/data/mp0")
            })
            .expect("some object maps to mp0");

        let mut disabled = (*mps[0]).clone();
        disabled.enabled = false;
        mps[0] = Arc::new(disabled);

        let chosen = hrw_mountpath(&mps, &bck, &obj).unwrap();
        assert_ne!(chosen.path, PathBuf::from("/data/mp0"));
    }
}

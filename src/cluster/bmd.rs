//! Bucket metadata: the authoritative, versioned bucket catalog.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{Bck, BucketProps, MetaVersion};

/// The bucket catalog. Invariants:
/// - `add` succeeds iff the bucket is absent;
/// - `del` succeeds iff the bucket is present;
/// - a bucket marked renamed is read-sealed until its successor commits;
/// - the version strictly increases on every committed mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bmd {
    pub version: MetaVersion,
    pub buckets: BTreeMap<Bck, BucketProps>,
}

impl Bmd {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bck: &Bck) -> Option<&BucketProps> {
        self.buckets.get(bck)
    }

    pub fn contains(&self, bck: &Bck) -> bool {
        self.buckets.contains_key(bck)
    }

    /// True when the bucket exists and is not read-sealed by a rename.
    pub fn is_readable(&self, bck: &Bck) -> bool {
        self.buckets
            .get(bck)
            .map(|props| !props.is_renamed())
            .unwrap_or(false)
    }

    /// Insert a new bucket. Returns false (and leaves the catalog
    /// untouched) when the bucket is already present.
    pub fn add(&mut self, bck: Bck, props: BucketProps) -> bool {
        if self.buckets.contains_key(&bck) {
            return false;
        }
        self.buckets.insert(bck, props);
        self.version += 1;
        true
    }

    /// Delete a bucket. Returns false when absent.
    pub fn del(&mut self, bck: &Bck) -> bool {
        if self.buckets.remove(bck).is_none() {
            return false;
        }
        self.version += 1;
        true
    }

    /// Replace the properties of an existing bucket. Returns false when
    /// absent.
    pub fn set(&mut self, bck: &Bck, props: BucketProps) -> bool {
        match self.buckets.get_mut(bck) {
            Some(slot) => {
                *slot = props;
                self.version += 1;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Buckets visible to listings: renamed sources are filtered out.
    pub fn select(&self, provider: Option<crate::types::Provider>) -> Vec<Bck> {
        self.buckets
            .iter()
            .filter(|(bck, props)| {
                !props.is_renamed() && provider.map(|p| bck.provider == p).unwrap_or(true)
            })
            .map(|(bck, _)| bck.clone())
            .collect()
    }
}

impl std::fmt::Display for Bmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bmd v{} [{} buckets]", self.version, self.buckets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Provider;

    #[test]
    fn test_add_iff_absent() {
        let mut bmd = Bmd::new();
        let bck = Bck::ais("b1");
        assert!(bmd.add(bck.clone(), BucketProps::default_props()));
        assert_eq!(bmd.version, 1);
        assert!(!bmd.add(bck.clone(), BucketProps::default_props()));
        assert_eq!(bmd.version, 1);
    }

    #[test]
    fn test_del_iff_present() {
        let mut bmd = Bmd::new();
        let bck = Bck::ais("b1");
        assert!(!bmd.del(&bck));
        assert_eq!(bmd.version, 0);

        bmd.add(bck.clone(), BucketProps::default_props());
        assert!(bmd.del(&bck));
        assert_eq!(bmd.version, 2);
    }

    #[test]
    fn test_renamed_is_read_sealed() {
        let mut bmd = Bmd::new();
        let bck = Bck::ais("old");
        bmd.add(bck.clone(), BucketProps::default_props());
        assert!(bmd.is_readable(&bck));

        let mut props = bmd.get(&bck).unwrap().clone();
        props.renamed = Some("rename-lb".to_string());
        bmd.set(&bck, props);
        assert!(bmd.contains(&bck));
        assert!(!bmd.is_readable(&bck));
        // and it is hidden from listings
        assert!(bmd.select(Some(Provider::Ais)).is_empty());
    }

    #[test]
    fn test_version_strictly_increases() {
        let mut bmd = Bmd::new();
        let bck = Bck::ais("b1");
        let mut last = bmd.version;
        bmd.add(bck.clone(), BucketProps::default_props());
        assert!(bmd.version > last);
        last = bmd.version;
        bmd.set(&bck, BucketProps::default_props());
        assert!(bmd.version > last);
        last = bmd.version;
        bmd.del(&bck);
        assert!(bmd.version > last);
    }
}

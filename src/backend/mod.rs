//! Cloud backend interface.
//!
//! Each third-party provider implements [`CloudProvider`]; the adapters
//! themselves (AWS, GCP, Azure SDK glue) are external plug-ins. The core
//! ships the trait, the error mapping, and an in-memory backend used by
//! tests and by `backend_bck`-tiered development setups.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::{AisError, Result};
use crate::types::{Bck, BucketEntry, BucketList, Provider, SelectMsg};

/// Object metadata as reported by a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjMeta {
    pub size: u64,
    pub version: String,
    pub checksum: String,
}

/// The fixed operation set every cloud backend provides. All failures
/// surface as [`AisError::CloudError`] with an HTTP-style status code;
/// a 404 on a bucket is translated to `RemoteBucketDoesNotExist`.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn provider(&self) -> Provider;

    async fn list_buckets(&self) -> Result<Vec<Bck>>;

    async fn head_bucket(&self, bck: &Bck) -> Result<HashMap<String, String>>;

    async fn list_objects(&self, bck: &Bck, msg: &SelectMsg) -> Result<BucketList>;

    async fn head_obj(&self, bck: &Bck, name: &str) -> Result<ObjMeta>;

    /// Fetch the full object; the caller streams it into a workfile.
    async fn get_obj(&self, bck: &Bck, name: &str) -> Result<(Bytes, ObjMeta)>;

    /// Store an object; returns the cloud-side version.
    async fn put_obj(&self, bck: &Bck, name: &str, data: Bytes) -> Result<String>;

    async fn delete_obj(&self, bck: &Bck, name: &str) -> Result<()>;
}

/// Per-node table of configured backends.
#[derive(Default)]
pub struct BackendRegistry {
    providers: RwLock<HashMap<Provider, Arc<dyn CloudProvider>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, backend: Arc<dyn CloudProvider>) {
        self.providers.write().insert(backend.provider(), backend);
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn CloudProvider>> {
        self.providers.read().get(&provider).cloned().ok_or_else(|| {
            AisError::BadRequest(format!("no backend configured for provider {}", provider))
        })
    }

    pub fn has(&self, provider: Provider) -> bool {
        self.providers.read().contains_key(&provider)
    }
}

/// In-memory cloud backend: deterministic, versioned, failure-free.
pub struct MemBackend {
    provider: Provider,
    buckets: RwLock<HashMap<String, BTreeMap<String, (Bytes, ObjMeta)>>>,
}

impl MemBackend {
    pub fn new(provider: Provider) -> Arc<Self> {
        Arc::new(Self {
            provider,
            buckets: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_bucket(provider: Provider, name: &str) -> Arc<Self> {
        let backend = Self::new(provider);
        backend.buckets.write().insert(name.to_string(), BTreeMap::new());
        backend
    }

    pub fn create_bucket(&self, name: &str) {
        self.buckets.write().entry(name.to_string()).or_default();
    }

    fn not_found(&self, bck: &Bck) -> AisError {
        AisError::from_cloud(404, format!("bucket {} not found", bck), bck)
    }
}

#[async_trait]
impl CloudProvider for MemBackend {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn list_buckets(&self) -> Result<Vec<Bck>> {
        Ok(self
            .buckets
            .read()
            .keys()
            .map(|name| Bck::new(self.provider, name.clone()))
            .collect())
    }

    async fn head_bucket(&self, bck: &Bck) -> Result<HashMap<String, String>> {
        let buckets = self.buckets.read();
        let objects = buckets.get(&bck.name).ok_or_else(|| self.not_found(bck))?;
        let mut props = HashMap::new();
        props.insert("provider".to_string(), self.provider.to_string());
        props.insert("object_count".to_string(), objects.len().to_string());
        Ok(props)
    }

    async fn list_objects(&self, bck: &Bck, msg: &SelectMsg) -> Result<BucketList> {
        let buckets = self.buckets.read();
        let objects = buckets.get(&bck.name).ok_or_else(|| self.not_found(bck))?;
        let page_size = msg.effective_page_size();

        let mut entries: Vec<BucketEntry> = objects
            .range(msg.page_marker.clone()..)
            .filter(|(name, _)| *name != &msg.page_marker)
            .filter(|(name, _)| name.starts_with(&msg.prefix))
            .take(page_size + 1)
            .map(|(name, (_, meta))| BucketEntry {
                name: name.clone(),
                size: meta.size,
                checksum: meta.checksum.clone(),
                atime: None,
                version: meta.version.clone(),
            })
            .collect();

        let page_marker = if entries.len() > page_size {
            entries.truncate(page_size);
            entries.last().map(|e| e.name.clone()).unwrap_or_default()
        } else {
            String::new()
        };
        Ok(BucketList {
            entries,
            page_marker,
        })
    }

    async fn head_obj(&self, bck: &Bck, name: &str) -> Result<ObjMeta> {
        let buckets = self.buckets.read();
        let objects = buckets.get(&bck.name).ok_or_else(|| self.not_found(bck))?;
        objects
            .get(name)
            .map(|(_, meta)| meta.clone())
            .ok_or_else(|| AisError::CloudError {
                status: 404,
                message: format!("object {} not found", name),
            })
    }

    async fn get_obj(&self, bck: &Bck, name: &str) -> Result<(Bytes, ObjMeta)> {
        let buckets = self.buckets.read();
        let objects = buckets.get(&bck.name).ok_or_else(|| self.not_found(bck))?;
        objects
            .get(name)
            .cloned()
            .ok_or_else(|| AisError::CloudError {
                status: 404,
                message: format!("object {} not found", name),
            })
    }

    async fn put_obj(&self, bck: &Bck, name: &str, data: Bytes) -> Result<String> {
        let mut buckets = self.buckets.write();
        let objects = buckets
            .get_mut(&bck.name)
            .ok_or_else(|| self.not_found(bck))?;
        // strictly advancing per write: parse the `v<N>` counter
        let next = objects
            .get(name)
            .and_then(|(_, m)| m.version.strip_prefix('v'))
            .and_then(|n| n.parse::<u64>().ok())
            .map(|n| n + 1)
            .unwrap_or(1);
        let version = format!("v{}", next);
        let meta = ObjMeta {
            size: data.len() as u64,
            version: version.clone(),
            checksum: format!("{:016x}", xxhash_rust::xxh64::xxh64(&data, 0)),
        };
        objects.insert(name.to_string(), (data, meta));
        Ok(version)
    }

    async fn delete_obj(&self, bck: &Bck, name: &str) -> Result<()> {
        let mut buckets = self.buckets.write();
        let objects = buckets
            .get_mut(&bck.name)
            .ok_or_else(|| self.not_found(bck))?;
        objects.remove(name).map(|_| ()).ok_or(AisError::CloudError {
            status: 404,
            message: format!("object {} not found", name),
        })
    }
}

//! Local object metadata (LOM).
//!
//! Target-local record of one stored object: size, checksum, cloud-side
//! version, access time, and the mountpaths holding replicas. Persisted
//! as JSON under the owning mountpath's `%meta` tree, mirroring the data
//! tree layout.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::fs::Mountpath;
use crate::types::Bck;

const META_DIR: &str = "%meta";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lom {
    pub bck: Bck,
    pub obj_name: String,
    pub size: u64,
    pub checksum: String,
    /// Cloud-side version, when the object came from a backend.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    pub mtime: chrono::DateTime<chrono::Utc>,
    /// Mountpath roots holding replicas, the HRW home first.
    pub copies: Vec<PathBuf>,
}

impl Lom {
    pub fn new(bck: Bck, obj_name: impl Into<String>, size: u64, checksum: String) -> Self {
        Self {
            bck,
            obj_name: obj_name.into(),
            size,
            checksum,
            version: String::new(),
            mtime: chrono::Utc::now(),
            copies: Vec::new(),
        }
    }

    /// Metadata file path on the given mountpath.
    pub fn meta_fqn(&self, mpath: &Mountpath) -> PathBuf {
        mpath
            .path
            .join(META_DIR)
            .join(self.bck.provider.fs_kind())
            .join(&self.bck.name)
            .join(format!("{}.json", self.obj_name))
    }

    pub fn persist(&self, mpath: &Mountpath) -> Result<()> {
        let path = self.meta_fqn(mpath);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(mpath: &Mountpath, bck: &Bck, obj_name: &str) -> Option<Self> {
        let path = mpath
            .path
            .join(META_DIR)
            .join(bck.provider.fs_kind())
            .join(&bck.name)
            .join(format!("{}.json", obj_name));
        let bytes = std::fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn remove(&self, mpath: &Mountpath) {
        let _ = std::fs::remove_file(self.meta_fqn(mpath));
    }

    pub fn add_copy(&mut self, mpath: &Arc<Mountpath>) {
        if !self.copies.contains(&mpath.path) {
            self.copies.push(mpath.path.clone());
        }
    }

    pub fn drop_copy(&mut self, mpath: &Arc<Mountpath>) {
        self.copies.retain(|p| p != &mpath.path);
    }
}

/// xxh64 checksum of an object body, as carried in checksum headers.
pub fn body_checksum(body: &[u8]) -> String {
    format!("{:016x}", xxhash_rust::xxh64::xxh64(body, 0))
}

//! Core type definitions for the aisd object storage cluster.
//!
//! This module contains the fundamental data types used throughout aisd:
//! bucket identity ([`Bck`]), per-bucket properties ([`BucketProps`]),
//! the action/select message envelopes of the REST API, and object
//! listing types.
//!
//! # Key Types
//!
//! - [`Bck`]: globally-unique bucket key `(provider, namespace, name)`
//! - [`BucketProps`]: versioning / checksum / mirror / EC / LRU policy
//! - [`ActionMsg`]: the `{action, name, value}` JSON envelope
//! - [`SelectMsg`]: paged object listing parameters

use serde::{Deserialize, Serialize};

use crate::error::{AisError, Result};

/// Unique identifier of a cluster node (content-addressed on first start).
pub type NodeId = String;

/// Monotonic version of a replicated metadata item (Smap / BMD / RMD).
pub type MetaVersion = i64;

/// Maximum accepted bucket name length.
pub const MAX_BCK_NAME_LEN: usize = 64;

/// Default page size for ais bucket listings.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Bucket provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Ais,
    Aws,
    Gcp,
    Azure,
}

impl Provider {
    /// True for third-party cloud providers (anything but the home namespace).
    pub fn is_remote(&self) -> bool {
        !matches!(self, Provider::Ais)
    }

    /// The on-disk bucket-kind directory under a mountpath root.
    pub fn fs_kind(&self) -> &'static str {
        match self {
            Provider::Ais => "ais",
            _ => "cloud",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Provider::Ais => "ais",
            Provider::Aws => "aws",
            Provider::Gcp => "gcp",
            Provider::Azure => "azure",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Provider {
    type Err = AisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ais" | "" => Ok(Provider::Ais),
            "aws" | "s3" => Ok(Provider::Aws),
            "gcp" | "gs" => Ok(Provider::Gcp),
            "azure" | "az" => Ok(Provider::Azure),
            other => Err(AisError::BadRequest(format!("unknown provider {:?}", other))),
        }
    }
}

/// Globally-unique bucket key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Bck {
    pub provider: Provider,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ns: String,
    pub name: String,
}

impl Bck {
    pub fn new(provider: Provider, name: impl Into<String>) -> Self {
        Self {
            provider,
            ns: String::new(),
            name: name.into(),
        }
    }

    pub fn ais(name: impl Into<String>) -> Self {
        Self::new(Provider::Ais, name)
    }

    pub fn is_ais(&self) -> bool {
        self.provider == Provider::Ais
    }

    pub fn is_remote(&self) -> bool {
        self.provider.is_remote()
    }

    /// Validate the bucket name before any RPC is issued.
    ///
    /// Rejected: empty names, path separators, the workfile prefix, names
    /// longer than [`MAX_BCK_NAME_LEN`], and characters outside
    /// `[A-Za-z0-9._-]`.
    pub fn validate_name(&self) -> Result<()> {
        let name = &self.name;
        let fail = |reason: &str| {
            Err(AisError::InvalidBucketName {
                name: name.clone(),
                reason: reason.to_string(),
            })
        };
        if name.is_empty() {
            return fail("empty name");
        }
        if name.len() > MAX_BCK_NAME_LEN {
            return fail("name too long");
        }
        if name.contains('/') || name.contains('\\') {
            return fail("name must not contain path separators");
        }
        if name.starts_with(crate::fs::content::WORKFILE_PREFIX) {
            return fail("reserved prefix");
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return fail("name may contain only alphanumerics, '.', '_' and '-'");
        }
        Ok(())
    }
}

impl std::fmt::Display for Bck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.ns.is_empty() {
            write!(f, "{}://{}", self.provider, self.name)
        } else {
            write!(f, "{}://{}/{}", self.provider, self.ns, self.name)
        }
    }
}

/// Versioning policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionConf {
    pub enabled: bool,
}

/// Checksum policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CksumConf {
    #[serde(rename = "type")]
    pub ty: CksumType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CksumType {
    XxHash,
    None,
}

impl Default for CksumConf {
    fn default() -> Self {
        Self {
            ty: CksumType::XxHash,
        }
    }
}

/// Local mirroring (replication across mountpaths).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConf {
    pub enabled: bool,
    pub copies: i64,
}

impl Default for MirrorConf {
    fn default() -> Self {
        Self {
            enabled: false,
            copies: 1,
        }
    }
}

/// Erasure coding policy. Once enabled, the slice counts are immutable;
/// the only allowed reconfiguration is disabling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcConf {
    pub enabled: bool,
    pub data_slices: i64,
    pub parity_slices: i64,
}

impl EcConf {
    pub fn required_targets(&self) -> i64 {
        self.data_slices + self.parity_slices + 1
    }
}

/// LRU eviction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LruConf {
    pub enabled: bool,
    pub lowwm: i64,
    pub highwm: i64,
    #[serde(with = "humantime_serde")]
    pub dont_evict_time: std::time::Duration,
}

impl Default for LruConf {
    fn default() -> Self {
        Self {
            enabled: true,
            lowwm: 75,
            highwm: 90,
            dont_evict_time: std::time::Duration::from_secs(120 * 60),
        }
    }
}

/// Access permission bits.
pub type AccessBits = u64;

pub const ACCESS_GET: AccessBits = 1 << 0;
pub const ACCESS_PUT: AccessBits = 1 << 1;
pub const ACCESS_DELETE: AccessBits = 1 << 2;
pub const ACCESS_ALL: AccessBits = ACCESS_GET | ACCESS_PUT | ACCESS_DELETE;

/// Per-bucket properties, stored in the BMD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketProps {
    pub created: chrono::DateTime<chrono::Utc>,
    pub versioning: VersionConf,
    pub checksum: CksumConf,
    pub mirror: MirrorConf,
    pub ec: EcConf,
    pub lru: LruConf,
    pub access: AccessBits,
    /// Optional cloud bucket this ais bucket is tiered against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_bck: Option<Bck>,
    /// Set while the bucket is the source of an in-flight rename;
    /// a renamed bucket is read-sealed until its successor commits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renamed: Option<String>,
}

impl BucketProps {
    pub fn default_props() -> Self {
        Self {
            created: chrono::Utc::now(),
            versioning: VersionConf::default(),
            checksum: CksumConf::default(),
            mirror: MirrorConf::default(),
            ec: EcConf::default(),
            lru: LruConf::default(),
            access: ACCESS_ALL,
            backend_bck: None,
            renamed: None,
        }
    }

    pub fn is_renamed(&self) -> bool {
        self.renamed.is_some()
    }

    /// Apply a partial update, returning the merged copy.
    pub fn apply(&self, patch: &PropsPatch) -> Self {
        let mut next = self.clone();
        if let Some(v) = &patch.versioning {
            next.versioning = *v;
        }
        if let Some(c) = &patch.checksum {
            next.checksum = c.clone();
        }
        if let Some(m) = &patch.mirror {
            next.mirror = *m;
        }
        if let Some(e) = &patch.ec {
            next.ec = *e;
        }
        if let Some(l) = &patch.lru {
            next.lru = *l;
        }
        if let Some(a) = patch.access {
            next.access = a;
        }
        if let Some(b) = &patch.backend_bck {
            next.backend_bck = Some(b.clone());
        }
        next
    }
}

/// Partial bucket-properties update (set-props payload).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versioning: Option<VersionConf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<CksumConf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<MirrorConf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ec: Option<EcConf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lru: Option<LruConf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<AccessBits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_bck: Option<Bck>,
}

// Bucket and xaction actions carried in ActionMsg.action.
pub const ACT_CREATE_BCK: &str = "create-bck";
pub const ACT_DESTROY_BCK: &str = "destroy-bck";
pub const ACT_EVICT_CB: &str = "evict-cb";
pub const ACT_RENAME_LB: &str = "rename-lb";
pub const ACT_COPY_BCK: &str = "copy-bck";
pub const ACT_SET_PROPS: &str = "set-props";
pub const ACT_RESET_PROPS: &str = "reset-props";
pub const ACT_MAKE_N_COPIES: &str = "makencopies";
pub const ACT_EC_ENCODE: &str = "ecencode";
pub const ACT_PREFETCH: &str = "prefetch";
pub const ACT_LIST: &str = "list";
pub const ACT_SUMMARY: &str = "summary";
pub const ACT_XACT_START: &str = "start";
pub const ACT_XACT_STOP: &str = "stop";

/// The `{action, name, value}` envelope of bucket-level POST/DELETE calls
/// and the inter-node transaction message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionMsg {
    pub action: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub value: serde_json::Value,
}

impl ActionMsg {
    pub fn new(action: &str) -> Self {
        Self {
            action: action.to_string(),
            ..Default::default()
        }
    }

    pub fn with_value<T: Serialize>(action: &str, value: &T) -> Result<Self> {
        Ok(Self {
            action: action.to_string(),
            name: String::new(),
            value: serde_json::to_value(value)?,
        })
    }

    pub fn parse_value<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.value.clone())?)
    }
}

/// Object listing parameters (`GET /v1/buckets/<bucket>?what=list`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectMsg {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub page_marker: String,
    /// 0 means provider default.
    #[serde(default)]
    pub page_size: usize,
    #[serde(default)]
    pub fast: bool,
    #[serde(default)]
    pub cached: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task_id: String,
}

impl SelectMsg {
    pub fn effective_page_size(&self) -> usize {
        if self.page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.page_size
        }
    }
}

/// One entry of an object listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketEntry {
    pub name: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atime: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

/// A page of an object listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketList {
    pub entries: Vec<BucketEntry>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub page_marker: String,
}

/// Xaction control message (`GET/PUT /v1/xactions` payload).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XactionMsg {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bck: Option<Bck>,
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub latest: bool,
}

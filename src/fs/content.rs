//! Content types and workfile naming.
//!
//! Besides objects, the data path deals with transient files: download
//! workfiles, rebalance artifacts, EC slices, dSort spill files. Each
//! content type registers a [`ContentResolver`] that encodes its
//! permissions (may rebalance move it, may LRU evict it, may services
//! checksum it) and its basename encoding.
//!
//! A workfile basename is `.~~~.<type>.<base>.<tiebreak>.<pid>`. The pid
//! segment lets a later process incarnation recognize orphans: a parsed
//! workfile whose pid differs from the current process is `old`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::warn;

use crate::error::{AisError, Result};

/// Prefix separating workfiles from objects in the same directory tree.
pub const WORKFILE_PREFIX: &str = ".~~~.";

/// Registered workfile type tags.
pub const CT_DEFAULT: &str = "wk";
pub const CT_DOWNLOAD: &str = "dl";
pub const CT_REBALANCE: &str = "reb";
pub const CT_EC: &str = "ec";
pub const CT_DSORT: &str = "ds";

/// Per-content-type permissions and naming.
pub trait ContentResolver: Send + Sync {
    /// Rebalance may relocate this content to another target.
    fn perm_to_move(&self) -> bool {
        false
    }
    /// LRU may evict/delete this content.
    fn perm_to_evict(&self) -> bool {
        false
    }
    /// The content may be checksummed / scanned / shown.
    fn perm_to_process(&self) -> bool {
        false
    }

    /// Append the type-specific opaque segment to `base`.
    fn gen_unique(&self, base: &str) -> String {
        let tiebreak: u32 = rand::random();
        format!("{}.{:08x}.{:x}", base, tiebreak, std::process::id())
    }

    /// Parse the opaque segment back; returns `(original_base, old)`.
    fn parse_unique(&self, encoded: &str) -> Option<(String, bool)> {
        let pid_idx = encoded.rfind('.')?;
        let tie_idx = encoded[..pid_idx].rfind('.')?;
        let pid = u32::from_str_radix(&encoded[pid_idx + 1..], 16).ok()?;
        u32::from_str_radix(&encoded[tie_idx + 1..pid_idx], 16).ok()?;
        Some((encoded[..tie_idx].to_string(), pid != std::process::id()))
    }
}

/// Default workfile: all permissions denied.
pub struct DefaultWorkfile;

impl ContentResolver for DefaultWorkfile {}

/// Parsed workfile info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentInfo {
    pub dir: PathBuf,
    /// Original base name the workfile was derived from.
    pub base: String,
    /// Orphan from an earlier process incarnation.
    pub old: bool,
    pub ty: String,
}

/// Process-wide registry of content types. Registration happens at node
/// start; the data path only reads.
pub struct ContentRegistry {
    types: RwLock<HashMap<String, Box<dyn ContentResolver>>>,
}

impl ContentRegistry {
    /// Registry pre-populated with the standard types.
    pub fn new() -> Self {
        let registry = Self {
            types: RwLock::new(HashMap::new()),
        };
        registry
            .register(CT_DEFAULT, Box::new(DefaultWorkfile))
            .expect("fresh registry");
        registry
            .register(CT_DOWNLOAD, Box::new(DefaultWorkfile))
            .expect("fresh registry");
        registry
            .register(CT_REBALANCE, Box::new(RebalanceContent))
            .expect("fresh registry");
        registry
            .register(CT_EC, Box::new(EcSliceContent))
            .expect("fresh registry");
        registry
            .register(CT_DSORT, Box::new(DefaultWorkfile))
            .expect("fresh registry");
        registry
    }

    /// Register a content type. The tag must not contain a dot (it is the
    /// field separator).
    pub fn register(&self, ty: &str, resolver: Box<dyn ContentResolver>) -> Result<()> {
        if ty.contains('.') || ty.is_empty() {
            return Err(AisError::BadRequest(format!(
                "content type {:?} must be non-empty and dot-free",
                ty
            )));
        }
        let mut types = self.types.write();
        if types.contains_key(ty) {
            return Err(AisError::BadRequest(format!(
                "content type {:?} already registered",
                ty
            )));
        }
        types.insert(ty.to_string(), resolver);
        Ok(())
    }

    /// Derive a workfile path from an object path, for content type `ty`.
    pub fn gen_workfile_fqn(&self, fqn: &Path, ty: &str) -> Result<PathBuf> {
        let types = self.types.read();
        let resolver = types
            .get(ty)
            .ok_or_else(|| AisError::Internal(format!("content type {:?} not registered", ty)))?;
        let dir = fqn.parent().unwrap_or_else(|| Path::new(""));
        let base = fqn
            .file_name()
            .and_then(|b| b.to_str())
            .ok_or_else(|| AisError::BadRequest(format!("bad fqn {}", fqn.display())))?;
        Ok(dir.join(format!(
            "{}{}.{}",
            WORKFILE_PREFIX,
            ty,
            resolver.gen_unique(base)
        )))
    }

    /// Classify a path. `None` means a plain object path.
    pub fn parse(&self, fqn: &Path) -> Option<ContentInfo> {
        let base = fqn.file_name()?.to_str()?;
        let rest = base.strip_prefix(WORKFILE_PREFIX)?;
        let ty_end = rest.find('.')?;
        let ty = &rest[..ty_end];

        let types = self.types.read();
        let Some(resolver) = types.get(ty) else {
            warn!(fqn = %fqn.display(), "workfile-like name with unregistered content type");
            return None;
        };
        let (orig, old) = resolver.parse_unique(&rest[ty_end + 1..])?;
        Some(ContentInfo {
            dir: fqn.parent().unwrap_or_else(|| Path::new("")).to_path_buf(),
            base: orig,
            old,
            ty: ty.to_string(),
        })
    }

    /// Permission lookup for housekeeping walkers.
    pub fn perms(&self, ty: &str) -> Option<(bool, bool, bool)> {
        let types = self.types.read();
        types
            .get(ty)
            .map(|r| (r.perm_to_move(), r.perm_to_evict(), r.perm_to_process()))
    }

    /// True when the basename carries the workfile prefix, registered
    /// type or not. Listings use this fast check to exclude non-objects.
    pub fn is_workfile_name(base: &str) -> bool {
        base.starts_with(WORKFILE_PREFIX)
    }
}

impl Default for ContentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Rebalance artifacts may be moved between targets but never evicted.
struct RebalanceContent;

impl ContentResolver for RebalanceContent {
    fn perm_to_move(&self) -> bool {
        true
    }
    fn perm_to_process(&self) -> bool {
        true
    }
}

/// EC slices can be relocated and checksummed.
struct EcSliceContent;

impl ContentResolver for EcSliceContent {
    fn perm_to_move(&self) -> bool {
        true
    }
    fn perm_to_process(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workfile_roundtrip() {
        let registry = ContentRegistry::new();
        let fqn = Path::new("/mp1/ais/b1/dir/obj.tar");
        let wfqn = registry.gen_workfile_fqn(fqn, CT_DOWNLOAD).unwrap();

        let base = wfqn.file_name().unwrap().to_str().unwrap();
        assert!(base.starts_with(WORKFILE_PREFIX));
        assert_eq!(wfqn.parent(), fqn.parent());

        let info = registry.parse(&wfqn).unwrap();
        assert_eq!(info.ty, CT_DOWNLOAD);
        assert_eq!(info.base, "obj.tar");
        assert!(!info.old, "same-process workfile must not be old");
    }

    #[test]
    fn test_foreign_pid_is_old() {
        let registry = ContentRegistry::new();
        // hand-build a workfile name with a pid that is not ours
        let foreign_pid = std::process::id().wrapping_add(1);
        let name = format!("{}dl.obj.0000abcd.{:x}", WORKFILE_PREFIX, foreign_pid);
        let info = registry.parse(Path::new("/mp1/ais/b1").join(name).as_path()).unwrap();
        assert!(info.old);
        assert_eq!(info.base, "obj");
    }

    #[test]
    fn test_plain_object_not_workfile() {
        let registry = ContentRegistry::new();
        assert!(registry.parse(Path::new("/mp1/ais/b1/obj")).is_none());
        assert!(!ContentRegistry::is_workfile_name("obj"));
        assert!(ContentRegistry::is_workfile_name(".~~~.dl.obj.1.2"));
    }

    #[test]
    fn test_register_validation() {
        let registry = ContentRegistry::new();
        assert!(registry.register("a.b", Box::new(DefaultWorkfile)).is_err());
        assert!(registry.register("", Box::new(DefaultWorkfile)).is_err());
        assert!(registry
            .register(CT_DOWNLOAD, Box::new(DefaultWorkfile))
            .is_err());
        assert!(registry.register("mine", Box::new(DefaultWorkfile)).is_ok());
    }

    #[test]
    fn test_default_perms_denied() {
        let registry = ContentRegistry::new();
        assert_eq!(registry.perms(CT_DEFAULT), Some((false, false, false)));
        assert_eq!(registry.perms(CT_REBALANCE), Some((true, false, true)));
        assert_eq!(registry.perms("nope"), None);
    }

    #[test]
    fn test_base_with_dots_survives() {
        let registry = ContentRegistry::new();
        let fqn = Path::new("/mp1/cloud/b/data.v2.json");
        let wfqn = registry.gen_workfile_fqn(fqn, CT_DEFAULT).unwrap();
        let info = registry.parse(&wfqn).unwrap();
        assert_eq!(info.base, "data.v2.json");
    }
}

//! Fully-qualified names: the bidirectional map between (bucket, object)
//! and on-disk paths.
//!
//! The canonical layout under a mountpath root is
//! `<root>/<ais|cloud>/<bucket-name>/<object-name>`; workfiles live in
//! the same tree with the workfile prefix on the basename.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{AisError, Result};
use crate::types::{Bck, Provider};

use super::mountpath::Mountpath;

/// Build the on-disk path of an object on a given mountpath.
pub fn fqn(mpath: &Mountpath, bck: &Bck, objname: &str) -> PathBuf {
    mpath
        .path
        .join(bck.provider.fs_kind())
        .join(&bck.name)
        .join(objname)
}

/// The bucket directory on a mountpath.
pub fn bucket_dir(mpath: &Mountpath, bck: &Bck) -> PathBuf {
    mpath.path.join(bck.provider.fs_kind()).join(&bck.name)
}

/// A path resolved back into cluster coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFqn {
    pub mpath: Arc<Mountpath>,
    pub kind: Provider,
    pub bucket: String,
    pub objname: String,
}

/// Resolve an absolute path back to `(mountpath, kind, bucket, object)`.
///
/// The `kind` segment only distinguishes `ais` from `cloud`; resolving a
/// cloud path yields the generic cloud provider slot and the caller maps
/// it through the BMD.
pub fn parse_fqn(mpaths: &[Arc<Mountpath>], path: &Path) -> Result<ParsedFqn> {
    let mpath = mpaths
        .iter()
        .find(|m| path.starts_with(&m.path))
        .cloned()
        .ok_or_else(|| {
            AisError::BadRequest(format!("{} is outside every mountpath", path.display()))
        })?;

    let rel = path
        .strip_prefix(&mpath.path)
        .map_err(|_| AisError::BadRequest(format!("bad fqn {}", path.display())))?;
    let mut parts = rel.components().map(|c| c.as_os_str().to_string_lossy());

    let kind = match parts.next().as_deref() {
        Some("ais") => Provider::Ais,
        Some("cloud") => Provider::Aws,
        other => {
            return Err(AisError::BadRequest(format!(
                "unknown bucket kind {:?} in {}",
                other,
                path.display()
            )))
        }
    };
    let bucket = parts
        .next()
        .ok_or_else(|| AisError::BadRequest(format!("no bucket in {}", path.display())))?
        .into_owned();
    let objname = {
        let rest: Vec<String> = parts.map(|p| p.into_owned()).collect();
        if rest.is_empty() {
            return Err(AisError::BadRequest(format!(
                "no object in {}",
                path.display()
            )));
        }
        rest.join("/")
    };

    Ok(ParsedFqn {
        mpath,
        kind,
        bucket,
        objname,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mpath(root: &str) -> Arc<Mountpath> {
        Arc::new(Mountpath {
            path: PathBuf::from(root),
            fsid: 1,
            enabled: true,
        })
    }

    #[test]
    fn test_fqn_layout() {
        let mp = mpath("/data/mp1");
        let path = fqn(&mp, &Bck::ais("b1"), "dir/obj");
        assert_eq!(path, PathBuf::from("/data/mp1/ais/b1/dir/obj"));

        let path = fqn(&mp, &Bck::new(Provider::Gcp, "b2"), "o");
        assert_eq!(path, PathBuf::from("/data/mp1/cloud/b2/o"));
    }

    #[test]
    fn test_parse_roundtrip() {
        let mps = vec![mpath("/data/mp1"), mpath("/data/mp2")];
        let bck = Bck::ais("b1");
        let path = fqn(&mps[1], &bck, "a/b/c");

        let parsed = parse_fqn(&mps, &path).unwrap();
        assert_eq!(parsed.mpath.path, mps[1].path);
        assert_eq!(parsed.kind, Provider::Ais);
        assert_eq!(parsed.bucket, "b1");
        assert_eq!(parsed.objname, "a/b/c");
    }

    #[test]
    fn test_parse_rejects_foreign_paths() {
        let mps = vec![mpath("/data/mp1")];
        assert!(parse_fqn(&mps, Path::new("/other/ais/b/o")).is_err());
        assert!(parse_fqn(&mps, Path::new("/data/mp1/weird/b/o")).is_err());
        assert!(parse_fqn(&mps, Path::new("/data/mp1/ais/bucket-only")).is_err());
    }
}

//! Local filesystem layer: mountpaths, health checking, content types
//! and fully-qualified names.

pub mod content;
pub mod fqn;
pub mod fshc;
pub mod mountpath;

pub use content::{ContentInfo, ContentRegistry, ContentResolver};
pub use fqn::{bucket_dir, fqn, parse_fqn, ParsedFqn};
pub use fshc::{FsHealthChecker, FshcReport};
pub use mountpath::{Mountpath, MountpathEvent, MountpathManager};

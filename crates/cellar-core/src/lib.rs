//! # cellar-core
//!
//! Domain types shared by every cellar crate: normalized relative paths,
//! SHA-512 content hashes with the two-character sharded key form, file
//! metadata, and the descriptor sum type that revision manifests are made of.

mod descriptor;
mod hash;
mod info;
mod path;

pub use descriptor::{
    ChildInfo, DirFileDescriptor, FileDescriptor, RegularFileDescriptor, SymlinkFileDescriptor,
};
pub use hash::{Hash, InvalidHash};
pub use info::{FileInfo, FileType};
pub use path::{contains_traversal, RelativePath};

use serde::{Deserialize, Serialize};

/// A named, independently versioned namespace within a store.
///
/// Ids are assigned monotonically (`max(existing) + 1`) and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub id: i64,
    pub name: String,
}

impl Bucket {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Unix-epoch seconds timestamp identifying a revision within its bucket.
/// Doubles as the manifest filename stem.
pub type RevisionVersion = i64;

/// An immutable snapshot of a bucket at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub bucket: Bucket,
    pub version: RevisionVersion,
}

impl Revision {
    pub fn new(bucket: Bucket, version: RevisionVersion) -> Self {
        Self { bucket, version }
    }
}

/// One hit from a store-wide path search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    #[serde(rename = "relativePath")]
    pub relative_path: RelativePath,
    pub bucket: Bucket,
    pub revision: RevisionVersion,
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, Serializer};

use crate::{FileInfo, FileType, Hash};

/// The record of one path in a revision, specialized by file type.
///
/// Serialization flattens the [`FileInfo`] fields, so a JSON manifest element
/// looks like `{"path": …, "type": 1, "modTime": …, "size": …, "fileMode": …,
/// "hash": …}`. Deserialization is driven by the manifest codecs, which peek
/// at `type` first and then decode the matching variant.
#[derive(Debug, Clone, PartialEq)]
pub enum FileDescriptor {
    Regular(RegularFileDescriptor),
    Symlink(SymlinkFileDescriptor),
    Dir(DirFileDescriptor),
}

impl FileDescriptor {
    pub fn info(&self) -> &FileInfo {
        match self {
            FileDescriptor::Regular(d) => &d.info,
            FileDescriptor::Symlink(d) => &d.info,
            FileDescriptor::Dir(d) => &d.info,
        }
    }

    pub fn file_type(&self) -> FileType {
        self.info().file_type
    }
}

impl Serialize for FileDescriptor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FileDescriptor::Regular(d) => d.serialize(serializer),
            FileDescriptor::Symlink(d) => d.serialize(serializer),
            FileDescriptor::Dir(d) => d.serialize(serializer),
        }
    }
}

/// A regular file: metadata plus the content hash of its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegularFileDescriptor {
    #[serde(flatten)]
    pub info: FileInfo,
    pub hash: Hash,
}

impl RegularFileDescriptor {
    pub fn new(info: FileInfo, hash: Hash) -> Self {
        Self { info, hash }
    }
}

/// A symbolic link: metadata plus the link target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymlinkFileDescriptor {
    #[serde(flatten)]
    pub info: FileInfo,
    pub dest: String,
}

impl SymlinkFileDescriptor {
    pub fn new(info: FileInfo, dest: impl Into<String>) -> Self {
        Self {
            info,
            dest: dest.into(),
        }
    }
}

/// A directory. The child enumeration is synthesized by the query layer's
/// directory-listing roll-up and never serialized into a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirFileDescriptor {
    #[serde(flatten)]
    pub info: FileInfo,
    #[serde(skip)]
    pub children: BTreeMap<String, ChildInfo>,
}

impl DirFileDescriptor {
    pub fn new(info: FileInfo) -> Self {
        Self {
            info,
            children: BTreeMap::new(),
        }
    }

    pub fn with_children(info: FileInfo, children: BTreeMap<String, ChildInfo>) -> Self {
        Self { info, children }
    }
}

/// Summary of one direct child inside a synthesized directory listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChildInfo {
    pub file_type: FileType,
    /// Number of entries observed beneath this child (directories only).
    pub sub_children: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RelativePath;
    use chrono::DateTime;

    fn info(file_type: FileType, path: &str) -> FileInfo {
        FileInfo::new(
            file_type,
            RelativePath::new(path),
            DateTime::from_timestamp(0, 0).unwrap(),
            15,
            0o600,
        )
    }

    #[test]
    fn test_regular_descriptor_json_shape() {
        let descriptor = FileDescriptor::Regular(RegularFileDescriptor::new(
            info(FileType::Regular, "a.txt"),
            Hash::from_bytes(b"file a contents"),
        ));

        let value: serde_json::Value = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(value["path"], "a.txt");
        assert_eq!(value["type"], 1);
        assert_eq!(value["modTime"], "1970-01-01T00:00:00Z");
        assert_eq!(value["size"], 15);
        assert_eq!(value["fileMode"], 0o600);
        assert!(value["hash"].is_string());
        assert!(value.get("dest").is_none());
    }

    #[test]
    fn test_symlink_descriptor_json_shape() {
        let descriptor = FileDescriptor::Symlink(SymlinkFileDescriptor::new(
            info(FileType::Symlink, "b"),
            "a.txt",
        ));

        let value: serde_json::Value = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(value["type"], 2);
        assert_eq!(value["dest"], "a.txt");
        assert!(value.get("hash").is_none());
    }

    #[test]
    fn test_regular_descriptor_roundtrip() {
        let original = RegularFileDescriptor::new(
            info(FileType::Regular, "a/b.txt"),
            Hash::from_bytes(b"payload"),
        );
        let json = serde_json::to_string(&original).unwrap();
        let decoded: RegularFileDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, original);
    }
}

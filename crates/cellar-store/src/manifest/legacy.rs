//! The retired extensionless manifest encoding: one bincode-serialized
//! record vector. Read-only; migration 1 rewrites these files as JSON. The
//! encoder survives only for tests that lay down pre-migration stores.

use std::path::Path;

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use cellar_core::{
    DirFileDescriptor, FileDescriptor, FileInfo, FileType, Hash, RegularFileDescriptor,
    RelativePath, SymlinkFileDescriptor,
};

use crate::{Result, StoreError};

// bincode cannot handle serde(flatten), so the wire records spell every
// field out. mod_time is Unix seconds.
#[derive(Debug, Serialize, Deserialize)]
enum LegacyRecord {
    Regular {
        path: String,
        mod_time: i64,
        size: u64,
        file_mode: u32,
        hash: String,
    },
    Symlink {
        path: String,
        mod_time: i64,
        size: u64,
        file_mode: u32,
        dest: String,
    },
    Dir {
        path: String,
        mod_time: i64,
        size: u64,
        file_mode: u32,
    },
}

pub(crate) fn decode(bytes: &[u8], path: &Path) -> Result<Vec<FileDescriptor>> {
    let records: Vec<LegacyRecord> =
        bincode::deserialize(bytes).map_err(|e| StoreError::ManifestUnreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let mut descriptors = Vec::with_capacity(records.len());
    for record in records {
        descriptors.push(descriptor_from(record, path)?);
    }
    Ok(descriptors)
}

fn descriptor_from(record: LegacyRecord, path: &Path) -> Result<FileDescriptor> {
    let info = |file_type, rel: &str, mod_time, size, file_mode| -> Result<FileInfo> {
        let mod_time =
            DateTime::from_timestamp(mod_time, 0).ok_or_else(|| StoreError::ManifestUnreadable {
                path: path.to_path_buf(),
                reason: format!("modTime out of range: {mod_time}"),
            })?;
        Ok(FileInfo::new(
            file_type,
            RelativePath::new(rel),
            mod_time,
            size,
            file_mode,
        ))
    };

    Ok(match record {
        LegacyRecord::Regular {
            path: rel,
            mod_time,
            size,
            file_mode,
            hash,
        } => FileDescriptor::Regular(RegularFileDescriptor::new(
            info(FileType::Regular, &rel, mod_time, size, file_mode)?,
            Hash::from_hex(hash).map_err(|e| StoreError::ManifestUnreadable {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?,
        )),
        LegacyRecord::Symlink {
            path: rel,
            mod_time,
            size,
            file_mode,
            dest,
        } => FileDescriptor::Symlink(SymlinkFileDescriptor::new(
            info(FileType::Symlink, &rel, mod_time, size, file_mode)?,
            dest,
        )),
        LegacyRecord::Dir {
            path: rel,
            mod_time,
            size,
            file_mode,
        } => FileDescriptor::Dir(DirFileDescriptor::new(info(
            FileType::Dir,
            &rel,
            mod_time,
            size,
            file_mode,
        )?)),
    })
}

#[cfg(test)]
pub(crate) fn encode(descriptors: &[FileDescriptor]) -> Vec<u8> {
    let records: Vec<LegacyRecord> = descriptors
        .iter()
        .map(|descriptor| {
            let info = descriptor.info();
            match descriptor {
                FileDescriptor::Regular(d) => LegacyRecord::Regular {
                    path: info.relative_path.as_str().to_string(),
                    mod_time: info.mod_time.timestamp(),
                    size: info.size,
                    file_mode: info.file_mode,
                    hash: d.hash.as_str().to_string(),
                },
                FileDescriptor::Symlink(d) => LegacyRecord::Symlink {
                    path: info.relative_path.as_str().to_string(),
                    mod_time: info.mod_time.timestamp(),
                    size: info.size,
                    file_mode: info.file_mode,
                    dest: d.dest.clone(),
                },
                FileDescriptor::Dir(_) => LegacyRecord::Dir {
                    path: info.relative_path.as_str().to_string(),
                    mod_time: info.mod_time.timestamp(),
                    size: info.size,
                    file_mode: info.file_mode,
                },
            }
        })
        .collect();
    bincode::serialize(&records).expect("legacy records always serialize")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn manifest_path() -> PathBuf {
        PathBuf::from("/store/.backup_data/buckets/1/versions/946782245")
    }

    #[test]
    fn test_decode_recovers_encoded_records() {
        let info = FileInfo::new(
            FileType::Regular,
            RelativePath::new("a.txt"),
            DateTime::from_timestamp(946_782_245, 0).unwrap(),
            15,
            0o600,
        );
        let original = vec![
            FileDescriptor::Regular(RegularFileDescriptor::new(
                info.clone(),
                Hash::from_bytes(b"file a contents"),
            )),
            FileDescriptor::Symlink(SymlinkFileDescriptor::new(
                FileInfo::new(
                    FileType::Symlink,
                    RelativePath::new("b"),
                    info.mod_time,
                    5,
                    0o777,
                ),
                "a.txt",
            )),
        ];

        let decoded = decode(&encode(&original), &manifest_path()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_garbage_is_unreadable() {
        assert!(matches!(
            decode(b"not bincode at all", &manifest_path()),
            Err(StoreError::ManifestUnreadable { .. })
        ));
    }
}

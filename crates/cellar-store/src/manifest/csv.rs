//! Pipe-delimited manifest encoding. Read-only; kept for stores whose
//! revisions were exported in this form.
//!
//! ```text
//! path|type|modTime|size|fileMode|contents_hash_or_symlink_target
//! a.txt|1|946782245000|15|600|cf83e…da3e
//! b|2|946782245000|5|777|a.txt
//! d|3|946782245000|0|700|
//! ```
//!
//! `modTime` is Unix milliseconds and `fileMode` octal.

use std::path::Path;

use chrono::DateTime;

use cellar_core::{
    DirFileDescriptor, FileDescriptor, FileInfo, FileType, Hash, RegularFileDescriptor,
    RelativePath, SymlinkFileDescriptor,
};

use crate::{Result, StoreError};

pub(crate) fn parse_line(line: &str, path: &Path) -> Result<FileDescriptor> {
    let unreadable = |reason: String| StoreError::ManifestUnreadable {
        path: path.to_path_buf(),
        reason,
    };

    let fields: Vec<&str> = line.split('|').collect();
    let [rel_path, type_code, mod_time, size, file_mode, tail] = fields[..] else {
        return Err(unreadable(format!(
            "expected 6 pipe-delimited fields, got {}: {line:?}",
            fields.len()
        )));
    };

    let code: u8 = type_code
        .parse()
        .map_err(|_| unreadable(format!("bad type code: {type_code:?}")))?;
    let mod_time_ms: i64 = mod_time
        .parse()
        .map_err(|_| unreadable(format!("bad modTime: {mod_time:?}")))?;
    let mod_time = DateTime::from_timestamp_millis(mod_time_ms)
        .ok_or_else(|| unreadable(format!("modTime out of range: {mod_time_ms}")))?;
    let size: u64 = size
        .parse()
        .map_err(|_| unreadable(format!("bad size: {size:?}")))?;
    let file_mode = u32::from_str_radix(file_mode, 8)
        .map_err(|_| unreadable(format!("bad fileMode: {file_mode:?}")))?;

    let file_type = match FileType::from_code(code) {
        Some(FileType::Unknown) | None => {
            return Err(StoreError::UnknownDescriptorType { code });
        }
        Some(file_type) => file_type,
    };
    let info = FileInfo::new(
        file_type,
        RelativePath::new(rel_path),
        mod_time,
        size,
        file_mode,
    );

    Ok(match file_type {
        FileType::Regular => {
            let hash = Hash::from_hex(tail).map_err(|e| unreadable(e.to_string()))?;
            FileDescriptor::Regular(RegularFileDescriptor::new(info, hash))
        }
        FileType::Symlink => FileDescriptor::Symlink(SymlinkFileDescriptor::new(info, tail)),
        FileType::Dir => FileDescriptor::Dir(DirFileDescriptor::new(info)),
        FileType::Unknown => unreachable!(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn manifest_path() -> PathBuf {
        PathBuf::from("/store/.backup_data/buckets/1/versions/946782245.csv")
    }

    #[test]
    fn test_regular_row() {
        let hash = "ab".repeat(64);
        let line = format!("a.txt|1|946782245000|15|600|{hash}");
        let FileDescriptor::Regular(descriptor) = parse_line(&line, &manifest_path()).unwrap()
        else {
            panic!("expected a regular file descriptor");
        };
        assert_eq!(descriptor.info.relative_path, RelativePath::new("a.txt"));
        assert_eq!(descriptor.info.mod_time.timestamp(), 946_782_245);
        assert_eq!(descriptor.info.size, 15);
        assert_eq!(descriptor.info.file_mode, 0o600);
        assert_eq!(descriptor.hash, Hash::from_hex(hash).unwrap());
    }

    #[test]
    fn test_symlink_row() {
        let line = "b|2|946782245000|5|777|a.txt";
        let FileDescriptor::Symlink(descriptor) = parse_line(line, &manifest_path()).unwrap()
        else {
            panic!("expected a symlink descriptor");
        };
        assert_eq!(descriptor.dest, "a.txt");
        assert_eq!(descriptor.info.file_mode, 0o777);
    }

    #[test]
    fn test_dir_row_has_empty_tail() {
        let line = "d|3|946782245000|0|700|";
        let FileDescriptor::Dir(descriptor) = parse_line(line, &manifest_path()).unwrap() else {
            panic!("expected a dir descriptor");
        };
        assert_eq!(descriptor.info.relative_path, RelativePath::new("d"));
        assert!(descriptor.children.is_empty());
    }

    #[test]
    fn test_malformed_rows() {
        assert!(matches!(
            parse_line("only|three|fields", &manifest_path()),
            Err(StoreError::ManifestUnreadable { .. })
        ));
        assert!(matches!(
            parse_line("x|9|946782245000|0|700|", &manifest_path()),
            Err(StoreError::UnknownDescriptorType { code: 9 })
        ));
        assert!(matches!(
            parse_line("x|1|notatime|0|700|h", &manifest_path()),
            Err(StoreError::ManifestUnreadable { .. })
        ));
    }

    #[test]
    fn test_truncated_hash_is_unreadable() {
        assert!(matches!(
            parse_line("x|1|946782245000|0|700|abcd", &manifest_path()),
            Err(StoreError::ManifestUnreadable { .. })
        ));
    }
}

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::RelativePath;

/// The kind of entry a descriptor records.
///
/// The integer codes are part of the on-disk manifest formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum FileType {
    Unknown,
    Regular,
    Symlink,
    Dir,
}

impl FileType {
    pub fn code(self) -> u8 {
        match self {
            FileType::Unknown => 0,
            FileType::Regular => 1,
            FileType::Symlink => 2,
            FileType::Dir => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(FileType::Unknown),
            1 => Some(FileType::Regular),
            2 => Some(FileType::Symlink),
            3 => Some(FileType::Dir),
            _ => None,
        }
    }
}

impl Default for FileType {
    fn default() -> Self {
        FileType::Unknown
    }
}

impl From<FileType> for u8 {
    fn from(file_type: FileType) -> u8 {
        file_type.code()
    }
}

impl TryFrom<u8> for FileType {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        FileType::from_code(code).ok_or_else(|| format!("unknown file type code: {code}"))
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileType::Unknown => "UNKNOWN",
            FileType::Regular => "REGULAR",
            FileType::Symlink => "SYMLINK",
            FileType::Dir => "DIRECTORY",
        };
        f.write_str(name)
    }
}

/// Basic metadata about one source-tree entry, as declared by an uploader at
/// transaction open.
///
/// The serialized field names are part of the JSON manifest format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    #[serde(rename = "type")]
    pub file_type: FileType,
    #[serde(rename = "path")]
    pub relative_path: RelativePath,
    #[serde(rename = "modTime")]
    pub mod_time: DateTime<Utc>,
    pub size: u64,
    #[serde(rename = "fileMode")]
    pub file_mode: u32,
}

impl FileInfo {
    pub fn new(
        file_type: FileType,
        relative_path: RelativePath,
        mod_time: DateTime<Utc>,
        size: u64,
        file_mode: u32,
    ) -> Self {
        Self {
            file_type,
            relative_path,
            mod_time,
            size,
            file_mode,
        }
    }

    /// True when the previous revision already recorded an identical entry,
    /// meaning the descriptor can be carried forward without re-upload.
    pub fn matches_for_carry_forward(&self, previous: &FileInfo) -> bool {
        self.file_type == previous.file_type
            && self.mod_time == previous.mod_time
            && self.size == previous.size
            && self.file_mode == previous.file_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_codes_roundtrip() {
        for code in 0..=3u8 {
            assert_eq!(FileType::from_code(code).unwrap().code(), code);
        }
        assert!(FileType::from_code(4).is_none());
    }

    #[test]
    fn test_file_type_json_is_integer() {
        assert_eq!(serde_json::to_string(&FileType::Regular).unwrap(), "1");
        assert_eq!(
            serde_json::from_str::<FileType>("2").unwrap(),
            FileType::Symlink
        );
        assert!(serde_json::from_str::<FileType>("9").is_err());
    }

    #[test]
    fn test_carry_forward_match() {
        let info = FileInfo::new(
            FileType::Regular,
            RelativePath::new("a.txt"),
            DateTime::from_timestamp(1_000, 0).unwrap(),
            15,
            0o600,
        );
        let mut other = info.clone();
        assert!(info.matches_for_carry_forward(&other));

        other.size = 16;
        assert!(!info.matches_for_carry_forward(&other));
    }
}

//! JSON manifest encoding: a top-level array of flat descriptor objects,
//! e.g. `{"path":"a.txt","type":1,"modTime":"…","size":15,"fileMode":384,
//! "hash":"…"}`. The default write format.

use std::path::Path;

use serde_json::Value;

use cellar_core::{
    DirFileDescriptor, FileDescriptor, FileType, RegularFileDescriptor, SymlinkFileDescriptor,
};

use crate::{Result, StoreError};

pub(crate) fn decode(bytes: &[u8], path: &Path) -> Result<Vec<FileDescriptor>> {
    let unreadable = |reason: String| StoreError::ManifestUnreadable {
        path: path.to_path_buf(),
        reason,
    };

    let value: Value = serde_json::from_slice(bytes).map_err(|e| unreadable(e.to_string()))?;
    let elements = value
        .as_array()
        .ok_or_else(|| unreadable("top-level value is not an array".to_string()))?;

    let mut descriptors = Vec::with_capacity(elements.len());
    for element in elements {
        descriptors.push(decode_element(element, path)?);
    }
    Ok(descriptors)
}

/// The envelope's `type` field picks the variant; the rest of the element is
/// then decoded as that variant.
fn decode_element(element: &Value, path: &Path) -> Result<FileDescriptor> {
    let unreadable = |reason: String| StoreError::ManifestUnreadable {
        path: path.to_path_buf(),
        reason,
    };

    let code = element
        .get("type")
        .and_then(Value::as_u64)
        .ok_or_else(|| unreadable(format!("missing or non-integer type field: {element}")))?;
    let code = u8::try_from(code).map_err(|_| StoreError::UnknownDescriptorType { code: u8::MAX })?;

    match FileType::from_code(code) {
        Some(FileType::Regular) => serde_json::from_value::<RegularFileDescriptor>(element.clone())
            .map(FileDescriptor::Regular)
            .map_err(|e| unreadable(e.to_string())),
        Some(FileType::Symlink) => serde_json::from_value::<SymlinkFileDescriptor>(element.clone())
            .map(FileDescriptor::Symlink)
            .map_err(|e| unreadable(e.to_string())),
        Some(FileType::Dir) => serde_json::from_value::<DirFileDescriptor>(element.clone())
            .map(FileDescriptor::Dir)
            .map_err(|e| unreadable(e.to_string())),
        Some(FileType::Unknown) | None => Err(StoreError::UnknownDescriptorType { code }),
    }
}

pub(crate) fn encode(descriptors: &[FileDescriptor]) -> Result<Vec<u8>> {
    serde_json::to_vec(descriptors).map_err(|e| StoreError::ManifestUnreadable {
        path: Path::new("<manifest>").to_path_buf(),
        reason: e.to_string(),
    })
}

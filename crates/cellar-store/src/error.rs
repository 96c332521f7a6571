use std::io;
use std::path::PathBuf;

use thiserror::Error;

use cellar_core::{FileType, Hash, RelativePath};

use crate::transaction::TransactionStage;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no store found at {}; run init first", path.display())]
    StoreNotInitialized { path: PathBuf },

    #[error("{} exists but is not a directory", path.display())]
    StoreDirectoryNotADirectory { path: PathBuf },

    #[error("cannot initialize a store in {}: directory is not empty", path.display())]
    StoreNotEmpty { path: PathBuf },

    #[error("bucket requires a name")]
    BucketRequiresAName,

    #[error("bucket name must be 100 characters or fewer: {name:?}")]
    BucketNameTooLong { name: String },

    #[error("illegal path traversal in {text:?}")]
    IllegalTraversal { text: String },

    #[error("bucket name already taken: {name:?}")]
    BucketNameAlreadyTaken { name: String },

    #[error("bucket does not exist: {name:?}")]
    BucketDoesNotExist { name: String },

    #[error("no revisions found for bucket {name:?}")]
    NoRevisionsForBucket { name: String },

    #[error("revision {version} does not exist in bucket {bucket:?}")]
    RevisionDoesNotExist { bucket: String, version: i64 },

    #[error("unreadable manifest at {}: {reason}", path.display())]
    ManifestUnreadable { path: PathBuf, reason: String },

    #[error("unknown descriptor type code {code}")]
    UnknownDescriptorType { code: u8 },

    #[error("the store is locked by another writer: {holder}")]
    LockAlreadyTaken { holder: String },

    #[error("failed to release the store lock: {source}")]
    LockReleaseFailed { source: io::Error },

    #[error("transaction open failed ({open}); releasing the lock failed too ({release})")]
    OpenAndLockRelease {
        open: Box<StoreError>,
        release: Box<StoreError>,
    },

    #[error("unsupported file type {file_type} for {path}")]
    UnsupportedFileType {
        file_type: FileType,
        path: RelativePath,
    },

    #[error("file not required for transaction: {subject}")]
    FileNotRequiredForTransaction { subject: String },

    #[error("transaction is in stage {actual}, expected {expected}")]
    StageMismatch {
        expected: TransactionStage,
        actual: TransactionStage,
    },

    #[error("{} symlink(s) still awaiting their targets", paths.len())]
    UnfinishedSymlinks { paths: Vec<RelativePath> },

    #[error("{} upload(s) still pending", hashes.len())]
    UnfinishedUploads { hashes: Vec<Hash> },

    #[error("object not found: {hash}")]
    ObjectNotFound { hash: Hash },

    #[error("no file or directory at {path}")]
    FileOrDirNotFound { path: RelativePath },

    #[error("symlink chain at {path} never reaches a regular file")]
    TooManySymlinkHops { path: RelativePath },

    #[error("revision failed verification with {} problem(s):\n{}", problems.len(), problems.join("\n"))]
    VerificationFailed { problems: Vec<String> },

    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

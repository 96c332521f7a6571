//! The multi-stage upload transaction.
//!
//! One backup run is a single transaction holding the global store lock:
//!
//! ```text
//! open ──► AwaitingFileHashes ──process_upload_hashes──► ReadyToUploadFiles
//!               │                                               │
//!               │◄──────────── process_symlinks ───────────────►│
//!               │                                               ├─commit──► Committed
//!               └───────────────── rollback ───────────────────►└─rollback► Aborted
//! ```
//!
//! Deduplication happens twice: at open, entries matching the previous
//! revision's metadata are carried forward without any hashing; at hash
//! processing, entries whose content already exists in the object repository
//! are recorded without re-upload.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Read;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info};

use cellar_core::{
    Bucket, DirFileDescriptor, FileDescriptor, FileInfo, FileType, Hash, RegularFileDescriptor,
    RelativePath, Revision, RevisionVersion, SymlinkFileDescriptor,
};

use crate::manifest::json;
use crate::{Result, Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStage {
    AwaitingFileHashes,
    ReadyToUploadFiles,
    Committed,
    Aborted,
}

impl fmt::Display for TransactionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionStage::AwaitingFileHashes => "awaiting file hashes",
            TransactionStage::ReadyToUploadFiles => "ready to upload files",
            TransactionStage::Committed => "committed",
            TransactionStage::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Answer to the open step: the content hash an uploader computed for one
/// declared path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelativePathWithHash {
    pub relative_path: RelativePath,
    pub hash: Hash,
}

/// The target an uploader read for one declared symlink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymlinkWithRelativePath {
    pub relative_path: RelativePath,
    pub dest: String,
}

struct TransactionState {
    stage: TransactionStage,
    descriptors: Vec<FileDescriptor>,
    missing_hashes: BTreeMap<RelativePath, FileInfo>,
    missing_symlinks: BTreeMap<RelativePath, FileInfo>,
    pending_uploads: BTreeSet<Hash>,
}

/// An in-flight backup of one bucket. Safe to share across uploader threads;
/// the store methods take `&Transaction`.
pub struct Transaction {
    bucket: Bucket,
    version: RevisionVersion,
    state: Mutex<TransactionState>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("bucket", &self.bucket)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub fn bucket(&self) -> &Bucket {
        &self.bucket
    }

    pub fn version(&self) -> RevisionVersion {
        self.version
    }

    pub fn stage(&self) -> TransactionStage {
        self.state().stage
    }

    /// Declared regular files that still need their content hashes. Paths
    /// carried forward from the previous revision are not listed.
    pub fn paths_awaiting_hashes(&self) -> Vec<RelativePath> {
        self.state().missing_hashes.keys().cloned().collect()
    }

    /// Declared symlinks that still need their targets.
    pub fn paths_awaiting_symlinks(&self) -> Vec<RelativePath> {
        self.state().missing_symlinks.keys().cloned().collect()
    }

    fn state(&self) -> MutexGuard<'_, TransactionState> {
        self.state.lock().unwrap()
    }
}

impl Store {
    /// Begin a backup of `bucket` covering the declared `infos`.
    ///
    /// Acquires the global lock for the whole transaction. Entries whose
    /// metadata matches the previous revision are carried forward
    /// immediately; the rest are parked awaiting hashes or symlink targets.
    /// On any failure the lock is released again; if that release fails too,
    /// both errors are reported.
    pub fn open_transaction(&self, bucket: &Bucket, infos: Vec<FileInfo>) -> Result<Transaction> {
        let version = self.now().timestamp();
        let lock_text = format!(
            "lock from transaction. Bucket: {} ({}), revision version: {}",
            bucket.id, bucket.name, version
        );
        self.acquire_lock(&lock_text)?;

        match self.build_transaction(bucket, version, infos) {
            Ok(transaction) => Ok(transaction),
            Err(open) => match self.release_lock() {
                Ok(()) => Err(open),
                Err(release) => Err(StoreError::OpenAndLockRelease {
                    open: Box::new(open),
                    release: Box::new(release),
                }),
            },
        }
    }

    fn build_transaction(
        &self,
        bucket: &Bucket,
        version: RevisionVersion,
        infos: Vec<FileInfo>,
    ) -> Result<Transaction> {
        let previous: BTreeMap<RelativePath, FileDescriptor> = match self.latest_revision(bucket) {
            Ok(revision) => self
                .files_in_revision(&revision)?
                .into_iter()
                .map(|d| (d.info().relative_path.clone(), d))
                .collect(),
            Err(StoreError::NoRevisionsForBucket { .. }) => BTreeMap::new(),
            Err(e) => return Err(e),
        };

        let mut state = TransactionState {
            stage: TransactionStage::AwaitingFileHashes,
            descriptors: Vec::new(),
            missing_hashes: BTreeMap::new(),
            missing_symlinks: BTreeMap::new(),
            pending_uploads: BTreeSet::new(),
        };

        let mut carried = 0usize;
        for info in infos {
            if info.relative_path.is_traversal() {
                return Err(StoreError::IllegalTraversal {
                    text: info.relative_path.as_str().to_string(),
                });
            }

            if let Some(previous_descriptor) = previous.get(&info.relative_path) {
                if previous_descriptor.info().matches_for_carry_forward(&info) {
                    state.descriptors.push(previous_descriptor.clone());
                    carried += 1;
                    continue;
                }
            }

            match info.file_type {
                FileType::Regular => {
                    state.missing_hashes.insert(info.relative_path.clone(), info);
                }
                FileType::Symlink => {
                    state
                        .missing_symlinks
                        .insert(info.relative_path.clone(), info);
                }
                FileType::Dir => {
                    state
                        .descriptors
                        .push(FileDescriptor::Dir(DirFileDescriptor::new(info)));
                }
                FileType::Unknown => {
                    return Err(StoreError::UnsupportedFileType {
                        file_type: FileType::Unknown,
                        path: info.relative_path,
                    });
                }
            }
        }

        debug!(
            bucket = bucket.name,
            version,
            carried,
            awaiting_hashes = state.missing_hashes.len(),
            awaiting_symlinks = state.missing_symlinks.len(),
            "opened transaction"
        );

        Ok(Transaction {
            bucket: bucket.clone(),
            version,
            state: Mutex::new(state),
        })
    }

    /// Record the content hashes for the declared regular files and return
    /// the hashes whose objects still need uploading.
    pub fn process_upload_hashes(
        &self,
        transaction: &Transaction,
        hashes: Vec<RelativePathWithHash>,
    ) -> Result<Vec<Hash>> {
        let mut state = transaction.state();
        if state.stage != TransactionStage::AwaitingFileHashes {
            return Err(StoreError::StageMismatch {
                expected: TransactionStage::AwaitingFileHashes,
                actual: state.stage,
            });
        }

        for RelativePathWithHash {
            relative_path,
            hash,
        } in hashes
        {
            let info = state.missing_hashes.remove(&relative_path).ok_or_else(|| {
                StoreError::FileNotRequiredForTransaction {
                    subject: relative_path.as_str().to_string(),
                }
            })?;
            state
                .descriptors
                .push(FileDescriptor::Regular(RegularFileDescriptor::new(
                    info,
                    hash.clone(),
                )));

            if !state.pending_uploads.contains(&hash) && !self.is_object_present(&hash)? {
                state.pending_uploads.insert(hash);
            }
        }

        state.stage = TransactionStage::ReadyToUploadFiles;
        let required: Vec<Hash> = state.pending_uploads.iter().cloned().collect();
        debug!(required = required.len(), "processed upload hashes");
        Ok(required)
    }

    /// Upload one file's contents. The plaintext is hashed server-side; the
    /// hash must be among the transaction's pending uploads.
    ///
    /// Callers may upload distinct files concurrently. Two racers carrying
    /// the same content converge on one stored object.
    pub fn backup_file(&self, transaction: &Transaction, reader: &mut dyn Read) -> Result<()> {
        {
            let state = transaction.state();
            if state.stage != TransactionStage::ReadyToUploadFiles {
                return Err(StoreError::StageMismatch {
                    expected: TransactionStage::ReadyToUploadFiles,
                    actual: state.stage,
                });
            }
        }

        let (hash, staged) = self.stage_blob(reader)?;

        let wanted = transaction.state().pending_uploads.contains(&hash);
        if !wanted {
            let _ = self.fs().remove(&staged);
            return Err(StoreError::FileNotRequiredForTransaction {
                subject: hash.to_string(),
            });
        }

        self.ingest_object(&hash, &staged)?;
        transaction.state().pending_uploads.remove(&hash);
        Ok(())
    }

    /// Record the targets for declared symlinks. Allowed in either live
    /// stage.
    pub fn process_symlinks(
        &self,
        transaction: &Transaction,
        symlinks: Vec<SymlinkWithRelativePath>,
    ) -> Result<()> {
        let mut state = transaction.state();
        match state.stage {
            TransactionStage::AwaitingFileHashes | TransactionStage::ReadyToUploadFiles => {}
            actual => {
                return Err(StoreError::StageMismatch {
                    expected: TransactionStage::ReadyToUploadFiles,
                    actual,
                });
            }
        }

        for SymlinkWithRelativePath {
            relative_path,
            dest,
        } in symlinks
        {
            let info = state
                .missing_symlinks
                .remove(&relative_path)
                .ok_or_else(|| StoreError::FileNotRequiredForTransaction {
                    subject: relative_path.as_str().to_string(),
                })?;
            state
                .descriptors
                .push(FileDescriptor::Symlink(SymlinkFileDescriptor::new(
                    info, dest,
                )));
        }
        Ok(())
    }

    /// Write the revision manifest, mark the transaction committed, and
    /// release the lock. Failed guards leave the transaction retryable.
    pub fn commit(&self, transaction: &Transaction) -> Result<Revision> {
        let mut state = transaction.state();
        if state.stage != TransactionStage::ReadyToUploadFiles {
            return Err(StoreError::StageMismatch {
                expected: TransactionStage::ReadyToUploadFiles,
                actual: state.stage,
            });
        }
        if !state.missing_symlinks.is_empty() {
            return Err(StoreError::UnfinishedSymlinks {
                paths: state.missing_symlinks.keys().cloned().collect(),
            });
        }
        if !state.pending_uploads.is_empty() {
            return Err(StoreError::UnfinishedUploads {
                hashes: state.pending_uploads.iter().cloned().collect(),
            });
        }

        let manifest_path =
            self.version_path(transaction.bucket.id, transaction.version, ".json");
        let bytes = json::encode(&state.descriptors)?;
        self.fs()
            .write_file(&manifest_path, &bytes, 0o600)
            .map_err(|e| StoreError::io("write manifest", manifest_path, e))?;

        state.stage = TransactionStage::Committed;
        drop(state);

        self.release_lock()?;
        info!(
            bucket = transaction.bucket.name,
            version = transaction.version,
            "committed revision"
        );
        Ok(Revision::new(transaction.bucket.clone(), transaction.version))
    }

    /// Abandon the transaction and release the lock. Objects already
    /// ingested stay in the repository; they are content-addressed and
    /// harmless.
    pub fn rollback(&self, transaction: &Transaction) -> Result<()> {
        let mut state = transaction.state();
        match state.stage {
            TransactionStage::AwaitingFileHashes | TransactionStage::ReadyToUploadFiles => {}
            actual => {
                return Err(StoreError::StageMismatch {
                    expected: TransactionStage::ReadyToUploadFiles,
                    actual,
                });
            }
        }
        state.stage = TransactionStage::Aborted;
        drop(state);

        self.release_lock()?;
        info!(
            bucket = transaction.bucket.name,
            version = transaction.version,
            "rolled back transaction"
        );
        Ok(())
    }
}

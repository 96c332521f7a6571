//! End-to-end backup flows against the in-memory filesystem with a pinned
//! clock.

use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use cellar_core::{FileInfo, FileType, Hash, RelativePath};
use cellar_fs::{Fs, MemFs};
use cellar_store::{
    Clock, RelativePathWithHash, Store, StoreError, SymlinkWithRelativePath, TransactionStage,
};

/// 2000-01-02T03:04:05Z.
const FROZEN_NOW: i64 = 946_782_245;

struct SteppableClock(AtomicI64);

impl SteppableClock {
    fn frozen() -> Arc<Self> {
        Arc::new(Self(AtomicI64::new(FROZEN_NOW)))
    }

    fn advance(&self, seconds: i64) {
        self.0.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for SteppableClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.0.load(Ordering::SeqCst), 0).unwrap()
    }
}

fn new_store() -> (Store, Arc<MemFs>, Arc<SteppableClock>) {
    let fs = Arc::new(MemFs::new());
    fs.mkdir_all(Path::new("/store"), 0o700).unwrap();
    let clock = SteppableClock::frozen();
    let store = Store::init(fs.clone(), clock.clone(), Path::new("/store")).unwrap();
    (store, fs, clock)
}

fn regular_info(path: &str, size: u64) -> FileInfo {
    FileInfo::new(
        FileType::Regular,
        RelativePath::new(path),
        DateTime::from_timestamp(946_000_000, 0).unwrap(),
        size,
        0o600,
    )
}

fn symlink_info(path: &str, target_len: u64) -> FileInfo {
    FileInfo::new(
        FileType::Symlink,
        RelativePath::new(path),
        DateTime::from_timestamp(946_000_000, 0).unwrap(),
        target_len,
        0o777,
    )
}

fn read_all(mut reader: Box<dyn Read + Send>) -> Vec<u8> {
    let mut contents = Vec::new();
    reader.read_to_end(&mut contents).unwrap();
    contents
}

#[test]
fn test_init_and_create_bucket() {
    let (store, fs, _clock) = new_store();

    let bucket = store.create_bucket("docs").unwrap();
    assert_eq!(bucket.id, 1);
    assert_eq!(bucket.name, "docs");

    for dir in [
        "/store/.backup_data/store_metadata",
        "/store/.backup_data/objects",
        "/store/.backup_data/locks",
        "/store/.backup_data/tmp",
        "/store/.backup_data/buckets/1/versions",
    ] {
        assert!(fs.stat(Path::new(dir)).unwrap().is_dir(), "missing {dir}");
    }
}

#[test]
fn test_single_file_backup() {
    let (store, fs, _clock) = new_store();
    let bucket = store.create_bucket("docs").unwrap();

    let data = b"file a contents";
    let transaction = store
        .open_transaction(&bucket, vec![regular_info("a.txt", data.len() as u64)])
        .unwrap();
    assert_eq!(transaction.version(), FROZEN_NOW);

    let required = store
        .process_upload_hashes(
            &transaction,
            vec![RelativePathWithHash {
                relative_path: RelativePath::new("a.txt"),
                hash: Hash::from_bytes(data),
            }],
        )
        .unwrap();
    assert_eq!(required, vec![Hash::from_bytes(data)]);

    store
        .backup_file(&transaction, &mut Cursor::new(data.to_vec()))
        .unwrap();
    let revision = store.commit(&transaction).unwrap();
    assert_eq!(revision.version, FROZEN_NOW);
    assert_eq!(transaction.stage(), TransactionStage::Committed);

    // The manifest landed under the frozen timestamp and the lock is gone.
    assert!(fs
        .stat(Path::new("/store/.backup_data/buckets/1/versions/946782245.json"))
        .is_ok());
    assert!(store.lock_information().unwrap().is_none());

    assert!(store.is_object_present(&Hash::from_bytes(data)).unwrap());
    let contents = store
        .file_contents(&revision, &RelativePath::new("a.txt"))
        .unwrap();
    assert_eq!(read_all(contents), data);
}

#[test]
fn test_unchanged_file_carried_forward_without_upload() {
    let (store, _fs, clock) = new_store();
    let bucket = store.create_bucket("docs").unwrap();
    let data = b"file a contents";
    let info = regular_info("a.txt", data.len() as u64);

    let transaction = store.open_transaction(&bucket, vec![info.clone()]).unwrap();
    store
        .process_upload_hashes(
            &transaction,
            vec![RelativePathWithHash {
                relative_path: RelativePath::new("a.txt"),
                hash: Hash::from_bytes(data),
            }],
        )
        .unwrap();
    store
        .backup_file(&transaction, &mut Cursor::new(data.to_vec()))
        .unwrap();
    store.commit(&transaction).unwrap();

    clock.advance(60);

    // Identical metadata: no hash requested, no upload needed.
    let second = store.open_transaction(&bucket, vec![info]).unwrap();
    let required = store.process_upload_hashes(&second, vec![]).unwrap();
    assert!(required.is_empty());
    let revision = store.commit(&second).unwrap();
    assert_eq!(revision.version, FROZEN_NOW + 60);

    let contents = store
        .file_contents(&revision, &RelativePath::new("a.txt"))
        .unwrap();
    assert_eq!(read_all(contents), data);
    assert_eq!(store.revisions(&bucket).unwrap().len(), 2);
}

#[test]
fn test_identical_contents_deduplicated_within_transaction() {
    let (store, _fs, _clock) = new_store();
    let bucket = store.create_bucket("docs").unwrap();
    let data = b"same bytes";
    let hash = Hash::from_bytes(data);

    let transaction = store
        .open_transaction(
            &bucket,
            vec![
                regular_info("a.txt", data.len() as u64),
                regular_info("b.txt", data.len() as u64),
            ],
        )
        .unwrap();

    let required = store
        .process_upload_hashes(
            &transaction,
            vec![
                RelativePathWithHash {
                    relative_path: RelativePath::new("a.txt"),
                    hash: hash.clone(),
                },
                RelativePathWithHash {
                    relative_path: RelativePath::new("b.txt"),
                    hash: hash.clone(),
                },
            ],
        )
        .unwrap();
    // One object serves both paths.
    assert_eq!(required, vec![hash.clone()]);

    store
        .backup_file(&transaction, &mut Cursor::new(data.to_vec()))
        .unwrap();
    let revision = store.commit(&transaction).unwrap();

    let manifest = store.files_in_revision(&revision).unwrap();
    assert_eq!(manifest.len(), 2);
    let contents = store
        .file_contents(&revision, &RelativePath::new("b.txt"))
        .unwrap();
    assert_eq!(read_all(contents), data);
}

#[test]
fn test_content_known_from_earlier_revision_needs_no_upload() {
    let (store, _fs, clock) = new_store();
    let bucket = store.create_bucket("docs").unwrap();
    let data = b"shared contents";

    let first = store
        .open_transaction(&bucket, vec![regular_info("a.txt", data.len() as u64)])
        .unwrap();
    store
        .process_upload_hashes(
            &first,
            vec![RelativePathWithHash {
                relative_path: RelativePath::new("a.txt"),
                hash: Hash::from_bytes(data),
            }],
        )
        .unwrap();
    store
        .backup_file(&first, &mut Cursor::new(data.to_vec()))
        .unwrap();
    store.commit(&first).unwrap();

    clock.advance(60);

    // A brand-new path carrying already-stored content: hashed, but never
    // uploaded again.
    let second = store
        .open_transaction(&bucket, vec![regular_info("b.txt", data.len() as u64)])
        .unwrap();
    let required = store
        .process_upload_hashes(
            &second,
            vec![RelativePathWithHash {
                relative_path: RelativePath::new("b.txt"),
                hash: Hash::from_bytes(data),
            }],
        )
        .unwrap();
    assert!(required.is_empty());

    let revision = store.commit(&second).unwrap();
    let contents = store
        .file_contents(&revision, &RelativePath::new("b.txt"))
        .unwrap();
    assert_eq!(read_all(contents), data);
}

#[test]
fn test_commit_blocked_until_uploads_finish() {
    let (store, _fs, _clock) = new_store();
    let bucket = store.create_bucket("docs").unwrap();
    let data = b"not yet uploaded";

    let transaction = store
        .open_transaction(&bucket, vec![regular_info("a.txt", data.len() as u64)])
        .unwrap();
    store
        .process_upload_hashes(
            &transaction,
            vec![RelativePathWithHash {
                relative_path: RelativePath::new("a.txt"),
                hash: Hash::from_bytes(data),
            }],
        )
        .unwrap();

    match store.commit(&transaction).unwrap_err() {
        StoreError::UnfinishedUploads { hashes } => {
            assert_eq!(hashes, vec![Hash::from_bytes(data)])
        }
        other => panic!("unexpected error: {other}"),
    }

    // The failed commit left the transaction retryable.
    assert_eq!(transaction.stage(), TransactionStage::ReadyToUploadFiles);
    store
        .backup_file(&transaction, &mut Cursor::new(data.to_vec()))
        .unwrap();
    store.commit(&transaction).unwrap();
}

#[test]
fn test_symlink_flow() {
    let (store, _fs, _clock) = new_store();
    let bucket = store.create_bucket("docs").unwrap();
    let data = b"file a contents";

    let transaction = store
        .open_transaction(
            &bucket,
            vec![
                regular_info("a.txt", data.len() as u64),
                symlink_info("b", 5),
            ],
        )
        .unwrap();
    store
        .process_upload_hashes(
            &transaction,
            vec![RelativePathWithHash {
                relative_path: RelativePath::new("a.txt"),
                hash: Hash::from_bytes(data),
            }],
        )
        .unwrap();
    store
        .backup_file(&transaction, &mut Cursor::new(data.to_vec()))
        .unwrap();

    match store.commit(&transaction).unwrap_err() {
        StoreError::UnfinishedSymlinks { paths } => {
            assert_eq!(paths, vec![RelativePath::new("b")])
        }
        other => panic!("unexpected error: {other}"),
    }

    store
        .process_symlinks(
            &transaction,
            vec![SymlinkWithRelativePath {
                relative_path: RelativePath::new("b"),
                dest: "a.txt".to_string(),
            }],
        )
        .unwrap();
    let revision = store.commit(&transaction).unwrap();

    // Reading the link follows it to the target's contents.
    let contents = store
        .file_contents(&revision, &RelativePath::new("b"))
        .unwrap();
    assert_eq!(read_all(contents), data);
}

#[test]
fn test_second_writer_locked_out() {
    let (store, _fs, _clock) = new_store();
    let bucket = store.create_bucket("docs").unwrap();

    let transaction = store.open_transaction(&bucket, vec![]).unwrap();
    match store.open_transaction(&bucket, vec![]).unwrap_err() {
        StoreError::LockAlreadyTaken { holder } => assert!(holder.contains("docs")),
        other => panic!("unexpected error: {other}"),
    }

    store.rollback(&transaction).unwrap();
    // Lock released; a new writer may proceed.
    let transaction = store.open_transaction(&bucket, vec![]).unwrap();
    store.rollback(&transaction).unwrap();
}

#[test]
fn test_traversal_refused_and_lock_released() {
    let (store, _fs, _clock) = new_store();
    let bucket = store.create_bucket("docs").unwrap();

    let err = store
        .open_transaction(&bucket, vec![regular_info("../escape.txt", 1)])
        .unwrap_err();
    assert!(matches!(err, StoreError::IllegalTraversal { .. }));

    // The failed open released the lock on its way out.
    assert!(store.lock_information().unwrap().is_none());
    let transaction = store.open_transaction(&bucket, vec![]).unwrap();
    store.rollback(&transaction).unwrap();
}

#[test]
fn test_stage_machine_enforced() {
    let (store, _fs, _clock) = new_store();
    let bucket = store.create_bucket("docs").unwrap();
    let data = b"contents";

    let transaction = store
        .open_transaction(&bucket, vec![regular_info("a.txt", data.len() as u64)])
        .unwrap();

    // Upload before hashes were processed.
    match store
        .backup_file(&transaction, &mut Cursor::new(data.to_vec()))
        .unwrap_err()
    {
        StoreError::StageMismatch { expected, actual } => {
            assert_eq!(expected, TransactionStage::ReadyToUploadFiles);
            assert_eq!(actual, TransactionStage::AwaitingFileHashes);
        }
        other => panic!("unexpected error: {other}"),
    }

    // Commit before hashes were processed.
    assert!(matches!(
        store.commit(&transaction),
        Err(StoreError::StageMismatch { .. })
    ));

    store.rollback(&transaction).unwrap();
    assert_eq!(transaction.stage(), TransactionStage::Aborted);
    assert!(matches!(
        store.rollback(&transaction),
        Err(StoreError::StageMismatch { .. })
    ));
}

#[test]
fn test_unrequested_hash_refused() {
    let (store, _fs, _clock) = new_store();
    let bucket = store.create_bucket("docs").unwrap();

    let transaction = store
        .open_transaction(&bucket, vec![regular_info("a.txt", 1)])
        .unwrap();
    let err = store
        .process_upload_hashes(
            &transaction,
            vec![RelativePathWithHash {
                relative_path: RelativePath::new("never-declared.txt"),
                hash: Hash::from_bytes(b"x"),
            }],
        )
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::FileNotRequiredForTransaction { .. }
    ));
    store.rollback(&transaction).unwrap();
}

#[test]
fn test_rollback_writes_no_manifest() {
    let (store, _fs, _clock) = new_store();
    let bucket = store.create_bucket("docs").unwrap();
    let data = b"rolled back";

    let transaction = store
        .open_transaction(&bucket, vec![regular_info("a.txt", data.len() as u64)])
        .unwrap();
    store
        .process_upload_hashes(
            &transaction,
            vec![RelativePathWithHash {
                relative_path: RelativePath::new("a.txt"),
                hash: Hash::from_bytes(data),
            }],
        )
        .unwrap();
    store
        .backup_file(&transaction, &mut Cursor::new(data.to_vec()))
        .unwrap();
    store.rollback(&transaction).unwrap();

    assert!(store.revisions(&bucket).unwrap().is_empty());
    // Ingested objects stay; they are content-addressed and harmless.
    assert!(store.is_object_present(&Hash::from_bytes(data)).unwrap());
}

#[test]
fn test_reopen_existing_store() {
    let (store, fs, clock) = new_store();
    let bucket = store.create_bucket("docs").unwrap();
    let data = b"persisted";

    let transaction = store
        .open_transaction(&bucket, vec![regular_info("a.txt", data.len() as u64)])
        .unwrap();
    store
        .process_upload_hashes(
            &transaction,
            vec![RelativePathWithHash {
                relative_path: RelativePath::new("a.txt"),
                hash: Hash::from_bytes(data),
            }],
        )
        .unwrap();
    store
        .backup_file(&transaction, &mut Cursor::new(data.to_vec()))
        .unwrap();
    let revision = store.commit(&transaction).unwrap();
    drop(store);

    let reopened = Store::open(fs, clock, Path::new("/store")).unwrap();
    let bucket = reopened.bucket_by_name("docs").unwrap();
    assert_eq!(
        reopened.latest_revision(&bucket).unwrap().version,
        revision.version
    );
    let contents = reopened
        .file_contents(&revision, &RelativePath::new("a.txt"))
        .unwrap();
    assert_eq!(read_all(contents), data);
}

#[test]
fn test_open_uninitialized_store() {
    let fs = Arc::new(MemFs::new());
    fs.mkdir_all(Path::new("/empty"), 0o700).unwrap();
    let err = Store::open(fs, SteppableClock::frozen(), Path::new("/empty")).unwrap_err();
    assert!(matches!(err, StoreError::StoreNotInitialized { .. }));
}

#[test]
fn test_init_refuses_non_empty_directory() {
    let fs = Arc::new(MemFs::new());
    fs.mkdir_all(Path::new("/occupied"), 0o700).unwrap();
    fs.write_file(Path::new("/occupied/something"), b"x", 0o600)
        .unwrap();
    let err = Store::init(fs, SteppableClock::frozen(), Path::new("/occupied")).unwrap_err();
    assert!(matches!(err, StoreError::StoreNotEmpty { .. }));
}

#[test]
fn test_verify_detects_missing_object() {
    let (store, fs, _clock) = new_store();
    let bucket = store.create_bucket("docs").unwrap();
    let data = b"to be lost";
    let hash = Hash::from_bytes(data);

    let transaction = store
        .open_transaction(&bucket, vec![regular_info("a.txt", data.len() as u64)])
        .unwrap();
    store
        .process_upload_hashes(
            &transaction,
            vec![RelativePathWithHash {
                relative_path: RelativePath::new("a.txt"),
                hash: hash.clone(),
            }],
        )
        .unwrap();
    store
        .backup_file(&transaction, &mut Cursor::new(data.to_vec()))
        .unwrap();
    let revision = store.commit(&transaction).unwrap();

    store.verify_revision(&revision).unwrap();

    // Lose the object behind the store's back.
    let shard = format!(
        "/store/.backup_data/objects/{}/{}.gz",
        hash.first_chunk(),
        hash.remainder()
    );
    fs.remove(Path::new(&shard)).unwrap();

    match store.verify_revision(&revision).unwrap_err() {
        StoreError::VerificationFailed { problems } => {
            assert_eq!(problems.len(), 1);
            assert!(problems[0].contains(hash.as_str()));
        }
        other => panic!("unexpected error: {other}"),
    }
}

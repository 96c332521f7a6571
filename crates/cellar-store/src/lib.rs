//! # cellar-store
//!
//! The on-disk engine: a content-addressed object repository, bucket and
//! revision registries, manifest codecs, a single global write lock, the
//! multi-stage upload transaction, the query layer, the verifier, and the
//! forward schema migrations.
//!
//! All durable state lives under `<base>/.backup_data`:
//!
//! ```text
//! .backup_data/
//!   store_metadata/   buckets-data.json, users-data.json, status.json
//!   buckets/<id>/versions/<timestamp>.<ext>
//!   objects/<xx>/<rest>.gz
//!   locks/store_lock
//!   tmp/<seq>
//! ```

mod buckets;
mod error;
mod lock;
mod manifest;
mod migrations;
mod objects;
mod revisions;
mod transaction;
mod verify;

pub use error::{Result, StoreError};
pub use lock::StoreLock;
pub use transaction::{
    RelativePathWithHash, SymlinkWithRelativePath, Transaction, TransactionStage,
};

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use cellar_core::{Hash, RevisionVersion};
use cellar_fs::Fs;

pub(crate) const DATA_DIR_NAME: &str = ".backup_data";

/// Schema version written by a fresh `init`.
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Version stamped onto a store that predates schema versioning.
pub(crate) const FLOOR_SCHEMA_VERSION: u32 = 2;

/// Source of "now" for revision timestamps and lock records. Injected so
/// tests can pin time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Tunables for an open store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Upper bound on files the verifier holds open at once.
    pub max_concurrent_open_files: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_concurrent_open_files: 50,
        }
    }
}

/// Contents of `store_metadata/status.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatus {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
}

/// A backup store rooted at one directory.
pub struct Store {
    base_path: PathBuf,
    fs: Arc<dyn Fs>,
    clock: Arc<dyn Clock>,
    max_concurrent_open_files: usize,
    tmp_counter: AtomicU64,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("base_path", &self.base_path)
            .field("max_concurrent_open_files", &self.max_concurrent_open_files)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Create a new store in `base_path`, which must be an existing empty
    /// directory.
    pub fn init(fs: Arc<dyn Fs>, clock: Arc<dyn Clock>, base_path: &Path) -> Result<Self> {
        Self::init_with_options(fs, clock, base_path, StoreOptions::default())
    }

    pub fn init_with_options(
        fs: Arc<dyn Fs>,
        clock: Arc<dyn Clock>,
        base_path: &Path,
        options: StoreOptions,
    ) -> Result<Self> {
        let meta = fs
            .stat(base_path)
            .map_err(|e| StoreError::io("stat", base_path, e))?;
        if !meta.is_dir() {
            return Err(StoreError::StoreDirectoryNotADirectory {
                path: base_path.to_path_buf(),
            });
        }
        let existing = fs
            .read_dir(base_path)
            .map_err(|e| StoreError::io("read dir", base_path, e))?;
        if !existing.is_empty() {
            return Err(StoreError::StoreNotEmpty {
                path: base_path.to_path_buf(),
            });
        }

        let store = Self::new(fs, clock, base_path, options);
        for dir in [
            store.metadata_dir(),
            store.buckets_dir(),
            store.objects_dir(),
            store.locks_dir(),
            store.tmp_dir(),
        ] {
            store
                .fs
                .mkdir_all(&dir, 0o700)
                .map_err(|e| StoreError::io("create dir", dir.clone(), e))?;
        }

        store.write_metadata_file("buckets-data.json", b"[]")?;
        store.write_metadata_file("users-data.json", b"[]")?;
        store.update_status(CURRENT_SCHEMA_VERSION)?;

        debug!(path = %base_path.display(), "initialized store");
        Ok(store)
    }

    /// Open an existing store, clearing stale staging files and applying any
    /// pending schema migrations.
    pub fn open(fs: Arc<dyn Fs>, clock: Arc<dyn Clock>, base_path: &Path) -> Result<Self> {
        Self::open_with_options(fs, clock, base_path, StoreOptions::default())
    }

    pub fn open_with_options(
        fs: Arc<dyn Fs>,
        clock: Arc<dyn Clock>,
        base_path: &Path,
        options: StoreOptions,
    ) -> Result<Self> {
        let store = Self::new(fs, clock, base_path, options);

        let data_dir = store.data_dir();
        match store.fs.stat(&data_dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(StoreError::StoreDirectoryNotADirectory { path: data_dir });
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::StoreNotInitialized {
                    path: base_path.to_path_buf(),
                });
            }
            Err(e) => return Err(StoreError::io("stat", data_dir, e)),
        }

        store.ensure_status()?;

        let tmp = store.tmp_dir();
        store
            .fs
            .remove_all(&tmp)
            .map_err(|e| StoreError::io("clear tmp dir", tmp.clone(), e))?;
        store
            .fs
            .mkdir_all(&tmp, 0o700)
            .map_err(|e| StoreError::io("create tmp dir", tmp.clone(), e))?;

        store.run_migrations()?;

        Ok(store)
    }

    fn new(fs: Arc<dyn Fs>, clock: Arc<dyn Clock>, base_path: &Path, options: StoreOptions) -> Self {
        Self {
            base_path: base_path.to_path_buf(),
            fs,
            clock,
            max_concurrent_open_files: options.max_concurrent_open_files,
            tmp_counter: AtomicU64::new(0),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Current schema version, stamping the pre-versioning floor onto stores
    /// that have no status file yet.
    pub fn status(&self) -> Result<StoreStatus> {
        let path = self.status_path();
        match self.fs.read_file(&path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| StoreError::ManifestUnreadable {
                    path,
                    reason: e.to_string(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreStatus {
                schema_version: FLOOR_SCHEMA_VERSION,
            }),
            Err(e) => Err(StoreError::io("read status", path, e)),
        }
    }

    pub(crate) fn update_status(&self, schema_version: u32) -> Result<()> {
        let status = StoreStatus { schema_version };
        let bytes = serde_json::to_vec(&status).map_err(|e| StoreError::ManifestUnreadable {
            path: self.status_path(),
            reason: e.to_string(),
        })?;
        self.write_metadata_file("status.json", &bytes)
    }

    fn ensure_status(&self) -> Result<()> {
        let path = self.status_path();
        match self.fs.stat(&path) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.update_status(FLOOR_SCHEMA_VERSION)
            }
            Err(e) => Err(StoreError::io("stat status", path, e)),
        }
    }

    fn write_metadata_file(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.metadata_dir().join(name);
        self.fs
            .write_file(&path, data, 0o600)
            .map_err(|e| StoreError::io("write metadata", path.clone(), e))
    }

    // Path layout.

    pub(crate) fn data_dir(&self) -> PathBuf {
        self.base_path.join(DATA_DIR_NAME)
    }

    pub(crate) fn metadata_dir(&self) -> PathBuf {
        self.data_dir().join("store_metadata")
    }

    pub(crate) fn status_path(&self) -> PathBuf {
        self.metadata_dir().join("status.json")
    }

    pub(crate) fn buckets_registry_path(&self) -> PathBuf {
        self.metadata_dir().join("buckets-data.json")
    }

    pub(crate) fn buckets_dir(&self) -> PathBuf {
        self.data_dir().join("buckets")
    }

    pub(crate) fn versions_dir(&self, bucket_id: i64) -> PathBuf {
        self.buckets_dir().join(bucket_id.to_string()).join("versions")
    }

    pub(crate) fn version_path(&self, bucket_id: i64, version: RevisionVersion, ext: &str) -> PathBuf {
        self.versions_dir(bucket_id)
            .join(format!("{version}{ext}"))
    }

    pub(crate) fn objects_dir(&self) -> PathBuf {
        self.data_dir().join("objects")
    }

    pub(crate) fn object_shard_dir(&self, hash: &Hash) -> PathBuf {
        self.objects_dir().join(hash.first_chunk())
    }

    pub(crate) fn locks_dir(&self) -> PathBuf {
        self.data_dir().join("locks")
    }

    pub(crate) fn lock_path(&self) -> PathBuf {
        self.locks_dir().join("store_lock")
    }

    pub(crate) fn tmp_dir(&self) -> PathBuf {
        self.data_dir().join("tmp")
    }

    pub(crate) fn fs(&self) -> &dyn Fs {
        self.fs.as_ref()
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

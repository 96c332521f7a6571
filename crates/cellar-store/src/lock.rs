//! Single global write lock: `locks/store_lock`, a JSON record naming the
//! holder. Advisory only; the acquire is stat-then-create, so two processes
//! racing within that window can both win. Accepted for a tool whose writers
//! are humans running one backup at a time.

use std::io::{self, Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use cellar_fs::OpenFlags;

use crate::{Result, Store, StoreError};

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLock {
    #[serde(rename = "acquisitionTime")]
    pub acquisition_time: DateTime<Utc>,
    pub pid: u32,
    pub text: String,
}

impl Store {
    /// The current lock record, if a writer holds the store.
    pub fn lock_information(&self) -> Result<Option<StoreLock>> {
        let path = self.lock_path();
        match self.fs().read_file(&path) {
            Ok(bytes) => {
                let lock =
                    serde_json::from_slice(&bytes).map_err(|e| StoreError::ManifestUnreadable {
                        path,
                        reason: e.to_string(),
                    })?;
                Ok(Some(lock))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io("read lock", path, e)),
        }
    }

    pub(crate) fn acquire_lock(&self, text: &str) -> Result<StoreLock> {
        let path = self.lock_path();
        match self.fs().stat(&path) {
            Ok(_) => {
                let holder = self
                    .lock_information()
                    .ok()
                    .flatten()
                    .map(|l| format!("{} (pid {})", l.text, l.pid))
                    .unwrap_or_else(|| "unknown holder".to_string());
                return Err(StoreError::LockAlreadyTaken { holder });
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io("stat lock", path, e)),
        }

        let lock = StoreLock {
            acquisition_time: self.now(),
            pid: std::process::id(),
            text: text.to_string(),
        };
        let bytes = serde_json::to_vec(&lock).map_err(|e| StoreError::ManifestUnreadable {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let flags = OpenFlags {
            create: true,
            truncate: true,
            mode: 0o600,
        };
        let mut writer = self
            .fs()
            .open_with_flags(&path, flags)
            .map_err(|e| StoreError::io("create lock", path.clone(), e))?;
        writer
            .write_all(&bytes)
            .and_then(|_| writer.flush())
            .map_err(|e| StoreError::io("write lock", path, e))?;

        debug!(text, "acquired store lock");
        Ok(lock)
    }

    pub(crate) fn release_lock(&self) -> Result<()> {
        self.fs()
            .remove_all(&self.lock_path())
            .map_err(|e| StoreError::LockReleaseFailed { source: e })?;
        debug!("released store lock");
        Ok(())
    }
}

//! Revision verification: every regular file's object must be present.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rayon::prelude::*;
use tracing::info;

use cellar_core::{FileDescriptor, Revision};

use crate::{Result, Store, StoreError};

impl Store {
    /// Check that the object repository holds every object the revision's
    /// manifest references. All problems are collected before reporting, so
    /// one pass gives the complete damage picture.
    pub fn verify_revision(&self, revision: &Revision) -> Result<()> {
        let descriptors = self.files_in_revision(revision)?;
        let total = descriptors.len();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.max_concurrent_open_files)
            .build()
            .map_err(|e| {
                StoreError::io(
                    "build verifier pool",
                    self.base_path().to_path_buf(),
                    std::io::Error::other(e),
                )
            })?;

        let problems = Mutex::new(Vec::new());
        let checked = AtomicUsize::new(0);

        pool.install(|| {
            descriptors.par_iter().for_each(|descriptor| {
                if let FileDescriptor::Regular(regular) = descriptor {
                    match self.is_object_present(&regular.hash) {
                        Ok(true) => {}
                        Ok(false) => problems.lock().unwrap().push(format!(
                            "object {} not found (for {})",
                            regular.hash, regular.info.relative_path
                        )),
                        Err(e) => problems.lock().unwrap().push(format!(
                            "could not check object {} (for {}): {e}",
                            regular.hash, regular.info.relative_path
                        )),
                    }
                }

                let done = checked.fetch_add(1, Ordering::Relaxed) + 1;
                if done % 100 == 0 {
                    info!(done, total, "verification progress");
                }
            });
        });

        let mut problems = problems.into_inner().unwrap();
        if problems.is_empty() {
            info!(
                bucket = revision.bucket.name,
                version = revision.version,
                total,
                "revision verified"
            );
            Ok(())
        } else {
            problems.sort();
            Err(StoreError::VerificationFailed { problems })
        }
    }
}
